//! Durable record of the supervised cloudflared process.
//!
//! Every cftunnel command is a short-lived process, so "is a tunnel running?"
//! cannot be answered from memory. The supervisor writes a small JSON marker
//! when it launches cloudflared; readers re-check the recorded pid against the
//! OS on every query and drop markers whose process has gone away.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from reading or writing the process marker.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to serialize process marker: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A launched tunnel process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelProcessHandle {
    pub pid: u32,
    /// Launch time, seconds since the Unix epoch.
    pub started_at_secs: u64,
    /// Port cloudflared forwards to (the local service or the auth proxy).
    pub port: u16,
}

impl TunnelProcessHandle {
    /// Handle for a process started now.
    pub fn new(pid: u32, port: u16) -> Self {
        Self {
            pid,
            started_at_secs: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            port,
        }
    }

    /// Time elapsed since launch.
    pub fn uptime(&self) -> Duration {
        let started = SystemTime::UNIX_EPOCH + Duration::from_secs(self.started_at_secs);
        SystemTime::now()
            .duration_since(started)
            .unwrap_or_default()
    }
}

const CLAIM_ATTEMPTS: usize = 3;

/// Outcome of [`ProcessTracker::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The marker now names the calling process.
    Acquired,
    /// A live process already holds the marker.
    Held(TunnelProcessHandle),
}

/// Reads and writes the process marker.
#[derive(Debug, Clone)]
pub struct ProcessTracker {
    marker: PathBuf,
}

impl ProcessTracker {
    /// Tracker using the default marker location under `data_dir`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            marker: cftunnel_core::paths::pid_path(data_dir),
        }
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    fn read_marker(&self) -> Option<TunnelProcessHandle> {
        let content = std::fs::read_to_string(&self.marker).ok()?;
        match serde_json::from_str(&content) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(path = %self.marker.display(), error = %e, "Discarding unreadable process marker");
                self.remove_marker();
                None
            }
        }
    }

    fn remove_marker(&self) {
        if let Err(e) = std::fs::remove_file(&self.marker) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.marker.display(), error = %e, "Failed to remove process marker");
            }
        }
    }

    /// The recorded process, if it is still alive.
    ///
    /// A marker pointing at a dead process is removed.
    pub fn current(&self) -> Option<TunnelProcessHandle> {
        let handle = self.read_marker()?;
        if process_alive(handle.pid) {
            Some(handle)
        } else {
            debug!(pid = handle.pid, "Recorded tunnel process is gone, clearing marker");
            self.remove_marker();
            None
        }
    }

    pub fn is_running(&self) -> bool {
        self.current().is_some()
    }

    pub fn current_pid(&self) -> Option<u32> {
        self.current().map(|h| h.pid)
    }

    /// Atomically take the marker for the calling process.
    ///
    /// The marker is created only if absent, holding this process's own pid
    /// as a placeholder until [`record`](Self::record) replaces it with the
    /// tunnel's pid. A stale or corrupt marker is cleared and the claim
    /// retried; a live one is returned as [`Claim::Held`].
    pub fn claim(&self, port: u16) -> Result<Claim, StateError> {
        let placeholder = TunnelProcessHandle::new(std::process::id(), port);
        let dir = self.marker.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        for _ in 0..CLAIM_ATTEMPTS {
            let mut staged = NamedTempFile::new_in(dir)?;
            staged.write_all(serde_json::to_string(&placeholder)?.as_bytes())?;
            match staged.persist_noclobber(&self.marker) {
                Ok(_) => {
                    debug!(pid = placeholder.pid, port, "Claimed process marker");
                    return Ok(Claim::Acquired);
                }
                Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(holder) = self.current() {
                        return Ok(Claim::Held(holder));
                    }
                }
                Err(e) => return Err(e.error.into()),
            }
        }
        Err(StateError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "process marker keeps reappearing",
        )))
    }

    /// Record a freshly launched process.
    pub fn record(&self, handle: &TunnelProcessHandle) -> Result<(), StateError> {
        let dir = self.marker.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut staged = NamedTempFile::new_in(dir)?;
        staged.write_all(serde_json::to_string(handle)?.as_bytes())?;
        staged.persist(&self.marker).map_err(|e| StateError::Io(e.error))?;
        debug!(pid = handle.pid, port = handle.port, "Recorded tunnel process");
        Ok(())
    }

    /// Remove the marker if it still refers to `pid`.
    pub fn release(&self, pid: u32) {
        if self.read_marker().is_some_and(|h| h.pid == pid) {
            self.remove_marker();
        }
    }

    /// Remove the marker unconditionally.
    pub fn clear(&self) {
        self.remove_marker();
    }
}

/// Whether a process with `pid` exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // pid 0 and negative pids address process groups.
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Whether a process with `pid` exists.
#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
        .output()
        .is_ok_and(|o| {
            String::from_utf8_lossy(&o.stdout).contains(&format!("\"{pid}\""))
        })
}

/// Ask a process to exit with SIGTERM.
#[cfg(unix)]
pub fn terminate(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid pid"))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(std::io::Error::from)
}

/// Stop a process tree with `taskkill /F`.
///
/// A plain `taskkill` posts `WM_CLOSE`, which a console program such as
/// cloudflared never receives, so the request would be ignored and `down`
/// would time out. Windows has no graceful equivalent of SIGTERM here.
#[cfg(not(unix))]
pub fn terminate(pid: u32) -> std::io::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(taskkill_args(pid))
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("taskkill exited with {status}")))
    }
}

#[cfg(any(not(unix), test))]
fn taskkill_args(pid: u32) -> [String; 4] {
    ["/PID".into(), pid.to_string(), "/T".into(), "/F".into()]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn taskkill_forces_the_whole_tree() {
        assert_eq!(taskkill_args(4242), ["/PID", "4242", "/T", "/F"]);
    }

    #[test]
    fn no_marker_means_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProcessTracker::new(dir.path());
        assert!(!tracker.is_running());
        assert_eq!(tracker.current_pid(), None);
    }

    #[test]
    fn own_process_is_running() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProcessTracker::new(dir.path());
        let handle = TunnelProcessHandle::new(std::process::id(), 8080);
        tracker.record(&handle).unwrap();
        assert!(tracker.is_running());
        assert_eq!(tracker.current_pid(), Some(std::process::id()));
        assert_eq!(tracker.current().unwrap().port, 8080);
    }

    #[cfg(unix)]
    #[test]
    fn externally_exited_process_reads_as_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProcessTracker::new(dir.path());

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        tracker
            .record(&TunnelProcessHandle::new(child.id(), 3000))
            .unwrap();
        assert!(tracker.is_running());

        child.kill().unwrap();
        child.wait().unwrap();

        assert!(!tracker.is_running());
        assert!(!tracker.marker_path().exists(), "stale marker should be cleared");
    }

    #[test]
    fn corrupt_marker_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProcessTracker::new(dir.path());
        std::fs::write(tracker.marker_path(), "not json").unwrap();
        assert!(!tracker.is_running());
        assert!(!tracker.marker_path().exists());
    }

    #[test]
    fn release_only_removes_matching_pid() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProcessTracker::new(dir.path());
        tracker
            .record(&TunnelProcessHandle::new(std::process::id(), 1))
            .unwrap();
        tracker.release(std::process::id().wrapping_add(1));
        assert!(tracker.marker_path().exists());
        tracker.release(std::process::id());
        assert!(!tracker.marker_path().exists());
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProcessTracker::new(dir.path());
        tracker.clear();
        tracker
            .record(&TunnelProcessHandle::new(std::process::id(), 1))
            .unwrap();
        tracker.clear();
        tracker.clear();
        assert!(!tracker.is_running());
    }

    #[test]
    fn claim_takes_free_marker_once() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProcessTracker::new(dir.path());

        assert_eq!(tracker.claim(3000).unwrap(), Claim::Acquired);
        assert_eq!(tracker.current_pid(), Some(std::process::id()));

        match tracker.claim(4000).unwrap() {
            Claim::Held(holder) => {
                assert_eq!(holder.pid, std::process::id());
                assert_eq!(holder.port, 3000);
            }
            Claim::Acquired => panic!("second claim must not succeed"),
        }
    }

    #[test]
    fn claim_replaces_corrupt_marker() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProcessTracker::new(dir.path());
        std::fs::write(tracker.marker_path(), "{").unwrap();

        assert_eq!(tracker.claim(3000).unwrap(), Claim::Acquired);
        assert!(tracker.is_running());
    }

    #[cfg(unix)]
    #[test]
    fn claim_replaces_stale_marker() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProcessTracker::new(dir.path());
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead = child.id();
        child.wait().unwrap();
        tracker.record(&TunnelProcessHandle::new(dead, 1)).unwrap();

        assert_eq!(tracker.claim(3000).unwrap(), Claim::Acquired);
        assert_eq!(tracker.current_pid(), Some(std::process::id()));
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| ProcessTracker::new(dir.path()).claim(3000).unwrap()))
                .collect();
            handles
                .into_iter()
                .map(std::thread::ScopedJoinHandle::join)
                .filter(|r| matches!(r, Ok(Claim::Acquired)))
                .count()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn record_replaces_claim_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProcessTracker::new(dir.path());
        tracker.claim(3000).unwrap();

        let mut child_like = TunnelProcessHandle::new(std::process::id(), 3000);
        child_like.started_at_secs += 1;
        tracker.record(&child_like).unwrap();
        assert_eq!(tracker.current(), Some(child_like));
    }

    #[test]
    fn pid_zero_is_never_alive() {
        assert!(!process_alive(0));
    }

    #[test]
    fn uptime_is_non_negative() {
        let handle = TunnelProcessHandle::new(1, 1);
        assert!(handle.uptime() < Duration::from_secs(5));
    }
}
