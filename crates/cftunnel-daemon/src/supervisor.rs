//! Foreground quick-tunnel supervision.
//!
//! Runs cloudflared as a child process until either the operator interrupts
//! or the child exits on its own:
//! - stderr is scanned for the assigned `trycloudflare.com` address
//! - a waiter task reports the exit status over a oneshot channel
//! - on interrupt the child gets SIGTERM and we wait for it to actually exit
//!
//! There is no SIGKILL escalation: a child that ignores SIGTERM keeps the
//! session open until it exits.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::acquire::{AcquireError, BinaryAcquirer};
use crate::auth_proxy::{AuthProxyConfig, AuthProxyError, AuthProxyFactory, ProxyGuard};
use crate::scanner::scan_output;
use crate::state::{Claim, ProcessTracker, StateError, TunnelProcessHandle, terminate};

/// How long to let the scanner flush remaining output after the child exits.
const SCANNER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const QUICK_CONFIG_CONTENT: &str = "# cftunnel quick mode - empty config\n";

/// Errors from a supervised tunnel session.
#[derive(Debug, Error)]
pub enum SuperviseError {
    #[error("cloudflared is already running (pid {pid}), run `cftunnel down` first")]
    AlreadyRunning { pid: u32 },

    #[error("failed to start auth proxy: {0}")]
    AuthProxy(#[from] AuthProxyError),

    #[error("failed to obtain cloudflared: {0}")]
    Acquire(#[from] AcquireError),

    #[error("failed to launch cloudflared: {0}")]
    Launch(#[source] io::Error),

    #[error("cloudflared exited abnormally: {0}")]
    AbnormalExit(ExitStatus),

    #[error("failed waiting for cloudflared: {0}")]
    Wait(#[source] io::Error),

    #[error("failed to record tunnel process: {0}")]
    State(#[from] StateError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Starts and babysits cloudflared quick tunnels.
#[derive(Debug, Clone)]
pub struct Supervisor {
    data_dir: PathBuf,
    acquirer: BinaryAcquirer,
    tracker: ProcessTracker,
    auth_proxy: Option<AuthProxyFactory>,
}

enum Wake {
    Interrupted,
    Exited(Result<io::Result<ExitStatus>, oneshot::error::RecvError>),
}

impl Supervisor {
    pub fn new(data_dir: &Path, acquirer: BinaryAcquirer) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            acquirer,
            tracker: ProcessTracker::new(data_dir),
            auth_proxy: None,
        }
    }

    /// Use `factory` to build the proxy for sessions that request auth.
    #[must_use]
    pub fn with_auth_proxy(mut self, factory: AuthProxyFactory) -> Self {
        self.auth_proxy = Some(factory);
        self
    }

    pub const fn tracker(&self) -> &ProcessTracker {
        &self.tracker
    }

    /// Run a quick tunnel to `local_port` until Ctrl+C or child exit.
    pub async fn start_foreground(
        &self,
        local_port: u16,
        auth: Option<AuthProxyConfig>,
    ) -> Result<(), SuperviseError> {
        self.start_foreground_until(local_port, auth, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Cannot listen for Ctrl+C, running until cloudflared exits");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run a quick tunnel to `local_port` until `shutdown` resolves or the
    /// child exits.
    ///
    /// The process marker is claimed before anything else, so a second
    /// start is refused even while the first is still downloading
    /// cloudflared. Until the child is launched the marker names this
    /// process.
    pub async fn start_foreground_until<F>(
        &self,
        local_port: u16,
        auth: Option<AuthProxyConfig>,
        shutdown: F,
    ) -> Result<(), SuperviseError>
    where
        F: Future<Output = ()>,
    {
        if let Claim::Held(holder) = self.tracker.claim(local_port)? {
            return Err(SuperviseError::AlreadyRunning { pid: holder.pid });
        }
        let result = self.run_claimed(local_port, auth, shutdown).await;
        // No-op once the child's pid replaced the placeholder.
        self.tracker.release(std::process::id());
        result
    }

    async fn run_claimed<F>(
        &self,
        local_port: u16,
        auth: Option<AuthProxyConfig>,
        shutdown: F,
    ) -> Result<(), SuperviseError>
    where
        F: Future<Output = ()>,
    {
        // Dropping the guard stops the proxy, so every return below cleans up.
        let proxy = match auth {
            Some(config) => {
                let factory = self.auth_proxy.as_ref().ok_or(AuthProxyError::Unavailable)?;
                Some(ProxyGuard::start(factory.build(config))?)
            }
            None => None,
        };
        let target_port = proxy.as_ref().map_or(local_port, ProxyGuard::port);
        if let Some(guard) = &proxy {
            info!(proxy_port = guard.port(), local_port, "Auth proxy started");
        }

        let binary = self.acquirer.ensure_binary().await?;
        let config = ensure_quick_config(&self.data_dir)?;

        let mut cmd = Command::new(&binary);
        cmd.arg("tunnel")
            .arg("--config")
            .arg(&config)
            .arg("--url")
            .arg(format!("http://localhost:{target_port}"))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped());

        info!(
            binary = %binary.display(),
            target_port,
            "Starting cloudflared quick tunnel"
        );
        let mut child = cmd.spawn().map_err(SuperviseError::Launch)?;
        let Some(pid) = child.id() else {
            return Err(SuperviseError::Launch(io::Error::other(
                "cloudflared exited before reporting a pid",
            )));
        };

        if let Err(e) = self.tracker.record(&TunnelProcessHandle::new(pid, target_port)) {
            warn!(pid, error = %e, "Failed to record tunnel process, stopping it");
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e.into());
        }

        let scanner = child.stderr.take().map(|stderr| {
            tokio::spawn(scan_output(stderr, tokio::io::stderr(), tokio::io::stdout()))
        });

        let (done_tx, mut done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = done_tx.send(child.wait().await);
        });

        tokio::pin!(shutdown);
        let wake = tokio::select! {
            () = &mut shutdown => Wake::Interrupted,
            res = &mut done_rx => Wake::Exited(res),
        };

        let result = match wake {
            Wake::Interrupted => {
                info!(pid, "Interrupt received, stopping cloudflared");
                if let Err(e) = terminate(pid) {
                    debug!(pid, error = %e, "Termination signal not delivered");
                }
                let status = done_rx.await;
                debug!(?status, "cloudflared stopped");
                Ok(())
            }
            Wake::Exited(res) => exit_outcome(res),
        };

        self.tracker.release(pid);

        if let Some(handle) = scanner {
            match tokio::time::timeout(SCANNER_DRAIN_TIMEOUT, handle).await {
                Ok(Ok(Ok(endpoint))) => debug!(?endpoint, "Output scanner finished"),
                Ok(Ok(Err(e))) => warn!(error = %e, "Reading cloudflared output failed"),
                Ok(Err(e)) => warn!(error = %e, "Output scanner task failed"),
                Err(_) => debug!("Output scanner still draining, detaching"),
            }
        }

        drop(proxy);
        result
    }
}

fn exit_outcome(
    res: Result<io::Result<ExitStatus>, oneshot::error::RecvError>,
) -> Result<(), SuperviseError> {
    match res {
        Ok(Ok(status)) if status.success() => {
            info!("cloudflared exited");
            Ok(())
        }
        Ok(Ok(status)) => {
            warn!(%status, "cloudflared exited abnormally");
            Err(SuperviseError::AbnormalExit(status))
        }
        Ok(Err(e)) => Err(SuperviseError::Wait(e)),
        Err(_) => Err(SuperviseError::Wait(io::Error::other(
            "exit waiter stopped without reporting",
        ))),
    }
}

/// Path of the isolated empty config, created on first use.
///
/// Passing this explicitly keeps cloudflared away from a stale
/// `~/.cloudflared/config.yml`, whose leftover `tunnel:` id breaks quick
/// tunnels.
pub fn ensure_quick_config(data_dir: &Path) -> io::Result<PathBuf> {
    let path = cftunnel_core::paths::quick_config_path(data_dir);
    if !path.exists() {
        std::fs::create_dir_all(data_dir)?;
        std::fs::write(&path, QUICK_CONFIG_CONTENT)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
    }
    Ok(path)
}
