//! cloudflared acquisition.
//!
//! Resolution order for the tunnel-client executable:
//! 1. an explicitly configured path
//! 2. the private cache (`<data_dir>/bin/cloudflared`)
//! 3. `PATH`
//! 4. download from GitHub releases, trying each mirror prefix in order
//!
//! Downloads are staged in a temporary file next to the cache path and only
//! renamed into place once complete, so an interrupted download never looks
//! like a cached binary.

use std::ffi::OsStr;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::http;
use crate::platform::{ArtifactDescriptor, ArtifactKind};

/// Release download location; mirrors are prepended to this.
pub const ORIGIN: &str = "https://github.com/cloudflare/cloudflared/releases/latest/download/";

/// GitHub mirror prefixes by priority. The empty prefix is the origin itself.
pub const DEFAULT_MIRRORS: &[&str] = &[
    "https://ghfast.top/",
    "https://gh-proxy.com/",
    "https://ghproxy.cn/",
    "",
];

/// Per-attempt download timeout. Binaries are tens of megabytes.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Name of the executable inside release archives and on `PATH`.
const EXECUTABLE_NAME: &str = "cloudflared";

/// Errors from binary acquisition.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("all {attempts} download sources failed, last error: {last}")]
    AllMirrorsFailed { attempts: usize, last: String },

    #[error("HTTP {status} from {source_name}")]
    Status { status: u16, source_name: String },

    #[error("cloudflared not found in downloaded archive")]
    ArchiveEntryMissing,

    #[error("failed to unpack archive: {0}")]
    Extract(#[source] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ordered download prefixes, always ending with the empty (origin) prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorList(Vec<String>);

impl MirrorList {
    /// Build a mirror list; the origin entry is appended if missing.
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list: Vec<String> = prefixes.into_iter().map(Into::into).collect();
        if list.last().is_none_or(|last| !last.is_empty()) {
            list.push(String::new());
        }
        Self(list)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for MirrorList {
    fn default() -> Self {
        Self::new(DEFAULT_MIRRORS.iter().copied())
    }
}

/// Human-readable label for a mirror prefix, used in logs and errors.
fn source_name(mirror: &str) -> String {
    if mirror.is_empty() {
        "GitHub".to_string()
    } else {
        mirror.trim_end_matches('/').to_string()
    }
}

/// Locates or downloads the cloudflared executable.
#[derive(Debug, Clone)]
pub struct BinaryAcquirer {
    cache_path: PathBuf,
    explicit_path: Option<PathBuf>,
    search_path: bool,
    target: (String, String),
    artifact: Option<ArtifactDescriptor>,
    mirrors: MirrorList,
    origin: String,
    timeout: Duration,
}

impl BinaryAcquirer {
    /// Acquirer caching under `data_dir` for the host platform.
    pub fn new(data_dir: &Path) -> Self {
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;
        Self {
            cache_path: cftunnel_core::paths::cloudflared_path(data_dir),
            explicit_path: None,
            search_path: true,
            target: (os.to_string(), arch.to_string()),
            artifact: ArtifactDescriptor::resolve(os, arch),
            mirrors: MirrorList::default(),
            origin: ORIGIN.to_string(),
            timeout: DOWNLOAD_TIMEOUT,
        }
    }

    /// Prefer `path` over every other source when it exists.
    #[must_use]
    pub fn with_explicit_path(mut self, path: Option<PathBuf>) -> Self {
        self.explicit_path = path;
        self
    }

    /// Enable or disable the `PATH` lookup.
    #[must_use]
    pub const fn with_path_lookup(mut self, enabled: bool) -> Self {
        self.search_path = enabled;
        self
    }

    /// Override the target platform (Rust `OS`/`ARCH` names).
    #[must_use]
    pub fn with_target(mut self, os: &str, arch: &str) -> Self {
        self.target = (os.to_string(), arch.to_string());
        self.artifact = ArtifactDescriptor::resolve(os, arch);
        self
    }

    /// Override the download sources.
    #[must_use]
    pub fn with_sources(mut self, mirrors: MirrorList, origin: impl Into<String>) -> Self {
        self.mirrors = mirrors;
        self.origin = origin.into();
        self
    }

    /// Override the per-attempt download timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Where a downloaded binary is cached.
    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Release artifact for the target platform, if supported.
    pub const fn artifact(&self) -> Option<&ArtifactDescriptor> {
        self.artifact.as_ref()
    }

    /// Find an installed binary without touching the network.
    pub fn locate(&self) -> Option<PathBuf> {
        if let Some(path) = &self.explicit_path {
            if path.is_file() {
                return Some(path.clone());
            }
            warn!(path = %path.display(), "Configured cloudflared path does not exist, ignoring");
        }
        if self.cache_path.is_file() {
            return Some(self.cache_path.clone());
        }
        if self.search_path {
            if let Ok(path) = which::which(EXECUTABLE_NAME) {
                debug!(path = %path.display(), "Found cloudflared on PATH");
                return Some(path);
            }
        }
        None
    }

    /// Return a usable cloudflared path, downloading it if necessary.
    pub async fn ensure_binary(&self) -> Result<PathBuf, AcquireError> {
        if let Some(path) = self.locate() {
            return Ok(path);
        }
        self.download().await?;
        Ok(self.cache_path.clone())
    }

    async fn download(&self) -> Result<(), AcquireError> {
        let artifact = self
            .artifact
            .clone()
            .ok_or_else(|| AcquireError::UnsupportedPlatform {
                os: self.target.0.clone(),
                arch: self.target.1.clone(),
            })?;

        if let Some(dir) = self.cache_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let client = http::client(self.timeout)?;
        info!(
            artifact = artifact.file_name,
            platform = %artifact.platform,
            "Downloading cloudflared"
        );

        let mut last_err = None;
        for mirror in self.mirrors.iter() {
            let url = format!("{mirror}{}{}", self.origin, artifact.file_name);
            let source = source_name(mirror);
            info!(source = %source, "Trying download source");

            match self.fetch(&client, &url, &source, artifact.kind).await {
                Ok(()) => {
                    info!(path = %self.cache_path.display(), "cloudflared downloaded");
                    return Ok(());
                }
                Err(e) => {
                    warn!(source = %source, error = %e, "Download source failed");
                    last_err = Some(e);
                }
            }
        }

        Err(AcquireError::AllMirrorsFailed {
            attempts: self.mirrors.len(),
            last: last_err.map_or_else(|| "no sources tried".to_string(), |e| e.to_string()),
        })
    }

    async fn fetch(
        &self,
        client: &reqwest::Client,
        url: &str,
        source: &str,
        kind: ArtifactKind,
    ) -> Result<(), AcquireError> {
        let mut resp = client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AcquireError::Status {
                status: status.as_u16(),
                source_name: source.to_string(),
            });
        }
        let dir = self
            .cache_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let download = NamedTempFile::new_in(&dir)?;
        let mut out = tokio::fs::File::from_std(download.reopen()?);
        let mut written: u64 = 0;
        while let Some(chunk) = resp.chunk().await? {
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        out.sync_all().await?;
        drop(out);
        debug!(bytes = written, "Download complete, persisting");

        let dest = self.cache_path.clone();
        tokio::task::spawn_blocking(move || persist(download, kind, &dest))
            .await
            .map_err(|e| AcquireError::Io(std::io::Error::other(e)))?
    }
}

/// Move a fully downloaded artifact to `dest`.
///
/// Raw executables are renamed into place; archives are unpacked into a
/// second staging file first. Either way `dest` only appears once complete.
pub(crate) fn persist(
    download: NamedTempFile,
    kind: ArtifactKind,
    dest: &Path,
) -> Result<(), AcquireError> {
    let staged = match kind {
        ArtifactKind::Executable => download,
        ArtifactKind::TarGz => {
            let dir = dest.parent().unwrap_or_else(|| Path::new("."));
            let mut staged = NamedTempFile::new_in(dir)?;
            extract_executable(download.reopen()?, staged.as_file_mut())?;
            staged.as_file().sync_all()?;
            staged
        }
    };
    make_executable(staged.path())?;

    staged.persist(dest).map_err(|e| AcquireError::Io(e.error))?;
    Ok(())
}

/// Copy the `cloudflared` entry of a gzip'd tarball into `out`.
fn extract_executable<R: Read, W: Write>(archive: R, out: &mut W) -> Result<u64, AcquireError> {
    let mut archive = tar::Archive::new(GzDecoder::new(archive));
    for entry in archive.entries().map_err(AcquireError::Extract)? {
        let mut entry = entry.map_err(AcquireError::Extract)?;
        let matches = entry
            .path()
            .map_err(AcquireError::Extract)?
            .file_name()
            == Some(OsStr::new(EXECUTABLE_NAME));
        if matches && entry.header().entry_type().is_file() {
            return std::io::copy(&mut entry, out).map_err(AcquireError::Extract);
        }
    }
    Err(AcquireError::ArchiveEntryMissing)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
const fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
