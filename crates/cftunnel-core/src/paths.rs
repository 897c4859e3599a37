//! Private data directory resolution.
//!
//! Everything cftunnel persists lives under one directory:
//! - normal mode: `~/.cftunnel/`
//! - portable mode: the directory holding the executable, when a file named
//!   `portable` sits next to it
//!
//! The directory is computed once per process; later calls return the cached
//! value.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Name of the marker file that switches on portable mode.
pub const PORTABLE_MARKER: &str = "portable";

const DATA_SUBDIR: &str = ".cftunnel";

static DATA_DIR: OnceLock<DataDir> = OnceLock::new();

#[derive(Debug)]
struct DataDir {
    path: PathBuf,
    portable: bool,
}

fn resolve() -> DataDir {
    if let Some(exe_dir) = std::env::current_exe()
        .and_then(std::fs::canonicalize)
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        if exe_dir.join(PORTABLE_MARKER).exists() {
            return DataDir {
                path: exe_dir,
                portable: true,
            };
        }
    }

    let home = dirs::home_dir().unwrap_or_else(|| {
        tracing::warn!("dirs::home_dir() returned None; falling back to temp_dir for data directory");
        std::env::temp_dir()
    });
    DataDir {
        path: home.join(DATA_SUBDIR),
        portable: false,
    }
}

/// The private data directory.
pub fn data_dir() -> &'static Path {
    &DATA_DIR.get_or_init(resolve).path
}

/// Whether the data directory is the executable's own directory.
pub fn is_portable() -> bool {
    DATA_DIR.get_or_init(resolve).portable
}

/// Directory holding the cached tunnel-client binary.
pub fn bin_dir(base: &Path) -> PathBuf {
    base.join("bin")
}

/// File name of the tunnel-client executable on this platform.
pub const fn cloudflared_file_name() -> &'static str {
    if cfg!(windows) {
        "cloudflared.exe"
    } else {
        "cloudflared"
    }
}

/// Cache location of the tunnel-client binary.
pub fn cloudflared_path(base: &Path) -> PathBuf {
    bin_dir(base).join(cloudflared_file_name())
}

/// Route configuration file.
pub fn config_path(base: &Path) -> PathBuf {
    base.join("config.yml")
}

/// Marker recording the supervised tunnel process.
pub fn pid_path(base: &Path) -> PathBuf {
    base.join("cloudflared.pid")
}

/// Empty configuration handed to quick tunnels.
pub fn quick_config_path(base: &Path) -> PathBuf {
    base.join("quick-config.yml")
}
