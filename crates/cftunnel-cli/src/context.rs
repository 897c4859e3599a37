//! Per-invocation state shared by the subcommands.

use std::path::{Path, PathBuf};

use anyhow::Context as _;

use cftunnel_core::Config;
use cftunnel_core::paths;
use cftunnel_daemon::{BinaryAcquirer, ProcessTracker, RouteProbeInput};

/// Data directory plus the configuration loaded from it.
#[derive(Debug, Clone)]
pub struct Context {
    pub data_dir: PathBuf,
    pub config: Config,
}

impl Context {
    /// Load from the process-wide data directory.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(paths::data_dir())
    }

    pub fn load_from(data_dir: &Path) -> anyhow::Result<Self> {
        let config_path = paths::config_path(data_dir);
        let config = Config::load(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            config,
        })
    }

    pub fn acquirer(&self) -> BinaryAcquirer {
        BinaryAcquirer::new(&self.data_dir).with_explicit_path(self.config.cloudflared_override())
    }

    pub fn tracker(&self) -> ProcessTracker {
        ProcessTracker::new(&self.data_dir)
    }

    pub fn route_inputs(&self) -> Vec<RouteProbeInput> {
        self.config
            .routes
            .iter()
            .map(|r| RouteProbeInput {
                name: r.name.clone(),
                hostname: r.hostname.clone(),
                service: r.service.clone(),
            })
            .collect()
    }
}
