//! Read-only view of the cftunnel configuration file.
//!
//! The file (`<data_dir>/config.yml`) is written by the route management
//! commands; this crate only reads the parts the runtime needs:
//! 1. Built-in defaults (missing file)
//! 2. `config.yml`
//! 3. Environment variables (highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default auth-proxy cookie lifetime (24 hours).
pub const DEFAULT_COOKIE_TTL_SECS: u64 = 86_400;

/// Environment variable overriding the tunnel-client binary location.
pub const CLOUDFLARED_PATH_ENV: &str = "CFTUNNEL_CLOUDFLARED_PATH";

/// cftunnel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub cloudflared: CloudflaredConfig,
}

/// A named mapping from a public hostname to a local service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteConfig {
    pub name: String,
    #[serde(default)]
    pub hostname: String,
    /// Local service URL, e.g. `http://localhost:3000`.
    #[serde(default)]
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<RouteAuth>,
}

/// Credentials for the auth proxy placed in front of a route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteAuth {
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,
    /// Cookie lifetime in seconds; zero or absent means the default.
    #[serde(default)]
    pub cookie_ttl: u64,
}

impl RouteAuth {
    /// Cookie lifetime, falling back to 24 hours.
    pub const fn cookie_ttl_or_default(&self) -> Duration {
        if self.cookie_ttl > 0 {
            Duration::from_secs(self.cookie_ttl)
        } else {
            Duration::from_secs(DEFAULT_COOKIE_TTL_SECS)
        }
    }
}

/// Tunnel-client binary settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CloudflaredConfig {
    /// Explicit binary path. Empty means "resolve automatically".
    #[serde(default)]
    pub path: String,
}

impl Config {
    /// Load the configuration from `path`, applying environment overrides.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
            })?;
            Self::from_yaml(&content)?
        } else {
            tracing::debug!(path = %path.display(), "config file missing, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from YAML text. An empty document is the default.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(CLOUDFLARED_PATH_ENV) {
            if !val.is_empty() {
                self.cloudflared.path = val;
            }
        }
    }

    /// Explicitly configured tunnel-client binary, if any.
    pub fn cloudflared_override(&self) -> Option<PathBuf> {
        let trimmed = self.cloudflared.path.trim();
        (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
    }

    /// Look up a route by name.
    pub fn find_route(&self, name: &str) -> Option<&RouteConfig> {
        self.routes.iter().find(|r| r.name == name)
    }
}
