//! Error types for cftunnel core library.

use thiserror::Error;

/// Result type alias using cftunnel Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for cftunnel operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
