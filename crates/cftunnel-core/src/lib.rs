//! cftunnel Core Library
//!
//! Shared functionality for cftunnel components:
//! - Private data directory resolution (normal and portable mode)
//! - Read-only route configuration
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod paths;
pub mod tracing_init;

pub use config::{Config, RouteConfig};
pub use error::{Error, Result};
