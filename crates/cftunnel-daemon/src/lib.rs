//! cftunnel runtime
//!
//! Everything needed to run a cloudflared quick tunnel:
//! - Binary acquisition with mirror fallback
//! - Liveness tracking of the tunnel process
//! - Output scanning for the public URL
//! - Foreground supervision with optional auth proxy
//! - Connectivity diagnostics

pub mod acquire;
pub mod auth_proxy;
pub mod diagnose;
pub mod http;
pub mod platform;
pub mod scanner;
pub mod state;
pub mod supervisor;

pub use acquire::{AcquireError, BinaryAcquirer, MirrorList};
pub use diagnose::{DiagnosticReport, DiagnosticsEngine, RouteProbeInput};
pub use state::{ProcessTracker, TunnelProcessHandle};
pub use supervisor::{SuperviseError, Supervisor};
