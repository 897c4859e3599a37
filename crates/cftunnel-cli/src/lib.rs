//! cftunnel CLI library
//!
//! Command implementations and output formatting for the `cftunnel` binary.

pub mod context;
pub mod diagnose_cmd;
pub mod fmt;
pub mod tunnel_cmd;
