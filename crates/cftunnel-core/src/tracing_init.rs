//! Log setup for the `cftunnel` binary.
//!
//! Everything goes to stderr: stdout carries the tunnel URL notice and
//! `--json` reports, which must stay clean. cloudflared's own output is
//! relayed verbatim and never passes through tracing.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// `RUST_LOG` when set and valid, otherwise `default`.
///
/// The CLI passes `cftunnel=<level>` from `--log-level`, so by default only
/// this tool's own crates log and dependencies such as reqwest stay quiet.
pub fn build_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber, human-readable or one JSON object per line.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let filter = build_filter(default_filter);
    let json = log_json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });
    let text = (!log_json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .init();
}
