//! Shared reqwest client construction.

use std::time::Duration;

/// Build an HTTP client whose requests are bounded by `timeout`.
pub fn client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    // Ensure a TLS crypto provider is installed (reqwest uses rustls-no-provider).
    // The `Err` case just means it was already installed -- safe to ignore.
    let _ = rustls::crypto::ring::default_provider().install_default();

    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("cftunnel/", env!("CARGO_PKG_VERSION")))
        .build()
}
