//! Contract for the cookie-authenticated reverse proxy.
//!
//! The proxy itself lives outside this crate. The supervisor only needs to
//! build one from an [`AuthProxyConfig`] through an [`AuthProxyFactory`],
//! start it in front of the local service, learn the ephemeral port it bound,
//! and stop it when the tunnel session ends.

use std::sync::Arc;
use std::time::Duration;

use cftunnel_core::config::RouteAuth;
use thiserror::Error;
use tracing::debug;

/// Settings handed to an auth proxy implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthProxyConfig {
    pub username: String,
    pub password: String,
    /// Local service port the proxy forwards authenticated requests to.
    pub target_port: u16,
    /// Key used to sign session cookies. Empty means the proxy picks a
    /// per-session key.
    pub signing_key: Vec<u8>,
    pub cookie_ttl: Duration,
}

impl AuthProxyConfig {
    /// Settings for a route's credentials, forwarding to `target_port`.
    pub fn from_route_auth(auth: &RouteAuth, target_port: u16) -> Self {
        Self {
            username: auth.username.clone(),
            password: auth.password.clone(),
            target_port,
            signing_key: auth
                .signing_key
                .as_deref()
                .map(|key| key.as_bytes().to_vec())
                .unwrap_or_default(),
            cookie_ttl: auth.cookie_ttl_or_default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthProxyError {
    #[error("failed to bind auth proxy: {0}")]
    Bind(#[from] std::io::Error),

    #[error("invalid auth proxy configuration: {0}")]
    Config(String),

    #[error("authentication requested but no auth proxy is available")]
    Unavailable,
}

/// A reverse proxy that requires a login before forwarding.
///
/// `start` and `stop` are each called at most once per instance.
pub trait AuthProxy: Send {
    /// Bind an ephemeral loopback port and begin serving.
    fn start(&mut self) -> Result<(), AuthProxyError>;

    /// Stop serving and release the port.
    fn stop(&mut self);

    /// Port bound by `start`; `None` before a successful start.
    fn listen_port(&self) -> Option<u16>;
}

type BuildFn = dyn Fn(AuthProxyConfig) -> Box<dyn AuthProxy> + Send + Sync;

/// Builds an [`AuthProxy`] for one tunnel session.
#[derive(Clone)]
pub struct AuthProxyFactory(Arc<BuildFn>);

impl AuthProxyFactory {
    pub fn new<F>(build: F) -> Self
    where
        F: Fn(AuthProxyConfig) -> Box<dyn AuthProxy> + Send + Sync + 'static,
    {
        Self(Arc::new(build))
    }

    pub fn build(&self, config: AuthProxyConfig) -> Box<dyn AuthProxy> {
        (self.0)(config)
    }
}

impl std::fmt::Debug for AuthProxyFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthProxyFactory").finish_non_exhaustive()
    }
}

/// Stops the wrapped proxy when dropped, on every exit path.
pub struct ProxyGuard {
    proxy: Box<dyn AuthProxy>,
    port: u16,
}

impl ProxyGuard {
    /// Start `proxy` and hold it until the guard is dropped.
    pub fn start(mut proxy: Box<dyn AuthProxy>) -> Result<Self, AuthProxyError> {
        proxy.start()?;
        let Some(port) = proxy.listen_port() else {
            proxy.stop();
            return Err(AuthProxyError::Config(
                "proxy started without reporting a listen port".into(),
            ));
        };
        Ok(Self { proxy, port })
    }

    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for ProxyGuard {
    fn drop(&mut self) {
        debug!(port = self.port, "Stopping auth proxy");
        self.proxy.stop();
    }
}

impl std::fmt::Debug for ProxyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyGuard").field("port", &self.port).finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProxy {
        port: Option<u16>,
        bind_to: Option<u16>,
        stops: Arc<AtomicUsize>,
    }

    impl AuthProxy for CountingProxy {
        fn start(&mut self) -> Result<(), AuthProxyError> {
            self.port = self.bind_to;
            Ok(())
        }
        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        fn listen_port(&self) -> Option<u16> {
            self.port
        }
    }

    #[test]
    fn guard_stops_proxy_once_on_drop() {
        let stops = Arc::new(AtomicUsize::new(0));
        let guard = ProxyGuard::start(Box::new(CountingProxy {
            port: None,
            bind_to: Some(40_000),
            stops: Arc::clone(&stops),
        }))
        .unwrap();
        assert_eq!(guard.port(), 40_000);
        assert_eq!(stops.load(Ordering::SeqCst), 0);
        drop(guard);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_port_is_rejected_and_proxy_stopped() {
        let stops = Arc::new(AtomicUsize::new(0));
        let result = ProxyGuard::start(Box::new(CountingProxy {
            port: None,
            bind_to: None,
            stops: Arc::clone(&stops),
        }));
        assert!(matches!(result, Err(AuthProxyError::Config(_))));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    fn route_auth(signing_key: Option<&str>, cookie_ttl: u64) -> RouteAuth {
        RouteAuth {
            username: "ops".into(),
            password: "hunter2".into(),
            signing_key: signing_key.map(str::to_string),
            cookie_ttl,
        }
    }

    #[test]
    fn route_credentials_become_proxy_settings() {
        let config = AuthProxyConfig::from_route_auth(&route_auth(Some("k3y"), 600), 3000);
        assert_eq!(config.username, "ops");
        assert_eq!(config.password, "hunter2");
        assert_eq!(config.target_port, 3000);
        assert_eq!(config.signing_key, b"k3y");
        assert_eq!(config.cookie_ttl, Duration::from_secs(600));
    }

    #[test]
    fn unset_ttl_and_key_use_defaults() {
        let config = AuthProxyConfig::from_route_auth(&route_auth(None, 0), 8080);
        assert!(config.signing_key.is_empty());
        assert_eq!(config.cookie_ttl, Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn factory_receives_the_settings() {
        let seen = Arc::new(Mutex::new(None));
        let factory = {
            let seen = Arc::clone(&seen);
            AuthProxyFactory::new(move |config| {
                *seen.lock().unwrap() = Some(config.target_port);
                Box::new(CountingProxy {
                    port: None,
                    bind_to: Some(40_001),
                    stops: Arc::new(AtomicUsize::new(0)),
                })
            })
        };
        let config = AuthProxyConfig::from_route_auth(&route_auth(None, 0), 5173);
        let guard = ProxyGuard::start(factory.build(config)).unwrap();
        assert_eq!(guard.port(), 40_001);
        assert_eq!(*seen.lock().unwrap(), Some(5173));
    }
}
