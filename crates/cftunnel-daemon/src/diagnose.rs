//! Connectivity diagnostics.
//!
//! Checks, in order:
//! 1. cloudflared binary (installed, version) and tunnel process liveness
//! 2. Cloudflare API reachability
//! 3. per route, concurrently: local port, DNS, HTTPS
//!
//! Nothing here returns an error. Every failed check becomes a field in the
//! report. Route checks fan out one task per route with no concurrency cap,
//! which is fine for the handful of routes a config normally holds.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::acquire::BinaryAcquirer;
use crate::http;
use crate::state::ProcessTracker;

/// Timeout for every individual probe.
pub const DIAGNOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Endpoint used to check that the Cloudflare API answers at all.
pub const API_VERIFY_URL: &str = "https://api.cloudflare.com/client/v4/user/tokens/verify";

/// A route to diagnose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteProbeInput {
    pub name: String,
    pub hostname: String,
    /// Local service URL, e.g. `http://localhost:3000`.
    pub service: String,
}

/// cloudflared binary and process state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryCheck {
    pub installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Cloudflare API reachability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCheck {
    pub reachable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// Result of probing one route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDiagnosis {
    pub name: String,
    pub hostname: String,
    pub service: String,
    pub local_ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_err: Option<String>,
    pub dns_ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_err: Option<String>,
    pub http_ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_err: Option<String>,
}

impl RouteDiagnosis {
    fn for_route(route: &RouteProbeInput) -> Self {
        Self {
            name: route.name.clone(),
            hostname: route.hostname.clone(),
            service: route.service.clone(),
            ..Self::default()
        }
    }

    /// A route passes when the local service listens and its hostname
    /// resolves. HTTPS reachability is reported but does not count.
    pub const fn passed(&self) -> bool {
        self.local_ok && self.dns_ok
    }
}

/// Full diagnostics result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub cloudflared: BinaryCheck,
    pub api: ApiCheck,
    pub routes: Vec<RouteDiagnosis>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

impl DiagnosticReport {
    /// Assemble a report and derive the totals from the route results.
    pub fn new(cloudflared: BinaryCheck, api: ApiCheck, routes: Vec<RouteDiagnosis>) -> Self {
        let passed = routes.iter().filter(|r| r.passed()).count();
        Self {
            cloudflared,
            api,
            total: routes.len(),
            passed,
            failed: routes.len() - passed,
            routes,
        }
    }
}

/// Why a single probe failed. The messages are deliberately generic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    #[error("cannot resolve port")]
    NoPort,
    #[error("not listening")]
    NotListening,
    #[error("resolution failed")]
    DnsFailed,
    #[error("unreachable")]
    Unreachable,
}

/// Network probes used by the diagnostics engine.
pub trait Prober: Send + Sync + 'static {
    /// TCP connect to `127.0.0.1:port`, closing immediately.
    fn local_port(&self, port: u16) -> impl Future<Output = Result<(), ProbeFailure>> + Send;

    /// Resolve `hostname`.
    fn resolve(&self, hostname: &str) -> impl Future<Output = Result<(), ProbeFailure>> + Send;

    /// GET `https://<hostname>`; any HTTP response counts.
    fn https(&self, hostname: &str) -> impl Future<Output = Result<(), ProbeFailure>> + Send;

    /// GET `url`; any HTTP response counts.
    fn api(&self, url: &str) -> impl Future<Output = Result<(), ProbeFailure>> + Send;
}

/// Probes against the real network, each bounded by a timeout.
#[derive(Debug, Clone)]
pub struct NetworkProber {
    http: reqwest::Client,
    timeout: Duration,
}

impl NetworkProber {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: http::client(timeout)?,
            timeout,
        })
    }
}

impl Prober for NetworkProber {
    async fn local_port(&self, port: u16) -> Result<(), ProbeFailure> {
        match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(("127.0.0.1", port)))
            .await
        {
            Ok(Ok(stream)) => {
                drop(stream);
                Ok(())
            }
            _ => Err(ProbeFailure::NotListening),
        }
    }

    async fn resolve(&self, hostname: &str) -> Result<(), ProbeFailure> {
        match tokio::time::timeout(self.timeout, tokio::net::lookup_host((hostname, 443))).await {
            Ok(Ok(mut addrs)) => addrs.next().map(drop).ok_or(ProbeFailure::DnsFailed),
            _ => Err(ProbeFailure::DnsFailed),
        }
    }

    async fn https(&self, hostname: &str) -> Result<(), ProbeFailure> {
        self.http
            .get(format!("https://{hostname}"))
            .send()
            .await
            .map(drop)
            .map_err(|e| {
                debug!(hostname, error = %e, "HTTPS probe failed");
                ProbeFailure::Unreachable
            })
    }

    async fn api(&self, url: &str) -> Result<(), ProbeFailure> {
        self.http.get(url).send().await.map(drop).map_err(|e| {
            debug!(url, error = %e, "API probe failed");
            ProbeFailure::Unreachable
        })
    }
}

/// Produces [`DiagnosticReport`]s.
#[derive(Debug)]
pub struct DiagnosticsEngine<P = NetworkProber> {
    acquirer: BinaryAcquirer,
    tracker: ProcessTracker,
    prober: Arc<P>,
    api_url: String,
    timeout: Duration,
}

impl DiagnosticsEngine<NetworkProber> {
    /// Engine probing the real network.
    pub fn new(acquirer: BinaryAcquirer, tracker: ProcessTracker) -> Result<Self, reqwest::Error> {
        Ok(Self::with_prober(
            acquirer,
            tracker,
            NetworkProber::new(DIAGNOSE_TIMEOUT)?,
        ))
    }
}

impl<P: Prober> DiagnosticsEngine<P> {
    pub fn with_prober(acquirer: BinaryAcquirer, tracker: ProcessTracker, prober: P) -> Self {
        Self {
            acquirer,
            tracker,
            prober: Arc::new(prober),
            api_url: API_VERIFY_URL.to_string(),
            timeout: DIAGNOSE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    /// Run every check and return the report.
    pub async fn diagnose(&self, routes: &[RouteProbeInput]) -> DiagnosticReport {
        let cloudflared = self.check_binary().await;
        let api = self.check_api().await;

        let handles: Vec<_> = routes
            .iter()
            .cloned()
            .map(|route| {
                let prober = Arc::clone(&self.prober);
                tokio::spawn(async move { diagnose_route(prober.as_ref(), &route).await })
            })
            .collect();

        let mut results = Vec::with_capacity(routes.len());
        for (handle, route) in handles.into_iter().zip(routes) {
            match handle.await {
                Ok(diagnosis) => results.push(diagnosis),
                Err(e) => {
                    warn!(route = %route.name, error = %e, "Route probe task failed");
                    let mut diagnosis = RouteDiagnosis::for_route(route);
                    diagnosis.local_err = Some("probe task failed".to_string());
                    results.push(diagnosis);
                }
            }
        }

        DiagnosticReport::new(cloudflared, api, results)
    }

    async fn check_binary(&self) -> BinaryCheck {
        let mut check = BinaryCheck::default();
        if let Some(path) = self.acquirer.locate() {
            check.installed = true;
            check.version = self.binary_version(&path).await;
            check.path = Some(path);
        }
        if let Some(handle) = self.tracker.current() {
            check.running = true;
            check.pid = Some(handle.pid);
        }
        check
    }

    async fn binary_version(&self, path: &std::path::Path) -> Option<String> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(path).arg("version").kill_on_drop(true).output(),
        )
        .await
        .ok()?
        .ok()?;
        if !output.status.success() {
            debug!(status = %output.status, "cloudflared version failed");
            return None;
        }
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }

    async fn check_api(&self) -> ApiCheck {
        let start = Instant::now();
        match self.prober.api(&self.api_url).await {
            Ok(()) => ApiCheck {
                reachable: true,
                latency_ms: Some(u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)),
                err: None,
            },
            Err(e) => ApiCheck {
                reachable: false,
                latency_ms: None,
                err: Some(e.to_string()),
            },
        }
    }
}

async fn diagnose_route<P: Prober>(prober: &P, route: &RouteProbeInput) -> RouteDiagnosis {
    let mut d = RouteDiagnosis::for_route(route);

    match extract_port(&route.service) {
        Some(port) => match prober.local_port(port).await {
            Ok(()) => d.local_ok = true,
            Err(e) => d.local_err = Some(e.to_string()),
        },
        None => d.local_err = Some(ProbeFailure::NoPort.to_string()),
    }

    if !route.hostname.is_empty() {
        match prober.resolve(&route.hostname).await {
            Ok(()) => d.dns_ok = true,
            Err(e) => d.dns_err = Some(e.to_string()),
        }
    }

    // Probing HTTPS for a name that does not resolve tells us nothing.
    if d.dns_ok {
        match prober.https(&route.hostname).await {
            Ok(()) => d.http_ok = true,
            Err(e) => d.http_err = Some(e.to_string()),
        }
    }

    d
}

/// Port of a service URL such as `http://localhost:3000`.
///
/// The scheme is optional, a trailing path is ignored, IPv6 hosts must be
/// bracketed. Returns `None` when no explicit port is present.
pub fn extract_port(service: &str) -> Option<u16> {
    let rest = service
        .strip_prefix("https://")
        .or_else(|| service.strip_prefix("http://"))
        .unwrap_or(service);
    let authority = rest.split('/').next().unwrap_or(rest);

    let port = if let Some(bracketed) = authority.strip_prefix('[') {
        let (_, after) = bracketed.split_once(']')?;
        after.strip_prefix(':')?
    } else {
        let (host, port) = authority.rsplit_once(':')?;
        if host.contains(':') {
            return None;
        }
        port
    };
    port.parse::<u16>().ok().filter(|p| *p != 0)
}
