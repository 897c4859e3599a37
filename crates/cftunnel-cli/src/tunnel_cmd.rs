//! Tunnel lifecycle subcommands: quick, status, fetch, down.
//!
//! User-facing output uses writeln! to the supplied writer (stdout in the
//! binary), logs go to stderr through tracing.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use serde::Serialize;
use tracing::info;

use cftunnel_daemon::auth_proxy::AuthProxyConfig;
use cftunnel_daemon::diagnose::extract_port;
use cftunnel_daemon::state::{process_alive, terminate};
use cftunnel_daemon::{SuperviseError, Supervisor};

use crate::context::Context;
use crate::fmt;

/// How long `down` waits for cloudflared to exit after the signal.
const DOWN_TIMEOUT: Duration = Duration::from_secs(10);
const DOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Local port and auth settings for a quick tunnel.
///
/// With `route`, the port defaults to the one in the route's service URL and
/// the route's credentials put the session behind the auth proxy. An explicit
/// `port` always wins.
pub fn quick_target(
    ctx: &Context,
    port: Option<u16>,
    route: Option<&str>,
) -> Result<(u16, Option<AuthProxyConfig>)> {
    let Some(name) = route else {
        let port = port.context("A port or --route is required")?;
        return Ok((port, None));
    };
    let Some(route) = ctx.config.find_route(name) else {
        bail!("Unknown route: {name}");
    };
    let port = match port {
        Some(port) => port,
        None => extract_port(&route.service).with_context(|| {
            format!("Cannot resolve a port from service {:?}", route.service)
        })?,
    };
    let auth = route
        .auth
        .as_ref()
        .map(|auth| AuthProxyConfig::from_route_auth(auth, port));
    Ok((port, auth))
}

/// Run a quick tunnel in the foreground until Ctrl+C.
pub async fn quick(ctx: &Context, port: Option<u16>, route: Option<&str>) -> Result<()> {
    let (port, auth) = quick_target(ctx, port, route)?;
    let supervisor = Supervisor::new(&ctx.data_dir, ctx.acquirer());
    match supervisor.start_foreground(port, auth).await {
        Err(SuperviseError::AlreadyRunning { pid }) => {
            bail!("A tunnel is already running (PID: {pid}). Stop it with `cftunnel down`.")
        }
        other => other.context("Quick tunnel failed"),
    }
}

/// Make sure cloudflared is available and print where it is.
pub async fn fetch(ctx: &Context, out: &mut impl Write) -> Result<()> {
    let path = ctx
        .acquirer()
        .ensure_binary()
        .await
        .context("Failed to obtain cloudflared")?;
    writeln!(out, "cloudflared: {}", path.display())?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusOutput<'a> {
    running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uptime_secs: Option<u64>,
    routes: Vec<RouteStatus<'a>>,
}

#[derive(Debug, Serialize)]
struct RouteStatus<'a> {
    name: &'a str,
    hostname: &'a str,
    service: &'a str,
    auth: bool,
}

/// Print tunnel liveness and the configured routes.
pub fn status(ctx: &Context, json: bool, out: &mut impl Write) -> Result<()> {
    let tunnel = ctx.tracker().current();

    if json {
        let status = StatusOutput {
            running: tunnel.is_some(),
            pid: tunnel.as_ref().map(|t| t.pid),
            port: tunnel.as_ref().map(|t| t.port),
            uptime_secs: tunnel.as_ref().map(|t| t.uptime().as_secs()),
            routes: ctx
                .config
                .routes
                .iter()
                .map(|r| RouteStatus {
                    name: &r.name,
                    hostname: &r.hostname,
                    service: &r.service,
                    auth: r.auth.is_some(),
                })
                .collect(),
        };
        serde_json::to_writer_pretty(&mut *out, &status)?;
        writeln!(out)?;
    } else {
        fmt::write_status(out, tunnel.as_ref(), &ctx.config.routes)?;
    }
    Ok(())
}

/// Signal the recorded tunnel process and wait for it to go away.
pub async fn down(ctx: &Context, out: &mut impl Write) -> Result<()> {
    let tracker = ctx.tracker();
    let Some(handle) = tracker.current() else {
        writeln!(out, "No tunnel running")?;
        return Ok(());
    };
    let pid = handle.pid;

    info!(pid, "Stopping cloudflared");
    terminate(pid).with_context(|| format!("Failed to signal cloudflared (PID: {pid})"))?;

    let deadline = tokio::time::Instant::now() + DOWN_TIMEOUT;
    while process_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "cloudflared (PID: {pid}) still running after {}s",
                DOWN_TIMEOUT.as_secs()
            );
        }
        tokio::time::sleep(DOWN_POLL_INTERVAL).await;
    }

    tracker.clear();
    writeln!(out, "Tunnel stopped (PID: {pid})")?;
    Ok(())
}
