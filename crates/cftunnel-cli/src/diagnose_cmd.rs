//! `cftunnel diagnose`

use std::io::Write;

use anyhow::{Context as _, Result};

use cftunnel_daemon::DiagnosticsEngine;

use crate::context::Context;
use crate::fmt;

/// Diagnose every configured route, or only `route` when given.
pub async fn run(
    ctx: &Context,
    route: Option<&str>,
    json: bool,
    out: &mut impl Write,
) -> Result<()> {
    let routes = match route {
        Some(name) => {
            ctx.config
                .find_route(name)
                .with_context(|| format!("No route named '{name}'"))?;
            ctx.route_inputs()
                .into_iter()
                .filter(|r| r.name == name)
                .collect()
        }
        None => ctx.route_inputs(),
    };

    let engine = DiagnosticsEngine::new(ctx.acquirer(), ctx.tracker())
        .context("Failed to set up HTTP client")?;
    let report = engine.diagnose(&routes).await;

    if json {
        serde_json::to_writer_pretty(&mut *out, &report)?;
        writeln!(out)?;
    } else {
        fmt::write_report(out, &report)?;
    }
    Ok(())
}
