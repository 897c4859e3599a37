//! cftunnel CLI
//!
//! Quick tunnels over cloudflared plus connectivity diagnostics for the
//! configured routes.

use std::io;

use clap::{Parser, Subcommand};
use tracing::debug;

use cftunnel_cli::context::Context;
use cftunnel_cli::{diagnose_cmd, tunnel_cmd};

#[derive(Parser, Debug)]
#[command(name = "cftunnel")]
#[command(version, about = "Expose local services through Cloudflare tunnels", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, default_value = "info", env = "CFTUNNEL_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "CFTUNNEL_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a temporary tunnel to a local port (no account needed).
    ///
    /// Runs in the foreground and prints the assigned trycloudflare.com URL.
    /// Press Ctrl+C to stop.
    Quick {
        /// Local port to expose. Defaults to the port of `--route`.
        #[arg(
            value_parser = clap::value_parser!(u16).range(1..),
            required_unless_present = "route"
        )]
        port: Option<u16>,
        /// Expose a configured route, behind its auth settings if it has any.
        #[arg(long)]
        route: Option<String>,
    },
    /// Check cloudflared, the Cloudflare API and every configured route.
    Diagnose {
        /// Only check this route.
        #[arg(long)]
        route: Option<String>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show whether a tunnel is running and list the configured routes.
    Status {
        /// Print status as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Download cloudflared if it is not installed yet.
    Fetch,
    /// Stop the running tunnel.
    Down,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    cftunnel_core::tracing_init::init_tracing(
        &format!("cftunnel={}", cli.log_level),
        cli.log_json,
    );

    let ctx = Context::load()?;
    debug!(
        data_dir = %ctx.data_dir.display(),
        portable = cftunnel_core::paths::is_portable(),
        routes = ctx.config.routes.len(),
        "Loaded configuration"
    );

    let mut out = io::stdout();
    match cli.command {
        Command::Quick { port, route } => tunnel_cmd::quick(&ctx, port, route.as_deref()).await,
        Command::Diagnose { route, json } => {
            diagnose_cmd::run(&ctx, route.as_deref(), json, &mut out).await
        }
        Command::Status { json } => tunnel_cmd::status(&ctx, json, &mut out),
        Command::Fetch => tunnel_cmd::fetch(&ctx, &mut out).await,
        Command::Down => tunnel_cmd::down(&ctx, &mut out).await,
    }
}
