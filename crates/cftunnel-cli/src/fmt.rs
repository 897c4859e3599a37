//! Human-readable output for `status` and `diagnose`.

use std::io::{self, Write};
use std::time::Duration;

use cftunnel_core::RouteConfig;
use cftunnel_daemon::TunnelProcessHandle;
use cftunnel_daemon::diagnose::{DiagnosticReport, RouteDiagnosis};

const OK: &str = "✓";
const FAIL: &str = "✗";

/// `1h 02m 03s`, `4m 05s` or `6s`.
pub fn format_uptime(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

pub fn write_status(
    w: &mut impl Write,
    tunnel: Option<&TunnelProcessHandle>,
    routes: &[RouteConfig],
) -> io::Result<()> {
    match tunnel {
        Some(t) => {
            writeln!(w, "Tunnel:  {OK} running (PID: {})", t.pid)?;
            writeln!(w, "  Port:   {}", t.port)?;
            writeln!(w, "  Uptime: {}", format_uptime(t.uptime()))?;
        }
        None => writeln!(w, "Tunnel:  {FAIL} stopped")?,
    }
    writeln!(w, "Routes:  {}", routes.len())?;
    for r in routes {
        let auth = if r.auth.is_some() { " [auth]" } else { "" };
        writeln!(w, "  {} → {}{auth}", r.hostname, r.service)?;
    }
    Ok(())
}

pub fn write_report(w: &mut impl Write, r: &DiagnosticReport) -> io::Result<()> {
    writeln!(w, "Connectivity diagnostics")?;
    writeln!(w, "========================")?;

    let c = &r.cloudflared;
    if c.installed {
        writeln!(
            w,
            "cloudflared: {OK} installed ({})",
            c.version.as_deref().unwrap_or("unknown version")
        )?;
        if let Some(path) = &c.path {
            writeln!(w, "  Path:    {}", path.display())?;
        }
        match c.pid.filter(|_| c.running) {
            Some(pid) => writeln!(w, "  Process: running (PID: {pid})")?,
            None => writeln!(w, "  Process: not running")?,
        }
    } else {
        writeln!(w, "cloudflared: {FAIL} not installed")?;
    }

    let a = &r.api;
    if a.reachable {
        writeln!(w, "Cloudflare API: {OK} reachable ({}ms)", a.latency_ms.unwrap_or(0))?;
    } else {
        writeln!(
            w,
            "Cloudflare API: {FAIL} {}",
            a.err.as_deref().unwrap_or("unreachable")
        )?;
    }
    writeln!(w)?;

    if r.routes.is_empty() {
        writeln!(w, "No routes to check")?;
        return Ok(());
    }

    let mut rows = vec![
        ["Route", "Hostname", "Local", "DNS", "HTTPS"].map(String::from),
        ["-----", "--------", "-----", "---", "-----"].map(String::from),
    ];
    rows.extend(r.routes.iter().map(route_row));
    write_table(w, &rows)?;

    writeln!(
        w,
        "\nResult: {} routes, {} passed / {} failed",
        r.total, r.passed, r.failed
    )
}

fn route_row(d: &RouteDiagnosis) -> [String; 5] {
    let check = |ok: bool, err: Option<&String>| {
        if ok {
            OK.to_string()
        } else {
            format!("{FAIL} {}", err.map_or("", String::as_str))
                .trim_end()
                .to_string()
        }
    };
    let https = if d.dns_ok {
        check(d.http_ok, d.http_err.as_ref())
    } else {
        "-".to_string()
    };
    [
        d.name.clone(),
        d.hostname.clone(),
        check(d.local_ok, d.local_err.as_ref()),
        check(d.dns_ok, d.dns_err.as_ref()),
        https,
    ]
}

/// Left-aligned columns separated by two spaces.
fn write_table<const N: usize>(w: &mut impl Write, rows: &[[String; N]]) -> io::Result<()> {
    let mut widths = [0usize; N];
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }
    for row in rows {
        let mut line = String::new();
        for (i, cell) in row.iter().enumerate() {
            line.push_str(cell);
            if i + 1 < N {
                let pad = widths[i] - cell.chars().count() + 2;
                line.extend(std::iter::repeat_n(' ', pad));
            }
        }
        writeln!(w, "{}", line.trim_end())?;
    }
    Ok(())
}
