//! cloudflared output scanning.
//!
//! Quick tunnels announce their randomly assigned `*.trycloudflare.com`
//! address on stderr. The scanner relays every line to the operator and
//! prints a single notice the first time the address shows up.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{info, warn};

/// Substring marking lines that carry the quick-tunnel address.
pub const QUICK_TUNNEL_MARKER: &str = "trycloudflare.com";

/// Extract the public URL from a cloudflared output line.
///
/// Returns the first whitespace-delimited token that contains `marker` and
/// starts with `http`.
pub fn extract_url<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.split_whitespace()
        .find(|token| token.contains(marker) && token.starts_with("http"))
}

/// Relay `reader` line by line to `relay`, announcing the endpoint on `notice`.
///
/// Lines are relayed byte for byte; invalid UTF-8 is only decoded lossily for
/// matching. A failing `relay` or `notice` writer is logged once and then
/// skipped while the reader keeps being drained, so the child never blocks
/// or sees a closed pipe. Returns the endpoint once the stream ends, if one
/// was seen.
pub async fn scan_output<R, W, N>(
    reader: R,
    mut relay: W,
    mut notice: N,
) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    N: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut endpoint: Option<String> = None;
    let mut relay_open = true;
    let mut notice_open = true;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }

        if endpoint.is_none() {
            let line = String::from_utf8_lossy(&buf);
            if let Some(url) = extract_url(&line, QUICK_TUNNEL_MARKER) {
                info!(url, "Quick tunnel endpoint assigned");
                if notice_open {
                    let text = format!("\n\u{2714} Tunnel is up: {url}\n\n");
                    if let Err(e) = write_flushed(&mut notice, text.as_bytes()).await {
                        warn!(error = %e, "Cannot print tunnel notice");
                        notice_open = false;
                    }
                }
                endpoint = Some(url.to_string());
            }
        }

        if relay_open {
            if let Err(e) = write_flushed(&mut relay, &buf).await {
                warn!(error = %e, "Cannot relay cloudflared output, discarding the rest");
                relay_open = false;
            }
        }
    }

    Ok(endpoint)
}

async fn write_flushed<W: AsyncWrite + Unpin>(w: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    w.write_all(bytes).await?;
    w.flush().await
}
