//! Admin endpoint: the UUID → client-port table over a line protocol.
//!
//! One ASCII request per connection, `\n`-terminated:
//!
//! | Request | Response |
//! |---------|----------|
//! | `LIST` | one `<uuid> -> <client_host>:<port>` line per live session |
//! | `GET <uuid>` | `<client_host>:<port>` or `None` |
//! | anything else | connection closed without a reply |

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::net::BoxedStream;
use crate::registry::Registry;

/// Serve one admin connection to completion.  All failures just close the
/// connection; the admin plane never affects sessions.
pub async fn handle_admin(stream: BoxedStream, registry: Arc<Registry>, client_host: String) {
    let (rd, mut wr) = tokio::io::split(stream);
    let mut line = String::new();
    // Invalid UTF-8 or I/O failure: close without a reply.
    if BufReader::new(rd).read_line(&mut line).await.is_err() {
        return;
    }
    let line = line.trim();

    if line == "LIST" {
        let mut reply = String::new();
        for (uuid, port) in registry.snapshot() {
            reply.push_str(&format!("{uuid} -> {client_host}:{port}\n"));
        }
        let _ = wr.write_all(reply.as_bytes()).await;
        let _ = wr.flush().await;
        return;
    }

    let mut parts = line.split_whitespace();
    if parts.next() == Some("GET") {
        if let Some(uuid) = parts.next() {
            let reply = match registry.port_of(uuid) {
                Some(port) => format!("{client_host}:{port}\n"),
                None => "None\n".to_owned(),
            };
            let _ = wr.write_all(reply.as_bytes()).await;
            let _ = wr.flush().await;
        }
    }
    // Malformed input falls through to the connection close.
}

// ── Tests ─────────────────────────────────────────────────────────────────
