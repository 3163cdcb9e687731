//! Client plane: per-UUID listeners and attached-client handlers.
//!
//! Each identified VM gets its own accept loop on the allocated client
//! port.  Every accepted client is attached to the session record and
//! served by a handler task that pastes client bytes into the VM writer;
//! VM payload reaches clients through the session driver's broadcast.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;

use crate::net::{self, Acceptor, BoxedStream};
use crate::registry::{ListenerHandle, Registry};
use crate::telnet;

/// Clients are read in chunks of at most this many bytes; each chunk is
/// written through to the VM before the next read (backpressure).
const CLIENT_READ_BUF: usize = 1024;

// ── Listener ──────────────────────────────────────────────────────────────

/// Bind the client listener for `uuid` and spawn its accept loop.
///
/// The returned [`ListenerHandle`] stops the loop when its `stop` end is
/// dropped; awaiting `task` then guarantees no further accepts.
pub async fn start_listener(
    registry: Arc<Registry>,
    uuid: &str,
    host: &str,
    port: u16,
    tls: Option<TlsAcceptor>,
) -> io::Result<ListenerHandle> {
    let acceptor = Acceptor::bind(host, port, tls).await?;
    log::info!("Started client listener on port {port} for VM with UUID='{uuid}'");

    let uuid = uuid.to_owned();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                accepted = acceptor.accept() => match accepted {
                    Ok((stream, peer)) => {
                        log::info!("Client connected for VM with UUID='{uuid}'");
                        tokio::spawn(handle_client(
                            registry.clone(),
                            uuid.clone(),
                            stream,
                            peer,
                        ));
                    }
                    Err(e) => {
                        log::warn!("client accept failed for UUID='{uuid}': {e}");
                    }
                },
            }
        }
    });

    Ok(ListenerHandle { stop: stop_tx, task })
}

// ── Client handler ────────────────────────────────────────────────────────

/// Serve one attached client until it disconnects or the session dies.
///
/// Client bytes are IAC-escaped before entering the VM's Telnet stream.
/// The handler holds no registry lock across awaits; it re-looks-up the VM
/// writer on every chunk so a torn-down session is noticed promptly.
async fn handle_client(
    registry: Arc<Registry>,
    uuid: String,
    stream: BoxedStream,
    peer: SocketAddr,
) {
    let (mut rd, writer) = net::split_stream(stream);
    let Some((client_id, mut closed)) = registry.attach_client(&uuid, writer.clone()) else {
        // The session vanished between accept and attach.
        log::debug!("{peer}: session for UUID='{uuid}' is gone, dropping client");
        net::close_writer(&writer).await;
        return;
    };

    let mut buf = [0u8; CLIENT_READ_BUF];
    loop {
        let n = tokio::select! {
            read = rd.read(&mut buf) => match read {
                Ok(n) => n,
                Err(e) => {
                    log::debug!("{peer}: client read failed: {e}");
                    break;
                }
            },
            _ = closed.changed() => break,
        };
        if n == 0 {
            break;
        }
        let Some(vm_writer) = registry.lookup_vm_writer(&uuid) else {
            break;
        };
        let escaped = telnet::encode_payload(&buf[..n]);
        if let Err(e) = net::write_all_flush(&vm_writer, &escaped).await {
            log::debug!("{peer}: write to VM failed: {e}");
            break;
        }
    }

    registry.detach_client(&uuid, client_id);
    net::close_writer(&writer).await;
    log::info!("Client disconnected for VM with UUID='{uuid}'");
}

// ── Tests ─────────────────────────────────────────────────────────────────
