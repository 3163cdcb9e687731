//! Listener and stream plumbing: plain TCP or TLS, shared writer handles.
//!
//! [`Acceptor`] wraps a [`TcpListener`] with an optional [`TlsAcceptor`]
//! so the rest of the service never cares which transport a connection
//! arrived on; accepted connections surface as [`BoxedStream`]s.
//!
//! Writer halves are shared between tasks (the session driver answers
//! protocol options on the same socket that client handlers paste into),
//! so they live behind an async mutex as [`SharedWriter`]s.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

// ── Stream types ──────────────────────────────────────────────────────────

/// Object-safe alias for anything we can read and write asynchronously.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> AsyncStream for T {}

/// An accepted connection, plain or TLS.
pub type BoxedStream = Box<dyn AsyncStream>;

/// The outbound half of a split [`BoxedStream`], shareable across tasks.
pub type SharedWriter = Arc<Mutex<WriteHalf<BoxedStream>>>;

/// Split an accepted stream into its read half and a [`SharedWriter`].
pub fn split_stream(stream: BoxedStream) -> (tokio::io::ReadHalf<BoxedStream>, SharedWriter) {
    let (rd, wr) = tokio::io::split(stream);
    (rd, Arc::new(Mutex::new(wr)))
}

/// Write `bytes` and flush before releasing the writer lock, so concurrent
/// writers never interleave inside one span.
pub async fn write_all_flush(writer: &SharedWriter, bytes: &[u8]) -> io::Result<()> {
    let mut guard = writer.lock().await;
    guard.write_all(bytes).await?;
    guard.flush().await
}

/// Shut the writer down, ignoring errors; close paths must not fail.
pub async fn close_writer(writer: &SharedWriter) {
    let _ = writer.lock().await.shutdown().await;
}

// ── TLS setup ─────────────────────────────────────────────────────────────

/// Build a [`TlsAcceptor`] from PEM certificate and key files.  Shared by
/// every listener the service binds.
pub fn tls_acceptor(cert: &Path, key: &Path) -> io::Result<TlsAcceptor> {
    let mut cert_rd = BufReader::new(File::open(cert)?);
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_rd).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no certificates found in {}", cert.display()),
        ));
    }

    let mut key_rd = BufReader::new(File::open(key)?);
    let key = rustls_pemfile::private_key(&mut key_rd)?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no private key found in {}", key.display()),
        )
    })?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

// ── Acceptor ──────────────────────────────────────────────────────────────

/// A listening socket that yields [`BoxedStream`]s, TLS-wrapping each
/// accepted connection when an acceptor is configured.
pub struct Acceptor {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl Acceptor {
    pub async fn bind(host: &str, port: u16, tls: Option<TlsAcceptor>) -> io::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        Ok(Self { listener, tls })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn accept(&self) -> io::Result<(BoxedStream, SocketAddr)> {
        let (tcp, peer) = self.listener.accept().await?;
        match &self.tls {
            Some(acceptor) => {
                let tls = acceptor.accept(tcp).await?;
                Ok((Box::new(tls), peer))
            }
            None => Ok((Box::new(tcp), peer)),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
