//! Service assembly: binds the listeners and drives them from a single
//! `tokio::select!` loop.
//!
//! Each accepted VM connection is spawned into a [`JoinSet`] running
//! [`crate::session::run_vm_session`]; admin connections are short-lived
//! and spawned detached.  SIGINT/SIGTERM stop both accept loops first,
//! then a shutdown signal is broadcast and the session set is drained so
//! every driver runs its cleanup path.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::admin;
use crate::config::VspcConfig;
use crate::net::{self, Acceptor, BoxedStream};
use crate::registry::Registry;
use crate::session;
use crate::sink::SerialLog;

// ── SessionContext ────────────────────────────────────────────────────────

/// Everything a session driver needs, cloned per connection.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<Registry>,
    pub sink: Arc<SerialLog>,
    pub config: Arc<VspcConfig>,
    /// TLS acceptor shared by every listener; `None` for plain TCP.
    pub tls: Option<TlsAcceptor>,
    /// Resolves when the service is shutting down.
    pub shutdown: watch::Receiver<()>,
}

// ── VspcServer ────────────────────────────────────────────────────────────

/// The bound-but-not-yet-running service.
///
/// Binding is separate from [`Self::run`] so callers (and tests) can learn
/// the actual listen addresses before any connection is accepted.
pub struct VspcServer {
    config: Arc<VspcConfig>,
    registry: Arc<Registry>,
    sink: Arc<SerialLog>,
    tls: Option<TlsAcceptor>,
    vm_listener: Acceptor,
    admin_listener: Option<Acceptor>,
}

impl VspcServer {
    /// Bind the VM listener and, when the client plane is enabled, the
    /// admin listener.
    pub async fn bind(config: VspcConfig) -> io::Result<Self> {
        let tls = match (&config.cert, &config.key) {
            (Some(cert), Some(key)) => Some(net::tls_acceptor(cert, key)?),
            _ => None,
        };
        let vm_listener = Acceptor::bind(&config.host, config.port, tls.clone()).await?;
        let admin_listener = if config.enable_clients {
            Some(Acceptor::bind(&config.admin_host, config.admin_port, tls.clone()).await?)
        } else {
            None
        };
        let registry = Arc::new(Registry::new(config.enable_clients, config.vm_start_port));
        let sink = Arc::new(SerialLog::new(&config.serial_log_dir));
        Ok(Self {
            config: Arc::new(config),
            registry,
            sink,
            tls,
            vm_listener,
            admin_listener,
        })
    }

    /// Address the VM listener actually bound to.
    pub fn vm_addr(&self) -> io::Result<SocketAddr> {
        self.vm_listener.local_addr()
    }

    /// Address of the admin listener, when the client plane is enabled.
    pub fn admin_addr(&self) -> io::Result<Option<SocketAddr>> {
        self.admin_listener.as_ref().map(|l| l.local_addr()).transpose()
    }

    /// Serve until SIGINT or SIGTERM, then shut down in order: stop
    /// accepting, signal the sessions, wait for their cleanup.
    pub async fn run(self) -> io::Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let mut sessions: JoinSet<()> = JoinSet::new();

        log::info!("Serving on {}", self.vm_listener.local_addr()?);
        log::info!("Log directory: {}", self.config.serial_log_dir.display());

        loop {
            tokio::select! {
                accepted = self.vm_listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = SessionContext {
                            registry: self.registry.clone(),
                            sink: self.sink.clone(),
                            config: self.config.clone(),
                            tls: self.tls.clone(),
                            shutdown: shutdown_rx.clone(),
                        };
                        sessions.spawn(session::run_vm_session(stream, peer, ctx));
                    }
                    Err(e) => log::warn!("VM accept failed: {e}"),
                },

                accepted = accept_opt(&self.admin_listener) => match accepted {
                    Ok((stream, _peer)) => {
                        let registry = self.registry.clone();
                        let client_host = self.config.client_host.clone();
                        tokio::spawn(admin::handle_admin(stream, registry, client_host));
                    }
                    Err(e) => log::warn!("admin accept failed: {e}"),
                },

                // Reap finished session tasks as the service runs.
                Some(finished) = sessions.join_next() => {
                    if let Err(e) = finished {
                        log::error!("session task died: {e}");
                    }
                }

                _ = sigint.recv() => break,
                _ = sigterm.recv() => break,
            }
        }

        log::info!("Shutting down");
        drop(self.vm_listener);
        drop(self.admin_listener);
        let _ = shutdown_tx.send(());
        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                log::error!("session task died during shutdown: {e}");
            }
        }
        Ok(())
    }
}

/// Accept from an optional listener; pending forever when there is none.
async fn accept_opt(listener: &Option<Acceptor>) -> io::Result<(BoxedStream, SocketAddr)> {
    match listener {
        Some(acceptor) => acceptor.accept().await,
        None => std::future::pending().await,
    }
}
