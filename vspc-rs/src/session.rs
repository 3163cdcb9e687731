//! Per-VM-connection session driver.
//!
//! One [`run_vm_session`] task per accepted VM connection.  The driver
//! owns the read half and the Telnet parser; the [`VmwareHandler`] runs
//! synchronously inside the decode loop, so its replies are flushed before
//! the next read is issued.
//!
//! Lifecycle: advertise the VMware extension, wait for VM-VC-UUID under a
//! deadline, register with the [`Registry`] (optionally starting the
//! per-UUID client listener), then pump payload to the log sink and the
//! attached clients until EOF, error, or service shutdown.  Teardown is
//! unconditional once the session is registered.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::client;
use crate::net::{self, BoxedStream, SharedWriter};
use crate::server::SessionContext;
use crate::telnet::{opt, TelnetEvent, TelnetParser, IAC, WILL};
use crate::vmware::{Verdict, VmwareHandler};

/// How long a VM may take to present VM-VC-UUID before the connection is
/// dropped.
pub const IDENT_TIMEOUT: Duration = Duration::from_secs(2);

const READ_BUF: usize = 8192;

/// Drive one VM connection from accept to teardown.  Never panics the
/// service: all failures end at this frame.
pub async fn run_vm_session(stream: BoxedStream, peer: SocketAddr, ctx: SessionContext) {
    log::info!("{peer} connected");
    match VmSession::new(stream, peer, &ctx).drive().await {
        Ok(()) => log::info!("{peer} disconnected"),
        Err(e) => log::error!("{peer}: session failed: {e}"),
    }
}

// ── VmSession ─────────────────────────────────────────────────────────────

struct VmSession<'a> {
    peer: SocketAddr,
    rd: tokio::io::ReadHalf<BoxedStream>,
    vm_writer: SharedWriter,
    parser: TelnetParser,
    handler: VmwareHandler,
    uuid_rx: oneshot::Receiver<String>,
    ctx: &'a SessionContext,
}

impl<'a> VmSession<'a> {
    fn new(stream: BoxedStream, peer: SocketAddr, ctx: &'a SessionContext) -> Self {
        let (rd, vm_writer) = net::split_stream(stream);
        let (uuid_tx, uuid_rx) = oneshot::channel();
        let handler = VmwareHandler::new(peer, &ctx.config.uri, uuid_tx);
        Self {
            peer,
            rd,
            vm_writer,
            parser: TelnetParser::new(),
            handler,
            uuid_rx,
            ctx,
        }
    }

    async fn drive(mut self) -> io::Result<()> {
        // Advertise the VMware extension; the VM answers with DO and its
        // KNOWN-SUBOPTIONS-1 announcement.
        net::write_all_flush(&self.vm_writer, &[IAC, WILL, opt::VMWARE_EXT]).await?;

        let (uuid, early_payload) = match timeout(IDENT_TIMEOUT, self.await_uuid()).await {
            Ok(Ok(Some(identified))) => identified,
            // EOF or orderly close (proxy rejection) before identification.
            Ok(Ok(None)) => {
                net::close_writer(&self.vm_writer).await;
                return Ok(());
            }
            Ok(Err(e)) => {
                net::close_writer(&self.vm_writer).await;
                return Err(e);
            }
            Err(_) => {
                log::error!("{} didn't present UUID", self.peer);
                net::close_writer(&self.vm_writer).await;
                return Ok(());
            }
        };
        log::info!("{} identified as UUID='{uuid}'", self.peer);

        // Duplicate UUID or port exhaustion is fatal to this connection
        // only; the existing session is untouched.
        let port = match self
            .ctx
            .registry
            .allocate_and_register(&uuid, self.vm_writer.clone())
        {
            Ok(port) => port,
            Err(e) => {
                net::close_writer(&self.vm_writer).await;
                return Err(e.into());
            }
        };

        if let Some(port) = port {
            let started = client::start_listener(
                self.ctx.registry.clone(),
                &uuid,
                &self.ctx.config.client_host,
                port,
                self.ctx.tls.clone(),
            )
            .await;
            match started {
                Ok(handle) => self.ctx.registry.set_listener(&uuid, handle),
                Err(e) => {
                    log::error!(
                        "Unable to start client listener on port {port} for VM with UUID='{uuid}'"
                    );
                    self.teardown(&uuid).await;
                    return Err(e);
                }
            }
        }

        let result = self.payload_loop(&uuid, early_payload).await;
        self.teardown(&uuid).await;
        result
    }

    /// Read until the VM has identified itself.  Returns `None` on EOF or
    /// an orderly close verdict; payload decoded along the way is handed
    /// back so it reaches the log once the session exists.
    async fn await_uuid(&mut self) -> io::Result<Option<(String, Vec<u8>)>> {
        let mut buf = [0u8; READ_BUF];
        let mut early_payload = Vec::new();
        loop {
            let n = self.rd.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            let (spans, close) = self.process_batch(&buf[..n]).await?;
            for span in spans {
                early_payload.extend_from_slice(&span);
            }
            if close {
                return Ok(None);
            }
            if let Ok(uuid) = self.uuid_rx.try_recv() {
                return Ok(Some((uuid, early_payload)));
            }
        }
    }

    /// Parse one read's worth of bytes, run the option handler, and write
    /// its replies.  Returns the decoded payload spans and whether the
    /// handler asked for an orderly close.
    async fn process_batch(&mut self, bytes: &[u8]) -> io::Result<(Vec<Vec<u8>>, bool)> {
        let events = self.parser.feed(bytes)?;
        let mut replies = Vec::new();
        let mut spans = Vec::new();
        let mut close = false;
        for event in events {
            match event {
                TelnetEvent::Data(data) => spans.push(data),
                event => {
                    if self.handler.on_event(&event, &mut replies)? == Verdict::Close {
                        close = true;
                    }
                }
            }
        }
        if !replies.is_empty() {
            net::write_all_flush(&self.vm_writer, &replies).await?;
        }
        Ok((spans, close))
    }

    async fn payload_loop(&mut self, uuid: &str, early_payload: Vec<u8>) -> io::Result<()> {
        if !early_payload.is_empty() {
            self.deliver(uuid, &early_payload).await?;
        }
        let mut shutdown = self.ctx.shutdown.clone();
        let mut buf = [0u8; READ_BUF];
        loop {
            let n = tokio::select! {
                read = self.rd.read(&mut buf) => read?,
                // Fires on service shutdown (value or sender drop alike).
                _ = shutdown.changed() => break,
            };
            if n == 0 {
                break;
            }
            let (spans, close) = self.process_batch(&buf[..n]).await?;
            for span in &spans {
                self.deliver(uuid, span).await?;
            }
            if close {
                break;
            }
        }
        Ok(())
    }

    /// Log one payload span, then fan it out.  A sink failure is fatal to
    /// the session rather than silently dropped.
    async fn deliver(&self, uuid: &str, data: &[u8]) -> io::Result<()> {
        self.ctx.sink.append(uuid, data).await?;
        if self.ctx.registry.clients_enabled() {
            self.broadcast(uuid, data).await;
        }
        Ok(())
    }

    /// Write `data` to every attached client, in attach-id order per
    /// snapshot.  A client whose write fails is detached and closed; the
    /// session itself is unaffected.
    async fn broadcast(&self, uuid: &str, data: &[u8]) {
        for (client_id, writer) in self.ctx.registry.client_writers(uuid) {
            if let Err(e) = net::write_all_flush(&writer, data).await {
                log::warn!("dropping client of UUID='{uuid}': write failed: {e}");
                self.ctx.registry.detach_client(uuid, client_id);
                net::close_writer(&writer).await;
            }
        }
    }

    /// Unconditional cleanup once a session was registered: remove the
    /// record, quiesce the client listener, close every attached client,
    /// close the VM writer.  Errors here are logged and swallowed.
    async fn teardown(&self, uuid: &str) {
        if let Some(mut record) = self.ctx.registry.unregister(uuid) {
            if let Some(listener) = record.listener.take() {
                if let Some(port) = record.port {
                    log::info!("Stopping client listener on port {port} for VM with UUID='{uuid}'");
                }
                drop(listener.stop);
                if let Err(e) = listener.task.await {
                    log::debug!("client listener task for UUID='{uuid}' ended abnormally: {e}");
                }
            }
            for (_, writer) in record.clients.drain() {
                net::close_writer(&writer).await;
            }
            // Dropping the record releases `closed_tx`, waking any client
            // handler still blocked on its socket.
        }
        net::close_writer(&self.vm_writer).await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VspcConfig;
    use crate::registry::Registry;
    use crate::sink::SerialLog;
    use crate::telnet::{SB, SE};
    use crate::vmware::sub;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::watch;

    /// The returned sender must stay alive: dropping it reads as service
    /// shutdown to every session.
    fn test_context(
        dir: &std::path::Path,
        enable_clients: bool,
    ) -> (SessionContext, watch::Sender<()>) {
        let config = VspcConfig {
            host: "127.0.0.1".into(),
            port: 0,
            client_host: "127.0.0.1".into(),
            vm_start_port: 28000,
            admin_host: "127.0.0.1".into(),
            admin_port: 0,
            enable_clients,
            cert: None,
            key: None,
            uri: "vspc://test".into(),
            serial_log_dir: dir.to_owned(),
        };
        let (shutdown_tx, shutdown) = watch::channel(());
        let ctx = SessionContext {
            registry: Arc::new(Registry::new(enable_clients, config.vm_start_port)),
            sink: Arc::new(SerialLog::new(dir)),
            config: Arc::new(config),
            tls: None,
            shutdown,
        };
        (ctx, shutdown_tx)
    }

    /// Accept one connection and run a session driver for it.
    async fn spawn_session(
        ctx: SessionContext,
    ) -> (TcpStream, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let vm = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let task = tokio::spawn(run_vm_session(Box::new(stream), peer, ctx));
        (vm, task)
    }

    fn uuid_subneg(uuid: &[u8]) -> Vec<u8> {
        let mut msg = vec![IAC, SB, opt::VMWARE_EXT, sub::VM_VC_UUID];
        msg.extend_from_slice(uuid);
        msg.extend_from_slice(&[IAC, SE]);
        msg
    }

    #[tokio::test]
    async fn unidentified_vm_is_dropped_after_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _shutdown_tx) = test_context(dir.path(), false);
        let (mut vm, task) = spawn_session(ctx).await;

        // Swallow the WILL advertisement, then stay silent.
        let mut buf = [0u8; 3];
        vm.read_exact(&mut buf).await.unwrap();

        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(4), vm.read_to_end(&mut rest))
            .await
            .expect("server should close within the deadline")
            .unwrap();
        assert_eq!(n, 0);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn identified_vm_payload_reaches_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _shutdown_tx) = test_context(dir.path(), false);
        let registry = ctx.registry.clone();
        let (mut vm, task) = spawn_session(ctx).await;

        vm.write_all(&uuid_subneg(b"11-22 33")).await.unwrap();
        vm.write_all(b"hello").await.unwrap();
        vm.flush().await.unwrap();

        // Wait until the payload landed, then disconnect.
        let path = dir.path().join("112233");
        tokio::time::timeout(Duration::from_secs(2), async {
            while std::fs::read(&path).map(|c| c != b"hello").unwrap_or(true) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(registry.lookup_vm_writer("112233").is_some());

        drop(vm);
        task.await.unwrap();
        assert!(registry.lookup_vm_writer("112233").is_none());
    }

    #[tokio::test]
    async fn second_connection_with_same_uuid_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _shutdown_tx) = test_context(dir.path(), false);
        let registry = ctx.registry.clone();

        let (mut vm1, _task1) = spawn_session(ctx.clone()).await;
        vm1.write_all(&uuid_subneg(b"abc")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.lookup_vm_writer("abc").is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let (mut vm2, task2) = spawn_session(ctx).await;
        vm2.write_all(&uuid_subneg(b"abc")).await.unwrap();
        let mut buf = Vec::new();
        // The duplicate is closed; the first session stays registered.
        tokio::time::timeout(Duration::from_secs(4), vm2.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        task2.await.unwrap();
        assert!(registry.lookup_vm_writer("abc").is_some());
    }
}
