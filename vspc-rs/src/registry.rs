//! Process-wide session registry: the only state shared across tasks.
//!
//! Maps each live VM's normalized UUID to its [`SessionRecord`].  All
//! mutation goes through the methods here; the inner map is guarded by a
//! plain [`std::sync::Mutex`] and no method awaits while holding it, so
//! every operation is atomic with respect to every other.
//!
//! Client-plane coroutines run in parallel with their VM session driver:
//! `attach_client` / `detach_client` interleave arbitrarily with
//! `allocate_and_register` / `unregister`, and the invariants (one record
//! per UUID, pairwise-distinct client ports) must hold at every instant.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::net::SharedWriter;

// ── ListenerHandle ────────────────────────────────────────────────────────

/// Handle to a per-UUID client accept loop.
///
/// Dropping `stop` makes the loop exit; awaiting `task` confirms
/// quiescence before client writers are closed.
pub struct ListenerHandle {
    pub stop: oneshot::Sender<()>,
    pub task: JoinHandle<()>,
}

// ── SessionRecord ─────────────────────────────────────────────────────────

/// Everything the registry holds for one identified VM connection.
pub struct SessionRecord {
    /// Outbound half of the VM transport; shared with client handlers.
    pub vm_writer: SharedWriter,
    /// Allocated client port; `None` when the client plane is disabled.
    pub port: Option<u16>,
    /// Accept-loop handle for `port`; installed after a successful bind.
    pub listener: Option<ListenerHandle>,
    /// Attached client writers, keyed by their attach id.
    pub clients: HashMap<u64, SharedWriter>,
    /// Dropped on teardown; subscribed by every client handler so blocked
    /// reads wake up when the session dies.
    pub closed_tx: watch::Sender<()>,
    next_client_id: u64,
}

impl SessionRecord {
    fn new(vm_writer: SharedWriter, port: Option<u16>) -> Self {
        let (closed_tx, _) = watch::channel(());
        Self {
            vm_writer,
            port,
            listener: None,
            clients: HashMap::new(),
            closed_tx,
            next_client_id: 0,
        }
    }
}

// ── RegistryError ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A live session already exists for this UUID.
    DuplicateUuid(String),
    /// Every port in `[vm_start_port, 65535)` is taken.
    PortExhausted,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::DuplicateUuid(uuid) => {
                write!(f, "a session already exists for UUID '{uuid}'")
            }
            RegistryError::PortExhausted => write!(f, "unable to find a free client port"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<RegistryError> for std::io::Error {
    fn from(e: RegistryError) -> Self {
        std::io::Error::new(std::io::ErrorKind::AddrInUse, e)
    }
}

// ── Registry ──────────────────────────────────────────────────────────────

pub struct Registry {
    clients_enabled: bool,
    start_port: u16,
    inner: Mutex<HashMap<String, SessionRecord>>,
}

impl Registry {
    pub fn new(clients_enabled: bool, start_port: u16) -> Self {
        Self {
            clients_enabled,
            start_port,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn clients_enabled(&self) -> bool {
        self.clients_enabled
    }

    /// Insert a record for `uuid`, allocating the lowest free client port
    /// when the client plane is enabled.  Atomic: the uuid check, the port
    /// scan, and the insert happen under one lock acquisition.
    pub fn allocate_and_register(
        &self,
        uuid: &str,
        vm_writer: SharedWriter,
    ) -> Result<Option<u16>, RegistryError> {
        let mut map = self.inner.lock().unwrap();
        if map.contains_key(uuid) {
            return Err(RegistryError::DuplicateUuid(uuid.to_owned()));
        }
        let port = if self.clients_enabled {
            Some(self.find_port(&map)?)
        } else {
            None
        };
        map.insert(uuid.to_owned(), SessionRecord::new(vm_writer, port));
        Ok(port)
    }

    /// Lowest port in `[start_port, 65535)` not held by a live session.
    fn find_port(&self, map: &HashMap<String, SessionRecord>) -> Result<u16, RegistryError> {
        for port in self.start_port..u16::MAX {
            if !map.values().any(|r| r.port == Some(port)) {
                return Ok(port);
            }
        }
        Err(RegistryError::PortExhausted)
    }

    /// Install the accept-loop handle for `uuid`.  A record that vanished
    /// in between simply drops the handle, stopping the loop.
    pub fn set_listener(&self, uuid: &str, handle: ListenerHandle) {
        let mut map = self.inner.lock().unwrap();
        if let Some(record) = map.get_mut(uuid) {
            record.listener = Some(handle);
        }
    }

    pub fn lookup_vm_writer(&self, uuid: &str) -> Option<SharedWriter> {
        self.inner.lock().unwrap().get(uuid).map(|r| r.vm_writer.clone())
    }

    pub fn port_of(&self, uuid: &str) -> Option<u16> {
        self.inner.lock().unwrap().get(uuid).and_then(|r| r.port)
    }

    /// Attach a client writer to a live session.  Returns the attach id
    /// (for detach) and a receiver that resolves when the session closes;
    /// `None` if the session no longer exists.
    pub fn attach_client(
        &self,
        uuid: &str,
        writer: SharedWriter,
    ) -> Option<(u64, watch::Receiver<()>)> {
        let mut map = self.inner.lock().unwrap();
        let record = map.get_mut(uuid)?;
        let id = record.next_client_id;
        record.next_client_id += 1;
        record.clients.insert(id, writer);
        Some((id, record.closed_tx.subscribe()))
    }

    /// Remove an attached client writer.  A no-op when the session or the
    /// writer is already gone.
    pub fn detach_client(&self, uuid: &str, client_id: u64) {
        let mut map = self.inner.lock().unwrap();
        if let Some(record) = map.get_mut(uuid) {
            record.clients.remove(&client_id);
        }
    }

    /// Snapshot of the writers currently attached to `uuid`, for broadcast.
    pub fn client_writers(&self, uuid: &str) -> Vec<(u64, SharedWriter)> {
        let map = self.inner.lock().unwrap();
        match map.get(uuid) {
            Some(record) => record
                .clients
                .iter()
                .map(|(id, w)| (*id, w.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Remove and return the record for `uuid` so the caller can close its
    /// listener and writers.  A second call for the same UUID is a no-op.
    pub fn unregister(&self, uuid: &str) -> Option<SessionRecord> {
        self.inner.lock().unwrap().remove(uuid)
    }

    /// `(uuid, port)` pairs for every live session with a client port.
    pub fn snapshot(&self) -> Vec<(String, u16)> {
        let map = self.inner.lock().unwrap();
        map.iter()
            .filter_map(|(uuid, r)| r.port.map(|p| (uuid.clone(), p)))
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{split_stream, BoxedStream};

    fn writer() -> SharedWriter {
        let (a, _b) = tokio::io::duplex(64);
        let (_rd, wr) = split_stream(Box::new(a) as BoxedStream);
        wr
    }

    #[tokio::test]
    async fn register_allocates_sequential_ports() {
        let reg = Registry::new(true, 20000);
        assert_eq!(reg.allocate_and_register("a", writer()).unwrap(), Some(20000));
        assert_eq!(reg.allocate_and_register("b", writer()).unwrap(), Some(20001));

        // Freeing the first port makes it the next allocation again.
        reg.unregister("a");
        assert_eq!(reg.allocate_and_register("c", writer()).unwrap(), Some(20000));
    }

    #[tokio::test]
    async fn duplicate_uuid_is_rejected() {
        let reg = Registry::new(true, 20000);
        reg.allocate_and_register("a", writer()).unwrap();
        assert_eq!(
            reg.allocate_and_register("a", writer()).unwrap_err(),
            RegistryError::DuplicateUuid("a".into())
        );
        // The original record survives the failed attempt.
        assert_eq!(reg.port_of("a"), Some(20000));
    }

    #[tokio::test]
    async fn ports_are_pairwise_distinct() {
        let reg = Registry::new(true, 20000);
        for i in 0..10 {
            reg.allocate_and_register(&format!("vm{i}"), writer()).unwrap();
        }
        let mut ports: Vec<u16> = reg.snapshot().iter().map(|(_, p)| *p).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 10);
    }

    #[tokio::test]
    async fn port_exhaustion_is_an_error() {
        let reg = Registry::new(true, u16::MAX - 2);
        reg.allocate_and_register("a", writer()).unwrap();
        reg.allocate_and_register("b", writer()).unwrap();
        assert_eq!(
            reg.allocate_and_register("c", writer()).unwrap_err(),
            RegistryError::PortExhausted
        );
    }

    #[tokio::test]
    async fn disabled_client_plane_skips_ports() {
        let reg = Registry::new(false, 20000);
        assert_eq!(reg.allocate_and_register("a", writer()).unwrap(), None);
        assert!(reg.snapshot().is_empty());
        assert_eq!(reg.port_of("a"), None);
    }

    #[tokio::test]
    async fn attach_and_detach_clients() {
        let reg = Registry::new(true, 20000);
        reg.allocate_and_register("a", writer()).unwrap();

        let (id1, _closed1) = reg.attach_client("a", writer()).unwrap();
        let (id2, _closed2) = reg.attach_client("a", writer()).unwrap();
        assert_ne!(id1, id2);
        assert_eq!(reg.client_writers("a").len(), 2);

        reg.detach_client("a", id1);
        assert_eq!(reg.client_writers("a").len(), 1);
        // Idempotent.
        reg.detach_client("a", id1);
        assert_eq!(reg.client_writers("a").len(), 1);
    }

    #[tokio::test]
    async fn attach_to_missing_session_fails() {
        let reg = Registry::new(true, 20000);
        assert!(reg.attach_client("nope", writer()).is_none());
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let reg = Registry::new(true, 20000);
        reg.allocate_and_register("a", writer()).unwrap();
        assert!(reg.unregister("a").is_some());
        assert!(reg.unregister("a").is_none());
    }

    #[tokio::test]
    async fn closed_signal_fires_on_record_drop() {
        let reg = Registry::new(true, 20000);
        reg.allocate_and_register("a", writer()).unwrap();
        let (_id, mut closed) = reg.attach_client("a", writer()).unwrap();

        let record = reg.unregister("a").unwrap();
        drop(record);
        assert!(closed.changed().await.is_err());
    }
}
