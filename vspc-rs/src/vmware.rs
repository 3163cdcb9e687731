//! VMware serial-port extension handling (Telnet option 232).
//!
//! [`VmwareHandler`] interprets the option events decoded by
//! [`crate::telnet::TelnetParser`] for one VM connection: it answers
//! WILL/DO negotiation, dispatches the vendor sub-options (identification,
//! proxy handshake, VMotion token exchange), and delivers the VM's UUID
//! through a one-shot channel.
//!
//! The handler is pure with respect to I/O: replies are appended to a
//! caller-supplied buffer and the caller owns writing + flushing them, so
//! replies are on the wire before the next read is issued.

use std::net::SocketAddr;

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::oneshot;

use crate::telnet::{self, opt, TelnetEvent, DO, DONT, IAC, SB, SE, WILL, WONT};

// ── VMware sub-option bytes ───────────────────────────────────────────────

/// Sub-command bytes carried as the second byte of a `VMWARE_EXT`
/// subnegotiation.
pub mod sub {
    pub const KNOWN_SUBOPTIONS_1: u8 = 0;
    pub const KNOWN_SUBOPTIONS_2: u8 = 1;
    pub const VMOTION_BEGIN: u8 = 40;
    pub const VMOTION_GOAHEAD: u8 = 41;
    pub const VMOTION_NOTNOW: u8 = 43;
    pub const VMOTION_PEER: u8 = 44;
    pub const VMOTION_PEER_OK: u8 = 45;
    pub const VMOTION_COMPLETE: u8 = 46;
    pub const VMOTION_ABORT: u8 = 48;
    pub const VM_VC_UUID: u8 = 80;
    pub const GET_VM_VC_UUID: u8 = 81;
    pub const VM_NAME: u8 = 82;
    pub const GET_VM_NAME: u8 = 83;
    pub const DO_PROXY: u8 = 70;
    pub const WILL_PROXY: u8 = 71;
    pub const WONT_PROXY: u8 = 73;
}

/// Sub-options announced in our KNOWN-SUBOPTIONS-2 reply, in the exact
/// order they appear on the wire.
pub const SUPPORTED_OPTS: [u8; 16] = [
    sub::KNOWN_SUBOPTIONS_1,
    sub::KNOWN_SUBOPTIONS_2,
    sub::VMOTION_BEGIN,
    sub::VMOTION_GOAHEAD,
    sub::VMOTION_NOTNOW,
    sub::VMOTION_PEER,
    sub::VMOTION_PEER_OK,
    sub::VMOTION_COMPLETE,
    sub::VMOTION_ABORT,
    sub::VM_VC_UUID,
    sub::GET_VM_VC_UUID,
    sub::VM_NAME,
    sub::GET_VM_NAME,
    sub::DO_PROXY,
    sub::WILL_PROXY,
    sub::WONT_PROXY,
];

// ── VmwareError ───────────────────────────────────────────────────────────

/// A violation of the VMware extension protocol.  Fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmwareError {
    /// A `VMWARE_EXT` subnegotiation whose sub-command we do not handle.
    UnknownSubcommand(u8),
    /// A `VMWARE_EXT` subnegotiation with no sub-command byte.
    TruncatedSubnegotiation,
    /// The VM sent VM-VC-UUID twice on one connection.
    DuplicateUuid,
    /// A VM-VC-UUID payload that is not ASCII.
    NonAsciiUuid,
}

impl std::fmt::Display for VmwareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmwareError::UnknownSubcommand(b) => write!(f, "unknown VMware sub-command {b}"),
            VmwareError::TruncatedSubnegotiation => {
                write!(f, "VMware subnegotiation without a sub-command byte")
            }
            VmwareError::DuplicateUuid => write!(f, "VM-VC-UUID delivered twice"),
            VmwareError::NonAsciiUuid => write!(f, "VM-VC-UUID payload is not ASCII"),
        }
    }
}

impl std::error::Error for VmwareError {}

impl From<VmwareError> for std::io::Error {
    fn from(e: VmwareError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    }
}

// ── Verdict ───────────────────────────────────────────────────────────────

/// What the session driver should do after an event has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep driving the connection.
    Continue,
    /// Write any pending replies, then close the connection.  Used for the
    /// proxy-rejection path, which is an orderly close rather than an error.
    Close,
}

// ── VmwareHandler ─────────────────────────────────────────────────────────

/// Per-connection handler for Telnet negotiation and VMware sub-options.
///
/// Owns the sending half of the session's `uuid_received` one-shot; the
/// session driver holds the receiving half under its identification
/// deadline.
pub struct VmwareHandler {
    peer: SocketAddr,
    /// URI the VM must present in DO-PROXY to be accepted.
    vspc_uri: String,
    uuid_tx: Option<oneshot::Sender<String>>,
}

impl VmwareHandler {
    pub fn new(peer: SocketAddr, vspc_uri: &str, uuid_tx: oneshot::Sender<String>) -> Self {
        Self {
            peer,
            vspc_uri: vspc_uri.to_owned(),
            uuid_tx: Some(uuid_tx),
        }
    }

    /// Handle one decoded option event, appending reply bytes to `out`.
    ///
    /// [`TelnetEvent::Data`] never reaches the handler; the driver consumes
    /// payload spans itself.
    pub fn on_event(
        &mut self,
        event: &TelnetEvent,
        out: &mut Vec<u8>,
    ) -> Result<Verdict, VmwareError> {
        match event {
            TelnetEvent::Will(o) => {
                self.handle_will(*o, out);
                Ok(Verdict::Continue)
            }
            TelnetEvent::Do(o) => {
                self.handle_do(*o, out);
                Ok(Verdict::Continue)
            }
            TelnetEvent::Wont(o) => {
                log::debug!("<< {} WONT {}", self.peer, o);
                Ok(Verdict::Continue)
            }
            TelnetEvent::Dont(o) => {
                log::debug!("<< {} DONT {}", self.peer, o);
                Ok(Verdict::Continue)
            }
            TelnetEvent::Subneg(data) if data.first() == Some(&opt::VMWARE_EXT) => {
                self.handle_vmware_subneg(&data[1..], out)
            }
            // Subnegotiations for options we never enable.
            TelnetEvent::Subneg(data) => {
                log::debug!("<< {} SB {:?} (ignored)", self.peer, data.first());
                Ok(Verdict::Continue)
            }
            TelnetEvent::Data(_) => Ok(Verdict::Continue),
        }
    }

    // ── Option negotiation ────────────────────────────────────────────────

    fn handle_will(&self, o: u8, out: &mut Vec<u8>) {
        log::debug!("<< {} WILL {}", self.peer, o);
        if matches!(o, opt::BINARY | opt::SGA | opt::VMWARE_EXT) {
            log::debug!(">> {} DO {}", self.peer, o);
            out.extend_from_slice(&[IAC, DO, o]);
        } else {
            log::debug!(">> {} DONT {}", self.peer, o);
            out.extend_from_slice(&[IAC, DONT, o]);
        }
    }

    fn handle_do(&self, o: u8, out: &mut Vec<u8>) {
        log::debug!("<< {} DO {}", self.peer, o);
        if matches!(o, opt::BINARY | opt::SGA) {
            log::debug!(">> {} WILL {}", self.peer, o);
            out.extend_from_slice(&[IAC, WILL, o]);
        } else {
            log::debug!(">> {} WONT {}", self.peer, o);
            out.extend_from_slice(&[IAC, WONT, o]);
        }
    }

    // ── VMware sub-option dispatch ────────────────────────────────────────

    /// `body` is the subnegotiation payload after the VMWARE_EXT byte:
    /// one sub-command byte plus its argument bytes.
    fn handle_vmware_subneg(
        &mut self,
        body: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<Verdict, VmwareError> {
        let (&cmd, arg) = body
            .split_first()
            .ok_or(VmwareError::TruncatedSubnegotiation)?;
        match cmd {
            sub::KNOWN_SUBOPTIONS_1 => {
                self.handle_known_suboptions(arg, out);
                Ok(Verdict::Continue)
            }
            sub::DO_PROXY => Ok(self.handle_do_proxy(arg, out)),
            sub::VM_VC_UUID => self.handle_vm_vc_uuid(arg),
            sub::VMOTION_BEGIN => {
                self.handle_vmotion_begin(arg, out);
                Ok(Verdict::Continue)
            }
            sub::VMOTION_PEER => {
                self.handle_vmotion_peer(arg, out);
                Ok(Verdict::Continue)
            }
            sub::VMOTION_COMPLETE => {
                log::debug!("<< {} VMOTION-COMPLETE {:?}", self.peer, arg);
                Ok(Verdict::Continue)
            }
            other => {
                log::error!("Unknown VMware cmd: {} {:?}", other, arg);
                Err(VmwareError::UnknownSubcommand(other))
            }
        }
    }

    fn handle_known_suboptions(&self, arg: &[u8], out: &mut Vec<u8>) {
        log::debug!("<< {} KNOWN-SUBOPTIONS-1 {:?}", self.peer, arg);
        log::debug!(">> {} KNOWN-SUBOPTIONS-2 {:?}", self.peer, SUPPORTED_OPTS);
        out.extend_from_slice(&frame(sub::KNOWN_SUBOPTIONS_2, &SUPPORTED_OPTS));
        // Ask for identification right away; the session driver is waiting
        // on it under a deadline.
        log::debug!(">> {} GET-VM-VC-UUID", self.peer);
        out.extend_from_slice(&frame(sub::GET_VM_VC_UUID, &[]));
    }

    /// DO-PROXY carries `<dir><uri>`: accept only a server-direction
    /// request for exactly our configured URI.
    fn handle_do_proxy(&self, arg: &[u8], out: &mut Vec<u8>) -> Verdict {
        let dir = arg.first().copied();
        let uri = std::str::from_utf8(&arg[dir.map_or(0, |_| 1)..]).unwrap_or("");
        log::debug!(
            "<< {} DO-PROXY {} {}",
            self.peer,
            dir.map(|d| d as char).unwrap_or('?'),
            uri
        );
        if dir == Some(b'S') && uri == self.vspc_uri {
            log::debug!(">> {} WILL-PROXY", self.peer);
            out.extend_from_slice(&frame(sub::WILL_PROXY, &[]));
            Verdict::Continue
        } else {
            log::debug!(">> {} WONT-PROXY", self.peer);
            out.extend_from_slice(&frame(sub::WONT_PROXY, &[]));
            Verdict::Close
        }
    }

    fn handle_vm_vc_uuid(&mut self, arg: &[u8]) -> Result<Verdict, VmwareError> {
        let raw = std::str::from_utf8(arg).map_err(|_| VmwareError::NonAsciiUuid)?;
        if !raw.is_ascii() {
            return Err(VmwareError::NonAsciiUuid);
        }
        log::debug!("<< {} VM-VC-UUID {}", self.peer, raw);
        let uuid: String = raw.chars().filter(|c| *c != ' ' && *c != '-').collect();
        let tx = self.uuid_tx.take().ok_or(VmwareError::DuplicateUuid)?;
        // A dropped receiver means the driver already gave up on this
        // connection; nothing useful is left to do with the value.
        let _ = tx.send(uuid);
        Ok(Verdict::Continue)
    }

    fn handle_vmotion_begin(&self, cookie: &[u8], out: &mut Vec<u8>) {
        log::debug!("<< {} VMOTION-BEGIN {:?}", self.peer, cookie);
        let mut secret = [0u8; 4];
        OsRng.fill_bytes(&mut secret);
        log::debug!(">> {} VMOTION-GOAHEAD {:?} {:?}", self.peer, cookie, secret);
        let mut payload = cookie.to_vec();
        payload.extend_from_slice(&secret);
        out.extend_from_slice(&frame(sub::VMOTION_GOAHEAD, &payload));
    }

    fn handle_vmotion_peer(&self, arg: &[u8], out: &mut Vec<u8>) {
        log::debug!("<< {} VMOTION-PEER {:?}", self.peer, arg);
        log::debug!(">> {} VMOTION-PEER-OK {:?}", self.peer, arg);
        out.extend_from_slice(&frame(sub::VMOTION_PEER_OK, arg));
    }
}

// ── Reply framing ─────────────────────────────────────────────────────────

/// Build `IAC SB VMWARE_EXT <subcmd> <payload> IAC SE`, IAC-doubling the
/// payload (VMotion tokens may contain 0xFF).
fn frame(subcmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut f = vec![IAC, SB, opt::VMWARE_EXT, subcmd];
    f.extend_from_slice(&telnet::encode_payload(payload));
    f.extend_from_slice(&[IAC, SE]);
    f
}

// ── Tests ─────────────────────────────────────────────────────────────────
