//! Telnet protocol parser for the VM-facing data path.
//!
//! [`TelnetParser`] is a pure byte-stream FSM: call [`TelnetParser::feed`]
//! with raw bytes from a VM connection to get back decoded
//! [`TelnetEvent`]s.  The parser holds no I/O handles and buffers partial
//! command sequences, so byte alignment is never lost across read
//! boundaries.
//!
//! Unlike a tolerant interactive client, a concentrator treats malformed
//! command sequences as fatal: `feed` returns a [`ProtocolError`] and the
//! caller closes the connection.

// ── Telnet byte constants ──────────────────────────────────────────────────

/// Interpret As Command — starts every Telnet command sequence.
pub const IAC: u8 = 255;
/// Subnegotiation Begin.
pub const SB: u8 = 250;
/// Subnegotiation End.
pub const SE: u8 = 240;
/// WILL — sender will enable the option.
pub const WILL: u8 = 251;
/// WONT — sender will not enable the option.
pub const WONT: u8 = 252;
/// DO — sender requests the receiver to enable the option.
pub const DO: u8 = 253;
/// DONT — sender requests the receiver to disable the option.
pub const DONT: u8 = 254;

/// Telnet option numbers negotiated on a VM serial connection.
pub mod opt {
    /// 8-bit transparent data path.
    pub const BINARY: u8 = 0;
    /// Suppress go-ahead.
    pub const SGA: u8 = 3;
    /// VMware serial-port extension (vendor option).
    pub const VMWARE_EXT: u8 = 232;
}

// ── ProtocolError ─────────────────────────────────────────────────────────

/// A malformed Telnet sequence.  Fatal to the connection that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// `IAC` followed by a byte that is not a recognised command.
    UnknownCommand(u8),
    /// `IAC` inside a subnegotiation followed by neither `SE` nor `IAC`.
    MalformedSubnegotiation(u8),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::UnknownCommand(b) => {
                write!(f, "unknown telnet command {b:#04x} after IAC")
            }
            ProtocolError::MalformedSubnegotiation(b) => {
                write!(f, "unexpected byte {b:#04x} after IAC inside subnegotiation")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<ProtocolError> for std::io::Error {
    fn from(e: ProtocolError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    }
}

// ── TelnetEvent ───────────────────────────────────────────────────────────

/// A decoded event produced by [`TelnetParser::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelnetEvent {
    /// Application payload (non-empty, `IAC IAC` collapsed to `0xFF`).
    Data(Vec<u8>),
    /// Peer sent `IAC WILL <opt>`.
    Will(u8),
    /// Peer sent `IAC WONT <opt>`.
    Wont(u8),
    /// Peer sent `IAC DO <opt>`.
    Do(u8),
    /// Peer sent `IAC DONT <opt>`.
    Dont(u8),
    /// Peer sent `IAC SB <bytes> IAC SE`; carries everything strictly
    /// between `SB` and the terminating `IAC SE`, escapes collapsed.
    Subneg(Vec<u8>),
}

// ── Parser FSM ────────────────────────────────────────────────────────────

#[derive(Debug)]
enum State {
    Stream,
    Iac,
    /// After WILL/WONT/DO/DONT — holds the command byte, awaits option.
    Cmd(u8),
    /// Collecting subnegotiation bytes after `IAC SB`.
    Subneg,
    /// Saw `IAC` inside a subnegotiation.
    SubnegIac,
}

/// Byte-stream Telnet parser.
///
/// Feed raw VM-connection bytes into [`Self::feed`]; receive decoded
/// [`TelnetEvent`]s in return.  Entirely synchronous and I/O-free.
#[derive(Debug)]
pub struct TelnetParser {
    state: State,
    /// Accumulates payload bytes between command sequences.
    data_buf: Vec<u8>,
    /// Accumulates subnegotiation bytes.
    sb_buf: Vec<u8>,
}

impl Default for TelnetParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TelnetParser {
    pub fn new() -> Self {
        Self {
            state: State::Stream,
            data_buf: Vec::new(),
            sb_buf: Vec::new(),
        }
    }

    /// Feed a slice of raw bytes; returns all events decoded from them.
    ///
    /// Payload that is not yet terminated by a command sequence is emitted
    /// as a trailing [`TelnetEvent::Data`] span so the caller never waits
    /// on buffered bytes.  On error the parser state is unspecified; the
    /// connection must be closed.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<TelnetEvent>, ProtocolError> {
        let mut events = Vec::new();
        for &b in bytes {
            self.step(b, &mut events)?;
        }
        self.flush_data(&mut events);
        Ok(events)
    }

    fn flush_data(&mut self, events: &mut Vec<TelnetEvent>) {
        if !self.data_buf.is_empty() {
            events.push(TelnetEvent::Data(std::mem::take(&mut self.data_buf)));
        }
    }

    fn step(&mut self, b: u8, events: &mut Vec<TelnetEvent>) -> Result<(), ProtocolError> {
        match self.state {
            State::Stream => {
                if b == IAC {
                    self.flush_data(events);
                    self.state = State::Iac;
                } else {
                    self.data_buf.push(b);
                }
            }
            State::Iac => match b {
                IAC => {
                    // IAC IAC — escaped literal 0xFF in the payload.
                    self.data_buf.push(0xFF);
                    self.state = State::Stream;
                }
                WILL | WONT | DO | DONT => {
                    self.state = State::Cmd(b);
                }
                SB => {
                    self.sb_buf.clear();
                    self.state = State::Subneg;
                }
                other => return Err(ProtocolError::UnknownCommand(other)),
            },
            State::Cmd(cmd) => {
                let event = match cmd {
                    WILL => TelnetEvent::Will(b),
                    WONT => TelnetEvent::Wont(b),
                    DO => TelnetEvent::Do(b),
                    DONT => TelnetEvent::Dont(b),
                    _ => unreachable!("only WILL/WONT/DO/DONT reach Cmd state"),
                };
                events.push(event);
                self.state = State::Stream;
            }
            State::Subneg => {
                if b == IAC {
                    self.state = State::SubnegIac;
                } else {
                    self.sb_buf.push(b);
                }
            }
            State::SubnegIac => match b {
                SE => {
                    events.push(TelnetEvent::Subneg(std::mem::take(&mut self.sb_buf)));
                    self.state = State::Stream;
                }
                IAC => {
                    // IAC IAC inside SB — literal 0xFF in the payload.
                    self.sb_buf.push(0xFF);
                    self.state = State::Subneg;
                }
                other => return Err(ProtocolError::MalformedSubnegotiation(other)),
            },
        }
        Ok(())
    }
}

// ── Payload encoding ──────────────────────────────────────────────────────

/// Escape `payload` for transmission on a Telnet stream: every literal
/// `0xFF` byte is doubled.  The inverse of the collapse performed by
/// [`TelnetParser`].
pub fn encode_payload(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    for &b in payload {
        if b == IAC {
            out.push(IAC);
        }
        out.push(b);
    }
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────
