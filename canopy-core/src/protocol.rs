//! Canopy wire protocol: opcodes, version tuple and protocol constants.

use std::fmt;
use std::time::Duration;

use crate::wire::ENDPOINT_LEN;

/// Current protocol version. Sent by the listener as the first 4 handshake bytes.
pub const PROTOCOL_VERSION: Version = Version::new(0, 1, 0, 0);

/// Well-known listening port for root nodes.
pub const DEFAULT_PORT: u16 = 6974;

/// Maximum number of children a node attaches before redirecting joiners.
pub const BRANCHING_LIMIT: usize = 2;

/// How long a partially received frame may stay incomplete.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on hairpin reconnect attempts per candidate.
pub const MAX_CONNECT_ATTEMPTS: u32 = 256;

/// Session secret size exchanged during bootstrap and echoed over the hairpin link.
pub const SESSION_SECRET_LEN: usize = 16;

/// Handshake status byte: redirect follows.
pub const STATUS_REDIRECT: u8 = 0;
/// Handshake status byte: accepted, session secret follows.
pub const STATUS_ACCEPT: u8 = 1;

/// Single raw byte a peer writes back after receiving `Disconnect`.
pub const DISCONNECT_ACK: u8 = 0;

/// Version tuple (major, minor, build, revision). Must match exactly to join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub build: u8,
    pub revision: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, build: u8, revision: u8) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    pub const fn to_bytes(self) -> [u8; 4] {
        [self.major, self.minor, self.build, self.revision]
    }

    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self::new(bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// Frame opcodes. Errors occupy 250..=254; `Okay` is 255.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    Disconnect = 1,
    Code = 2,
    Invoke = 3,
    EntryPointInvalidSignature = 250,
    NoEntryPoint = 251,
    NoImage = 252,
    InvalidFlow = 253,
    BadImage = 254,
    Okay = 255,
}

impl Op {
    pub fn from_byte(byte: u8) -> Option<Op> {
        let op = match byte {
            1 => Op::Disconnect,
            2 => Op::Code,
            3 => Op::Invoke,
            250 => Op::EntryPointInvalidSignature,
            251 => Op::NoEntryPoint,
            252 => Op::NoImage,
            253 => Op::InvalidFlow,
            254 => Op::BadImage,
            255 => Op::Okay,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn is_error(self) -> bool {
        (250..=254).contains(&self.as_byte())
    }

    /// Minimum declared payload for this opcode. `from_parent` is true when the frame
    /// arrives on the parent-facing connection.
    pub fn min_payload_len(self, from_parent: bool) -> u32 {
        match self {
            Op::Disconnect if from_parent => ENDPOINT_LEN as u32,
            _ => 0,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Disconnect => "Disconnect",
            Op::Code => "Code",
            Op::Invoke => "Invoke",
            Op::EntryPointInvalidSignature => "EntryPointInvalidSignature",
            Op::NoEntryPoint => "NoEntryPoint",
            Op::NoImage => "NoImage",
            Op::InvalidFlow => "InvalidFlow",
            Op::BadImage => "BadImage",
            Op::Okay => "Okay",
        };
        f.write_str(name)
    }
}
