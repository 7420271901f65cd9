//! Canopy overlay protocol core.
//! No socket setup: the node crate owns listeners and the poll loop and hands streams in.

pub mod connection;
pub mod log;
pub mod protocol;
pub mod sandbox;
pub mod wire;

pub use connection::{Action, Connection, ConnectionError};
pub use log::{Level, LogSink, Logger, TracingSink};
pub use protocol::{Op, Version, PROTOCOL_VERSION};
pub use sandbox::{ModuleState, Sandbox, SandboxError};
pub use wire::{decode_endpoint, encode_endpoint, encode_frame, FrameDecodeError, FrameEncodeError};
