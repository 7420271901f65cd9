use std::io;
use std::net::SocketAddrV4;

use canopy_core::wire::EndpointError;
use canopy_core::Version;
use thiserror::Error;

/// Bootstrap failures. Fatal to `initialize` on the joiner side; on the listener side they
/// only abandon the candidate.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("version mismatch (ours {ours}, theirs {theirs})")]
    VersionMismatch { ours: Version, theirs: Version },
    #[error("unexpected handshake status byte {0}")]
    UnexpectedStatus(u8),
    #[error("malformed redirect: {0}")]
    Redirect(#[from] EndpointError),
    #[error("{actual} acts as parent ({expected} expected)")]
    UnexpectedParent {
        expected: SocketAddrV4,
        actual: SocketAddrV4,
    },
    #[error("session secret challenge failed")]
    SecretMismatch,
    #[error("handshake made no progress for {0:?}")]
    Stalled(std::time::Duration),
    #[error("parent never connected back within {0:?}")]
    AcceptTimeout(std::time::Duration),
    #[error("couldn't reverse connection for {remote} after {attempts} attempts; peer may be behind symmetric NAT")]
    NatTraversal { remote: SocketAddrV4, attempts: u32 },
    #[error("bootstrap cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("node already initialized")]
    AlreadyInitialized,
    #[error("node not initialized")]
    NotInitialized,
    #[error("execution already started")]
    AlreadyRunning,
    #[error("node is not running")]
    NotRunning,
    #[error("code module of {len}B exceeds the {max}B frame limit")]
    ModuleTooLarge { len: usize, max: u32 },
    #[error("poll loop terminated unexpectedly")]
    LoopGone,
}
