//! Canopy overlay node: sockets, bootstrap handshake and the topology manager that runs
//! the poll loop over `canopy_core` connections.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod node;
pub mod socket;

pub use config::NodeConfig;
pub use error::{BootstrapError, NodeError};
pub use node::{Node, NodeStatus, PeerInfo, Role};
