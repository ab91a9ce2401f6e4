//! Error types for node operations

use nodelink_core::SocketError;
use std::net::SocketAddrV4;
use thiserror::Error;

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;

/// Errors that can occur starting or driving a node
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration rejected by `NodeConfig::validate`
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    /// The main listener could not be bound
    #[error("cannot listen on {addr}: {source}")]
    Listen {
        addr: SocketAddrV4,
        #[source]
        source: SocketError,
    },

    /// The reactor wakeup pipe could not be created
    #[error("cannot create reactor wakeup: {0}")]
    Wakeup(#[source] std::io::Error),

    /// A thread could not be spawned
    #[error("cannot spawn {kind} thread: {source}")]
    Spawn {
        kind: String,
        #[source]
        source: std::io::Error,
    },

    /// The node is shutting down and no longer takes new work
    #[error("node is shutting down")]
    Shutdown,
}
