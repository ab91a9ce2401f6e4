//! # nodelink-core
//!
//! Core types for the nodelink networking runtime.
//!
//! This crate has no threads and no sockets. Everything that touches the OS
//! lives in `nodelink-runtime`; what is here is pure data and pure logic, so
//! it can be unit-tested exhaustively.
//!
//! ## Modules
//!
//! - `id` - Endpoint, node and socket identifiers
//! - `message` - Message envelope and the tag catalogue
//! - `payload` - Binary codecs for every control payload
//! - `wire` - Frame header, incremental frame parser, handshake sniffing
//! - `state` - Connection states and events
//! - `fsm` - The connection transition table
//! - `admission` - Per-remote-IP admission control (`ServerInfo`)
//! - `portset` - Local port range for outbound connections
//! - `error` - Error types
//! - `env` - Environment variable utilities

pub mod id;
pub mod message;
pub mod payload;
pub mod wire;
pub mod state;
pub mod fsm;
pub mod admission;
pub mod portset;
pub mod error;
pub mod env;

// Re-exports for convenience
pub use id::{EndpointId, NodeAddr, SocketId};
pub use message::{tag, Message};
pub use payload::{ExitReason, Payload};
pub use state::{ConnEvent, ConnState};
pub use fsm::{transition, Action, Step};
pub use admission::{AdmissionTable, ServerInfo};
pub use portset::PortSet;
pub use error::{SocketError, WireError, WireResult};
pub use env::{env_get, env_get_bool, env_get_opt, parse_bool, parse_opt};

/// Well-known ids and sizing constants
pub mod constants {
    /// Local id of the reactor endpoint on every node
    pub const IO_ID: u32 = 1;

    /// Local id of the manager endpoint on every node
    pub const MANAGER_ID: u32 = 2;

    /// First local id handed out to user endpoints
    pub const FIRST_ID: u32 = 3;

    /// Concurrent opening connections allowed per remote IP
    pub const MAX_OPENING: usize = 3;

    /// Default per-connection I/O chunk (read cap and write backpressure threshold)
    pub const DEFAULT_IO_CHUNK: usize = 64 * 1024;

    /// Socket error messages are truncated to this many bytes
    pub const ERRMSG_MAX: usize = 256;

    /// Backlog passed to listen(2)
    pub const LISTEN_BACKLOG: i32 = 10;
}
