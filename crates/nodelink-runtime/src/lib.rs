//! # nodelink-runtime
//!
//! The node runtime: one reactor thread owning every socket, one OS thread
//! per endpoint, and message passing between them.
//!
//! ```text
//!   endpoint threads                         reactor thread
//!   ┌──────────┐  send(dest local) ──▶ mailbox of dest
//!   │ Endpoint │
//!   └──────────┘  send(IO_ID / remote) ──▶ IoInbox ──wake──▶ poll loop
//!                                                            │ control requests
//!                                                            │ frames to peers
//!                     responses, READ data, EXITs  ◀─────────┘
//! ```
//!
//! All shared state lives behind the node lock (`NodeState`). Each mailbox
//! has its own lock, so a blocked `receive` never holds up routing.
//!
//! This crate provides:
//! - `Node` lifecycle (start, add_thread, shutdown, join) and introspection
//! - `Endpoint` handles with mailbox, links and interrupt
//! - The reactor loop and the connection state machine driver
//! - Listeners with accept throttling and peer handshake sniffing
//! - The manager actor and the line-oriented console
//! - `requests` helpers for the socket protocol

pub mod config;
pub mod error;
pub mod logging;
pub mod mailbox;
pub mod endpoint;
pub mod requests;
pub mod manager;
pub mod node;

mod notifier;
mod sys;
mod connection;
mod listener;
mod reactor;
mod console;

// Re-exports
pub use config::NodeConfig;
pub use error::{NodeError, NodeResult};
pub use mailbox::{Mailbox, Wait};
pub use endpoint::Endpoint;
pub use manager::ManagerExtension;
pub use node::{ConnectionInfo, EndpointInfo, ListenerInfo, Node, NodeStats, ServerSnapshot, TrafficInfo};

#[doc(hidden)]
pub use tracing as __tracing;

/// Log an invariant violation and abort the process
///
/// Used where the state space is closed and reaching the branch means a
/// logic defect; there is nothing sensible to recover.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        $crate::__tracing::error!(target: "nodelink::fatal", $($arg)*);
        eprintln!("nodelink fatal: {}", format_args!($($arg)*));
        ::std::process::abort()
    }};
}
