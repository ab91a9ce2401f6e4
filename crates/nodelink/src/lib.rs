//! # nodelink
//!
//! Nodes that host endpoints (one OS thread and one mailbox each) and move
//! messages between them, locally or over TCP to other nodes. Sockets are
//! driven by messages too: an endpoint asks its node's reactor to listen,
//! connect, read or write, and gets the result back as a message.
//!
//! ## Quick Start
//!
//! ```ignore
//! use nodelink::prelude::*;
//!
//! fn main() -> NodeResult<()> {
//!     nodelink::logging::init();
//!     nodelink::run(NodeConfig::from_env(), |node| {
//!         let pong = node.add_thread("pong", |ep| {
//!             while let Some(msg) = ep.receive(Wait::Forever) {
//!                 if msg.tag == tag::KILL {
//!                     break;
//!                 }
//!                 ep.send(msg.source, msg.tag, msg.data);
//!             }
//!         })?;
//!         node.add_thread("ping", move |ep| {
//!             ep.link(pong);
//!             ep.send(pong, tag::USER_BASE, b"PING".to_vec());
//!             let reply = ep.receive(Wait::Forever);
//!             println!("{:?}", reply.map(|m| m.data));
//!         })?;
//!         Ok(())
//!     })
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Endpoints                              │
//! │        send / receive / link, one thread + mailbox each     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Node                                │
//! │      registry, routing, link bookkeeping (node lock)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ IoInbox + self-pipe
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Reactor                              │
//! │  poll(2), connection FSM, admission control, peer framing   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                    TCP: apps, peers, console
//! ```

// Re-export core types
pub use nodelink_core::{
    constants,
    payload,
    tag,
    wire,
    ConnEvent,
    ConnState,
    EndpointId,
    ExitReason,
    Message,
    NodeAddr,
    Payload,
    SocketError,
    SocketId,
    WireError,
    WireResult,
};

// Re-export env utilities
pub use nodelink_core::{env_get, env_get_bool, env_get_opt};

// Re-export runtime types
pub use nodelink_runtime::{
    fatal,
    logging,
    requests,
    ConnectionInfo,
    Endpoint,
    EndpointInfo,
    ListenerInfo,
    ManagerExtension,
    Node,
    NodeConfig,
    NodeError,
    NodeResult,
    NodeStats,
    ServerSnapshot,
    TrafficInfo,
    Wait,
};

/// Start a node, run `f`, then wait for the node to be shut down
///
/// `f` usually spawns endpoints and returns; the node keeps running until
/// something calls `Node::shutdown` (an endpoint, the console, a signal
/// handler). If `f` fails the node is shut down at once.
pub fn run<F>(config: NodeConfig, f: F) -> NodeResult<()>
where
    F: FnOnce(&Node) -> NodeResult<()>,
{
    let node = Node::start(config)?;
    if let Err(e) = f(&node) {
        node.shutdown();
        node.join()?;
        return Err(e);
    }
    node.join()
}

/// Everything an endpoint body usually needs
pub mod prelude {
    pub use crate::requests;
    pub use nodelink_core::payload::{
        AcceptResponse, ConnPairResponse, ConnectResponse, ConnectionClosed, EndpointExit, FinWriteResponse,
        ListenResponse, ReadResponse, WriteResponse,
    };
    pub use nodelink_core::{tag, EndpointId, ExitReason, Message, NodeAddr, Payload, SocketId};
    pub use nodelink_runtime::{Endpoint, Node, NodeConfig, NodeError, NodeResult, Wait};
}
