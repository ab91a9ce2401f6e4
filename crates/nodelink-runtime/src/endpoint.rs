//! Endpoint handle
//!
//! Each endpoint runs on its own OS thread and owns a mailbox. The handle
//! passed to the entry function is the endpoint's only way to talk to the
//! node: send, receive, link and unlink.
//!
//! When the entry function returns, or unwinds, the [`Worker`] guard
//! deregisters the endpoint and notifies its link partners.

use crate::mailbox::{Mailbox, Wait};
use crate::node::{Node, NodeShared};

use nodelink_core::constants::{IO_ID, MANAGER_ID};
use nodelink_core::{EndpointId, ExitReason, Message, Payload};

use std::sync::Arc;

pub struct Endpoint {
    id: EndpointId,
    kind: String,
    mailbox: Arc<Mailbox>,
    node: Arc<NodeShared>,
}

impl Endpoint {
    pub(crate) fn new(id: EndpointId, kind: String, mailbox: Arc<Mailbox>, node: Arc<NodeShared>) -> Self {
        Self { id, kind, mailbox, node }
    }

    #[inline]
    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Handle to the node this endpoint runs on
    pub fn node(&self) -> Node {
        Node::from_shared(self.node.clone())
    }

    /// The reactor's id on this node
    pub fn io_id(&self) -> EndpointId {
        self.node.addr.endpoint(IO_ID)
    }

    pub fn manager_id(&self) -> EndpointId {
        self.node.addr.endpoint(MANAGER_ID)
    }

    /// Send raw bytes; never blocks
    pub fn send(&self, dest: EndpointId, tag: u32, data: Vec<u8>) {
        self.node.route(Message::new(self.id, dest, tag, data));
    }

    pub fn send_payload<P: Payload>(&self, dest: EndpointId, payload: &P) {
        self.node.route(Message::with_payload(self.id, dest, payload));
    }

    /// Route a message keeping its original source
    pub(crate) fn forward(&self, msg: Message) {
        self.node.route(msg);
    }

    /// Next message from the mailbox
    ///
    /// `None` on timeout or when interrupted. Accepts a [`Wait`], a
    /// `Duration`, or milliseconds (-1 blocks, 0 polls).
    pub fn receive(&self, wait: impl Into<Wait>) -> Option<Message> {
        self.mailbox.receive(wait.into())
    }

    /// Ask to be told (ENDPOINT_EXIT) when `target` exits
    ///
    /// Linking to an endpoint that is already gone produces an exit with
    /// reason `NoSuchEndpoint`.
    pub fn link(&self, target: EndpointId) {
        self.node.lock().link(self.id, target);
    }

    pub fn unlink(&self, target: EndpointId) {
        self.node.lock().unlink(self.id, target);
    }

    /// Make a blocked (or the next) `receive` return `None`
    pub fn interrupt(&self) {
        self.mailbox.interrupt();
    }

    /// Messages queued and not yet received
    pub fn pending(&self) -> usize {
        self.mailbox.len()
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").field("id", &self.id).field("kind", &self.kind).finish()
    }
}

/// Deregisters the endpoint when its thread leaves the entry function
pub(crate) struct Worker {
    id: EndpointId,
    node: Arc<NodeShared>,
}

impl Worker {
    pub fn new(endpoint: &Endpoint) -> Self {
        Self { id: endpoint.id, node: endpoint.node.clone() }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let reason = if std::thread::panicking() {
            tracing::error!("endpoint {} panicked", self.id);
            ExitReason::Panicked
        } else {
            ExitReason::Normal
        };
        self.node.endpoint_exited(self.id.localid, reason);
    }
}
