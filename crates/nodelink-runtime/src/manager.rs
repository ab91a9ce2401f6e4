//! Manager endpoint (`MANAGER_ID`)
//!
//! Every node runs one. It proxies socket requests to the IO endpoint that
//! should serve them, so a remote endpoint can drive sockets here knowing
//! only the node's address. Tags it does not handle go to the node's
//! [`ManagerExtension`].

use crate::endpoint::Endpoint;
use crate::mailbox::Wait;

use nodelink_core::payload::{
    Accept, ConnPair, Connect, DeleteConnection, DeleteListener, FinWrite, Listen, Read, Write,
};
use nodelink_core::{tag, EndpointId, Message, Payload, SocketId, WireResult};

use tracing::{debug, warn};

/// Application hooks for the manager
pub trait ManagerExtension: Send + 'static {
    /// Handle a message with a tag the manager does not know
    ///
    /// Return `false` to have it logged as unexpected.
    fn handle(&mut self, endpoint: &Endpoint, msg: &Message) -> bool {
        let _ = (endpoint, msg);
        false
    }

    /// Runs once when the manager stops
    fn finish(&mut self, endpoint: &Endpoint) {
        let _ = endpoint;
    }
}

/// No extra behaviour
pub(crate) struct NoExtension;

impl ManagerExtension for NoExtension {}

pub(crate) fn run(endpoint: &Endpoint, mut extension: Box<dyn ManagerExtension>) {
    loop {
        let Some(msg) = endpoint.receive(Wait::Forever) else {
            continue;
        };
        match msg.tag {
            tag::KILL => break,
            tag::ENDPOINT_EXIT => {}
            t if tag::is_socket_request(t) => {
                if let Err(e) = proxy(endpoint, &msg) {
                    warn!("manager: malformed {} from {}: {}", msg.tag_name(), msg.source, e);
                }
            }
            _ => {
                if !extension.handle(endpoint, &msg) {
                    warn!("manager: unexpected {} from {}", msg.tag_name(), msg.source);
                }
            }
        }
    }
    extension.finish(endpoint);
    debug!("manager {} stopped", endpoint.id());
}

/// Re-encode with a null owner replaced by the requester
fn with_owner<P: Payload>(msg: &Message, owner: impl FnOnce(&mut P) -> &mut EndpointId) -> WireResult<Vec<u8>> {
    let mut payload = msg.decode::<P>()?;
    let slot = owner(&mut payload);
    if slot.is_null() {
        *slot = msg.source;
    }
    Ok(payload.to_bytes())
}

fn io_for(endpoint: &Endpoint, sockid: SocketId) -> EndpointId {
    if sockid.owner.is_null() {
        endpoint.io_id()
    } else {
        sockid.owner
    }
}

fn proxy(endpoint: &Endpoint, msg: &Message) -> WireResult<()> {
    let local = endpoint.io_id();
    let (dest, data) = match msg.tag {
        tag::LISTEN => (local, with_owner::<Listen>(msg, |p| &mut p.owner)?),
        tag::CONNECT => (local, with_owner::<Connect>(msg, |p| &mut p.owner)?),
        tag::CONNPAIR => (local, with_owner::<ConnPair>(msg, |p| &mut p.owner)?),
        tag::ACCEPT => (io_for(endpoint, msg.decode::<Accept>()?.sockid), msg.data.clone()),
        tag::READ => (io_for(endpoint, msg.decode::<Read>()?.sockid), msg.data.clone()),
        tag::WRITE => (io_for(endpoint, msg.decode::<Write>()?.sockid), msg.data.clone()),
        tag::FINWRITE => (io_for(endpoint, msg.decode::<FinWrite>()?.sockid), msg.data.clone()),
        tag::DELETE_CONNECTION => (io_for(endpoint, msg.decode::<DeleteConnection>()?.sockid), msg.data.clone()),
        tag::DELETE_LISTENER => (io_for(endpoint, msg.decode::<DeleteListener>()?.sockid), msg.data.clone()),
        _ => return Ok(()),
    };
    debug!("manager: {} from {} → {}", msg.tag_name(), msg.source, dest);
    endpoint.forward(Message::new(msg.source, dest, msg.tag, data));
    Ok(())
}
