//! Socket requests from endpoint code
//!
//! Thin wrappers that build a request payload and send it to the right IO
//! endpoint: LISTEN, CONNECT and CONNPAIR go to the caller's own node;
//! verbs on an existing socket go to the node that issued the sockid. The
//! caller becomes the owner. Responses arrive in the caller's mailbox and
//! carry the `request_id` passed here.
//!
//! ```ignore
//! requests::send_connect(ep, "127.0.0.1", port, 1);
//! let msg = ep.receive(Wait::Forever)?;
//! let resp: ConnectResponse = msg.decode()?;
//! requests::send_write(ep, resp.sockid, 2, b"PING".to_vec());
//! ```

use crate::endpoint::Endpoint;

use nodelink_core::payload::{
    Accept, ConnPair, Connect, DeleteConnection, DeleteListener, FinWrite, Listen, Read, Write,
};
use nodelink_core::SocketId;

use std::net::Ipv4Addr;

/// IO endpoint responsible for `sockid`
fn io_for(ep: &Endpoint, sockid: SocketId) -> nodelink_core::EndpointId {
    if sockid.owner.is_null() {
        ep.io_id()
    } else {
        sockid.owner
    }
}

/// Bind a listener; port 0 picks a free one (see `ListenResponse::port`)
pub fn send_listen(ep: &Endpoint, ip: Ipv4Addr, port: u16, request_id: u32) {
    ep.send_payload(ep.io_id(), &Listen { ip, port, owner: ep.id(), request_id });
}

/// Admit one more inbound connection on `listener`
pub fn send_accept(ep: &Endpoint, listener: SocketId, request_id: u32) {
    ep.send_payload(io_for(ep, listener), &Accept { sockid: listener, request_id });
}

pub fn send_connect(ep: &Endpoint, hostname: &str, port: u16, request_id: u32) {
    let req = Connect { hostname: hostname.to_string(), port, owner: ep.id(), request_id };
    ep.send_payload(ep.io_id(), &req);
}

pub fn send_connpair(ep: &Endpoint, request_id: u32) {
    ep.send_payload(ep.io_id(), &ConnPair { owner: ep.id(), request_id });
}

pub fn send_read(ep: &Endpoint, sockid: SocketId, request_id: u32) {
    ep.send_payload(io_for(ep, sockid), &Read { sockid, request_id });
}

pub fn send_write(ep: &Endpoint, sockid: SocketId, request_id: u32, data: Vec<u8>) {
    ep.send_payload(io_for(ep, sockid), &Write { sockid, request_id, data });
}

/// Half-close once everything written so far is sent
pub fn send_finwrite(ep: &Endpoint, sockid: SocketId, request_id: u32) {
    ep.send_payload(io_for(ep, sockid), &FinWrite { sockid, request_id });
}

pub fn send_delete_connection(ep: &Endpoint, sockid: SocketId) {
    ep.send_payload(io_for(ep, sockid), &DeleteConnection { sockid });
}

pub fn send_delete_listener(ep: &Endpoint, sockid: SocketId) {
    ep.send_payload(io_for(ep, sockid), &DeleteListener { sockid });
}
