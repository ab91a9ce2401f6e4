//! Listening sockets
//!
//! The node's main listener accepts whatever arrives and lets the reactor
//! sniff the first bytes (peer node or console). Listeners created with
//! LISTEN belong to an endpoint and only accept while that endpoint has
//! ACCEPT requests outstanding; otherwise they stay out of the poll set and
//! the kernel backlog absorbs new clients.

use crate::connection::{Connection, Request, Role};
use crate::node::NodeState;
use crate::sys;

use nodelink_core::payload::{Accept, AcceptResponse, DeleteListener, Listen, ListenResponse};
use nodelink_core::wire::WELCOME;
use nodelink_core::{ConnEvent, EndpointId, Message, SocketId};

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::os::fd::OwnedFd;

use tracing::{debug, info, warn};

#[derive(Debug)]
pub(crate) struct Listener {
    pub serial: u32,
    pub sockid: SocketId,
    pub fd: OwnedFd,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub owner: EndpointId,
    /// The node's own listener (peers and console)
    pub main: bool,
    /// Outstanding ACCEPT requests, oldest first
    pub accepts: VecDeque<Request>,
}

impl Listener {
    /// In the poll set
    pub fn accepting(&self) -> bool {
        self.main || !self.accepts.is_empty()
    }
}

impl NodeState {
    pub fn add_main_listener(&mut self, fd: OwnedFd, ip: Ipv4Addr, port: u16) -> u32 {
        let serial = self.next_serial();
        let listener = Listener {
            serial,
            sockid: self.sockid(serial),
            fd,
            ip,
            port,
            owner: EndpointId::NULL,
            main: true,
            accepts: VecDeque::new(),
        };
        self.listeners.insert(serial, listener);
        serial
    }

    fn lookup_listener(&self, sockid: &SocketId) -> Option<u32> {
        if sockid.owner != self.io_id() {
            return None;
        }
        self.listeners.contains_key(&sockid.serial).then_some(sockid.serial)
    }

    pub fn handle_listen(&mut self, msg: &Message, req: Listen) {
        let io = self.io_id();
        let owner = req.owner.or(msg.source);
        match sys::bind_listener(req.ip, req.port, self.config.listen_backlog) {
            Ok((fd, port)) => {
                let serial = self.next_serial();
                let sockid = self.sockid(serial);
                self.listeners.insert(
                    serial,
                    Listener {
                        serial,
                        sockid,
                        fd,
                        ip: req.ip,
                        port,
                        owner,
                        main: false,
                        accepts: VecDeque::new(),
                    },
                );
                self.link_owner(owner);
                info!("listening on {}:{} for {}", req.ip, port, owner);
                let response = ListenResponse { request_id: req.request_id, sockid, port, error: None };
                self.send_payload(io, owner, &response);
            }
            Err(e) => {
                warn!("listen on {}:{} failed: {}", req.ip, req.port, e);
                let response = ListenResponse {
                    request_id: req.request_id,
                    sockid: SocketId::NULL,
                    port: req.port,
                    error: Some(e),
                };
                self.send_payload(io, owner, &response);
            }
        }
    }

    pub fn handle_accept(&mut self, msg: &Message, req: Accept) {
        let Some(listener) = self.lookup_listener(&req.sockid).and_then(|s| self.listeners.get_mut(&s)) else {
            warn!("accept on unknown listener {:?} from {}", req.sockid, msg.source);
            return;
        };
        if listener.main {
            warn!("accept on the node listener from {} ignored", msg.source);
            return;
        }
        listener.accepts.push_back(Request { id: req.request_id, from: msg.source });
    }

    pub fn handle_delete_listener(&mut self, msg: &Message, req: DeleteListener) {
        match self.lookup_listener(&req.sockid) {
            Some(serial) if self.listeners.get(&serial).is_some_and(|l| l.main) => {
                warn!("delete of the node listener from {} ignored", msg.source);
            }
            Some(serial) => self.remove_listener(serial),
            None => debug!("delete of unknown listener {:?} from {}", req.sockid, msg.source),
        }
    }

    /// Close a listener and every connection it accepted
    pub fn remove_listener(&mut self, serial: u32) {
        let Some(listener) = self.listeners.remove(&serial) else {
            return;
        };
        debug!("listener {}:{} closed", listener.ip, listener.port);
        self.toclose.push(listener.fd);
        let spawned: Vec<u32> = self
            .connections
            .values()
            .filter(|c| c.listener == Some(serial))
            .map(|c| c.serial)
            .collect();
        for conn in spawned {
            self.request_delete(conn, false);
        }
    }

    /// Accept one pending client
    pub fn accept_one(&mut self, serial: u32) {
        let io = self.io_id();
        let Some(listener) = self.listeners.get_mut(&serial) else {
            return;
        };
        let (fd, ip, port) = match sys::accept(&listener.fd) {
            Ok(Some(accepted)) => accepted,
            Ok(None) => return,
            Err(e) => {
                warn!("accept on {}:{} failed: {}", listener.ip, listener.port, e);
                return;
            }
        };

        let main = listener.main;
        let listener_sockid = listener.sockid;
        let owner = listener.owner;
        let request = if main { None } else { listener.accepts.pop_front() };

        let conn_serial = self.next_serial();
        let role = if main { Role::Sniffing } else { Role::App };
        let mut conn = Connection::new(conn_serial, self.sockid(conn_serial), ip.to_string(), ip, port, role);
        conn.fd = Some(fd);
        conn.listener = Some(serial);
        if main {
            conn.sendbuf.extend_from_slice(WELCOME);
        } else {
            conn.owner = owner;
        }
        let sockid = conn.sockid;
        self.connections.insert(conn_serial, conn);
        debug!("accepted {}:{} as connection {}", ip, port, conn_serial);
        self.fire(conn_serial, ConnEvent::ClientConnected);

        if let Some(req) = request {
            let response = AcceptResponse {
                request_id: req.id,
                listener: listener_sockid,
                sockid,
                hostname: ip.to_string(),
                port,
            };
            self.send_payload(io, req.from, &response);
        }
    }
}
