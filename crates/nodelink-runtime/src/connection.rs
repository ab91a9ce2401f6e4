//! Connections and the state machine driver
//!
//! A [`Connection`] is one TCP stream (or one end of a socketpair) owned by
//! the reactor. Its state only changes through [`NodeState::fire`], which
//! applies the transition table from `nodelink_core::fsm`:
//!
//! ```text
//!   fire(serial, ev)
//!     └─ fire_inner(serial, ev)
//!          Enter{next, action}: pre-action → set_state → fire Auto → post-action
//!          Release:             drop connection, fd → toclose
//!     └─ while admission.promotable() → fire_inner(serial, SlotAvailable)
//! ```
//!
//! Every `fire` happens on the reactor thread with the node lock held.

use crate::node::NodeState;
use crate::notifier::Resolution;
use crate::sys::{self, Transfer};

use nodelink_core::payload::{
    ConnPair, ConnPairResponse, Connect, ConnectResponse, ConnectionClosed, DeleteConnection,
    FinWrite, FinWriteResponse, Read, ReadResponse, Write, WriteResponse,
};
use nodelink_core::{
    transition, Action, ConnEvent, ConnState, EndpointId, Message, NodeAddr, SocketError, SocketId, Step,
};

use std::collections::VecDeque;
use std::net::{Ipv4Addr, Shutdown};
use std::os::fd::OwnedFd;
use std::thread;

use tracing::{debug, error, trace, warn};

/// A pending request and who to answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Request {
    pub id: u32,
    pub from: EndpointId,
}

/// What a connection carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Byte stream driven by an endpoint's READ/WRITE requests
    App,
    /// Accepted on the main listener; greeting not seen yet
    Sniffing,
    /// Frames to and from another node
    Peer { node: NodeAddr, handshaken: bool },
}

#[derive(Debug)]
pub(crate) struct Connection {
    pub serial: u32,
    pub sockid: SocketId,
    pub fd: Option<OwnedFd>,
    pub hostname: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub state: ConnState,
    pub role: Role,
    /// Created by CONNECT or for a peer; counts against admission
    pub outbound: bool,
    pub owner: EndpointId,
    /// Listener that accepted it
    pub listener: Option<u32>,
    pub recvbuf: Vec<u8>,
    pub sendbuf: Vec<u8>,
    pub connect_request: u32,
    pub read_request: Option<Request>,
    /// WRITE responses held back until sendbuf drains
    pub write_waiters: VecDeque<Request>,
    pub finwrite: Option<Request>,
    /// Close once sendbuf is flushed
    pub delete_pending: bool,
    pub error: Option<SocketError>,
    pub totalread: u64,
    pub totalwritten: u64,
    /// Local port taken from the client port range
    pub outport: Option<u16>,
    /// Name lookup in flight on a resolver thread
    pub resolving: bool,
}

impl Connection {
    pub fn new(serial: u32, sockid: SocketId, hostname: String, ip: Ipv4Addr, port: u16, role: Role) -> Self {
        Self {
            serial,
            sockid,
            fd: None,
            hostname,
            ip,
            port,
            state: ConnState::Start,
            role,
            outbound: false,
            owner: EndpointId::NULL,
            listener: None,
            recvbuf: Vec::new(),
            sendbuf: Vec::new(),
            connect_request: 0,
            read_request: None,
            write_waiters: VecDeque::new(),
            finwrite: None,
            delete_pending: false,
            error: None,
            totalread: 0,
            totalwritten: 0,
            outport: None,
            resolving: false,
        }
    }

    /// Poll for readability
    pub fn wants_read(&self) -> bool {
        self.fd.is_some()
            && self.state.can_read()
            && match self.role {
                Role::App => self.read_request.is_some(),
                Role::Sniffing | Role::Peer { .. } => true,
            }
    }

    /// Poll for writability (also how a pending connect completes)
    pub fn wants_write(&self) -> bool {
        self.fd.is_some()
            && (self.state == ConnState::Connecting || (self.state.can_write() && !self.sendbuf.is_empty()))
    }
}

impl NodeState {
    // ========================================================================
    // State machine driver
    // ========================================================================

    /// Fire `event` on connection `serial`, then promote waiting connections
    pub fn fire(&mut self, serial: u32, event: ConnEvent) {
        self.fire_inner(serial, event);
        if self.shutdown {
            return;
        }
        while let Some((ip, next)) = self.admission.promotable() {
            trace!("admission: promoting {} to {}", next, ip);
            self.fire_inner(next, ConnEvent::SlotAvailable);
        }
    }

    fn fire_inner(&mut self, serial: u32, event: ConnEvent) {
        let Some(state) = self.connections.get(&serial).map(|c| c.state) else {
            crate::fatal!("event {} for unknown connection {}", event, serial);
        };

        match transition(state, event) {
            Step::Ignore => {}
            Step::Fatal => {
                crate::fatal!("connection {}: no transition for {} in {}", serial, event, state);
            }
            Step::Release => self.release(serial),
            Step::Enter { next, action } => {
                debug!("connection {}: {} --{}--> {}", serial, state, event, next);
                if action.is_pre() {
                    self.run_action(serial, action);
                }
                self.set_state(serial, next);
                self.fire_inner(serial, ConnEvent::Auto);
                if action.is_post() {
                    self.run_action(serial, action);
                }
            }
        }
    }

    fn set_state(&mut self, serial: u32, next: ConnState) {
        if let Some(conn) = self.connections.get_mut(&serial) {
            let prev = conn.state;
            conn.state = next;
            if conn.outbound {
                self.admission.record(conn.ip, serial, prev, next);
            }
        }
    }

    fn release(&mut self, serial: u32) {
        // Deleted before it connected: no close notice answered these
        self.answer_held_requests(serial);
        let Some(mut conn) = self.connections.remove(&serial) else {
            return;
        };
        if let Some(fd) = conn.fd.take() {
            self.toclose.push(fd);
        }
        self.record_traffic(conn.ip, conn.port, conn.totalread, conn.totalwritten);
        if let (Some(port), Some(ports)) = (conn.outport, self.outports.as_mut()) {
            ports.release(port);
        }
        if let Role::Peer { node, .. } = conn.role {
            if self.peers.get(&node) == Some(&serial) {
                self.peers.remove(&node);
            }
        }
        trace!("connection {} released", serial);
    }

    fn run_action(&mut self, serial: u32, action: Action) {
        let io = self.io_id();
        let Some(conn) = self.connections.get_mut(&serial) else {
            return;
        };
        let (sockid, owner, role) = (conn.sockid, conn.owner, conn.role);

        match action {
            Action::None => {}
            Action::InitiateConnect => {
                let (ip, port) = (conn.ip, conn.port);
                let result = self.connect_outbound(ip, port);
                let Some(conn) = self.connections.get_mut(&serial) else {
                    return;
                };
                match result {
                    Ok((fd, outport)) => {
                        conn.fd = Some(fd);
                        conn.outport = outport;
                        self.fire_inner(serial, ConnEvent::AsyncStarted);
                    }
                    Err(e) => {
                        debug!("connection {}: connect to {}:{} failed: {}", serial, ip, port, e);
                        conn.error = Some(e);
                        self.fire_inner(serial, ConnEvent::AttemptFailed);
                    }
                }
            }
            Action::NotifyConnected => match role {
                Role::App => {
                    let response = ConnectResponse { request_id: conn.connect_request, sockid, error: None };
                    self.send_payload(io, owner, &response);
                }
                Role::Peer { node, .. } => debug!("peer link to {} up", node),
                Role::Sniffing => {}
            },
            Action::NotifyConnectFailed => {
                let error = conn.error.clone().unwrap_or_else(|| SocketError::new(libc::ECONNREFUSED, "connect failed"));
                let request_id = conn.connect_request;
                match role {
                    Role::App => {
                        self.answer_held_requests(serial);
                        let response = ConnectResponse { request_id, sockid: SocketId::NULL, error: Some(error) };
                        self.send_payload(io, owner, &response);
                    }
                    Role::Peer { node, .. } => {
                        warn!("cannot reach node {}: {}", node, error);
                        self.drop_peer(serial, node);
                    }
                    Role::Sniffing => {}
                }
            }
            Action::NotifyClosed => {
                let error = conn.error.clone();
                match role {
                    Role::App => {
                        self.answer_held_requests(serial);
                        self.send_payload(io, owner, &ConnectionClosed { sockid, error });
                    }
                    Role::Peer { node, .. } => {
                        match &error {
                            Some(e) => warn!("peer link to {} closed: {}", node, e),
                            None => debug!("peer link to {} closed", node),
                        }
                        self.drop_peer(serial, node);
                    }
                    Role::Sniffing => {}
                }
            }
            Action::ShutdownRead => {
                if let Some(fd) = &conn.fd {
                    sys::shutdown(fd, Shutdown::Read);
                }
            }
            Action::ShutdownWrite => {
                if let Some(fd) = &conn.fd {
                    sys::shutdown(fd, Shutdown::Write);
                }
            }
        }
    }

    /// Answer WRITE and FINWRITE requests still held on a closing connection
    ///
    /// Their data may not have reached the peer; the CONNECTION_CLOSED that
    /// follows says whether the connection ended in error.
    fn answer_held_requests(&mut self, serial: u32) {
        let io = self.io_id();
        let Some(conn) = self.connections.get_mut(&serial) else {
            return;
        };
        let sockid = conn.sockid;
        let writes = std::mem::take(&mut conn.write_waiters);
        let finwrite = conn.finwrite.take();
        for req in writes {
            self.send_payload(io, req.from, &WriteResponse { request_id: req.id, sockid });
        }
        if let Some(req) = finwrite {
            self.send_payload(io, req.from, &FinWriteResponse { request_id: req.id, sockid });
        }
    }

    /// Start a connect, from the client port range when one is configured
    ///
    /// Ports that cannot be bound are dropped from the range for good.
    fn connect_outbound(&mut self, ip: Ipv4Addr, port: u16) -> Result<(OwnedFd, Option<u16>), SocketError> {
        let Some(ports) = self.outports.as_mut() else {
            return sys::connect_nonblocking(ip, port, None).map(|fd| (fd, None));
        };
        loop {
            let Some(local) = ports.alloc() else {
                error!("outgoing ports exhausted");
                return Err(SocketError::new(libc::EADDRNOTAVAIL, "outgoing ports exhausted"));
            };
            match sys::connect_nonblocking(ip, port, Some(local)) {
                Ok(fd) => return Ok((fd, Some(local))),
                Err(e) if sys::port_unusable(&e) => {
                    debug!("client port {} unusable: {}", local, e);
                }
                Err(e) => {
                    ports.release(local);
                    return Err(e);
                }
            }
        }
    }

    /// Add a finished connection's byte counts to the per-destination totals
    fn record_traffic(&mut self, ip: Ipv4Addr, port: u16, read: u64, written: u64) {
        let totals = self.traffic.entry((ip, port)).or_default();
        totals.0 += read;
        totals.1 += written;
    }

    /// Forget a peer link and break every link that went through it
    fn drop_peer(&mut self, serial: u32, node: NodeAddr) {
        if self.peers.get(&node) == Some(&serial) {
            self.peers.remove(&node);
            self.handle_disconnection(node);
        }
    }

    /// Close a connection, flushing queued output first if asked to
    pub fn request_delete(&mut self, serial: u32, flush: bool) {
        let Some(conn) = self.connections.get_mut(&serial) else {
            return;
        };
        let state = conn.state;
        if state.is_established() {
            if flush && state.can_write() && !conn.sendbuf.is_empty() {
                conn.delete_pending = true;
                return;
            }
            self.fire(serial, ConnEvent::Delete);
        } else if matches!(state, ConnState::Start | ConnState::Waiting | ConnState::Ready | ConnState::Connecting) {
            self.fire(serial, ConnEvent::Delete);
        }
    }

    /// Connection for a sockid issued by this node
    pub fn lookup(&self, sockid: &SocketId) -> Option<u32> {
        if sockid.owner != self.io_id() {
            return None;
        }
        self.connections.contains_key(&sockid.serial).then_some(sockid.serial)
    }

    /// Reactor links to `owner` so its exit tears down what it owns
    pub fn link_owner(&mut self, owner: EndpointId) {
        if !owner.is_null() {
            let io = self.io_id();
            self.link(io, owner);
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Literal addresses connect at once; names are looked up on a resolver
    /// thread while the connection waits in `Start`
    pub fn handle_connect(&mut self, msg: &Message, req: Connect) {
        let io = self.io_id();
        let owner = req.owner.or(msg.source);
        let literal = req.hostname.parse::<Ipv4Addr>().ok();

        let serial = self.next_serial();
        let ip = literal.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let mut conn = Connection::new(serial, self.sockid(serial), req.hostname.clone(), ip, req.port, Role::App);
        conn.owner = owner;
        conn.connect_request = req.request_id;

        if literal.is_none() {
            let inbox = self.inbox.clone();
            let (hostname, port) = (req.hostname, req.port);
            let spawned = thread::Builder::new().name("nodelink-resolve".to_string()).spawn(move || {
                let result = sys::resolve(&hostname, port);
                inbox.push_resolution(Resolution { serial, result });
            });
            if let Err(e) = spawned {
                warn!("connect: cannot start resolver: {}", e);
                let response = ConnectResponse { request_id: req.request_id, sockid: SocketId::NULL, error: Some(e.into()) };
                self.send_payload(io, owner, &response);
                return;
            }
            conn.resolving = true;
            self.connections.insert(serial, conn);
            self.link_owner(owner);
            return;
        }

        conn.outbound = true;
        self.connections.insert(serial, conn);
        self.link_owner(owner);
        self.fire(serial, ConnEvent::Requested);
    }

    /// A resolver thread finished; connect or report the failure
    pub fn handle_resolution(&mut self, resolution: Resolution) {
        let io = self.io_id();
        let serial = resolution.serial;
        let Some(conn) = self.connections.get_mut(&serial).filter(|c| c.resolving) else {
            trace!("lookup for connection {} finished after it closed", serial);
            return;
        };
        conn.resolving = false;
        match resolution.result {
            Ok(ip) => {
                debug!("connection {}: {} is {}", serial, conn.hostname, ip);
                conn.ip = ip;
                // Counts against admission once its address is known
                conn.outbound = true;
                self.fire(serial, ConnEvent::Requested);
            }
            Err(e) => {
                debug!("connect: cannot resolve {}: {}", conn.hostname, e);
                let response = ConnectResponse { request_id: conn.connect_request, sockid: SocketId::NULL, error: Some(e) };
                let owner = conn.owner;
                self.fire(serial, ConnEvent::Delete);
                self.send_payload(io, owner, &response);
            }
        }
    }

    pub fn handle_connpair(&mut self, msg: &Message, req: ConnPair) {
        let io = self.io_id();
        let owner = req.owner.or(msg.source);
        let (a, b) = match sys::socketpair() {
            Ok(pair) => pair,
            Err(e) => {
                let response = ConnPairResponse {
                    request_id: req.request_id,
                    sockids: [SocketId::NULL; 2],
                    error: Some(e),
                };
                self.send_payload(io, owner, &response);
                return;
            }
        };

        let mut sockids = [SocketId::NULL; 2];
        for (slot, fd) in [a, b].into_iter().enumerate() {
            let serial = self.next_serial();
            let mut conn =
                Connection::new(serial, self.sockid(serial), "localhost".to_string(), Ipv4Addr::LOCALHOST, 0, Role::App);
            conn.fd = Some(fd);
            conn.owner = owner;
            sockids[slot] = conn.sockid;
            self.connections.insert(serial, conn);
            self.fire(serial, ConnEvent::ClientConnected);
        }
        self.link_owner(owner);
        self.send_payload(io, owner, &ConnPairResponse { request_id: req.request_id, sockids, error: None });
    }

    pub fn handle_read(&mut self, msg: &Message, req: Read) {
        let io = self.io_id();
        let chunk = self.config.io_chunk;
        let eof = ReadResponse { request_id: req.request_id, sockid: req.sockid, data: Vec::new() };

        let Some(serial) = self.lookup(&req.sockid) else {
            warn!("read on unknown socket {:?} from {}", req.sockid, msg.source);
            self.send_payload(io, msg.source, &eof);
            return;
        };
        let Some(conn) = self.connections.get_mut(&serial) else {
            return;
        };

        if !conn.recvbuf.is_empty() {
            let n = conn.recvbuf.len().min(chunk);
            let data: Vec<u8> = conn.recvbuf.drain(..n).collect();
            let response = ReadResponse { request_id: req.request_id, sockid: req.sockid, data };
            self.send_payload(io, msg.source, &response);
        } else if conn.state.is_established() && !conn.state.can_read() {
            self.send_payload(io, msg.source, &eof);
        } else if conn.read_request.is_some() {
            warn!("connection {}: read already pending, dropping request {}", serial, req.request_id);
        } else {
            conn.read_request = Some(Request { id: req.request_id, from: msg.source });
        }
    }

    /// Queue data; the response is held while a chunk or more is queued
    ///
    /// A held response is always sent: once the queue drains below a chunk,
    /// or, if the connection closes first, just before CONNECTION_CLOSED.
    pub fn handle_write(&mut self, msg: &Message, req: Write) {
        let io = self.io_id();
        let chunk = self.config.io_chunk;
        let response = WriteResponse { request_id: req.request_id, sockid: req.sockid };

        let Some(serial) = self.lookup(&req.sockid) else {
            warn!("write on unknown socket {:?} from {}", req.sockid, msg.source);
            self.send_payload(io, msg.source, &response);
            return;
        };
        let Some(conn) = self.connections.get_mut(&serial) else {
            return;
        };

        if !conn.state.accepts_output() {
            warn!("connection {}: write after close ({}), {} bytes dropped", serial, conn.state, req.data.len());
            self.send_payload(io, msg.source, &response);
            return;
        }
        conn.sendbuf.extend_from_slice(&req.data);
        if conn.sendbuf.len() < chunk {
            self.send_payload(io, msg.source, &response);
        } else {
            trace!("connection {}: {} bytes queued, holding write response", serial, conn.sendbuf.len());
            conn.write_waiters.push_back(Request { id: req.request_id, from: msg.source });
        }
    }

    pub fn handle_finwrite(&mut self, msg: &Message, req: FinWrite) {
        let io = self.io_id();
        let response = FinWriteResponse { request_id: req.request_id, sockid: req.sockid };

        let Some(serial) = self.lookup(&req.sockid) else {
            warn!("finwrite on unknown socket {:?} from {}", req.sockid, msg.source);
            self.send_payload(io, msg.source, &response);
            return;
        };
        let Some(conn) = self.connections.get_mut(&serial) else {
            return;
        };

        if conn.state.is_established() && !conn.state.can_write() {
            self.send_payload(io, msg.source, &response);
            return;
        }
        conn.finwrite = Some(Request { id: req.request_id, from: msg.source });
        // Anything still queued goes out before the half-close
        self.settle(serial);
    }

    pub fn handle_delete_connection(&mut self, msg: &Message, req: DeleteConnection) {
        match self.lookup(&req.sockid) {
            Some(serial) => self.request_delete(serial, true),
            None => debug!("delete of unknown socket {:?} from {}", req.sockid, msg.source),
        }
    }

    /// Tear down what a dead endpoint owned
    pub fn handle_owner_exit(&mut self, dead: EndpointId) {
        let owned: Vec<u32> = self
            .connections
            .values_mut()
            .filter(|c| c.owner == dead)
            .map(|c| {
                c.owner = EndpointId::NULL;
                c.serial
            })
            .collect();
        for serial in owned {
            self.request_delete(serial, true);
        }
        let listeners: Vec<u32> = self.listeners.values().filter(|l| l.owner == dead).map(|l| l.serial).collect();
        for serial in listeners {
            self.remove_listener(serial);
        }
    }

    // ========================================================================
    // Socket servicing
    // ========================================================================

    /// Finish a pending half-close or delete once output has drained
    pub fn settle(&mut self, serial: u32) {
        let io = self.io_id();
        let Some(conn) = self.connections.get_mut(&serial) else {
            return;
        };
        if !conn.sendbuf.is_empty() || !conn.state.is_established() {
            return;
        }
        if conn.state.can_write() {
            if let Some(req) = conn.finwrite.take() {
                let sockid = conn.sockid;
                self.fire(serial, ConnEvent::FinWrite);
                self.send_payload(io, req.from, &FinWriteResponse { request_id: req.id, sockid });
            }
        }
        let delete = self.connections.get(&serial).is_some_and(|c| c.delete_pending);
        if delete {
            self.fire(serial, ConnEvent::Delete);
        }
    }

    /// Settle every connection with a half-close or delete outstanding
    pub fn settle_all(&mut self) {
        let pending: Vec<u32> = self
            .connections
            .values()
            .filter(|c| c.finwrite.is_some() || c.delete_pending)
            .map(|c| c.serial)
            .collect();
        for serial in pending {
            self.settle(serial);
        }
    }

    /// Writable: finish a pending connect or flush queued output
    pub fn service_write(&mut self, serial: u32) {
        let io = self.io_id();
        let chunk = self.config.io_chunk;
        let Some(conn) = self.connections.get_mut(&serial) else {
            return;
        };
        let Some(fd) = conn.fd.as_ref() else {
            return;
        };

        if conn.state == ConnState::Connecting {
            match sys::take_socket_error(fd) {
                Ok(()) => self.fire(serial, ConnEvent::AsyncOk),
                Err(e) => {
                    debug!("connection {}: connect to {}:{} failed: {}", serial, conn.ip, conn.port, e);
                    conn.error = Some(e);
                    self.fire(serial, ConnEvent::AsyncFailed);
                }
            }
            return;
        }
        if !conn.state.can_write() || conn.sendbuf.is_empty() {
            return;
        }

        match sys::send(fd, &conn.sendbuf) {
            Ok(Transfer::Done(n)) => {
                conn.sendbuf.drain(..n);
                conn.totalwritten += n as u64;
                trace!("connection {}: sent {} bytes, {} queued", serial, n, conn.sendbuf.len());
            }
            Ok(Transfer::WouldBlock) => {}
            Err(e) => {
                debug!("connection {}: send failed: {}", serial, e);
                conn.error = Some(e);
                self.fire(serial, ConnEvent::Error);
                return;
            }
        }

        if conn.sendbuf.len() < chunk && !conn.write_waiters.is_empty() {
            let sockid = conn.sockid;
            let waiters = std::mem::take(&mut conn.write_waiters);
            for req in waiters {
                self.send_payload(io, req.from, &WriteResponse { request_id: req.id, sockid });
            }
        }
        self.settle(serial);
    }

    /// Readable: pull at most one chunk and hand it on
    pub fn service_read(&mut self, serial: u32) {
        let chunk = self.config.io_chunk;
        let Some(conn) = self.connections.get_mut(&serial) else {
            return;
        };
        let Some(fd) = conn.fd.as_ref() else {
            return;
        };
        if self.readbuf.len() < chunk {
            self.readbuf.resize(chunk, 0);
        }

        match sys::read(fd, &mut self.readbuf[..chunk]) {
            Ok(Transfer::WouldBlock) => {}
            Ok(Transfer::Done(0)) => self.on_eof(serial),
            Ok(Transfer::Done(n)) => {
                conn.totalread += n as u64;
                let data = self.readbuf[..n].to_vec();
                self.on_data(serial, data);
            }
            Err(e) => {
                debug!("connection {}: read failed: {}", serial, e);
                conn.error = Some(e);
                self.fire(serial, ConnEvent::Error);
            }
        }
    }

    fn on_data(&mut self, serial: u32, data: Vec<u8>) {
        let io = self.io_id();
        let Some(conn) = self.connections.get_mut(&serial) else {
            return;
        };
        trace!("connection {}: read {} bytes", serial, data.len());

        match conn.role {
            Role::App => {
                let sockid = conn.sockid;
                match conn.read_request.take() {
                    Some(req) => {
                        self.send_payload(io, req.from, &ReadResponse { request_id: req.id, sockid, data });
                    }
                    None => conn.recvbuf.extend_from_slice(&data),
                }
                self.fire(serial, ConnEvent::Read);
            }
            Role::Sniffing | Role::Peer { .. } => {
                conn.recvbuf.extend_from_slice(&data);
                self.fire(serial, ConnEvent::Read);
                self.process_peer_input(serial);
            }
        }
    }

    fn on_eof(&mut self, serial: u32) {
        let io = self.io_id();
        let Some(conn) = self.connections.get_mut(&serial) else {
            return;
        };
        debug!("connection {}: end of stream", serial);

        match conn.role {
            Role::App => {
                let sockid = conn.sockid;
                if let Some(req) = conn.read_request.take() {
                    let response = ReadResponse { request_id: req.id, sockid, data: Vec::new() };
                    self.send_payload(io, req.from, &response);
                }
                self.fire(serial, ConnEvent::FinRead);
            }
            Role::Sniffing => {
                self.fire(serial, ConnEvent::FinRead);
                self.request_delete(serial, false);
            }
            Role::Peer { .. } => {
                self.fire(serial, ConnEvent::FinRead);
                self.request_delete(serial, true);
            }
        }
    }

    /// Fail a connection with a protocol error
    pub fn protocol_error(&mut self, serial: u32, message: String) {
        let Some(conn) = self.connections.get_mut(&serial) else {
            return;
        };
        warn!("connection {} ({}:{}): {}", serial, conn.ip, conn.port, message);
        conn.error = Some(SocketError::new(libc::EPROTO, message));
        if conn.state.is_established() {
            self.fire(serial, ConnEvent::Error);
        }
    }

    /// Shutdown: close every connection without flushing, then every listener
    pub fn close_all(&mut self) {
        let serials: Vec<u32> = self.connections.keys().copied().collect();
        for serial in serials {
            self.request_delete(serial, false);
        }
        let listeners: Vec<u32> = self.listeners.keys().copied().collect();
        for serial in listeners {
            self.remove_listener(serial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(role: Role) -> Connection {
        Connection::new(1, SocketId::NULL, "h".into(), Ipv4Addr::LOCALHOST, 1, role)
    }

    #[test]
    fn test_wants_read_without_fd() {
        let mut c = conn(Role::Sniffing);
        c.state = ConnState::Connected;
        assert!(!c.wants_read());
        assert!(!c.wants_write());
    }

    #[test]
    fn test_app_reads_only_on_request() {
        let (a, _b) = sys::socketpair().unwrap();
        let mut c = conn(Role::App);
        c.fd = Some(a);
        c.state = ConnState::Connected;
        assert!(!c.wants_read());
        c.read_request = Some(Request { id: 1, from: EndpointId::NULL });
        assert!(c.wants_read());
        c.state = ConnState::AcceptedDoneReading;
        assert!(!c.wants_read());
    }

    #[test]
    fn test_peer_always_reads() {
        let (a, _b) = sys::socketpair().unwrap();
        let node = NodeAddr::new(Ipv4Addr::LOCALHOST, 9);
        let mut c = conn(Role::Peer { node, handshaken: true });
        c.fd = Some(a);
        c.state = ConnState::Accepted;
        assert!(c.wants_read());
    }

    #[test]
    fn test_wants_write() {
        let (a, _b) = sys::socketpair().unwrap();
        let mut c = conn(Role::App);
        c.fd = Some(a);
        c.state = ConnState::Connecting;
        assert!(c.wants_write());
        c.state = ConnState::Connected;
        assert!(!c.wants_write());
        c.sendbuf.extend_from_slice(b"x");
        assert!(c.wants_write());
        c.state = ConnState::ConnectedDoneWriting;
        assert!(!c.wants_write());
    }
}
