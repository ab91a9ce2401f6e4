//! Node: endpoint registry, routing, links and lifecycle
//!
//! ```text
//!   Node (handle, Clone)
//!     └── Arc<NodeShared>
//!           ├── IoInbox            lock-free; reactor work + wakeup pipe
//!           └── Mutex<NodeState>   "the node lock"
//!                 ├── endpoints    localid → EndpointEntry (sink, links)
//!                 ├── connections  serial → Connection      (reactor only)
//!                 ├── listeners    serial → Listener        (reactor only)
//!                 ├── peers        NodeAddr → serial
//!                 └── admission    ServerInfo per remote IP
//! ```
//!
//! Every routing decision happens under the node lock. Local delivery pushes
//! into the destination mailbox (its own lock, taken after the node lock).
//! Anything for the reactor or for another node goes through the inbox; the
//! reactor is the only thread that touches sockets.

use crate::config::NodeConfig;
use crate::connection::{Connection, Role};
use crate::endpoint::{Endpoint, Worker};
use crate::error::{NodeError, NodeResult};
use crate::listener::Listener;
use crate::mailbox::Mailbox;
use crate::manager::{self, ManagerExtension, NoExtension};
use crate::notifier::{IoInbox, SelfPipe};
use crate::{reactor, sys};

use nodelink_core::constants::{FIRST_ID, IO_ID, MANAGER_ID};
use nodelink_core::payload::{EndpointExit, ExitReason, Kill};
use nodelink_core::{tag, AdmissionTable, ConnState, EndpointId, Message, NodeAddr, Payload, PortSet, SocketId};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, trace, warn};

/// Entry function of an endpoint thread
pub(crate) type EntryFn = Box<dyn FnOnce(&Endpoint) + Send + 'static>;

/// Where messages for an endpoint go
pub(crate) enum Sink {
    Mailbox(Arc<Mailbox>),
    /// The reactor: control requests and exits go to the inbox
    Reactor,
}

pub(crate) struct EndpointEntry {
    pub id: EndpointId,
    pub kind: String,
    pub sink: Sink,
    /// Endpoints linked to this one
    pub inlinks: BTreeSet<EndpointId>,
    /// Endpoints this one linked to
    pub outlinks: BTreeSet<EndpointId>,
}

/// Everything behind the node lock
pub(crate) struct NodeState {
    pub addr: NodeAddr,
    pub config: NodeConfig,
    pub shared: Weak<NodeShared>,
    pub inbox: Arc<IoInbox>,
    pub endpoints: HashMap<u32, EndpointEntry>,
    next_localid: u32,
    next_serial: u32,
    pub connections: BTreeMap<u32, Connection>,
    pub listeners: BTreeMap<u32, Listener>,
    pub peers: HashMap<NodeAddr, u32>,
    pub admission: AdmissionTable,
    /// Client port range for outbound connects
    pub outports: Option<PortSet>,
    /// Bytes (read, written) of released connections, per remote ip:port
    pub traffic: BTreeMap<(Ipv4Addr, u16), (u64, u64)>,
    /// Fds released this pass; closed after the lock is dropped
    pub toclose: Vec<OwnedFd>,
    pub readbuf: Vec<u8>,
    pub shutdown: bool,
}

impl NodeState {
    fn new(addr: NodeAddr, config: NodeConfig, shared: Weak<NodeShared>, inbox: Arc<IoInbox>) -> Self {
        let admission = AdmissionTable::new(config.max_opening);
        let readbuf = vec![0u8; config.io_chunk];
        let outports = config.client_ports.map(|(lo, hi)| PortSet::new(lo, hi));
        Self {
            addr,
            config,
            shared,
            inbox,
            endpoints: HashMap::new(),
            next_localid: FIRST_ID,
            next_serial: 1,
            connections: BTreeMap::new(),
            listeners: BTreeMap::new(),
            peers: HashMap::new(),
            admission,
            outports,
            traffic: BTreeMap::new(),
            toclose: Vec::new(),
            readbuf,
            shutdown: false,
        }
    }

    #[inline]
    pub fn io_id(&self) -> EndpointId {
        self.addr.endpoint(IO_ID)
    }

    /// Fresh serial for a connection or listener; never 0
    pub fn next_serial(&mut self) -> u32 {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1).max(1);
        serial
    }

    #[inline]
    pub fn sockid(&self, serial: u32) -> SocketId {
        SocketId::new(self.io_id(), serial)
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Deliver locally or hand to the reactor for a peer connection
    pub fn route(&mut self, msg: Message) {
        if msg.dest.is_on(self.addr) {
            self.deliver_local(msg);
        } else {
            self.inbox.push(msg);
        }
    }

    /// Encode and route a payload
    pub fn send_payload<P: Payload>(&mut self, source: EndpointId, dest: EndpointId, payload: &P) {
        if dest.is_null() {
            return;
        }
        self.route(Message::with_payload(source, dest, payload));
    }

    fn deliver_local(&mut self, msg: Message) {
        let Some(entry) = self.endpoints.get_mut(&msg.dest.localid) else {
            if msg.tag == tag::LINK {
                // late link: the target is already gone
                let exit = EndpointExit { dead: msg.dest, reason: ExitReason::NoSuchEndpoint };
                self.send_payload(msg.dest, msg.source, &exit);
            } else {
                trace!("dropping {} for dead endpoint {}", msg.tag_name(), msg.dest);
            }
            return;
        };

        match msg.tag {
            tag::LINK => {
                entry.inlinks.insert(msg.source);
                return;
            }
            tag::UNLINK => {
                entry.inlinks.remove(&msg.source);
                return;
            }
            tag::ENDPOINT_EXIT => {
                if let Ok(exit) = msg.decode::<EndpointExit>() {
                    entry.outlinks.remove(&exit.dead);
                    entry.inlinks.remove(&exit.dead);
                }
            }
            _ => {}
        }

        match &entry.sink {
            Sink::Mailbox(mailbox) => {
                mailbox.push(msg);
            }
            Sink::Reactor => self.inbox.push(msg),
        }
    }

    /// Record a link from `from` (local) to `to` and tell `to`'s node
    pub fn link(&mut self, from: EndpointId, to: EndpointId) {
        let Some(entry) = self.endpoints.get_mut(&from.localid) else {
            return;
        };
        if entry.outlinks.insert(to) {
            self.send_payload(from, to, &nodelink_core::payload::Link { target: to });
        }
    }

    pub fn unlink(&mut self, from: EndpointId, to: EndpointId) {
        let Some(entry) = self.endpoints.get_mut(&from.localid) else {
            return;
        };
        if entry.outlinks.remove(&to) {
            self.send_payload(from, to, &nodelink_core::payload::Unlink { target: to });
        }
    }

    // ========================================================================
    // Endpoints
    // ========================================================================

    fn register(&mut self, localid: Option<u32>, kind: &str, sink: Sink) -> EndpointId {
        let localid = localid.unwrap_or_else(|| {
            let id = self.next_localid;
            self.next_localid += 1;
            id
        });
        let id = self.addr.endpoint(localid);
        self.endpoints.insert(
            localid,
            EndpointEntry {
                id,
                kind: kind.to_string(),
                sink,
                inlinks: BTreeSet::new(),
                outlinks: BTreeSet::new(),
            },
        );
        id
    }

    /// Register an endpoint and start its thread
    ///
    /// The id is live before the thread runs, so messages sent to it right
    /// away are queued.
    pub fn spawn_endpoint(
        &mut self,
        localid: Option<u32>,
        kind: &str,
        entry: EntryFn,
    ) -> NodeResult<(EndpointId, JoinHandle<()>)> {
        if self.shutdown {
            return Err(NodeError::Shutdown);
        }
        let node = self.shared.upgrade().ok_or(NodeError::Shutdown)?;
        let mailbox = Arc::new(Mailbox::new());
        let id = self.register(localid, kind, Sink::Mailbox(mailbox.clone()));

        let mut builder = thread::Builder::new().name(format!("nodelink-{}-{}", kind, id.localid));
        if let Some(size) = self.config.worker_stack_size {
            builder = builder.stack_size(size);
        }
        let kind_owned = kind.to_string();
        let spawned = builder.spawn(move || {
            let endpoint = Endpoint::new(id, kind_owned, mailbox, node);
            let _worker = Worker::new(&endpoint);
            debug!("endpoint {} ({}) started", id, endpoint.kind());
            entry(&endpoint);
        });

        match spawned {
            Ok(handle) => Ok((id, handle)),
            Err(source) => {
                self.endpoints.remove(&id.localid);
                Err(NodeError::Spawn { kind: kind.to_string(), source })
            }
        }
    }

    /// Deregister a finished endpoint and notify every link partner once
    pub fn handle_endpoint_exit(&mut self, localid: u32, reason: ExitReason) {
        let Some(entry) = self.endpoints.remove(&localid) else {
            return;
        };
        if let Sink::Mailbox(mailbox) = &entry.sink {
            mailbox.close();
        }
        let dead = entry.id;
        debug!("endpoint {} ({}) exited: {:?}", dead, entry.kind, reason);

        let exit = EndpointExit { dead, reason };
        let mut notified = BTreeSet::new();
        for target in entry.inlinks.union(&entry.outlinks) {
            if notified.insert(*target) {
                self.send_payload(dead, *target, &exit);
            }
        }
        // Local endpoints whose LINK raced with the exit
        let late: Vec<EndpointId> = self
            .endpoints
            .values()
            .filter(|e| e.outlinks.contains(&dead))
            .map(|e| e.id)
            .collect();
        for target in late {
            if notified.insert(target) {
                self.send_payload(dead, target, &exit);
            }
        }
    }

    /// The connection to `node` is gone: every local link into it is dead
    pub fn handle_disconnection(&mut self, node: NodeAddr) {
        let mut exits = Vec::new();
        for entry in self.endpoints.values_mut() {
            entry.inlinks.retain(|id| !id.is_on(node));
            for id in entry.outlinks.iter().filter(|id| id.is_on(node)) {
                exits.push((*id, entry.id));
            }
        }
        if !exits.is_empty() {
            info!("lost connection to node {}: {} link(s) broken", node, exits.len());
        }
        for (dead, to) in exits {
            let exit = EndpointExit { dead, reason: ExitReason::ConnectionLost };
            self.send_payload(dead, to, &exit);
        }
    }
}

/// State shared between the node handle, endpoints and the reactor
pub(crate) struct NodeShared {
    pub addr: NodeAddr,
    pub config: NodeConfig,
    pub inbox: Arc<IoInbox>,
    state: Mutex<NodeState>,
    reactor: Mutex<Option<JoinHandle<()>>>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl NodeShared {
    pub fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn route(&self, msg: Message) {
        self.lock().route(msg);
    }

    pub fn endpoint_exited(&self, localid: u32, reason: ExitReason) {
        self.lock().handle_endpoint_exit(localid, reason);
    }

    pub fn shutdown(&self) {
        let mut state = self.lock();
        if !state.shutdown {
            info!("node {} shutting down", self.addr);
            state.shutdown = true;
        }
        self.inbox.wake();
    }
}

// ============================================================================
// Introspection
// ============================================================================

/// Counts for a quick health check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStats {
    pub endpoints: usize,
    pub connections: usize,
    pub listeners: usize,
    /// Messages queued for the reactor
    pub pending_io: usize,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub sockid: SocketId,
    pub hostname: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub state: ConnState,
    /// "app", "peer" or "handshake"
    pub role: &'static str,
    pub owner: EndpointId,
    pub outbound: bool,
    pub sendbuf: usize,
    pub recvbuf: usize,
    /// Bytes read from and written to the socket so far
    pub read: u64,
    pub written: u64,
    /// Local port, when taken from the client port range
    pub local_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct ListenerInfo {
    pub sockid: SocketId,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub owner: EndpointId,
    pub main: bool,
    pub pending_accepts: usize,
}

#[derive(Debug, Clone)]
pub struct EndpointInfo {
    pub id: EndpointId,
    pub kind: String,
    pub inlinks: Vec<EndpointId>,
    pub outlinks: Vec<EndpointId>,
    pub queued: usize,
}

/// Bytes moved to and from one remote ip:port, over every connection to it
/// (closed or open)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficInfo {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub read: u64,
    pub written: u64,
}

/// Admission counters for one remote IP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSnapshot {
    pub ip: Ipv4Addr,
    pub nwaiting: usize,
    pub nopening: usize,
    pub naccepted: usize,
}

// ============================================================================
// Public handle
// ============================================================================

/// A running node
///
/// Cloning gives another handle to the same node.
#[derive(Clone)]
pub struct Node {
    shared: Arc<NodeShared>,
}

impl Node {
    /// Bind the main listener, start the reactor and the manager
    pub fn start(config: NodeConfig) -> NodeResult<Node> {
        Self::start_with_extension(config, Box::new(NoExtension))
    }

    /// As `start`, with extra manager behaviour
    pub fn start_with_extension(
        config: NodeConfig,
        extension: Box<dyn ManagerExtension>,
    ) -> NodeResult<Node> {
        config.validate().map_err(NodeError::Config)?;

        let (fd, port) = sys::bind_listener(config.listen_ip, config.listen_port, config.listen_backlog)
            .map_err(|source| NodeError::Listen {
                addr: SocketAddrV4::new(config.listen_ip, config.listen_port),
                source,
            })?;
        let addr = NodeAddr::new(config.effective_ip(), port);
        let inbox = Arc::new(IoInbox::new(Box::new(SelfPipe::new().map_err(NodeError::Wakeup)?)));

        let shared = Arc::new_cyclic(|weak| NodeShared {
            addr,
            config: config.clone(),
            inbox: inbox.clone(),
            state: Mutex::new(NodeState::new(addr, config.clone(), weak.clone(), inbox)),
            reactor: Mutex::new(None),
            manager: Mutex::new(None),
        });

        {
            let mut state = shared.lock();
            state.register(Some(IO_ID), "io", Sink::Reactor);
            state.add_main_listener(fd, config.listen_ip, port);
        }

        let reactor = thread::Builder::new()
            .name(format!("nodelink-reactor-{}", port))
            .spawn({
                let shared = shared.clone();
                move || reactor::run(shared)
            })
            .map_err(|source| NodeError::Spawn { kind: "reactor".to_string(), source })?;
        *shared.reactor.lock().unwrap_or_else(|e| e.into_inner()) = Some(reactor);

        let node = Node { shared };
        let spawned = node.shared.lock().spawn_endpoint(
            Some(MANAGER_ID),
            "manager",
            Box::new(move |ep: &Endpoint| manager::run(ep, extension)),
        );
        match spawned {
            Ok((_, handle)) => {
                *node.shared.manager.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            }
            Err(e) => {
                node.shutdown();
                let _ = node.clone().join();
                return Err(e);
            }
        }

        info!("node {} started", addr);
        Ok(node)
    }

    pub(crate) fn from_shared(shared: Arc<NodeShared>) -> Node {
        Node { shared }
    }

    /// Address other nodes use to reach this one
    pub fn addr(&self) -> NodeAddr {
        self.shared.addr
    }

    /// Port of the main listener
    pub fn listen_port(&self) -> u16 {
        self.shared.addr.port
    }

    pub fn io_id(&self) -> EndpointId {
        self.shared.addr.endpoint(IO_ID)
    }

    pub fn manager_id(&self) -> EndpointId {
        self.shared.addr.endpoint(MANAGER_ID)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    /// Start an endpoint running `entry` on its own thread
    ///
    /// Returns as soon as the id is registered. When `entry` returns (or
    /// panics) the endpoint is removed and its link partners are notified.
    pub fn add_thread<F>(&self, kind: &str, entry: F) -> NodeResult<EndpointId>
    where
        F: FnOnce(&Endpoint) + Send + 'static,
    {
        let (id, _handle) = self.shared.lock().spawn_endpoint(None, kind, Box::new(entry))?;
        Ok(id)
    }

    /// Route a message on behalf of `source`
    pub fn send(&self, source: EndpointId, dest: EndpointId, tag: u32, data: Vec<u8>) {
        self.shared.route(Message::new(source, dest, tag, data));
    }

    /// Ask the reactor to close every socket and stop
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.lock().shutdown
    }

    /// Wait for the reactor to stop, then tell remaining endpoints to exit
    ///
    /// Waits for the manager; user endpoints are sent KILL but not waited on.
    pub fn join(self) -> NodeResult<()> {
        let reactor = self.shared.reactor.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = reactor {
            if handle.join().is_err() {
                warn!("reactor thread panicked");
            }
        }
        {
            let mut state = self.shared.lock();
            let io = state.io_id();
            let targets: Vec<EndpointId> = state
                .endpoints
                .values()
                .filter(|e| matches!(e.sink, Sink::Mailbox(_)))
                .map(|e| e.id)
                .collect();
            for id in targets {
                state.send_payload(io, id, &Kill);
            }
        }
        let manager = self.shared.manager.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = manager {
            if handle.join().is_err() {
                warn!("manager thread panicked");
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> NodeStats {
        let state = self.shared.lock();
        NodeStats {
            endpoints: state.endpoints.len(),
            connections: state.connections.len(),
            listeners: state.listeners.len(),
            pending_io: self.shared.inbox.len(),
        }
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.shared.lock();
        state
            .connections
            .values()
            .map(|c| ConnectionInfo {
                sockid: c.sockid,
                hostname: c.hostname.clone(),
                ip: c.ip,
                port: c.port,
                state: c.state,
                role: match c.role {
                    Role::App => "app",
                    Role::Sniffing => "handshake",
                    Role::Peer { .. } => "peer",
                },
                owner: c.owner,
                outbound: c.outbound,
                sendbuf: c.sendbuf.len(),
                recvbuf: c.recvbuf.len(),
                read: c.totalread,
                written: c.totalwritten,
                local_port: c.outport,
            })
            .collect()
    }

    /// Byte totals per remote ip:port, open connections included
    pub fn traffic(&self) -> Vec<TrafficInfo> {
        let state = self.shared.lock();
        let mut totals = state.traffic.clone();
        for c in state.connections.values() {
            let t = totals.entry((c.ip, c.port)).or_default();
            t.0 += c.totalread;
            t.1 += c.totalwritten;
        }
        totals
            .into_iter()
            .map(|((ip, port), (read, written))| TrafficInfo { ip, port, read, written })
            .collect()
    }

    pub fn listeners(&self) -> Vec<ListenerInfo> {
        let state = self.shared.lock();
        state
            .listeners
            .values()
            .map(|l| ListenerInfo {
                sockid: l.sockid,
                ip: l.ip,
                port: l.port,
                owner: l.owner,
                main: l.main,
                pending_accepts: l.accepts.len(),
            })
            .collect()
    }

    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        let state = self.shared.lock();
        let mut list: Vec<EndpointInfo> = state
            .endpoints
            .values()
            .map(|e| EndpointInfo {
                id: e.id,
                kind: e.kind.clone(),
                inlinks: e.inlinks.iter().copied().collect(),
                outlinks: e.outlinks.iter().copied().collect(),
                queued: match &e.sink {
                    Sink::Mailbox(mb) => mb.len(),
                    Sink::Reactor => self.shared.inbox.len(),
                },
            })
            .collect();
        list.sort_by_key(|e| e.id.localid);
        list
    }

    pub fn servers(&self) -> Vec<ServerSnapshot> {
        let state = self.shared.lock();
        let mut list: Vec<ServerSnapshot> = state
            .admission
            .iter()
            .map(|s| ServerSnapshot {
                ip: s.ip,
                nwaiting: s.nwaiting,
                nopening: s.nopening,
                naccepted: s.naccepted,
            })
            .collect();
        list.sort_by_key(|s| s.ip);
        list
    }

    pub fn server(&self, ip: Ipv4Addr) -> Option<ServerSnapshot> {
        self.servers().into_iter().find(|s| s.ip == ip)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("addr", &self.shared.addr).finish()
    }
}
