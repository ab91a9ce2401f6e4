//! # Reactor: the single I/O thread of a node
//!
//! The reactor owns every socket. Each pass:
//! 1. Builds a poll set under the node lock (wakeup pipe, accepting
//!    listeners, connections that want to read or write)
//! 2. Drops the lock and blocks in poll(2)
//! 3. Re-takes the lock and drains the inbox: control requests addressed to
//!    the IO endpoint, and messages for other nodes (framed onto the peer
//!    connection, which is opened on demand)
//! 4. Services writable sockets, then readable ones, then one accept per
//!    ready listener
//! 5. Closes the fds released during the pass after dropping the lock
//!
//! Reads are capped at one chunk per connection per pass so a busy stream
//! cannot starve the others.

use crate::connection::{Connection, Role};
use crate::console;
use crate::endpoint::Endpoint;
use crate::node::{NodeShared, NodeState};
use crate::sys;

use nodelink_core::payload::{
    Accept, ConnPair, Connect, DeleteConnection, DeleteListener, EndpointExit, FinWrite, Listen, Read, Write,
};
use nodelink_core::wire::{self, Sniff};
use nodelink_core::{tag, ConnEvent, Message, NodeAddr, Payload};

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

/// What a pollfd entry stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Token {
    Wakeup,
    Listener(u32),
    Conn(u32),
}

/// The reactor loop; runs on a dedicated OS thread.
pub(crate) fn run(node: Arc<NodeShared>) {
    let timeout = node.config.poll_timeout_ms();
    let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(64);
    let mut tokens: Vec<Token> = Vec::with_capacity(64);
    info!("reactor for {} started", node.addr);

    loop {
        // ── Step 1: poll set ──
        node.lock().build_poll_set(&mut pollfds, &mut tokens);

        // ── Step 2: wait ──
        if let Err(e) = sys::poll(&mut pollfds, timeout) {
            crate::fatal!("reactor poll failed: {}", e);
        }

        // ── Step 3-4: inbox, then sockets ──
        let (toclose, stopped) = {
            let mut state = node.lock();
            node.inbox.drain_wakeups();
            state.process_inbox();
            state.service(&pollfds, &tokens);
            state.settle_all();
            if state.shutdown {
                state.close_all();
            }
            (std::mem::take(&mut state.toclose), state.shutdown)
        };

        // ── Step 5: close outside the lock ──
        if !toclose.is_empty() {
            trace!("closing {} fd(s)", toclose.len());
        }
        drop(toclose);

        if stopped {
            break;
        }
    }

    info!("reactor for {} stopped", node.addr);
}

impl NodeState {
    fn build_poll_set(&self, pollfds: &mut Vec<libc::pollfd>, tokens: &mut Vec<Token>) {
        use std::os::fd::AsRawFd;

        pollfds.clear();
        tokens.clear();

        pollfds.push(libc::pollfd { fd: self.inbox.poll_fd(), events: libc::POLLIN, revents: 0 });
        tokens.push(Token::Wakeup);

        for listener in self.listeners.values().filter(|l| l.accepting()) {
            pollfds.push(libc::pollfd { fd: listener.fd.as_raw_fd(), events: libc::POLLIN, revents: 0 });
            tokens.push(Token::Listener(listener.serial));
        }

        for conn in self.connections.values() {
            let Some(fd) = &conn.fd else { continue };
            let mut events = 0;
            if conn.wants_read() {
                events |= libc::POLLIN;
            }
            if conn.wants_write() {
                events |= libc::POLLOUT;
            }
            if events != 0 {
                pollfds.push(libc::pollfd { fd: fd.as_raw_fd(), events, revents: 0 });
                tokens.push(Token::Conn(conn.serial));
            }
        }
    }

    /// Writes first, then reads, then accepts
    fn service(&mut self, pollfds: &[libc::pollfd], tokens: &[Token]) {
        const FAILED: libc::c_short = libc::POLLERR | libc::POLLHUP;

        let ready = || pollfds.iter().zip(tokens.iter()).filter(|(p, _)| p.revents != 0);

        for (pfd, token) in ready() {
            if let Token::Conn(serial) = *token {
                if pfd.events & libc::POLLOUT != 0 && pfd.revents & (libc::POLLOUT | FAILED) != 0 {
                    self.service_write(serial);
                }
            }
        }
        for (pfd, token) in ready() {
            if let Token::Conn(serial) = *token {
                if pfd.events & libc::POLLIN != 0 && pfd.revents & (libc::POLLIN | FAILED) != 0 {
                    self.service_read(serial);
                }
            }
        }
        for (_, token) in ready() {
            if let Token::Listener(serial) = *token {
                self.accept_one(serial);
            }
        }
    }

    // ========================================================================
    // Inbox
    // ========================================================================

    fn process_inbox(&mut self) {
        while let Some(resolution) = self.inbox.pop_resolution() {
            self.handle_resolution(resolution);
        }
        while let Some(msg) = self.inbox.pop() {
            if msg.dest.is_on(self.addr) {
                self.handle_control(msg);
            } else {
                self.forward_remote(msg);
            }
        }
    }

    fn handle_control(&mut self, msg: Message) {
        trace!("reactor: {} from {}", msg.tag_name(), msg.source);
        match msg.tag {
            tag::LISTEN => {
                if let Some(req) = decode_or_warn::<Listen>(&msg) {
                    self.handle_listen(&msg, req);
                }
            }
            tag::ACCEPT => {
                if let Some(req) = decode_or_warn::<Accept>(&msg) {
                    self.handle_accept(&msg, req);
                }
            }
            tag::CONNECT => {
                if let Some(req) = decode_or_warn::<Connect>(&msg) {
                    self.handle_connect(&msg, req);
                }
            }
            tag::CONNPAIR => {
                if let Some(req) = decode_or_warn::<ConnPair>(&msg) {
                    self.handle_connpair(&msg, req);
                }
            }
            tag::READ => {
                if let Some(req) = decode_or_warn::<Read>(&msg) {
                    self.handle_read(&msg, req);
                }
            }
            tag::WRITE => {
                if let Some(req) = decode_or_warn::<Write>(&msg) {
                    self.handle_write(&msg, req);
                }
            }
            tag::FINWRITE => {
                if let Some(req) = decode_or_warn::<FinWrite>(&msg) {
                    self.handle_finwrite(&msg, req);
                }
            }
            tag::DELETE_CONNECTION => {
                if let Some(req) = decode_or_warn::<DeleteConnection>(&msg) {
                    self.handle_delete_connection(&msg, req);
                }
            }
            tag::DELETE_LISTENER => {
                if let Some(req) = decode_or_warn::<DeleteListener>(&msg) {
                    self.handle_delete_listener(&msg, req);
                }
            }
            tag::ENDPOINT_EXIT => {
                if let Some(exit) = decode_or_warn::<EndpointExit>(&msg) {
                    debug!("reactor: owner {} gone ({:?})", exit.dead, exit.reason);
                    self.handle_owner_exit(exit.dead);
                }
            }
            _ => warn!("reactor: unexpected {} from {}", msg.tag_name(), msg.source),
        }
    }

    // ========================================================================
    // Peers
    // ========================================================================

    /// Frame a message onto the connection to its destination node
    fn forward_remote(&mut self, msg: Message) {
        let node = msg.dest.node();
        if !msg.source.is_on(self.addr) {
            warn!("dropping {} from foreign source {} to {}", msg.tag_name(), msg.source, msg.dest);
            return;
        }

        let existing = self
            .peers
            .get(&node)
            .copied()
            .and_then(|serial| self.connections.get_mut(&serial))
            .filter(|c| c.state.accepts_output());
        if let Some(conn) = existing {
            wire::encode_frame(&mut conn.sendbuf, msg.source.localid, msg.dest.localid, msg.tag, &msg.data);
            return;
        }

        if self.shutdown {
            debug!("shutting down, {} to {} dropped", msg.tag_name(), msg.dest);
            return;
        }

        // First message to this node: open a link, greeting first
        let serial = self.next_serial();
        let role = Role::Peer { node, handshaken: false };
        let mut conn = Connection::new(serial, self.sockid(serial), node.ip.to_string(), node.ip, node.port, role);
        conn.outbound = true;
        wire::encode_hello(&mut conn.sendbuf, self.addr.port);
        wire::encode_frame(&mut conn.sendbuf, msg.source.localid, msg.dest.localid, msg.tag, &msg.data);
        self.connections.insert(serial, conn);
        self.peers.insert(node, serial);
        debug!("opening peer link {} to {}", serial, node);
        self.fire(serial, ConnEvent::Requested);
    }

    /// Consume handshake bytes and frames buffered on a peer or sniffing connection
    pub fn process_peer_input(&mut self, serial: u32) {
        loop {
            let Some(conn) = self.connections.get_mut(&serial) else {
                return;
            };
            match conn.role {
                Role::App => return,
                Role::Sniffing => match wire::sniff(&conn.recvbuf, true) {
                    Sniff::NeedMore | Sniff::Peer { listen_port: None, .. } => return,
                    Sniff::Peer { listen_port: Some(port), consumed } => {
                        conn.recvbuf.drain(..consumed);
                        let node = NodeAddr::new(conn.ip, port);
                        conn.role = Role::Peer { node, handshaken: true };
                        debug!("connection {} is a peer link from {}", serial, node);
                        self.peers.entry(node).or_insert(serial);
                    }
                    Sniff::Console => {
                        self.start_console(serial);
                        return;
                    }
                },
                Role::Peer { node, handshaken: false } => match wire::sniff(&conn.recvbuf, false) {
                    Sniff::NeedMore => return,
                    Sniff::Peer { consumed, .. } => {
                        conn.recvbuf.drain(..consumed);
                        conn.role = Role::Peer { node, handshaken: true };
                        trace!("peer link {} to {} confirmed", serial, node);
                    }
                    Sniff::Console => {
                        self.protocol_error(serial, format!("{} sent an invalid welcome", node));
                        return;
                    }
                },
                Role::Peer { node, handshaken: true } => {
                    let frames = match wire::parse_frames(&conn.recvbuf) {
                        Ok((frames, used)) => {
                            conn.recvbuf.drain(..used);
                            frames
                        }
                        Err(e) => {
                            self.protocol_error(serial, format!("bad frame from {}: {}", node, e));
                            return;
                        }
                    };
                    for frame in frames {
                        let msg = Message::new(
                            node.endpoint(frame.source),
                            self.addr.endpoint(frame.dest),
                            frame.tag,
                            frame.data,
                        );
                        self.route(msg);
                    }
                    return;
                }
            }
        }
    }

    /// A client that is not a node: hand it to a console endpoint
    fn start_console(&mut self, serial: u32) {
        if !self.config.console {
            debug!("connection {}: console disabled, closing", serial);
            self.request_delete(serial, false);
            return;
        }
        let Some(conn) = self.connections.get_mut(&serial) else {
            return;
        };
        conn.role = Role::App;
        let sockid = conn.sockid;

        let spawned = self.spawn_endpoint(None, "console", Box::new(move |ep: &Endpoint| console::run(ep, sockid)));
        match spawned {
            Ok((id, _)) => {
                if let Some(conn) = self.connections.get_mut(&serial) {
                    conn.owner = id;
                }
                self.link_owner(id);
                info!("console session {} on connection {}", id, serial);
            }
            Err(e) => {
                warn!("cannot start console: {}", e);
                self.request_delete(serial, false);
            }
        }
    }
}

fn decode_or_warn<P: Payload>(msg: &Message) -> Option<P> {
    match msg.decode::<P>() {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!("reactor: malformed {} from {}: {}", msg.tag_name(), msg.source, e);
            None
        }
    }
}
