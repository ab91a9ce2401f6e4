//! Admission control for outbound connections
//!
//! One [`ServerInfo`] per remote IP counts the outbound connections to that
//! IP in each phase:
//!
//! ```text
//!   waiting   Waiting                      (FIFO queue of serials)
//!   opening   Ready, Connecting            (slot held until the connect resolves)
//!   accepted  Accepted, AcceptedDoneWriting, AcceptedDoneReading
//! ```
//!
//! At most `max_opening` connects per IP are unresolved at once. The rest
//! wait in FIFO order and are promoted one at a time as connects succeed or
//! fail. `ConnectedDoneWriting` is only reachable after a successful connect,
//! so it never takes a slot back.
//! The runtime reports every state change through
//! [`AdmissionTable::record`] and afterwards asks [`AdmissionTable::promotable`]
//! which waiting connection (if any) should receive `SlotAvailable`.

use crate::state::ConnState;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::Ipv4Addr;

/// Per-remote-IP connection counters
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub ip: Ipv4Addr,
    pub nwaiting: usize,
    pub nopening: usize,
    pub naccepted: usize,
    waiting: VecDeque<u32>,
    max_opening: usize,
}

impl ServerInfo {
    pub fn new(ip: Ipv4Addr, max_opening: usize) -> Self {
        ServerInfo {
            ip,
            nwaiting: 0,
            nopening: 0,
            naccepted: 0,
            waiting: VecDeque::new(),
            max_opening,
        }
    }

    /// Update counters for connection `serial` moving `from` → `to`
    pub fn record_transition(&mut self, serial: u32, from: ConnState, to: ConnState) {
        if from.is_waiting() != to.is_waiting() {
            if to.is_waiting() {
                self.nwaiting += 1;
                self.waiting.push_back(serial);
            } else {
                self.nwaiting = self.nwaiting.saturating_sub(1);
                self.waiting.retain(|s| *s != serial);
            }
        }
        if from.holds_slot() != to.holds_slot() {
            if to.holds_slot() {
                self.nopening += 1;
            } else {
                self.nopening = self.nopening.saturating_sub(1);
            }
        }
        if from.is_accepted() != to.is_accepted() {
            if to.is_accepted() {
                self.naccepted += 1;
            } else {
                self.naccepted = self.naccepted.saturating_sub(1);
            }
        }
    }

    /// The waiting connection to promote next, if a slot is free
    #[inline]
    pub fn next_ready(&self) -> Option<u32> {
        if self.nopening < self.max_opening {
            self.waiting.front().copied()
        } else {
            None
        }
    }

    /// Serials currently queued, oldest first
    pub fn waiting(&self) -> impl Iterator<Item = u32> + '_ {
        self.waiting.iter().copied()
    }

    #[inline]
    pub fn max_opening(&self) -> usize {
        self.max_opening
    }
}

/// All `ServerInfo`s of a node, created lazily and kept for the node's life
#[derive(Debug, Default)]
pub struct AdmissionTable {
    servers: HashMap<Ipv4Addr, ServerInfo>,
    dirty: BTreeSet<Ipv4Addr>,
    max_opening: usize,
}

impl AdmissionTable {
    pub fn new(max_opening: usize) -> Self {
        AdmissionTable {
            servers: HashMap::new(),
            dirty: BTreeSet::new(),
            max_opening,
        }
    }

    /// Record a state change of an outbound connection to `ip`
    pub fn record(&mut self, ip: Ipv4Addr, serial: u32, from: ConnState, to: ConnState) {
        let max = self.max_opening;
        self.servers
            .entry(ip)
            .or_insert_with(|| ServerInfo::new(ip, max))
            .record_transition(serial, from, to);
        self.dirty.insert(ip);
    }

    /// Next connection due for `SlotAvailable`, across every IP that changed
    ///
    /// IPs with nothing to promote are cleared from the dirty set. Call
    /// repeatedly until it returns `None`.
    pub fn promotable(&mut self) -> Option<(Ipv4Addr, u32)> {
        while let Some(ip) = self.dirty.first().copied() {
            if let Some(serial) = self.servers.get(&ip).and_then(ServerInfo::next_ready) {
                return Some((ip, serial));
            }
            self.dirty.remove(&ip);
        }
        None
    }

    pub fn get(&self, ip: &Ipv4Addr) -> Option<&ServerInfo> {
        self.servers.get(ip)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerInfo> {
        self.servers.values()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
