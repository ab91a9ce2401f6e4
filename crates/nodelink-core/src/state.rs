//! Connection states and events

use core::fmt;

/// State of a connection
///
/// ```text
///   outbound:  Start ─▶ Waiting ─▶ Ready ─▶ Connecting ─▶ Connected
///                                    │          │
///                                    └────┬─────┘
///                                         ▼
///                                      Failed
///   inbound:   Start ─────────────────────────────────▶ Connected
///
///   Connected ─▶ {ConnectedDoneWriting, Accepted*} ─▶ Finished ─▶ End
///                                                     Failed ─▶ End
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnState {
    Start = 0,
    Waiting = 1,
    Ready = 2,
    Failed = 3,
    Connecting = 4,
    Connected = 5,
    ConnectedDoneWriting = 6,
    Accepted = 7,
    AcceptedDoneWriting = 8,
    AcceptedDoneReading = 9,
    Finished = 10,
    End = 11,
}

impl ConnState {
    pub const ALL: [ConnState; 12] = [
        ConnState::Start,
        ConnState::Waiting,
        ConnState::Ready,
        ConnState::Failed,
        ConnState::Connecting,
        ConnState::Connected,
        ConnState::ConnectedDoneWriting,
        ConnState::Accepted,
        ConnState::AcceptedDoneWriting,
        ConnState::AcceptedDoneReading,
        ConnState::Finished,
        ConnState::End,
    ];

    /// Queued behind the admission limit
    #[inline]
    pub const fn is_waiting(&self) -> bool {
        matches!(self, ConnState::Waiting)
    }

    /// Opening phase of an outbound connection, before its first read
    #[inline]
    pub const fn is_opening(&self) -> bool {
        matches!(
            self,
            ConnState::Ready | ConnState::Connecting | ConnState::ConnectedDoneWriting
        )
    }

    /// Holds one of the per-IP opening slots: the connect is still unresolved
    #[inline]
    pub const fn holds_slot(&self) -> bool {
        matches!(self, ConnState::Ready | ConnState::Connecting)
    }

    /// Established and past its first read
    #[inline]
    pub const fn is_accepted(&self) -> bool {
        matches!(
            self,
            ConnState::Accepted | ConnState::AcceptedDoneWriting | ConnState::AcceptedDoneReading
        )
    }

    /// Established, in any half-close combination
    #[inline]
    pub const fn is_established(&self) -> bool {
        matches!(self, ConnState::Connected | ConnState::ConnectedDoneWriting) || self.is_accepted()
    }

    /// The read side is still open
    #[inline]
    pub const fn can_read(&self) -> bool {
        matches!(
            self,
            ConnState::Connected
                | ConnState::ConnectedDoneWriting
                | ConnState::Accepted
                | ConnState::AcceptedDoneWriting
        )
    }

    /// The write side is still open
    #[inline]
    pub const fn can_write(&self) -> bool {
        matches!(
            self,
            ConnState::Connected | ConnState::Accepted | ConnState::AcceptedDoneReading
        )
    }

    /// Output may be queued: established with the write side open, or still
    /// on its way to being established
    #[inline]
    pub const fn accepts_output(&self) -> bool {
        self.can_write()
            || matches!(
                self,
                ConnState::Start | ConnState::Waiting | ConnState::Ready | ConnState::Connecting
            )
    }

    pub const fn name(&self) -> &'static str {
        match self {
            ConnState::Start => "START",
            ConnState::Waiting => "WAITING",
            ConnState::Ready => "READY",
            ConnState::Failed => "FAILED",
            ConnState::Connecting => "CONNECTING",
            ConnState::Connected => "CONNECTED",
            ConnState::ConnectedDoneWriting => "CONNECTED_DONE_WRITING",
            ConnState::Accepted => "ACCEPTED",
            ConnState::AcceptedDoneWriting => "ACCEPTED_DONE_WRITING",
            ConnState::AcceptedDoneReading => "ACCEPTED_DONE_READING",
            ConnState::Finished => "FINISHED",
            ConnState::End => "END",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Event driving a connection's state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnEvent {
    /// Fired after every state change; lets transient states move on
    Auto = 0,
    /// Outbound connect requested
    Requested = 1,
    /// Admission control granted an opening slot
    SlotAvailable = 2,
    /// Socket setup or connect(2) failed synchronously
    AttemptFailed = 3,
    /// connect(2) returned EINPROGRESS
    AsyncStarted = 4,
    /// Asynchronous connect failed
    AsyncFailed = 5,
    /// Asynchronous connect completed
    AsyncOk = 6,
    /// Write side finished (requested half-close, or drained on delete)
    FinWrite = 7,
    /// Read side finished (EOF from peer)
    FinRead = 8,
    /// Socket error while established
    Error = 9,
    /// Connection deleted by its owner or by teardown
    Delete = 10,
    /// Data was read
    Read = 11,
    /// Socket already connected when created (accept, socketpair)
    ClientConnected = 12,
}

impl ConnEvent {
    pub const ALL: [ConnEvent; 13] = [
        ConnEvent::Auto,
        ConnEvent::Requested,
        ConnEvent::SlotAvailable,
        ConnEvent::AttemptFailed,
        ConnEvent::AsyncStarted,
        ConnEvent::AsyncFailed,
        ConnEvent::AsyncOk,
        ConnEvent::FinWrite,
        ConnEvent::FinRead,
        ConnEvent::Error,
        ConnEvent::Delete,
        ConnEvent::Read,
        ConnEvent::ClientConnected,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            ConnEvent::Auto => "AUTO",
            ConnEvent::Requested => "REQUESTED",
            ConnEvent::SlotAvailable => "SLOT_AVAILABLE",
            ConnEvent::AttemptFailed => "ATTEMPT_FAILED",
            ConnEvent::AsyncStarted => "ASYNC_STARTED",
            ConnEvent::AsyncFailed => "ASYNC_FAILED",
            ConnEvent::AsyncOk => "ASYNC_OK",
            ConnEvent::FinWrite => "FIN_WRITE",
            ConnEvent::FinRead => "FIN_READ",
            ConnEvent::Error => "ERROR",
            ConnEvent::Delete => "DELETE",
            ConnEvent::Read => "READ",
            ConnEvent::ClientConnected => "CLIENT_CONNECTED",
        }
    }
}

impl fmt::Display for ConnEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_sets_are_disjoint() {
        for s in ConnState::ALL {
            let n = s.is_waiting() as u8 + s.is_opening() as u8 + s.is_accepted() as u8;
            assert!(n <= 1, "{s} in {n} sets");
        }
    }

    #[test]
    fn test_half_close_predicates() {
        assert!(ConnState::ConnectedDoneWriting.can_read());
        assert!(!ConnState::ConnectedDoneWriting.can_write());
        assert!(ConnState::AcceptedDoneReading.can_write());
        assert!(!ConnState::AcceptedDoneReading.can_read());
        assert!(!ConnState::Finished.can_read());
        assert!(!ConnState::Finished.accepts_output());
        assert!(ConnState::Waiting.accepts_output());
    }

    #[test]
    fn test_resolved_connect_holds_no_slot() {
        for s in ConnState::ALL {
            if s.holds_slot() {
                assert!(s.is_opening(), "{s}");
                assert!(!s.is_established(), "{s}");
            }
        }
        assert!(!ConnState::Connected.is_opening());
        assert!(!ConnState::Connected.holds_slot());
        assert!(ConnState::ConnectedDoneWriting.is_opening());
        assert!(!ConnState::ConnectedDoneWriting.holds_slot());
    }
}
