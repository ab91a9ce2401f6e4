//! Connection transition table
//!
//! `transition` is a pure function over `(ConnState, ConnEvent)`. The
//! runtime applies the returned [`Step`]:
//!
//! ```text
//!   Enter { next, action }:
//!       action.is_pre()  → run action
//!       state = next     (admission counters follow)
//!       fire Auto        (may cascade, e.g. Finished → End → released)
//!       action.is_post() → run action
//!   Ignore   → nothing
//!   Release  → drop the connection, queue its fd for close
//!   Fatal    → abort the process
//! ```
//!
//! The state space is closed: every pair not listed below is `Fatal`.

use crate::state::{ConnEvent, ConnState};

/// Side effect attached to a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// Create the socket and issue a non-blocking connect; fires
    /// `AsyncStarted` or `AttemptFailed`
    InitiateConnect,
    /// Send `CONNECT_RESPONSE` with no error to the owner
    NotifyConnected,
    /// Send `CONNECT_RESPONSE` carrying the failure to the owner
    NotifyConnectFailed,
    /// Send `CONNECTION_CLOSED` to the owner
    NotifyClosed,
    /// shutdown(SHUT_RD)
    ShutdownRead,
    /// shutdown(SHUT_WR)
    ShutdownWrite,
}

impl Action {
    /// Runs before the state changes
    #[inline]
    pub const fn is_pre(&self) -> bool {
        matches!(
            self,
            Action::NotifyConnectFailed
                | Action::NotifyClosed
                | Action::ShutdownRead
                | Action::ShutdownWrite
        )
    }

    /// Runs after the state change and its `Auto` cascade
    #[inline]
    pub const fn is_post(&self) -> bool {
        matches!(self, Action::InitiateConnect | Action::NotifyConnected)
    }
}

/// Outcome of a `(state, event)` lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Enter { next: ConnState, action: Action },
    Ignore,
    Release,
    Fatal,
}

const fn enter(next: ConnState) -> Step {
    Step::Enter { next, action: Action::None }
}

const fn enter_with(next: ConnState, action: Action) -> Step {
    Step::Enter { next, action }
}

/// Look up the transition for `event` in `state`
pub const fn transition(state: ConnState, event: ConnEvent) -> Step {
    use ConnEvent as E;
    use ConnState as S;

    match (state, event) {
        (S::Start, E::Requested) => enter(S::Waiting),
        (S::Start, E::ClientConnected) => enter(S::Connected),
        (S::Start, E::Delete) => enter(S::End),

        (S::Waiting, E::SlotAvailable) => enter_with(S::Ready, Action::InitiateConnect),
        (S::Waiting, E::Delete) => enter(S::End),

        (S::Ready, E::AsyncStarted) => enter(S::Connecting),
        (S::Ready, E::AttemptFailed) => enter(S::Failed),
        (S::Ready, E::Delete) => enter(S::End),

        (S::Failed, E::Auto) => enter_with(S::End, Action::NotifyConnectFailed),

        (S::Connecting, E::AsyncOk) => enter_with(S::Connected, Action::NotifyConnected),
        (S::Connecting, E::AsyncFailed) => enter(S::Failed),
        (S::Connecting, E::Delete) => enter(S::End),

        (S::Connected, E::Read) => enter(S::Accepted),
        (S::Connected, E::FinRead) => enter_with(S::AcceptedDoneReading, Action::ShutdownRead),
        (S::Connected, E::FinWrite) => enter_with(S::ConnectedDoneWriting, Action::ShutdownWrite),

        (S::ConnectedDoneWriting, E::Read) => enter(S::AcceptedDoneWriting),
        (S::ConnectedDoneWriting, E::FinRead) => enter_with(S::Finished, Action::ShutdownRead),
        (S::ConnectedDoneWriting, E::FinWrite) => Step::Ignore,

        (S::Accepted, E::Read) => Step::Ignore,
        (S::Accepted, E::FinRead) => enter_with(S::AcceptedDoneReading, Action::ShutdownRead),
        (S::Accepted, E::FinWrite) => enter_with(S::AcceptedDoneWriting, Action::ShutdownWrite),

        (S::AcceptedDoneWriting, E::Read) => Step::Ignore,
        (S::AcceptedDoneWriting, E::FinWrite) => Step::Ignore,
        (S::AcceptedDoneWriting, E::FinRead) => enter_with(S::Finished, Action::ShutdownRead),

        (S::AcceptedDoneReading, E::FinRead) => Step::Ignore,
        (S::AcceptedDoneReading, E::FinWrite) => enter_with(S::Finished, Action::ShutdownWrite),

        (
            S::Connected
            | S::ConnectedDoneWriting
            | S::Accepted
            | S::AcceptedDoneWriting
            | S::AcceptedDoneReading,
            E::Error | E::Delete,
        ) => enter(S::Finished),

        (S::Finished, E::Auto) => enter_with(S::End, Action::NotifyClosed),

        (S::End, E::Auto) => Step::Release,

        (_, E::Auto) => Step::Ignore,

        _ => Step::Fatal,
    }
}
