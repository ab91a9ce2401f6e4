//! Endpoint mailbox
//!
//! A FIFO of messages behind its own mutex and condition variable. The node
//! lock is never held while a receiver waits here, and a mailbox never
//! takes the node lock, so lock order is always node → mailbox.

use nodelink_core::Message;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// How long `receive` may block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Forever,
    Poll,
    For(Duration),
}

impl From<Duration> for Wait {
    fn from(d: Duration) -> Self {
        Wait::For(d)
    }
}

/// Millisecond convention: -1 (any negative) blocks, 0 polls
impl From<i64> for Wait {
    fn from(ms: i64) -> Self {
        match ms {
            ms if ms < 0 => Wait::Forever,
            0 => Wait::Poll,
            ms => Wait::For(Duration::from_millis(ms as u64)),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<Message>,
    interrupted: bool,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct Mailbox {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a message; returns false if the mailbox is closed
    pub fn push(&self, msg: Message) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        inner.queue.push_back(msg);
        self.cond.notify_one();
        true
    }

    /// Oldest message, waiting as `wait` allows
    ///
    /// Returns `None` on timeout, when the mailbox is closed and empty, or
    /// when an interrupt is pending (the interrupt is consumed).
    pub fn receive(&self, wait: Wait) -> Option<Message> {
        let deadline = match wait {
            Wait::For(d) => Some(Instant::now() + d),
            _ => None,
        };
        let mut inner = self.lock();
        loop {
            if let Some(msg) = inner.queue.pop_front() {
                return Some(msg);
            }
            if inner.interrupted {
                inner.interrupted = false;
                return None;
            }
            if inner.closed {
                return None;
            }
            match (wait, deadline) {
                (Wait::Poll, _) => return None,
                (Wait::Forever, _) => {
                    inner = self.cond.wait(inner).unwrap_or_else(|e| e.into_inner());
                }
                (Wait::For(_), Some(deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    inner = self
                        .cond
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
                (Wait::For(_), None) => return None,
            }
        }
    }

    /// Wake a blocked `receive` (or make the next one return at once)
    pub fn interrupt(&self) {
        let mut inner = self.lock();
        inner.interrupted = true;
        self.cond.notify_all();
    }

    /// Refuse further messages and wake any receiver
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodelink_core::EndpointId;
    use std::sync::Arc;
    use std::thread;

    fn msg(tag: u32) -> Message {
        Message::new(EndpointId::NULL, EndpointId::NULL, tag, Vec::new())
    }

    #[test]
    fn test_fifo() {
        let mb = Mailbox::new();
        for t in 1..=3 {
            assert!(mb.push(msg(t)));
        }
        assert_eq!(mb.len(), 3);
        for t in 1..=3 {
            assert_eq!(mb.receive(Wait::Poll).map(|m| m.tag), Some(t));
        }
        assert!(mb.receive(Wait::Poll).is_none());
    }

    #[test]
    fn test_wait_conversions() {
        assert_eq!(Wait::from(-1), Wait::Forever);
        assert_eq!(Wait::from(0), Wait::Poll);
        assert_eq!(Wait::from(250), Wait::For(Duration::from_millis(250)));
    }

    #[test]
    fn test_timeout() {
        let mb = Mailbox::new();
        let start = Instant::now();
        assert!(mb.receive(Wait::For(Duration::from_millis(30))).is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_blocked_receive_wakes_on_push() {
        let mb = Arc::new(Mailbox::new());
        let mb2 = mb.clone();
        let handle = thread::spawn(move || mb2.receive(Wait::Forever).map(|m| m.tag));
        thread::sleep(Duration::from_millis(20));
        mb.push(msg(42));
        assert_eq!(handle.join().unwrap(), Some(42));
    }

    #[test]
    fn test_interrupt() {
        let mb = Arc::new(Mailbox::new());
        let mb2 = mb.clone();
        let handle = thread::spawn(move || mb2.receive(Wait::Forever));
        thread::sleep(Duration::from_millis(20));
        mb.interrupt();
        assert!(handle.join().unwrap().is_none());
        // consumed: the next poll sees nothing pending
        assert!(mb.receive(Wait::Poll).is_none());
        mb.push(msg(1));
        assert!(mb.receive(Wait::Poll).is_some());
    }

    #[test]
    fn test_closed_refuses() {
        let mb = Mailbox::new();
        mb.push(msg(1));
        mb.close();
        assert!(!mb.push(msg(2)));
        assert_eq!(mb.receive(Wait::Forever).map(|m| m.tag), Some(1));
        assert!(mb.receive(Wait::Forever).is_none());
    }
}
