//! Reactor wakeup
//!
//! Other threads hand work to the reactor through [`IoInbox`]: a lock-free
//! queue plus a [`Notifier`] that makes the reactor's poll return. The
//! default notifier is a self-pipe whose read end sits in every poll set.
//!
//! Notifications are coalesced: only the first `wake()` after the reactor
//! last drained the pipe writes a byte.

use crossbeam_queue::SegQueue;
use nix::fcntl::OFlag;
use nodelink_core::{Message, SocketError};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

/// Wakes the reactor out of poll
///
/// **Contract:**
/// - `notify()` must never block.
/// - Repeated calls before the reactor drains may collapse into one wakeup.
pub trait Notifier: Send + Sync {
    fn notify(&self) -> io::Result<()>;

    /// Consume pending notifications (reactor side)
    fn drain(&self);

    /// Fd the reactor polls for readability
    fn poll_fd(&self) -> RawFd;
}

/// Non-blocking pipe; writing a byte wakes the read end's poller
pub struct SelfPipe {
    reader: File,
    writer: File,
}

impl SelfPipe {
    pub fn new() -> io::Result<Self> {
        let (r, w) = nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        Ok(Self { reader: File::from(r), writer: File::from(w) })
    }
}

impl Notifier for SelfPipe {
    fn notify(&self) -> io::Result<()> {
        match (&self.writer).write(&[1u8]) {
            Ok(_) => Ok(()),
            // pipe full: a wakeup is already pending
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    fn poll_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}

/// A finished name lookup for a connection still in `Start`
#[derive(Debug)]
pub(crate) struct Resolution {
    pub serial: u32,
    pub result: Result<Ipv4Addr, SocketError>,
}

/// Messages for the reactor: control requests and frames bound for peers,
/// plus name lookups finished by resolver threads
pub(crate) struct IoInbox {
    queue: SegQueue<Message>,
    resolved: SegQueue<Resolution>,
    pending: AtomicBool,
    notifier: Box<dyn Notifier>,
}

impl IoInbox {
    pub fn new(notifier: Box<dyn Notifier>) -> Self {
        Self {
            queue: SegQueue::new(),
            resolved: SegQueue::new(),
            pending: AtomicBool::new(false),
            notifier,
        }
    }

    pub fn push_resolution(&self, resolution: Resolution) {
        self.resolved.push(resolution);
        self.wake();
    }

    pub fn pop_resolution(&self) -> Option<Resolution> {
        self.resolved.pop()
    }

    /// Queue a message and wake the reactor
    pub fn push(&self, msg: Message) {
        self.queue.push(msg);
        self.wake();
    }

    pub fn pop(&self) -> Option<Message> {
        self.queue.pop()
    }

    pub fn wake(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.notifier.notify() {
                tracing::warn!("reactor wakeup failed: {}", e);
            }
        }
    }

    /// Reset the coalescing flag, then empty the pipe. Anything pushed after
    /// this point wakes the next poll.
    pub fn drain_wakeups(&self) {
        self.pending.store(false, Ordering::Release);
        self.notifier.drain();
    }

    pub fn poll_fd(&self) -> RawFd {
        self.notifier.poll_fd()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
