//! Error types shared by the codec and the runtime

use crate::constants::ERRMSG_MAX;
use thiserror::Error;

/// Result type for decoding operations
pub type WireResult<T> = Result<T, WireError>;

/// Errors raised while decoding frames or payloads
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Input ended before a complete field was read
    #[error("truncated input: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    /// Frame header announced a payload larger than the frame limit
    #[error("frame payload of {0} bytes exceeds limit")]
    FrameTooLarge(u32),

    /// A string field was not valid UTF-8
    #[error("string field is not valid UTF-8")]
    BadString,

    /// Payload decoded under the wrong tag
    #[error("unexpected tag {0}")]
    UnknownTag(u32),
}

/// A socket-level failure captured as errno plus a bounded message
///
/// These are surfaced once to the owning endpoint in a response or in
/// `CONNECTION_CLOSED`; they are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (errno {errno})")]
pub struct SocketError {
    pub errno: i32,
    pub message: String,
}

impl SocketError {
    /// Build from an errno and message; the message is cut to `ERRMSG_MAX` bytes.
    pub fn new(errno: i32, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_utf8(&mut message, ERRMSG_MAX);
        SocketError { errno, message }
    }

    /// Build from an errno using the OS description
    pub fn from_errno(errno: i32) -> Self {
        SocketError::new(errno, std::io::Error::from_raw_os_error(errno).to_string())
    }

    /// Build from the calling thread's current errno
    pub fn last_os_error() -> Self {
        let err = std::io::Error::last_os_error();
        SocketError::new(err.raw_os_error().unwrap_or(0), err.to_string())
    }
}

impl From<std::io::Error> for SocketError {
    fn from(err: std::io::Error) -> Self {
        SocketError::new(err.raw_os_error().unwrap_or(0), err.to_string())
    }
}

fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}
