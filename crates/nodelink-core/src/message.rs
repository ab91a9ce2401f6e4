//! Message envelope and tag catalogue

use crate::error::WireResult;
use crate::id::EndpointId;
use crate::payload::Payload;

/// A message between two endpoints
///
/// Local delivery moves the message into the destination mailbox as-is.
/// Remote delivery writes a frame (`wire::FrameHeader` + `data`) onto the
/// connection to the destination's node; the receiving node rebuilds the
/// full ids from the connection's peer address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source: EndpointId,
    pub dest: EndpointId,
    pub tag: u32,
    pub data: Vec<u8>,
}

impl Message {
    #[inline]
    pub fn new(source: EndpointId, dest: EndpointId, tag: u32, data: Vec<u8>) -> Self {
        Message { source, dest, tag, data }
    }

    /// Build a message carrying an encoded payload
    pub fn with_payload<P: Payload>(source: EndpointId, dest: EndpointId, payload: &P) -> Self {
        Message::new(source, dest, P::TAG, payload.to_bytes())
    }

    /// Decode the payload, checking the tag first
    pub fn decode<P: Payload>(&self) -> WireResult<P> {
        if self.tag != P::TAG {
            return Err(crate::error::WireError::UnknownTag(self.tag));
        }
        P::from_bytes(&self.data)
    }

    /// Tag name for logs
    #[inline]
    pub fn tag_name(&self) -> &'static str {
        tag::name(self.tag)
    }
}

/// Message tags
///
/// Tags below `USER_BASE` belong to the runtime. Applications number their
/// own tags from `USER_BASE` upward.
pub mod tag {
    pub const LINK: u32 = 1;
    pub const UNLINK: u32 = 2;
    pub const ENDPOINT_EXIT: u32 = 3;
    pub const KILL: u32 = 4;

    pub const LISTEN: u32 = 10;
    pub const LISTEN_RESPONSE: u32 = 11;
    pub const ACCEPT: u32 = 12;
    pub const ACCEPT_RESPONSE: u32 = 13;
    pub const CONNECT: u32 = 14;
    pub const CONNECT_RESPONSE: u32 = 15;
    pub const CONNPAIR: u32 = 16;
    pub const CONNPAIR_RESPONSE: u32 = 17;
    pub const READ: u32 = 18;
    pub const READ_RESPONSE: u32 = 19;
    pub const WRITE: u32 = 20;
    pub const WRITE_RESPONSE: u32 = 21;
    pub const FINWRITE: u32 = 22;
    pub const FINWRITE_RESPONSE: u32 = 23;
    pub const DELETE_CONNECTION: u32 = 24;
    pub const DELETE_LISTENER: u32 = 25;
    pub const CONNECTION_CLOSED: u32 = 26;

    /// First tag available to applications
    pub const USER_BASE: u32 = 1000;

    /// Name of a runtime tag, or "USER"/"UNKNOWN"
    pub const fn name(tag: u32) -> &'static str {
        match tag {
            LINK => "LINK",
            UNLINK => "UNLINK",
            ENDPOINT_EXIT => "ENDPOINT_EXIT",
            KILL => "KILL",
            LISTEN => "LISTEN",
            LISTEN_RESPONSE => "LISTEN_RESPONSE",
            ACCEPT => "ACCEPT",
            ACCEPT_RESPONSE => "ACCEPT_RESPONSE",
            CONNECT => "CONNECT",
            CONNECT_RESPONSE => "CONNECT_RESPONSE",
            CONNPAIR => "CONNPAIR",
            CONNPAIR_RESPONSE => "CONNPAIR_RESPONSE",
            READ => "READ",
            READ_RESPONSE => "READ_RESPONSE",
            WRITE => "WRITE",
            WRITE_RESPONSE => "WRITE_RESPONSE",
            FINWRITE => "FINWRITE",
            FINWRITE_RESPONSE => "FINWRITE_RESPONSE",
            DELETE_CONNECTION => "DELETE_CONNECTION",
            DELETE_LISTENER => "DELETE_LISTENER",
            CONNECTION_CLOSED => "CONNECTION_CLOSED",
            t if t >= USER_BASE => "USER",
            _ => "UNKNOWN",
        }
    }

    /// Requests the reactor (and the manager) accept
    pub const fn is_socket_request(tag: u32) -> bool {
        matches!(
            tag,
            LISTEN
                | ACCEPT
                | CONNECT
                | CONNPAIR
                | READ
                | WRITE
                | FINWRITE
                | DELETE_CONNECTION
                | DELETE_LISTENER
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Kill;

    #[test]
    fn test_tag_names() {
        assert_eq!(tag::name(tag::WRITE), "WRITE");
        assert_eq!(tag::name(tag::CONNECTION_CLOSED), "CONNECTION_CLOSED");
        assert_eq!(tag::name(tag::USER_BASE + 7), "USER");
        assert_eq!(tag::name(999), "UNKNOWN");
    }

    #[test]
    fn test_socket_requests() {
        assert!(tag::is_socket_request(tag::LISTEN));
        assert!(tag::is_socket_request(tag::DELETE_LISTENER));
        assert!(!tag::is_socket_request(tag::LINK));
        assert!(!tag::is_socket_request(tag::READ_RESPONSE));
    }

    #[test]
    fn test_decode_checks_tag() {
        let msg = Message::new(EndpointId::NULL, EndpointId::NULL, tag::LINK, Vec::new());
        assert!(msg.decode::<Kill>().is_err());
        let msg = Message::with_payload(EndpointId::NULL, EndpointId::NULL, &Kill);
        assert_eq!(msg.tag, tag::KILL);
        assert_eq!(msg.decode::<Kill>(), Ok(Kill));
    }
}
