//! Binary codecs for control payloads
//!
//! Every runtime message has a payload type implementing [`Payload`]. The
//! encoding is the same whether the message stays on the node or crosses a
//! connection, so local and remote requesters speak one protocol.
//!
//! Field encoding (all integers big-endian):
//!
//! ```text
//!   EndpointId   ip:u32 port:u16 localid:u32          (10 bytes)
//!   SocketId     owner:EndpointId serial:u32          (14 bytes)
//!   string       len:u32 utf8[len]
//!   bytes        len:u32 raw[len]
//!   error?       0:u8 | 1:u8 errno:i32 message:string
//! ```

use crate::error::{SocketError, WireError, WireResult};
use crate::id::{EndpointId, SocketId};
use crate::message::tag;
use byteorder::{BigEndian, ByteOrder};
use std::net::Ipv4Addr;

/// A typed message payload
pub trait Payload: Sized {
    /// Tag carried by messages holding this payload
    const TAG: u32;

    /// Append the encoded payload to `buf`
    fn encode(&self, buf: &mut Vec<u8>);

    /// Decode from the front of `input`, advancing it
    fn decode(input: &mut &[u8]) -> WireResult<Self>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    fn from_bytes(mut data: &[u8]) -> WireResult<Self> {
        Self::decode(&mut data)
    }
}

// ============================================================================
// Field codecs
// ============================================================================

pub(crate) fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub(crate) fn put_u16(buf: &mut Vec<u8>, v: u16) {
    let mut b = [0u8; 2];
    BigEndian::write_u16(&mut b, v);
    buf.extend_from_slice(&b);
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, v);
    buf.extend_from_slice(&b);
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    let mut b = [0u8; 4];
    BigEndian::write_i32(&mut b, v);
    buf.extend_from_slice(&b);
}

fn put_ip(buf: &mut Vec<u8>, ip: Ipv4Addr) {
    put_u32(buf, u32::from(ip));
}

fn put_id(buf: &mut Vec<u8>, id: &EndpointId) {
    put_ip(buf, id.ip);
    put_u16(buf, id.port);
    put_u32(buf, id.localid);
}

fn put_sockid(buf: &mut Vec<u8>, sockid: &SocketId) {
    put_id(buf, &sockid.owner);
    put_u32(buf, sockid.serial);
}

fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    put_u32(buf, data.len() as u32);
    buf.extend_from_slice(data);
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn put_error(buf: &mut Vec<u8>, err: &Option<SocketError>) {
    match err {
        None => put_u8(buf, 0),
        Some(e) => {
            put_u8(buf, 1);
            put_i32(buf, e.errno);
            put_str(buf, &e.message);
        }
    }
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> WireResult<&'a [u8]> {
    if input.len() < n {
        return Err(WireError::Truncated { need: n, have: input.len() });
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}

pub(crate) fn get_u8(input: &mut &[u8]) -> WireResult<u8> {
    Ok(take(input, 1)?[0])
}

pub(crate) fn get_u16(input: &mut &[u8]) -> WireResult<u16> {
    Ok(BigEndian::read_u16(take(input, 2)?))
}

pub(crate) fn get_u32(input: &mut &[u8]) -> WireResult<u32> {
    Ok(BigEndian::read_u32(take(input, 4)?))
}

fn get_i32(input: &mut &[u8]) -> WireResult<i32> {
    Ok(BigEndian::read_i32(take(input, 4)?))
}

fn get_ip(input: &mut &[u8]) -> WireResult<Ipv4Addr> {
    Ok(Ipv4Addr::from(get_u32(input)?))
}

fn get_id(input: &mut &[u8]) -> WireResult<EndpointId> {
    let ip = get_ip(input)?;
    let port = get_u16(input)?;
    let localid = get_u32(input)?;
    Ok(EndpointId::new(ip, port, localid))
}

fn get_sockid(input: &mut &[u8]) -> WireResult<SocketId> {
    let owner = get_id(input)?;
    let serial = get_u32(input)?;
    Ok(SocketId::new(owner, serial))
}

fn get_bytes(input: &mut &[u8]) -> WireResult<Vec<u8>> {
    let len = get_u32(input)? as usize;
    Ok(take(input, len)?.to_vec())
}

fn get_str(input: &mut &[u8]) -> WireResult<String> {
    String::from_utf8(get_bytes(input)?).map_err(|_| WireError::BadString)
}

fn get_error(input: &mut &[u8]) -> WireResult<Option<SocketError>> {
    match get_u8(input)? {
        0 => Ok(None),
        _ => {
            let errno = get_i32(input)?;
            let message = get_str(input)?;
            Ok(Some(SocketError::new(errno, message)))
        }
    }
}

// ============================================================================
// Link / exit
// ============================================================================

/// Why an endpoint went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitReason {
    /// Entry function returned
    Normal = 0,
    /// Entry function panicked
    Panicked = 1,
    /// A link was made to an id that does not exist
    NoSuchEndpoint = 2,
    /// The connection to the endpoint's node was lost
    ConnectionLost = 3,
}

impl From<u8> for ExitReason {
    fn from(v: u8) -> Self {
        match v {
            1 => ExitReason::Panicked,
            2 => ExitReason::NoSuchEndpoint,
            3 => ExitReason::ConnectionLost,
            _ => ExitReason::Normal,
        }
    }
}

/// Request to link `source` to `target`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub target: EndpointId,
}

impl Payload for Link {
    const TAG: u32 = tag::LINK;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_id(buf, &self.target);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Link { target: get_id(input)? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unlink {
    pub target: EndpointId,
}

impl Payload for Unlink {
    const TAG: u32 = tag::UNLINK;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_id(buf, &self.target);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Unlink { target: get_id(input)? })
    }
}

/// Notification that a linked endpoint died
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointExit {
    pub dead: EndpointId,
    pub reason: ExitReason,
}

impl Payload for EndpointExit {
    const TAG: u32 = tag::ENDPOINT_EXIT;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_id(buf, &self.dead);
        put_u8(buf, self.reason as u8);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        let dead = get_id(input)?;
        let reason = ExitReason::from(get_u8(input)?);
        Ok(EndpointExit { dead, reason })
    }
}

/// Ask a worker to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kill;

impl Payload for Kill {
    const TAG: u32 = tag::KILL;
    fn encode(&self, _buf: &mut Vec<u8>) {}
    fn decode(_input: &mut &[u8]) -> WireResult<Self> {
        Ok(Kill)
    }
}

// ============================================================================
// Listeners
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Listen {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub owner: EndpointId,
    pub request_id: u32,
}

impl Payload for Listen {
    const TAG: u32 = tag::LISTEN;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_ip(buf, self.ip);
        put_u16(buf, self.port);
        put_id(buf, &self.owner);
        put_u32(buf, self.request_id);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Listen {
            ip: get_ip(input)?,
            port: get_u16(input)?,
            owner: get_id(input)?,
            request_id: get_u32(input)?,
        })
    }
}

/// Reply to `Listen`; `port` is the bound port, useful when 0 was asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenResponse {
    pub request_id: u32,
    pub sockid: SocketId,
    pub port: u16,
    pub error: Option<SocketError>,
}

impl Payload for ListenResponse {
    const TAG: u32 = tag::LISTEN_RESPONSE;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.request_id);
        put_sockid(buf, &self.sockid);
        put_u16(buf, self.port);
        put_error(buf, &self.error);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(ListenResponse {
            request_id: get_u32(input)?,
            sockid: get_sockid(input)?,
            port: get_u16(input)?,
            error: get_error(input)?,
        })
    }
}

/// Admit one inbound connection on a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accept {
    pub sockid: SocketId,
    pub request_id: u32,
}

impl Payload for Accept {
    const TAG: u32 = tag::ACCEPT;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_sockid(buf, &self.sockid);
        put_u32(buf, self.request_id);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Accept { sockid: get_sockid(input)?, request_id: get_u32(input)? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptResponse {
    pub request_id: u32,
    pub listener: SocketId,
    pub sockid: SocketId,
    pub hostname: String,
    pub port: u16,
}

impl Payload for AcceptResponse {
    const TAG: u32 = tag::ACCEPT_RESPONSE;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.request_id);
        put_sockid(buf, &self.listener);
        put_sockid(buf, &self.sockid);
        put_str(buf, &self.hostname);
        put_u16(buf, self.port);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(AcceptResponse {
            request_id: get_u32(input)?,
            listener: get_sockid(input)?,
            sockid: get_sockid(input)?,
            hostname: get_str(input)?,
            port: get_u16(input)?,
        })
    }
}

// ============================================================================
// Connections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub hostname: String,
    pub port: u16,
    pub owner: EndpointId,
    pub request_id: u32,
}

impl Payload for Connect {
    const TAG: u32 = tag::CONNECT;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_str(buf, &self.hostname);
        put_u16(buf, self.port);
        put_id(buf, &self.owner);
        put_u32(buf, self.request_id);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Connect {
            hostname: get_str(input)?,
            port: get_u16(input)?,
            owner: get_id(input)?,
            request_id: get_u32(input)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub request_id: u32,
    pub sockid: SocketId,
    pub error: Option<SocketError>,
}

impl Payload for ConnectResponse {
    const TAG: u32 = tag::CONNECT_RESPONSE;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.request_id);
        put_sockid(buf, &self.sockid);
        put_error(buf, &self.error);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(ConnectResponse {
            request_id: get_u32(input)?,
            sockid: get_sockid(input)?,
            error: get_error(input)?,
        })
    }
}

/// Create a connected pair of local streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnPair {
    pub owner: EndpointId,
    pub request_id: u32,
}

impl Payload for ConnPair {
    const TAG: u32 = tag::CONNPAIR;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_id(buf, &self.owner);
        put_u32(buf, self.request_id);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(ConnPair { owner: get_id(input)?, request_id: get_u32(input)? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnPairResponse {
    pub request_id: u32,
    pub sockids: [SocketId; 2],
    pub error: Option<SocketError>,
}

impl Payload for ConnPairResponse {
    const TAG: u32 = tag::CONNPAIR_RESPONSE;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.request_id);
        put_sockid(buf, &self.sockids[0]);
        put_sockid(buf, &self.sockids[1]);
        put_error(buf, &self.error);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(ConnPairResponse {
            request_id: get_u32(input)?,
            sockids: [get_sockid(input)?, get_sockid(input)?],
            error: get_error(input)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Read {
    pub sockid: SocketId,
    pub request_id: u32,
}

impl Payload for Read {
    const TAG: u32 = tag::READ;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_sockid(buf, &self.sockid);
        put_u32(buf, self.request_id);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Read { sockid: get_sockid(input)?, request_id: get_u32(input)? })
    }
}

/// Data read from a connection; empty `data` means end of stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub request_id: u32,
    pub sockid: SocketId,
    pub data: Vec<u8>,
}

impl ReadResponse {
    #[inline]
    pub fn is_eof(&self) -> bool {
        self.data.is_empty()
    }
}

impl Payload for ReadResponse {
    const TAG: u32 = tag::READ_RESPONSE;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.request_id);
        put_sockid(buf, &self.sockid);
        put_bytes(buf, &self.data);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(ReadResponse {
            request_id: get_u32(input)?,
            sockid: get_sockid(input)?,
            data: get_bytes(input)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub sockid: SocketId,
    pub request_id: u32,
    pub data: Vec<u8>,
}

impl Payload for Write {
    const TAG: u32 = tag::WRITE;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_sockid(buf, &self.sockid);
        put_u32(buf, self.request_id);
        put_bytes(buf, &self.data);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Write {
            sockid: get_sockid(input)?,
            request_id: get_u32(input)?,
            data: get_bytes(input)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResponse {
    pub request_id: u32,
    pub sockid: SocketId,
}

impl Payload for WriteResponse {
    const TAG: u32 = tag::WRITE_RESPONSE;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.request_id);
        put_sockid(buf, &self.sockid);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(WriteResponse { request_id: get_u32(input)?, sockid: get_sockid(input)? })
    }
}

/// Half-close the write side once buffered output has been sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinWrite {
    pub sockid: SocketId,
    pub request_id: u32,
}

impl Payload for FinWrite {
    const TAG: u32 = tag::FINWRITE;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_sockid(buf, &self.sockid);
        put_u32(buf, self.request_id);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(FinWrite { sockid: get_sockid(input)?, request_id: get_u32(input)? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinWriteResponse {
    pub request_id: u32,
    pub sockid: SocketId,
}

impl Payload for FinWriteResponse {
    const TAG: u32 = tag::FINWRITE_RESPONSE;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.request_id);
        put_sockid(buf, &self.sockid);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(FinWriteResponse { request_id: get_u32(input)?, sockid: get_sockid(input)? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteConnection {
    pub sockid: SocketId,
}

impl Payload for DeleteConnection {
    const TAG: u32 = tag::DELETE_CONNECTION;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_sockid(buf, &self.sockid);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(DeleteConnection { sockid: get_sockid(input)? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteListener {
    pub sockid: SocketId,
}

impl Payload for DeleteListener {
    const TAG: u32 = tag::DELETE_LISTENER;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_sockid(buf, &self.sockid);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(DeleteListener { sockid: get_sockid(input)? })
    }
}

/// Sent to a connection's owner when the connection reaches its end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClosed {
    pub sockid: SocketId,
    pub error: Option<SocketError>,
}

impl ConnectionClosed {
    #[inline]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl Payload for ConnectionClosed {
    const TAG: u32 = tag::CONNECTION_CLOSED;
    fn encode(&self, buf: &mut Vec<u8>) {
        put_sockid(buf, &self.sockid);
        put_error(buf, &self.error);
    }
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(ConnectionClosed { sockid: get_sockid(input)?, error: get_error(input)? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sock(serial: u32) -> SocketId {
        SocketId::new(EndpointId::new(Ipv4Addr::new(192, 168, 1, 20), 9001, 1), serial)
    }

    #[test]
    fn test_endpoint_id_is_ten_bytes() {
        let link = Link { target: EndpointId::new(Ipv4Addr::LOCALHOST, 1, 2) };
        assert_eq!(link.to_bytes().len(), 10);
        assert_eq!(
            DeleteConnection { sockid: sock(1) }.to_bytes().len(),
            14
        );
    }

    #[test]
    fn test_big_endian_layout() {
        let bytes = Link { target: EndpointId::new(Ipv4Addr::new(1, 2, 3, 4), 0x0506, 7) }.to_bytes();
        assert_eq!(bytes, vec![1, 2, 3, 4, 5, 6, 0, 0, 0, 7]);
    }

    #[test]
    fn test_connection_closed_with_error() {
        let msg = ConnectionClosed {
            sockid: sock(42),
            error: Some(SocketError::new(104, "Connection reset by peer")),
        };
        let back = ConnectionClosed::from_bytes(&msg.to_bytes()).unwrap();
        assert!(back.is_error());
        assert_eq!(back, msg);
    }

    #[test]
    fn test_connect_with_hostname() {
        let msg = Connect {
            hostname: "node-b.local".to_string(),
            port: 4100,
            owner: EndpointId::new(Ipv4Addr::LOCALHOST, 4000, 9),
            request_id: 77,
        };
        assert_eq!(Connect::from_bytes(&msg.to_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_truncated_input() {
        let bytes = Write { sockid: sock(3), request_id: 1, data: b"hello".to_vec() }.to_bytes();
        let err = Write::from_bytes(&bytes[..bytes.len() - 2]).unwrap_err();
        assert_eq!(err, WireError::Truncated { need: 5, have: 3 });
    }

    #[test]
    fn test_bad_utf8_hostname() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, &[0xff, 0xfe]);
        put_u16(&mut buf, 1);
        put_id(&mut buf, &EndpointId::NULL);
        put_u32(&mut buf, 0);
        assert_eq!(Connect::from_bytes(&buf).unwrap_err(), WireError::BadString);
    }

    #[test]
    fn test_exit_reason_unknown_is_normal() {
        assert_eq!(ExitReason::from(200), ExitReason::Normal);
        assert_eq!(ExitReason::from(3), ExitReason::ConnectionLost);
    }

    #[test]
    fn test_read_response_eof() {
        let r = ReadResponse { request_id: 1, sockid: sock(1), data: Vec::new() };
        assert!(r.is_eof());
    }
}
