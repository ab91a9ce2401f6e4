//! Endpoint, node and socket identifiers

use core::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Address of a node: the IP and the port of its main listener
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl NodeAddr {
    #[inline]
    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        NodeAddr { ip, port }
    }

    /// Id of the endpoint `localid` on this node
    #[inline]
    pub const fn endpoint(self, localid: u32) -> EndpointId {
        EndpointId { ip: self.ip, port: self.port, localid }
    }
}

impl From<SocketAddrV4> for NodeAddr {
    fn from(addr: SocketAddrV4) -> Self {
        NodeAddr::new(*addr.ip(), addr.port())
    }
}

impl From<NodeAddr> for SocketAddrV4 {
    fn from(addr: NodeAddr) -> Self {
        SocketAddrV4::new(addr.ip, addr.port)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl fmt::Debug for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddr({})", self)
    }
}

/// Globally unique address of an endpoint
///
/// `localid == 0` is the null address. The null id is used as "no owner"
/// in socket requests and never names a live endpoint.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub localid: u32,
}

impl EndpointId {
    /// The null address
    pub const NULL: EndpointId = EndpointId {
        ip: Ipv4Addr::UNSPECIFIED,
        port: 0,
        localid: 0,
    };

    #[inline]
    pub const fn new(ip: Ipv4Addr, port: u16, localid: u32) -> Self {
        EndpointId { ip, port, localid }
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        self.localid == 0
    }

    /// The node this endpoint lives on
    #[inline]
    pub const fn node(&self) -> NodeAddr {
        NodeAddr::new(self.ip, self.port)
    }

    /// True if the endpoint lives on `node`
    #[inline]
    pub fn is_on(&self, node: NodeAddr) -> bool {
        self.ip == node.ip && self.port == node.port
    }

    /// Return `self`, or `fallback` if `self` is null
    #[inline]
    pub fn or(self, fallback: EndpointId) -> EndpointId {
        if self.is_null() {
            fallback
        } else {
            self
        }
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        EndpointId::NULL
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.port, self.localid)
    }
}

impl fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "EndpointId(NULL)")
        } else {
            write!(f, "EndpointId({})", self)
        }
    }
}

/// Identifies a connection or listener
///
/// `owner` is always the reactor endpoint (`IO_ID`) of the node holding the
/// socket; `serial` is unique within that node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SocketId {
    pub owner: EndpointId,
    pub serial: u32,
}

impl SocketId {
    pub const NULL: SocketId = SocketId { owner: EndpointId::NULL, serial: 0 };

    #[inline]
    pub const fn new(owner: EndpointId, serial: u32) -> Self {
        SocketId { owner, serial }
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        self.serial == 0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.owner, self.serial)
    }
}

impl fmt::Debug for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SocketId({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null() {
        assert!(EndpointId::NULL.is_null());
        assert!(EndpointId::default().is_null());
        assert!(!EndpointId::new(Ipv4Addr::LOCALHOST, 9000, 3).is_null());
        assert!(SocketId::NULL.is_null());
    }

    #[test]
    fn test_or_fallback() {
        let a = EndpointId::new(Ipv4Addr::LOCALHOST, 9000, 5);
        assert_eq!(EndpointId::NULL.or(a), a);
        let b = EndpointId::new(Ipv4Addr::LOCALHOST, 9000, 6);
        assert_eq!(b.or(a), b);
    }

    #[test]
    fn test_node_membership() {
        let node = NodeAddr::new(Ipv4Addr::new(10, 0, 0, 1), 4000);
        let id = node.endpoint(7);
        assert!(id.is_on(node));
        assert!(!id.is_on(NodeAddr::new(Ipv4Addr::new(10, 0, 0, 1), 4001)));
        assert_eq!(id.node(), node);
        assert_eq!(format!("{}", id), "10.0.0.1:4000/7");
    }
}
