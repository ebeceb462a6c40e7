//! Network endpoint types and transports for KNXnet/IP communication.
//!
//! The stack reaches servers over three transports: UDP datagrams (the
//! classic KNXnet/IP mode), TCP streams and Unix-domain sockets. The
//! [`EndpointAddress`] type names a remote endpoint independently of the
//! transport; the submodules provide the concrete socket owners.

pub mod stream;
pub mod udp;

use core::fmt;
use std::net::SocketAddrV4;
use std::path::PathBuf;

/// Address of a KNXnet/IP communication endpoint.
///
/// # Examples
///
/// ```
/// use knx_netip::net::EndpointAddress;
/// use std::net::{Ipv4Addr, SocketAddrV4};
///
/// let server = EndpointAddress::udp(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 3671));
/// assert!(!server.is_stream());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointAddress {
    /// UDP endpoint
    Udp(SocketAddrV4),
    /// TCP endpoint
    Tcp(SocketAddrV4),
    /// Unix-domain socket endpoint
    Uds(PathBuf),
}

impl EndpointAddress {
    /// Create a UDP endpoint address
    pub const fn udp(addr: SocketAddrV4) -> Self {
        Self::Udp(addr)
    }

    /// Create a TCP endpoint address
    pub const fn tcp(addr: SocketAddrV4) -> Self {
        Self::Tcp(addr)
    }

    /// Create a Unix-domain socket endpoint address
    pub fn uds(path: impl Into<PathBuf>) -> Self {
        Self::Uds(path.into())
    }

    /// Check if the endpoint uses a stream transport
    pub const fn is_stream(&self) -> bool {
        matches!(self, Self::Tcp(_) | Self::Uds(_))
    }

    /// The IP socket address, if the endpoint has one
    pub const fn socket_addr(&self) -> Option<SocketAddrV4> {
        match self {
            Self::Udp(addr) | Self::Tcp(addr) => Some(*addr),
            Self::Uds(_) => None,
        }
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp(addr) => write!(f, "udp://{addr}"),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Uds(path) => write!(f, "uds://{}", path.display()),
        }
    }
}

impl From<SocketAddrV4> for EndpointAddress {
    /// Plain socket addresses default to UDP, the classic KNXnet/IP mode
    fn from(addr: SocketAddrV4) -> Self {
        Self::Udp(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_endpoint_display() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 3671);
        assert_eq!(EndpointAddress::udp(addr).to_string(), "udp://192.168.1.10:3671");
        assert_eq!(EndpointAddress::tcp(addr).to_string(), "tcp://192.168.1.10:3671");
        assert_eq!(EndpointAddress::uds("/run/knx.sock").to_string(), "uds:///run/knx.sock");
    }

    #[test]
    fn test_endpoint_predicates() {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 3671);
        assert!(!EndpointAddress::udp(addr).is_stream());
        assert!(EndpointAddress::tcp(addr).is_stream());
        assert!(EndpointAddress::uds("/tmp/x").is_stream());
        assert_eq!(EndpointAddress::uds("/tmp/x").socket_addr(), None);
        assert_eq!(EndpointAddress::udp(addr).socket_addr(), Some(addr));
    }
}
