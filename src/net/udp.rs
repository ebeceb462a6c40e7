//! UDP socket setup for KNXnet/IP.
//!
//! Plain connections use an ephemeral socket per connection; routing
//! joins a multicast group with address reuse so several clients can
//! share a host. Socket options beyond what `std` exposes (reuse,
//! multicast interface selection) go through `socket2`.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::Result;

/// Hop limit for sent multicast datagrams, per the KNXnet/IP routing default
const MULTICAST_TTL: u32 = 16;

/// Bind an ephemeral UDP socket on the given local interface.
///
/// Used by connections and the discoverer; the OS assigns the port.
pub fn bind_ephemeral(local: Ipv4Addr) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddrV4::new(local, 0))?;
    Ok(socket)
}

/// Bind a UDP socket joined to a multicast group.
///
/// The socket is bound to the group port with address reuse, joined to
/// `group` on `interface`, and configured to see its own datagrams
/// (loopback suppression happens in the routing layer, not the kernel).
pub fn bind_multicast(group: Ipv4Addr, port: u16, interface: Ipv4Addr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.join_multicast_v4(&group, &interface)?;
    if !interface.is_unspecified() {
        socket.set_multicast_if_v4(&interface)?;
    }
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
    Ok(socket.into())
}

/// Configure a bounded receive timeout so receiver loops can observe
/// their shutdown flag.
pub fn set_poll_interval(socket: &UdpSocket, interval: Duration) -> Result<()> {
    socket.set_read_timeout(Some(interval))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_assigns_port() {
        let socket = bind_ephemeral(Ipv4Addr::LOCALHOST).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_poll_interval() {
        let socket = bind_ephemeral(Ipv4Addr::LOCALHOST).unwrap();
        set_poll_interval(&socket, Duration::from_millis(250)).unwrap();
        assert_eq!(socket.read_timeout().unwrap(), Some(Duration::from_millis(250)));
    }
}
