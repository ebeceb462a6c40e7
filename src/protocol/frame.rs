//! KNXnet/IP frame header and HPAI parsing and encoding.
//!
//! All decoding rejects protocol versions other than 1.0 before any
//! further processing, and reports malformed bytes with the offset where
//! decoding failed.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{KnxError, Result};
use crate::protocol::constants::{
    ServiceType, HEADER_SIZE_10, IPV4_TCP, IPV4_UDP, KNXNETIP_VERSION_10,
};

/// KNXnet/IP frame header (6 bytes)
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Header Len   │ Protocol Ver │  Service Type ID    │
/// │   (1 byte)   │   (1 byte)   │     (2 bytes)       │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │           Total Length (2 bytes)                   │
/// └────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnxnetIpHeader {
    /// Service type identifier
    pub service_type: u16,
    /// Total length of frame (header + body)
    pub total_length: u16,
}

impl KnxnetIpHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 6;

    /// Create a new header for a body of the given length
    pub const fn new(service_type: u16, body_length: usize) -> Self {
        Self {
            service_type,
            total_length: (Self::SIZE + body_length) as u16,
        }
    }

    /// Parse a header from a byte slice
    ///
    /// # Errors
    ///
    /// Returns `WireFormat` if the buffer is too small, the structure
    /// length is not 6, the protocol version is not 1.0, or the total
    /// length is below the header size.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(KnxError::wire_format(data.len()));
        }
        if data[0] != HEADER_SIZE_10 {
            return Err(KnxError::wire_format(0));
        }
        if data[1] != KNXNETIP_VERSION_10 {
            return Err(KnxError::wire_format(1));
        }

        let service_type = u16::from_be_bytes([data[2], data[3]]);
        let total_length = u16::from_be_bytes([data[4], data[5]]);
        if (total_length as usize) < Self::SIZE {
            return Err(KnxError::wire_format(4));
        }

        Ok(Self { service_type, total_length })
    }

    /// Service type as a known identifier, `None` for unassigned codes
    pub const fn service(&self) -> Option<ServiceType> {
        ServiceType::from_u16(self.service_type)
    }

    /// Append the header to a frame buffer
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(HEADER_SIZE_10);
        buf.push(KNXNETIP_VERSION_10);
        buf.extend_from_slice(&self.service_type.to_be_bytes());
        buf.extend_from_slice(&self.total_length.to_be_bytes());
    }

    /// Get the expected body length from the header
    pub const fn body_length(&self) -> usize {
        self.total_length as usize - Self::SIZE
    }
}

/// Assemble a complete KNXnet/IP frame from a service type and body
pub fn make_frame(service_type: u16, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(KnxnetIpHeader::SIZE + body.len());
    KnxnetIpHeader::new(service_type, body.len()).encode(&mut buf);
    buf.extend_from_slice(body);
    buf
}

/// Host Protocol Address Information (HPAI)
///
/// 8-octet endpoint descriptor inside KNXnet/IP bodies.
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Structure Len│ Host Protocol│   IP Address        │
/// │   (1 byte)   │   (1 byte)   │   (4 bytes IPv4)    │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │                Port (2 bytes)                      │
/// └────────────────────────────────────────────────────┘
/// ```
///
/// A TCP connection always announces the `Tcp` form; a NAT-aware UDP
/// connection announces `Nat`; otherwise `Udp` carries the local bound
/// address and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hpai {
    /// UDP endpoint with the local bound address
    Udp(SocketAddrV4),
    /// NAT-traversal UDP endpoint (zero address and port)
    Nat,
    /// Stream endpoint (zero address and port, protocol code TCP)
    Tcp,
}

impl Hpai {
    /// Size of the HPAI structure for IPv4
    pub const SIZE: usize = 8;

    /// Create a UDP HPAI from an address and port
    pub const fn udp(addr: Ipv4Addr, port: u16) -> Self {
        Self::Udp(SocketAddrV4::new(addr, port))
    }

    /// Parse an HPAI from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(KnxError::wire_format(data.len()));
        }
        if data[0] != Self::SIZE as u8 {
            return Err(KnxError::wire_format(0));
        }

        let addr = Ipv4Addr::new(data[2], data[3], data[4], data[5]);
        let port = u16::from_be_bytes([data[6], data[7]]);
        let zero = addr.is_unspecified() && port == 0;

        match data[1] {
            IPV4_UDP if zero => Ok(Self::Nat),
            IPV4_UDP => Ok(Self::Udp(SocketAddrV4::new(addr, port))),
            IPV4_TCP if zero => Ok(Self::Tcp),
            IPV4_TCP => Err(KnxError::wire_format(2)),
            _ => Err(KnxError::wire_format(1)),
        }
    }

    /// Append the HPAI to a frame buffer
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(Self::SIZE as u8);
        match self {
            Self::Udp(ep) => {
                buf.push(IPV4_UDP);
                buf.extend_from_slice(&ep.ip().octets());
                buf.extend_from_slice(&ep.port().to_be_bytes());
            }
            Self::Nat => {
                buf.push(IPV4_UDP);
                buf.extend_from_slice(&[0; 6]);
            }
            Self::Tcp => {
                buf.push(IPV4_TCP);
                buf.extend_from_slice(&[0; 6]);
            }
        }
    }

    /// The announced endpoint, if the HPAI carries one
    pub const fn endpoint(&self) -> Option<SocketAddrV4> {
        match self {
            Self::Udp(ep) => Some(*ep),
            Self::Nat | Self::Tcp => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_parse() {
        let data = [
            0x06, // header length
            0x10, // protocol version
            0x02, 0x01, // service type (SEARCH_REQUEST)
            0x00, 0x0E, // total length (14 bytes)
        ];

        let header = KnxnetIpHeader::parse(&data).unwrap();
        assert_eq!(header.service_type, 0x0201);
        assert_eq!(header.service(), Some(ServiceType::SearchRequest));
        assert_eq!(header.total_length, 14);
        assert_eq!(header.body_length(), 8);
    }

    #[test]
    fn test_header_rejects_version() {
        let data = [0x06, 0x20, 0x02, 0x01, 0x00, 0x0E];
        match KnxnetIpHeader::parse(&data) {
            Err(KnxError::WireFormat { offset }) => assert_eq!(offset, 1),
            other => panic!("expected wire format error, got {other:?}"),
        }
    }

    #[test]
    fn test_header_rejects_short_total_length() {
        let data = [0x06, 0x10, 0x02, 0x01, 0x00, 0x04];
        assert!(KnxnetIpHeader::parse(&data).is_err());
    }

    #[test]
    fn test_make_frame() {
        let frame = make_frame(0x0201, &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(frame.len(), 10);
        assert_eq!(frame[0], 0x06);
        assert_eq!(frame[1], 0x10);
        assert_eq!(&frame[4..6], &[0x00, 0x0A]);
        assert_eq!(&frame[6..], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_hpai_udp_round_trip() {
        let hpai = Hpai::udp(Ipv4Addr::new(192, 168, 1, 100), 3671);
        let mut buf = Vec::new();
        hpai.encode(&mut buf);
        assert_eq!(buf, [0x08, 0x01, 192, 168, 1, 100, 0x0E, 0x57]);
        assert_eq!(Hpai::parse(&buf).unwrap(), hpai);
    }

    #[test]
    fn test_hpai_nat_and_tcp() {
        let mut nat = Vec::new();
        Hpai::Nat.encode(&mut nat);
        assert_eq!(nat, [0x08, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(Hpai::parse(&nat).unwrap(), Hpai::Nat);

        let mut tcp = Vec::new();
        Hpai::Tcp.encode(&mut tcp);
        assert_eq!(tcp, [0x08, 0x02, 0, 0, 0, 0, 0, 0]);
        assert_eq!(Hpai::parse(&tcp).unwrap(), Hpai::Tcp);
    }

    #[test]
    fn test_hpai_rejects_nonzero_tcp() {
        let data = [0x08, 0x02, 192, 168, 1, 1, 0x0E, 0x57];
        assert!(Hpai::parse(&data).is_err());
    }
}
