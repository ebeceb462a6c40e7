//! KNXnet/IP server discovery.
//!
//! Implements the SEARCH and DESCRIPTION services to find servers on the
//! local network without hardcoded addresses.
//!
//! ## Protocol Flow
//!
//! ```text
//! Client                          Server
//!   |                                |
//!   |------- SEARCH_REQUEST -------->| (multicast 224.0.23.12)
//!   |<------ SEARCH_RESPONSE --------|
//!   |                                |
//!   |----- DESCRIPTION_REQUEST ----->| (unicast)
//!   |<---- DESCRIPTION_RESPONSE -----|
//! ```
//!
//! A search fans out over the configured local interfaces, one ephemeral
//! datagram socket per interface, and collects responses until the
//! timeout elapses or [`Discoverer::stop`] is called. Duplicate
//! responses (same local endpoint and same response) are suppressed.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{KnxError, Result};
use crate::net::stream::StreamConnection;
use crate::net::udp;
use crate::protocol::constants::{ServiceType, KNXNETIP_DEFAULT_PORT, SYSTEM_SETUP_MULTICAST};
use crate::protocol::frame::{Hpai, KnxnetIpHeader};
use crate::protocol::services::{
    DescriptionRequest, DescriptionResponse, SearchRequest, SearchResponse, Srp,
};

/// Granularity at which collection loops observe stop requests
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default wait for a description response
pub const DESCRIPTION_TIMEOUT: Duration = Duration::from_secs(10);

/// A search response together with the local endpoint that received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredServer {
    /// Local endpoint the response arrived on
    pub local_endpoint: SocketAddrV4,
    /// The server's search response
    pub response: SearchResponse,
}

/// Discovers KNXnet/IP servers via multicast or unicast search.
#[derive(Debug, Default)]
pub struct Discoverer {
    /// Local interface addresses to search on; empty means the default route
    interfaces: Vec<Ipv4Addr>,
    /// Search request parameters for the extended search
    srps: Vec<Srp>,
    stop: AtomicBool,
    responses: Mutex<Vec<DiscoveredServer>>,
}

impl Discoverer {
    /// Create a discoverer searching on the default route interface
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a discoverer searching on the given local interface addresses
    pub fn on_interfaces(interfaces: Vec<Ipv4Addr>) -> Self {
        Self { interfaces, ..Self::default() }
    }

    /// Add a search request parameter; the search then uses the extended
    /// search request in addition to the standard one.
    pub fn add_srp(&mut self, srp: Srp) {
        self.srps.push(srp);
    }

    /// Search for servers, collecting responses until `timeout`.
    ///
    /// Returns one entry per response (deduplicated) and one `Err` entry
    /// per interface whose socket failed. Collected responses are also
    /// retained, see [`Self::responses`].
    pub fn search(&self, timeout: Duration) -> Vec<Result<DiscoveredServer>> {
        self.stop.store(false, Ordering::Release);
        let interfaces: &[Ipv4Addr] = if self.interfaces.is_empty() {
            &[Ipv4Addr::UNSPECIFIED]
        } else {
            &self.interfaces
        };

        let mut results = Vec::new();
        std::thread::scope(|scope| {
            let handles: Vec<_> = interfaces
                .iter()
                .map(|&local| scope.spawn(move || self.search_on_interface(local, timeout)))
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(Ok(found)) => results.extend(found.into_iter().map(Ok)),
                    Ok(Err(e)) => results.push(Err(e)),
                    Err(_) => results.push(Err(KnxError::interrupted())),
                }
            }
        });

        // suppress duplicates, against this run and earlier collected ones
        let mut collected = self.responses.lock();
        let mut seen: HashSet<(SocketAddrV4, Vec<u8>)> = collected
            .iter()
            .map(|d| (d.local_endpoint, d.response.build()))
            .collect();
        let mut deduped = Vec::new();
        for result in results {
            match result {
                Ok(found) => {
                    if seen.insert((found.local_endpoint, found.response.build())) {
                        collected.push(found.clone());
                        deduped.push(Ok(found));
                    }
                }
                Err(e) => deduped.push(Err(e)),
            }
        }
        deduped
    }

    fn search_on_interface(&self, local: Ipv4Addr, timeout: Duration) -> Result<Vec<DiscoveredServer>> {
        let socket = udp::bind_ephemeral(local)?;
        udp::set_poll_interval(&socket, POLL_INTERVAL)?;
        let local_endpoint = match socket.local_addr()? {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => return Err(KnxError::illegal_argument("IPv4 interface")),
        };

        let multicast = SocketAddrV4::new(SYSTEM_SETUP_MULTICAST.into(), KNXNETIP_DEFAULT_PORT);
        let request = SearchRequest::new(Hpai::Udp(local_endpoint)).build();
        socket.send_to(&request, multicast)?;
        if !self.srps.is_empty() {
            let extended = SearchRequest {
                discovery_endpoint: Hpai::Udp(local_endpoint),
                srps: self.srps.clone(),
            }
            .build();
            socket.send_to(&extended, multicast)?;
        }

        let mut found = Vec::new();
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 512];
        while Instant::now() < deadline && !self.stop.load(Ordering::Acquire) {
            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            };
            match parse_search_response(&buf[..len]) {
                Ok(response) => found.push(DiscoveredServer { local_endpoint, response }),
                Err(e) => debug!("ignoring datagram from {from}: {e}"),
            }
        }
        Ok(found)
    }

    /// Send a single unicast search request to a server control endpoint.
    pub fn search_unicast(&self, server: SocketAddrV4, timeout: Duration) -> Result<SearchResponse> {
        let socket = udp::bind_ephemeral(Ipv4Addr::UNSPECIFIED)?;
        socket.set_read_timeout(Some(timeout))?;
        let local_endpoint = match socket.local_addr()? {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => return Err(KnxError::illegal_argument("IPv4 interface")),
        };
        let request = SearchRequest::new(Hpai::Udp(local_endpoint)).build();
        socket.send_to(&request, server)?;

        let mut buf = [0u8; 512];
        let (len, _) = socket.recv_from(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
                KnxError::timeout()
            } else {
                KnxError::Io(e)
            }
        })?;
        parse_search_response(&buf[..len])
    }

    /// Request the self description of a server.
    ///
    /// Fails with `Timeout` if the server does not answer within
    /// `timeout`, and with `InvalidResponse` if the reply cannot be
    /// parsed as a description response.
    pub fn description(&self, server: SocketAddrV4, timeout: Duration) -> Result<DescriptionResponse> {
        let socket = udp::bind_ephemeral(Ipv4Addr::UNSPECIFIED)?;
        socket.set_read_timeout(Some(timeout))?;
        let local_endpoint = match socket.local_addr()? {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => return Err(KnxError::illegal_argument("IPv4 interface")),
        };
        let request = DescriptionRequest { control_endpoint: Hpai::Udp(local_endpoint) }.build();
        socket.send_to(&request, server)?;

        let mut buf = [0u8; 512];
        let (len, _) = socket.recv_from(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
                KnxError::timeout()
            } else {
                KnxError::Io(e)
            }
        })?;
        parse_description_response(&buf[..len])
    }

    /// Request the self description of a server through an existing
    /// stream connection.
    pub fn description_over(
        &self,
        connection: &StreamConnection,
        timeout: Duration,
    ) -> Result<DescriptionResponse> {
        let request = DescriptionRequest { control_endpoint: Hpai::Tcp }.build();
        let frame = connection.request(&request, timeout)?;
        parse_description_response(&frame)
    }

    /// Cancel an ongoing search; collection loops finish promptly.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Snapshot of all responses collected so far
    pub fn responses(&self) -> Vec<DiscoveredServer> {
        self.responses.lock().clone()
    }

    /// Forget previously collected search responses
    pub fn clear_search_responses(&self) {
        self.responses.lock().clear();
    }
}

fn parse_search_response(frame: &[u8]) -> Result<SearchResponse> {
    let header = KnxnetIpHeader::parse(frame)?;
    match header.service() {
        Some(ServiceType::SearchResponse | ServiceType::SearchResponseExtended) => {}
        _ => return Err(KnxError::invalid_response()),
    }
    if frame.len() < header.total_length as usize {
        return Err(KnxError::invalid_response());
    }
    SearchResponse::parse(&frame[KnxnetIpHeader::SIZE..header.total_length as usize])
}

fn parse_description_response(frame: &[u8]) -> Result<DescriptionResponse> {
    let header = match KnxnetIpHeader::parse(frame) {
        Ok(h) => h,
        Err(_) => return Err(KnxError::invalid_response()),
    };
    if header.service() != Some(ServiceType::DescriptionResponse)
        || frame.len() < header.total_length as usize
    {
        warn!("unexpected reply to description request");
        return Err(KnxError::invalid_response());
    }
    DescriptionResponse::parse(&frame[KnxnetIpHeader::SIZE..header.total_length as usize])
        .map_err(|_| KnxError::invalid_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::IndividualAddress;
    use crate::protocol::services::{DeviceDib, ServiceFamiliesDib};
    use std::thread;

    fn search_response() -> SearchResponse {
        SearchResponse {
            control_endpoint: Hpai::udp(Ipv4Addr::new(127, 0, 0, 1), 3671),
            device: DeviceDib {
                knx_medium: 0x02,
                device_status: 0,
                address: IndividualAddress::new(1, 1, 0).unwrap(),
                project_installation_id: 0,
                serial_number: [1, 2, 3, 4, 5, 6],
                routing_multicast: [224, 0, 23, 12],
                mac_address: [0; 6],
                friendly_name: "test".into(),
            },
            service_families: ServiceFamiliesDib { families: vec![(2, 1), (4, 1)] },
        }
    }

    #[test]
    fn test_search_unicast() {
        let server = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let server_addr = match server.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => unreachable!(),
        };

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 512];
            let (len, from) = server.recv_from(&mut buf).unwrap();
            let request = SearchRequest::parse(&buf[6..len]).unwrap();
            assert!(request.srps.is_empty());
            server.send_to(&search_response().build(), from).unwrap();
        });

        let discoverer = Discoverer::new();
        let response = discoverer.search_unicast(server_addr, Duration::from_secs(3)).unwrap();
        assert_eq!(response, search_response());
        handle.join().unwrap();
    }

    #[test]
    fn test_description_timeout() {
        // bind a server socket that never answers
        let server = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let server_addr = match server.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => unreachable!(),
        };

        let discoverer = Discoverer::new();
        let err = discoverer.description(server_addr, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, KnxError::Timeout));
    }

    #[test]
    fn test_description_invalid_response() {
        let server = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let server_addr = match server.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => unreachable!(),
        };

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 512];
            let (_, from) = server.recv_from(&mut buf).unwrap();
            server.send_to(&[0xDE, 0xAD], from).unwrap();
        });

        let discoverer = Discoverer::new();
        let err = discoverer.description(server_addr, Duration::from_secs(3)).unwrap_err();
        assert!(matches!(err, KnxError::InvalidResponse));
        handle.join().unwrap();
    }

    #[test]
    fn test_responses_retained_until_cleared() {
        let discoverer = Discoverer::new();
        discoverer.responses.lock().push(DiscoveredServer {
            local_endpoint: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1234),
            response: search_response(),
        });
        assert_eq!(discoverer.responses().len(), 1);
        discoverer.clear_search_responses();
        assert!(discoverer.responses().is_empty());
    }
}
