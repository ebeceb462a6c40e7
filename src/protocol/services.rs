//! KNXnet/IP service bodies: builders and parsers.
//!
//! Each service carried inside a KNXnet/IP frame gets a struct with a
//! `build` method producing the complete frame (header included) and a
//! `parse` method decoding the service body (without the header).
//!
//! ## Protocol Flow
//!
//! ```text
//! Client                          Server
//!   |                                |
//!   |------- CONNECT_REQUEST ------->|
//!   |<------ CONNECT_RESPONSE -------|
//!   |                                |
//!   |------ TUNNELING_REQUEST ------>|
//!   |<------ TUNNELING_ACK ----------|
//!   |                                |
//!   |--- CONNECTIONSTATE_REQUEST --->|  (every 60s)
//!   |<-- CONNECTIONSTATE_RESPONSE ---|
//!   |                                |
//!   |------ DISCONNECT_REQUEST ----->|
//!   |<----- DISCONNECT_RESPONSE -----|
//! ```

use crate::addressing::IndividualAddress;
use crate::error::{KnxError, Result};
use crate::protocol::constants::*;
use crate::protocol::frame::{make_frame, Hpai};

// =============================================================================
// Connection Request Information / Connection Response Data
// =============================================================================

/// Connection Request Information (CRI)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cri {
    /// Tunneling connection on the given KNX layer; optionally requests a
    /// specific tunneling individual address (extended CRI)
    Tunnel {
        /// KNX layer (`TUNNEL_LINKLAYER` or `TUNNEL_BUSMONITOR`)
        layer: u8,
        /// Requested tunneling address, if any
        address: Option<IndividualAddress>,
    },
    /// Local device management connection
    DeviceMgmt,
}

impl Cri {
    /// CRI for a link-layer tunnel
    pub const fn tunnel_link_layer() -> Self {
        Self::Tunnel { layer: TUNNEL_LINKLAYER, address: None }
    }

    /// CRI for a busmonitor tunnel
    pub const fn tunnel_busmonitor() -> Self {
        Self::Tunnel { layer: TUNNEL_BUSMONITOR, address: None }
    }

    /// Append the CRI to a body buffer
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Tunnel { layer, address: None } => {
                buf.extend_from_slice(&[4, TUNNEL_CONNECTION, *layer, 0x00]);
            }
            Self::Tunnel { layer, address: Some(addr) } => {
                buf.extend_from_slice(&[6, TUNNEL_CONNECTION, *layer, 0x00]);
                buf.extend_from_slice(&addr.raw().to_be_bytes());
            }
            Self::DeviceMgmt => buf.extend_from_slice(&[2, DEVICE_MGMT_CONNECTION]),
        }
    }

    /// Decode a CRI from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 || (data[0] as usize) > data.len() {
            return Err(KnxError::wire_format(0));
        }
        match data[1] {
            DEVICE_MGMT_CONNECTION => Ok(Self::DeviceMgmt),
            TUNNEL_CONNECTION if data[0] >= 4 => {
                let address = if data[0] >= 6 {
                    Some(IndividualAddress::from(u16::from_be_bytes([data[4], data[5]])))
                } else {
                    None
                };
                Ok(Self::Tunnel { layer: data[2], address })
            }
            _ => Err(KnxError::wire_format(1)),
        }
    }
}

/// Connection Response Data (CRD)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crd {
    /// Tunneling connection; carries the assigned tunneling address
    Tunnel {
        /// Individual address assigned to the tunnel
        address: IndividualAddress,
    },
    /// Local device management connection
    DeviceMgmt,
}

impl Crd {
    /// Append the CRD to a body buffer
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Tunnel { address } => {
                buf.extend_from_slice(&[4, TUNNEL_CONNECTION]);
                buf.extend_from_slice(&address.raw().to_be_bytes());
            }
            Self::DeviceMgmt => buf.extend_from_slice(&[2, DEVICE_MGMT_CONNECTION]),
        }
    }

    /// Decode a CRD from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 || (data[0] as usize) > data.len() {
            return Err(KnxError::wire_format(0));
        }
        match data[1] {
            DEVICE_MGMT_CONNECTION => Ok(Self::DeviceMgmt),
            TUNNEL_CONNECTION if data[0] >= 4 => Ok(Self::Tunnel {
                address: IndividualAddress::from(u16::from_be_bytes([data[2], data[3]])),
            }),
            _ => Err(KnxError::wire_format(1)),
        }
    }
}

// =============================================================================
// Core services
// =============================================================================

/// `CONNECT_REQUEST` service (0x0205)
#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest {
    /// Control endpoint (for connection management)
    pub control_endpoint: Hpai,
    /// Data endpoint (for tunneling data)
    pub data_endpoint: Hpai,
    /// Connection request information
    pub cri: Cri,
}

impl ConnectRequest {
    /// Create a new `CONNECT_REQUEST`
    pub const fn new(control_endpoint: Hpai, data_endpoint: Hpai, cri: Cri) -> Self {
        Self { control_endpoint, data_endpoint, cri }
    }

    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(2 * Hpai::SIZE + 6);
        self.control_endpoint.encode(&mut body);
        self.data_endpoint.encode(&mut body);
        self.cri.encode(&mut body);
        make_frame(SERVICE_CONNECT_REQUEST, &body)
    }

    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 * Hpai::SIZE + 2 {
            return Err(KnxError::wire_format(data.len()));
        }
        Ok(Self {
            control_endpoint: Hpai::parse(&data[..Hpai::SIZE])?,
            data_endpoint: Hpai::parse(&data[Hpai::SIZE..2 * Hpai::SIZE])?,
            cri: Cri::parse(&data[2 * Hpai::SIZE..])?,
        })
    }
}

/// `CONNECT_RESPONSE` service (0x0206)
#[derive(Debug, Clone, Copy)]
pub struct ConnectResponse {
    /// Communication channel ID
    pub channel_id: u8,
    /// Status code (0 = OK)
    pub status: u8,
    /// Data endpoint assigned by the server
    pub data_endpoint: Hpai,
    /// Connection response data
    pub crd: Crd,
}

impl ConnectResponse {
    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(KnxError::wire_format(data.len()));
        }
        let channel_id = data[0];
        let status = data[1];
        if status != E_NO_ERROR {
            // error responses carry no endpoint or CRD
            return Ok(Self { channel_id, status, data_endpoint: Hpai::Nat, crd: Crd::DeviceMgmt });
        }
        if data.len() < 2 + Hpai::SIZE + 2 {
            return Err(KnxError::wire_format(2));
        }
        Ok(Self {
            channel_id,
            status,
            data_endpoint: Hpai::parse(&data[2..2 + Hpai::SIZE])?,
            crd: Crd::parse(&data[2 + Hpai::SIZE..])?,
        })
    }

    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        let mut body = vec![self.channel_id, self.status];
        if self.status == E_NO_ERROR {
            self.data_endpoint.encode(&mut body);
            self.crd.encode(&mut body);
        }
        make_frame(SERVICE_CONNECT_RESPONSE, &body)
    }

    /// Check if the connection was accepted
    pub const fn is_ok(&self) -> bool {
        self.status == E_NO_ERROR
    }
}

/// `CONNECTIONSTATE_REQUEST` service (0x0207)
#[derive(Debug, Clone, Copy)]
pub struct ConnectionStateRequest {
    /// Communication channel ID
    pub channel_id: u8,
    /// Control endpoint
    pub control_endpoint: Hpai,
}

impl ConnectionStateRequest {
    /// Create a new `CONNECTIONSTATE_REQUEST`
    pub const fn new(channel_id: u8, control_endpoint: Hpai) -> Self {
        Self { channel_id, control_endpoint }
    }

    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        let mut body = vec![self.channel_id, 0x00];
        self.control_endpoint.encode(&mut body);
        make_frame(SERVICE_CONNECTIONSTATE_REQUEST, &body)
    }

    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 + Hpai::SIZE {
            return Err(KnxError::wire_format(data.len()));
        }
        Ok(Self { channel_id: data[0], control_endpoint: Hpai::parse(&data[2..])? })
    }
}

/// `CONNECTIONSTATE_RESPONSE` service (0x0208)
#[derive(Debug, Clone, Copy)]
pub struct ConnectionStateResponse {
    /// Communication channel ID
    pub channel_id: u8,
    /// Status code (0 = OK)
    pub status: u8,
}

impl ConnectionStateResponse {
    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(KnxError::wire_format(data.len()));
        }
        Ok(Self { channel_id: data[0], status: data[1] })
    }

    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        make_frame(SERVICE_CONNECTIONSTATE_RESPONSE, &[self.channel_id, self.status])
    }

    /// Check if the connection is still alive
    pub const fn is_ok(&self) -> bool {
        self.status == E_NO_ERROR
    }
}

/// `DISCONNECT_REQUEST` service (0x0209)
#[derive(Debug, Clone, Copy)]
pub struct DisconnectRequest {
    /// Communication channel ID
    pub channel_id: u8,
    /// Control endpoint
    pub control_endpoint: Hpai,
}

impl DisconnectRequest {
    /// Create a new `DISCONNECT_REQUEST`
    pub const fn new(channel_id: u8, control_endpoint: Hpai) -> Self {
        Self { channel_id, control_endpoint }
    }

    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        let mut body = vec![self.channel_id, 0x00];
        self.control_endpoint.encode(&mut body);
        make_frame(SERVICE_DISCONNECT_REQUEST, &body)
    }

    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 + Hpai::SIZE {
            return Err(KnxError::wire_format(data.len()));
        }
        Ok(Self { channel_id: data[0], control_endpoint: Hpai::parse(&data[2..])? })
    }
}

/// `DISCONNECT_RESPONSE` service (0x020A)
#[derive(Debug, Clone, Copy)]
pub struct DisconnectResponse {
    /// Communication channel ID
    pub channel_id: u8,
    /// Status code (0 = OK)
    pub status: u8,
}

impl DisconnectResponse {
    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(KnxError::wire_format(data.len()));
        }
        Ok(Self { channel_id: data[0], status: data[1] })
    }

    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        make_frame(SERVICE_DISCONNECT_RESPONSE, &[self.channel_id, self.status])
    }
}

// =============================================================================
// Data services (tunneling, device configuration)
// =============================================================================

/// Connection header prefixed to tunneling and configuration bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHeader {
    /// Communication channel ID
    pub channel_id: u8,
    /// Sequence counter
    pub sequence: u8,
    /// Status / reserved octet
    pub status: u8,
}

impl ConnectionHeader {
    /// Size of the connection header in bytes
    pub const SIZE: usize = 4;

    /// Create a new connection header
    pub const fn new(channel_id: u8, sequence: u8) -> Self {
        Self { channel_id, sequence, status: 0 }
    }

    /// Append the header to a body buffer
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[Self::SIZE as u8, self.channel_id, self.sequence, self.status]);
    }

    /// Decode from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || data[0] as usize != Self::SIZE {
            return Err(KnxError::wire_format(0));
        }
        Ok(Self { channel_id: data[1], sequence: data[2], status: data[3] })
    }
}

/// Service request carrying a cEMI frame behind a connection header.
///
/// Used for `TUNNELING_REQUEST` (0x0420) and
/// `DEVICE_CONFIGURATION_REQUEST` (0x0310), which share the same layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequest {
    /// Service type identifier of the request
    pub service_type: u16,
    /// Connection header
    pub header: ConnectionHeader,
    /// Serialized cEMI frame
    pub cemi: Vec<u8>,
}

impl DataRequest {
    /// Create a tunneling request
    pub fn tunneling(header: ConnectionHeader, cemi: Vec<u8>) -> Self {
        Self { service_type: SERVICE_TUNNELING_REQUEST, header, cemi }
    }

    /// Create a device-configuration request
    pub fn device_config(header: ConnectionHeader, cemi: Vec<u8>) -> Self {
        Self { service_type: ServiceType::DeviceConfigurationRequest.to_u16(), header, cemi }
    }

    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(ConnectionHeader::SIZE + self.cemi.len());
        self.header.encode(&mut body);
        body.extend_from_slice(&self.cemi);
        make_frame(self.service_type, &body)
    }

    /// Parse from frame body
    pub fn parse(service_type: u16, data: &[u8]) -> Result<Self> {
        let header = ConnectionHeader::parse(data)?;
        Ok(Self { service_type, header, cemi: data[ConnectionHeader::SIZE..].to_vec() })
    }
}

/// Service acknowledgment for data requests.
///
/// Used for `TUNNELING_ACK` (0x0421) and `DEVICE_CONFIGURATION_ACK`
/// (0x0311).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceAck {
    /// Service type identifier of the acknowledgment
    pub service_type: u16,
    /// Connection header; its status octet carries the result
    pub header: ConnectionHeader,
}

impl ServiceAck {
    /// Create a tunneling acknowledgment
    pub const fn tunneling(channel_id: u8, sequence: u8, status: u8) -> Self {
        Self {
            service_type: SERVICE_TUNNELING_ACK,
            header: ConnectionHeader { channel_id, sequence, status },
        }
    }

    /// Create a device-configuration acknowledgment
    pub const fn device_config(channel_id: u8, sequence: u8, status: u8) -> Self {
        Self {
            service_type: 0x0311,
            header: ConnectionHeader { channel_id, sequence, status },
        }
    }

    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(ConnectionHeader::SIZE);
        self.header.encode(&mut body);
        make_frame(self.service_type, &body)
    }

    /// Parse from frame body
    pub fn parse(service_type: u16, data: &[u8]) -> Result<Self> {
        Ok(Self { service_type, header: ConnectionHeader::parse(data)? })
    }

    /// Check if the request was accepted
    pub const fn is_ok(&self) -> bool {
        self.header.status == E_NO_ERROR
    }
}

/// Tunneling interface feature service (0x0422 .. 0x0425)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelingFeature {
    /// Service type identifier (get/set/response/info)
    pub service_type: u16,
    /// Connection header
    pub header: ConnectionHeader,
    /// Feature identifier
    pub feature_id: u8,
    /// Return code (0 on requests)
    pub return_code: u8,
    /// Feature value, if present
    pub value: Vec<u8>,
}

impl TunnelingFeature {
    /// Create a feature-get request
    pub fn get(header: ConnectionHeader, feature_id: u8) -> Self {
        Self {
            service_type: ServiceType::TunnelingFeatureGet.to_u16(),
            header,
            feature_id,
            return_code: 0,
            value: Vec::new(),
        }
    }

    /// Create a feature-set request
    pub fn set(header: ConnectionHeader, feature_id: u8, value: Vec<u8>) -> Self {
        Self {
            service_type: ServiceType::TunnelingFeatureSet.to_u16(),
            header,
            feature_id,
            return_code: 0,
            value,
        }
    }

    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(ConnectionHeader::SIZE + 2 + self.value.len());
        self.header.encode(&mut body);
        body.push(self.feature_id);
        body.push(self.return_code);
        body.extend_from_slice(&self.value);
        make_frame(self.service_type, &body)
    }

    /// Parse from frame body
    pub fn parse(service_type: u16, data: &[u8]) -> Result<Self> {
        let header = ConnectionHeader::parse(data)?;
        if data.len() < ConnectionHeader::SIZE + 2 {
            return Err(KnxError::wire_format(ConnectionHeader::SIZE));
        }
        Ok(Self {
            service_type,
            header,
            feature_id: data[ConnectionHeader::SIZE],
            return_code: data[ConnectionHeader::SIZE + 1],
            value: data[ConnectionHeader::SIZE + 2..].to_vec(),
        })
    }
}

// =============================================================================
// Routing services
// =============================================================================

/// `ROUTING_INDICATION` service (0x0530): body is the cEMI frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingIndication {
    /// Serialized cEMI frame
    pub cemi: Vec<u8>,
}

impl RoutingIndication {
    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        make_frame(SERVICE_ROUTING_INDICATION, &self.cemi)
    }

    /// Build as a routing system broadcast (service 0x0950)
    pub fn build_system_broadcast(&self) -> Vec<u8> {
        make_frame(SERVICE_ROUTING_SYSTEM_BROADCAST, &self.cemi)
    }

    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(KnxError::wire_format(0));
        }
        Ok(Self { cemi: data.to_vec() })
    }
}

/// `ROUTING_LOST_MESSAGE` service (0x0531)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingLostMessage {
    /// Router device state
    pub device_state: u8,
    /// Number of lost routing indications
    pub lost_messages: u16,
}

impl RoutingLostMessage {
    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        let body = [4, self.device_state, (self.lost_messages >> 8) as u8, self.lost_messages as u8];
        make_frame(ServiceType::RoutingLostMessage.to_u16(), &body)
    }

    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 || data[0] != 4 {
            return Err(KnxError::wire_format(0));
        }
        Ok(Self { device_state: data[1], lost_messages: u16::from_be_bytes([data[2], data[3]]) })
    }
}

/// `ROUTING_BUSY` service (0x0532)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingBusy {
    /// Router device state
    pub device_state: u8,
    /// Requested pause before further sends, in milliseconds
    pub wait_time_ms: u16,
    /// Control field selecting which routers shall pause (0 = all)
    pub control: u16,
}

impl RoutingBusy {
    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        let body = [
            6,
            self.device_state,
            (self.wait_time_ms >> 8) as u8,
            self.wait_time_ms as u8,
            (self.control >> 8) as u8,
            self.control as u8,
        ];
        make_frame(ServiceType::RoutingBusy.to_u16(), &body)
    }

    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 6 || data[0] != 6 {
            return Err(KnxError::wire_format(0));
        }
        Ok(Self {
            device_state: data[1],
            wait_time_ms: u16::from_be_bytes([data[2], data[3]]),
            control: u16::from_be_bytes([data[4], data[5]]),
        })
    }
}

// =============================================================================
// Discovery services
// =============================================================================

/// Description Information Block type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DibType {
    /// Hardware and identity information
    DeviceInfo = 0x01,
    /// Supported service families with versions
    SuppSvcFamilies = 0x02,
    /// IP configuration
    IpConfig = 0x03,
    /// Current IP configuration
    IpCurrentConfig = 0x04,
    /// KNX addresses
    KnxAddresses = 0x05,
    /// KNX IP Secure services
    SecureServiceFamilies = 0x06,
    /// Tunneling information
    TunnelingInfo = 0x07,
    /// Extended device information
    ExtendedDeviceInfo = 0x08,
    /// Manufacturer specific data
    MfrData = 0xFE,
}

/// Device information DIB (structure type 0x01, 54 octets)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDib {
    /// KNX medium code (0x02 = TP1, 0x20 = IP)
    pub knx_medium: u8,
    /// Device status (bit 0: programming mode)
    pub device_status: u8,
    /// Individual address of the server
    pub address: IndividualAddress,
    /// Project installation identifier
    pub project_installation_id: u16,
    /// KNX serial number
    pub serial_number: [u8; 6],
    /// Routing multicast address (0 if routing unsupported)
    pub routing_multicast: [u8; 4],
    /// MAC address
    pub mac_address: [u8; 6],
    /// Friendly name (ISO 8859-1, zero-terminated on the wire)
    pub friendly_name: String,
}

impl DeviceDib {
    const SIZE: usize = 54;

    /// Append the DIB to a body buffer
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(Self::SIZE as u8);
        buf.push(DibType::DeviceInfo as u8);
        buf.push(self.knx_medium);
        buf.push(self.device_status);
        buf.extend_from_slice(&self.address.raw().to_be_bytes());
        buf.extend_from_slice(&self.project_installation_id.to_be_bytes());
        buf.extend_from_slice(&self.serial_number);
        buf.extend_from_slice(&self.routing_multicast);
        buf.extend_from_slice(&self.mac_address);
        let mut name = [0u8; 30];
        for (dst, src) in name.iter_mut().zip(self.friendly_name.bytes()) {
            *dst = src;
        }
        buf.extend_from_slice(&name);
    }

    /// Decode the DIB from bytes (starting at the structure length octet)
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || data[0] as usize != Self::SIZE || data[1] != DibType::DeviceInfo as u8 {
            return Err(KnxError::wire_format(0));
        }
        let mut serial_number = [0u8; 6];
        serial_number.copy_from_slice(&data[8..14]);
        let mut routing_multicast = [0u8; 4];
        routing_multicast.copy_from_slice(&data[14..18]);
        let mut mac_address = [0u8; 6];
        mac_address.copy_from_slice(&data[18..24]);
        let name_bytes = &data[24..54];
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(30);
        let friendly_name = name_bytes[..name_len].iter().map(|&b| b as char).collect();

        Ok(Self {
            knx_medium: data[2],
            device_status: data[3],
            address: IndividualAddress::from(u16::from_be_bytes([data[4], data[5]])),
            project_installation_id: u16::from_be_bytes([data[6], data[7]]),
            serial_number,
            routing_multicast,
            mac_address,
            friendly_name,
        })
    }
}

/// Supported service families DIB (structure type 0x02)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceFamiliesDib {
    /// (family id, version) pairs
    pub families: Vec<(u8, u8)>,
}

impl ServiceFamiliesDib {
    /// Append the DIB to a body buffer
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push((2 + 2 * self.families.len()) as u8);
        buf.push(DibType::SuppSvcFamilies as u8);
        for &(family, version) in &self.families {
            buf.push(family);
            buf.push(version);
        }
    }

    /// Decode the DIB from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 || (data[0] as usize) > data.len() || data[1] != DibType::SuppSvcFamilies as u8 {
            return Err(KnxError::wire_format(0));
        }
        let len = data[0] as usize;
        let families = data[2..len].chunks_exact(2).map(|c| (c[0], c[1])).collect();
        Ok(Self { families })
    }

    /// Version of the given service family, if supported
    pub fn version(&self, family: u8) -> Option<u8> {
        self.families.iter().find(|&&(f, _)| f == family).map(|&(_, v)| v)
    }
}

/// Search Request Parameter block for the extended search request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Srp {
    /// SRP type code
    pub srp_type: u8,
    /// Mandatory flag; servers not satisfying a mandatory SRP stay silent
    pub mandatory: bool,
    /// Type-specific payload
    pub data: Vec<u8>,
}

impl Srp {
    /// SRP type: select only servers in programming mode
    pub const SELECT_BY_PROGRAMMING_MODE: u8 = 0x01;
    /// SRP type: select by MAC address
    pub const SELECT_BY_MAC: u8 = 0x02;
    /// SRP type: select by service family
    pub const SELECT_BY_SERVICE: u8 = 0x03;
    /// SRP type: request specific DIBs in the response
    pub const REQUEST_DIBS: u8 = 0x04;

    /// Append the SRP to a body buffer
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push((2 + self.data.len()) as u8);
        buf.push(self.srp_type | if self.mandatory { 0x80 } else { 0 });
        buf.extend_from_slice(&self.data);
    }

    /// Decode an SRP from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 || (data[0] as usize) > data.len() || data[0] < 2 {
            return Err(KnxError::wire_format(0));
        }
        Ok(Self {
            srp_type: data[1] & 0x7F,
            mandatory: data[1] & 0x80 != 0,
            data: data[2..data[0] as usize].to_vec(),
        })
    }
}

/// `SEARCH_REQUEST` (0x0201) and `SEARCH_REQUEST_EXTENDED` (0x020B)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Discovery endpoint the responses shall be sent to
    pub discovery_endpoint: Hpai,
    /// Search request parameters; non-empty only for the extended request
    pub srps: Vec<Srp>,
}

impl SearchRequest {
    /// Create a standard search request
    pub fn new(discovery_endpoint: Hpai) -> Self {
        Self { discovery_endpoint, srps: Vec::new() }
    }

    /// Build the complete frame; uses the extended service when SRPs are present
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(Hpai::SIZE);
        self.discovery_endpoint.encode(&mut body);
        if self.srps.is_empty() {
            make_frame(ServiceType::SearchRequest.to_u16(), &body)
        } else {
            for srp in &self.srps {
                srp.encode(&mut body);
            }
            make_frame(ServiceType::SearchRequestExtended.to_u16(), &body)
        }
    }

    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        let discovery_endpoint = Hpai::parse(data)?;
        let mut srps = Vec::new();
        let mut offset = Hpai::SIZE;
        while offset < data.len() {
            let srp = Srp::parse(&data[offset..])?;
            offset += 2 + srp.data.len();
            srps.push(srp);
        }
        Ok(Self { discovery_endpoint, srps })
    }
}

/// `SEARCH_RESPONSE` (0x0202/0x020C) and `DESCRIPTION_RESPONSE` (0x0204)
/// share the DIB layout; the search response is prefixed by the server's
/// control endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    /// Control endpoint of the responding server
    pub control_endpoint: Hpai,
    /// Device hardware DIB
    pub device: DeviceDib,
    /// Supported service families
    pub service_families: ServiceFamiliesDib,
}

impl SearchResponse {
    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(Hpai::SIZE + 64);
        self.control_endpoint.encode(&mut body);
        self.device.encode(&mut body);
        self.service_families.encode(&mut body);
        make_frame(ServiceType::SearchResponse.to_u16(), &body)
    }

    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        let control_endpoint = Hpai::parse(data)?;
        let (device, service_families) = parse_dibs(&data[Hpai::SIZE..])?;
        Ok(Self { control_endpoint, device, service_families })
    }
}

/// `DESCRIPTION_REQUEST` service (0x0203)
#[derive(Debug, Clone, Copy)]
pub struct DescriptionRequest {
    /// Control endpoint of the client
    pub control_endpoint: Hpai,
}

impl DescriptionRequest {
    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(Hpai::SIZE);
        self.control_endpoint.encode(&mut body);
        make_frame(ServiceType::DescriptionRequest.to_u16(), &body)
    }

    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(Self { control_endpoint: Hpai::parse(data)? })
    }
}

/// `DESCRIPTION_RESPONSE` service (0x0204)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionResponse {
    /// Device hardware DIB
    pub device: DeviceDib,
    /// Supported service families
    pub service_families: ServiceFamiliesDib,
}

impl DescriptionResponse {
    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64);
        self.device.encode(&mut body);
        self.service_families.encode(&mut body);
        make_frame(ServiceType::DescriptionResponse.to_u16(), &body)
    }

    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (device, service_families) = parse_dibs(data)?;
        Ok(Self { device, service_families })
    }
}

/// Walk a DIB sequence, extracting device info and service families.
///
/// Unknown DIB types are skipped.
fn parse_dibs(data: &[u8]) -> Result<(DeviceDib, ServiceFamiliesDib)> {
    let mut device = None;
    let mut families = ServiceFamiliesDib::default();
    let mut offset = 0;
    while offset + 2 <= data.len() {
        let len = data[offset] as usize;
        if len < 2 || offset + len > data.len() {
            return Err(KnxError::wire_format(offset));
        }
        match data[offset + 1] {
            t if t == DibType::DeviceInfo as u8 => {
                device = Some(DeviceDib::parse(&data[offset..offset + len])?);
            }
            t if t == DibType::SuppSvcFamilies as u8 => {
                families = ServiceFamiliesDib::parse(&data[offset..offset + len])?;
            }
            _ => {}
        }
        offset += len;
    }
    let device = device.ok_or(KnxError::wire_format(0))?;
    Ok((device, families))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn local_hpai() -> Hpai {
        Hpai::udp(Ipv4Addr::new(192, 168, 1, 100), 3671)
    }

    fn device_dib() -> DeviceDib {
        DeviceDib {
            knx_medium: 0x02,
            device_status: 0x00,
            address: IndividualAddress::new(1, 1, 0).unwrap(),
            project_installation_id: 0,
            serial_number: [0, 1, 2, 3, 4, 5],
            routing_multicast: [224, 0, 23, 12],
            mac_address: [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
            friendly_name: "test server".into(),
        }
    }

    #[test]
    fn test_connect_request_round_trip() {
        let req = ConnectRequest::new(local_hpai(), local_hpai(), Cri::tunnel_link_layer());
        let frame = req.build();
        assert_eq!(frame.len(), 26);
        assert_eq!(&frame[2..4], &[0x02, 0x05]);
        assert_eq!(&frame[4..6], &[0x00, 0x1A]);

        let parsed = ConnectRequest::parse(&frame[6..]).unwrap();
        assert_eq!(parsed.cri, Cri::tunnel_link_layer());
        assert_eq!(parsed.control_endpoint, local_hpai());
    }

    #[test]
    fn test_extended_cri() {
        let addr = IndividualAddress::new(1, 1, 240).unwrap();
        let cri = Cri::Tunnel { layer: TUNNEL_LINKLAYER, address: Some(addr) };
        let mut buf = Vec::new();
        cri.encode(&mut buf);
        assert_eq!(buf, [6, 0x04, 0x02, 0x00, 0x11, 0xF0]);
        assert_eq!(Cri::parse(&buf).unwrap(), cri);
    }

    #[test]
    fn test_connect_response_round_trip() {
        let res = ConnectResponse {
            channel_id: 21,
            status: E_NO_ERROR,
            data_endpoint: local_hpai(),
            crd: Crd::Tunnel { address: IndividualAddress::new(1, 1, 250).unwrap() },
        };
        let frame = res.build();
        let parsed = ConnectResponse::parse(&frame[6..]).unwrap();
        assert_eq!(parsed.channel_id, 21);
        assert!(parsed.is_ok());
        assert_eq!(parsed.crd, res.crd);
    }

    #[test]
    fn test_connect_response_error() {
        let parsed = ConnectResponse::parse(&[0x00, E_NO_MORE_CONNECTIONS]).unwrap();
        assert!(!parsed.is_ok());
        assert_eq!(parsed.status, E_NO_MORE_CONNECTIONS);
    }

    #[test]
    fn test_connectionstate_round_trip() {
        let req = ConnectionStateRequest::new(7, local_hpai());
        let frame = req.build();
        assert_eq!(frame.len(), 16);
        let parsed = ConnectionStateRequest::parse(&frame[6..]).unwrap();
        assert_eq!(parsed.channel_id, 7);

        let res = ConnectionStateResponse { channel_id: 7, status: 0 };
        let frame = res.build();
        assert!(ConnectionStateResponse::parse(&frame[6..]).unwrap().is_ok());
    }

    #[test]
    fn test_disconnect_round_trip() {
        let req = DisconnectRequest::new(7, local_hpai());
        let frame = req.build();
        let parsed = DisconnectRequest::parse(&frame[6..]).unwrap();
        assert_eq!(parsed.channel_id, 7);

        let res = DisconnectResponse { channel_id: 7, status: 0 };
        let frame = res.build();
        assert_eq!(DisconnectResponse::parse(&frame[6..]).unwrap().channel_id, 7);
    }

    #[test]
    fn test_data_request_round_trip() {
        let cemi = vec![0x11, 0x00, 0xBC, 0xE0, 0x00, 0x00, 0x0A, 0x03, 0x01, 0x00, 0x81];
        let req = DataRequest::tunneling(ConnectionHeader::new(21, 3), cemi.clone());
        let frame = req.build();
        assert_eq!(&frame[2..4], &[0x04, 0x20]);
        let parsed = DataRequest::parse(SERVICE_TUNNELING_REQUEST, &frame[6..]).unwrap();
        assert_eq!(parsed.header.sequence, 3);
        assert_eq!(parsed.cemi, cemi);
    }

    #[test]
    fn test_service_ack() {
        let ack = ServiceAck::tunneling(21, 3, E_NO_ERROR);
        let frame = ack.build();
        assert_eq!(frame.len(), 10);
        let parsed = ServiceAck::parse(SERVICE_TUNNELING_ACK, &frame[6..]).unwrap();
        assert!(parsed.is_ok());
        assert_eq!(parsed.header.sequence, 3);
    }

    #[test]
    fn test_tunneling_feature_round_trip() {
        let feat = TunnelingFeature::set(ConnectionHeader::new(5, 0), 8, vec![0x01]);
        let frame = feat.build();
        let parsed = TunnelingFeature::parse(0x0424, &frame[6..]).unwrap();
        assert_eq!(parsed.feature_id, 8);
        assert_eq!(parsed.value, vec![0x01]);
    }

    #[test]
    fn test_routing_busy_round_trip() {
        let busy = RoutingBusy { device_state: 0, wait_time_ms: 100, control: 0 };
        let frame = busy.build();
        assert_eq!(frame.len(), 12);
        assert_eq!(RoutingBusy::parse(&frame[6..]).unwrap(), busy);
    }

    #[test]
    fn test_routing_lost_round_trip() {
        let lost = RoutingLostMessage { device_state: 1, lost_messages: 17 };
        let frame = lost.build();
        assert_eq!(RoutingLostMessage::parse(&frame[6..]).unwrap(), lost);
    }

    #[test]
    fn test_search_request_standard() {
        let req = SearchRequest::new(local_hpai());
        let frame = req.build();
        assert_eq!(&frame[2..4], &[0x02, 0x01]);
        assert_eq!(frame.len(), 14);
        assert_eq!(SearchRequest::parse(&frame[6..]).unwrap(), req);
    }

    #[test]
    fn test_search_request_extended() {
        let req = SearchRequest {
            discovery_endpoint: local_hpai(),
            srps: vec![Srp {
                srp_type: Srp::REQUEST_DIBS,
                mandatory: false,
                data: vec![DibType::DeviceInfo as u8, DibType::SuppSvcFamilies as u8],
            }],
        };
        let frame = req.build();
        assert_eq!(&frame[2..4], &[0x02, 0x0B]);
        assert_eq!(SearchRequest::parse(&frame[6..]).unwrap(), req);
    }

    #[test]
    fn test_search_response_round_trip() {
        let res = SearchResponse {
            control_endpoint: local_hpai(),
            device: device_dib(),
            service_families: ServiceFamiliesDib { families: vec![(0x02, 1), (0x04, 2)] },
        };
        let frame = res.build();
        let parsed = SearchResponse::parse(&frame[6..]).unwrap();
        assert_eq!(parsed, res);
        assert_eq!(parsed.service_families.version(0x04), Some(2));
        assert_eq!(parsed.device.friendly_name, "test server");
    }

    #[test]
    fn test_description_round_trip() {
        let res = DescriptionResponse {
            device: device_dib(),
            service_families: ServiceFamiliesDib { families: vec![(0x02, 1)] },
        };
        let frame = res.build();
        assert_eq!(DescriptionResponse::parse(&frame[6..]).unwrap(), res);

        let req = DescriptionRequest { control_endpoint: Hpai::Nat };
        let frame = req.build();
        assert_eq!(DescriptionRequest::parse(&frame[6..]).unwrap().control_endpoint, Hpai::Nat);
    }

    #[test]
    fn test_dib_walk_skips_unknown() {
        let mut body = Vec::new();
        device_dib().encode(&mut body);
        // unknown DIB type 0xFE
        body.extend_from_slice(&[4, 0xFE, 0xAA, 0xBB]);
        let mut families = Vec::new();
        ServiceFamiliesDib { families: vec![(0x02, 1)] }.encode(&mut families);
        body.extend_from_slice(&families);

        let (device, fams) = parse_dibs(&body).unwrap();
        assert_eq!(device, device_dib());
        assert_eq!(fams.version(0x02), Some(1));
    }
}
