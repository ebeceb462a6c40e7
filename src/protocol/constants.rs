//! KNXnet/IP protocol constants and service type identifiers.

/// KNXnet/IP protocol version 1.0
pub const KNXNETIP_VERSION_10: u8 = 0x10;

/// Standard KNXnet/IP header length (6 bytes)
pub const HEADER_SIZE_10: u8 = 0x06;

/// Standard UDP/TCP port for KNXnet/IP communication
pub const KNXNETIP_DEFAULT_PORT: u16 = 3671;

/// KNXnet/IP system setup multicast address (also used for search)
pub const SYSTEM_SETUP_MULTICAST: [u8; 4] = [224, 0, 23, 12];

/// Maximum size of a standard KNXnet/IP frame carried over UDP
pub const MAX_FRAME_SIZE: usize = 512;

// =============================================================================
// Service Type Identifiers
// =============================================================================

// Service type constants (for convenience)
/// Service type constant for CONNECT_REQUEST (0x0205)
pub const SERVICE_CONNECT_REQUEST: u16 = 0x0205;
/// Service type constant for CONNECT_RESPONSE (0x0206)
pub const SERVICE_CONNECT_RESPONSE: u16 = 0x0206;
/// Service type constant for CONNECTIONSTATE_REQUEST (0x0207)
pub const SERVICE_CONNECTIONSTATE_REQUEST: u16 = 0x0207;
/// Service type constant for CONNECTIONSTATE_RESPONSE (0x0208)
pub const SERVICE_CONNECTIONSTATE_RESPONSE: u16 = 0x0208;
/// Service type constant for DISCONNECT_REQUEST (0x0209)
pub const SERVICE_DISCONNECT_REQUEST: u16 = 0x0209;
/// Service type constant for DISCONNECT_RESPONSE (0x020A)
pub const SERVICE_DISCONNECT_RESPONSE: u16 = 0x020A;
/// Service type constant for TUNNELING_REQUEST (0x0420)
pub const SERVICE_TUNNELING_REQUEST: u16 = 0x0420;
/// Service type constant for TUNNELING_ACK (0x0421)
pub const SERVICE_TUNNELING_ACK: u16 = 0x0421;
/// Service type constant for ROUTING_INDICATION (0x0530)
pub const SERVICE_ROUTING_INDICATION: u16 = 0x0530;

/// Service type constant for the routing system broadcast (0x0950).
///
/// The code is shared with `SecureWrapper`; on the routing multicast
/// channel it carries an unencrypted system-broadcast indication, on a
/// secure session it carries a secure envelope.
pub const SERVICE_ROUTING_SYSTEM_BROADCAST: u16 = 0x0950;

/// KNXnet/IP service type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ServiceType {
    // Core services (0x02xx)
    /// `SEARCH_REQUEST` - Server discovery request
    SearchRequest = 0x0201,
    /// `SEARCH_RESPONSE` - Server discovery response
    SearchResponse = 0x0202,
    /// `DESCRIPTION_REQUEST` - Server description request
    DescriptionRequest = 0x0203,
    /// `DESCRIPTION_RESPONSE` - Server description response
    DescriptionResponse = 0x0204,
    /// `CONNECT_REQUEST` - Connection request
    ConnectRequest = 0x0205,
    /// `CONNECT_RESPONSE` - Connection response
    ConnectResponse = 0x0206,
    /// `CONNECTIONSTATE_REQUEST` - Connection state request (heartbeat)
    ConnectionstateRequest = 0x0207,
    /// `CONNECTIONSTATE_RESPONSE` - Connection state response
    ConnectionstateResponse = 0x0208,
    /// `DISCONNECT_REQUEST` - Disconnect request
    DisconnectRequest = 0x0209,
    /// `DISCONNECT_RESPONSE` - Disconnect response
    DisconnectResponse = 0x020A,
    /// `SEARCH_REQUEST_EXTENDED` - Discovery request with search parameters
    SearchRequestExtended = 0x020B,
    /// `SEARCH_RESPONSE_EXTENDED` - Discovery response to an extended search
    SearchResponseExtended = 0x020C,

    // Device Management (0x03xx)
    /// `DEVICE_CONFIGURATION_REQUEST`
    DeviceConfigurationRequest = 0x0310,
    /// `DEVICE_CONFIGURATION_ACK`
    DeviceConfigurationAck = 0x0311,

    // Tunneling (0x04xx)
    /// `TUNNELING_REQUEST` - Tunneling data request
    TunnelingRequest = 0x0420,
    /// `TUNNELING_ACK` - Tunneling acknowledgment
    TunnelingAck = 0x0421,
    /// `TUNNELING_FEATURE_GET` - Read an interface feature
    TunnelingFeatureGet = 0x0422,
    /// `TUNNELING_FEATURE_RESPONSE` - Interface feature response
    TunnelingFeatureResponse = 0x0423,
    /// `TUNNELING_FEATURE_SET` - Set an interface feature
    TunnelingFeatureSet = 0x0424,
    /// `TUNNELING_FEATURE_INFO` - Unsolicited interface feature info
    TunnelingFeatureInfo = 0x0425,

    // Routing (0x05xx)
    /// `ROUTING_INDICATION` - Routing indication (multicast)
    RoutingIndication = 0x0530,
    /// `ROUTING_LOST_MESSAGE` - Routing lost message indication
    RoutingLostMessage = 0x0531,
    /// `ROUTING_BUSY` - Routing busy indication
    RoutingBusy = 0x0532,

    // Secure services (0x09xx)
    /// `SECURE_WRAPPER` - Secure envelope; doubles as the routing system
    /// broadcast service on the multicast channel
    SecureWrapper = 0x0950,
    /// `SESSION_REQUEST` - Secure session request
    SessionRequest = 0x0951,
    /// `SESSION_RESPONSE` - Secure session response
    SessionResponse = 0x0952,
    /// `SESSION_AUTHENTICATE` - Secure session authentication
    SessionAuthenticate = 0x0953,
    /// `SESSION_STATUS` - Secure session status
    SessionStatus = 0x0954,
    /// `GROUP_SYNC` - Secure routing timer synchronization
    GroupSync = 0x0955,
}

impl ServiceType {
    /// Convert a u16 to `ServiceType`
    ///
    /// Unknown codes return `None`; the receiver loops drop such frames
    /// without further processing.
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0201 => Some(Self::SearchRequest),
            0x0202 => Some(Self::SearchResponse),
            0x0203 => Some(Self::DescriptionRequest),
            0x0204 => Some(Self::DescriptionResponse),
            0x0205 => Some(Self::ConnectRequest),
            0x0206 => Some(Self::ConnectResponse),
            0x0207 => Some(Self::ConnectionstateRequest),
            0x0208 => Some(Self::ConnectionstateResponse),
            0x0209 => Some(Self::DisconnectRequest),
            0x020A => Some(Self::DisconnectResponse),
            0x020B => Some(Self::SearchRequestExtended),
            0x020C => Some(Self::SearchResponseExtended),
            0x0310 => Some(Self::DeviceConfigurationRequest),
            0x0311 => Some(Self::DeviceConfigurationAck),
            0x0420 => Some(Self::TunnelingRequest),
            0x0421 => Some(Self::TunnelingAck),
            0x0422 => Some(Self::TunnelingFeatureGet),
            0x0423 => Some(Self::TunnelingFeatureResponse),
            0x0424 => Some(Self::TunnelingFeatureSet),
            0x0425 => Some(Self::TunnelingFeatureInfo),
            0x0530 => Some(Self::RoutingIndication),
            0x0531 => Some(Self::RoutingLostMessage),
            0x0532 => Some(Self::RoutingBusy),
            0x0950 => Some(Self::SecureWrapper),
            0x0951 => Some(Self::SessionRequest),
            0x0952 => Some(Self::SessionResponse),
            0x0953 => Some(Self::SessionAuthenticate),
            0x0954 => Some(Self::SessionStatus),
            0x0955 => Some(Self::GroupSync),
            _ => None,
        }
    }

    /// Convert `ServiceType` to u16
    pub const fn to_u16(self) -> u16 {
        self as u16
    }
}

// =============================================================================
// Connection Type Codes
// =============================================================================

/// Connection type for `DEVICE_MGMT_CONNECTION`
pub const DEVICE_MGMT_CONNECTION: u8 = 0x03;

/// Connection type for `TUNNEL_CONNECTION`
pub const TUNNEL_CONNECTION: u8 = 0x04;

/// Connection type for `OBJSVR_CONNECTION`
pub const OBJSVR_CONNECTION: u8 = 0x08;

// =============================================================================
// KNX layers for tunnel connections
// =============================================================================

/// Tunnel on the data link layer
pub const TUNNEL_LINKLAYER: u8 = 0x02;

/// Tunnel in busmonitor mode
pub const TUNNEL_BUSMONITOR: u8 = 0x80;

// =============================================================================
// Host Protocol Codes
// =============================================================================

/// IPv4 UDP protocol
pub const IPV4_UDP: u8 = 0x01;

/// IPv4 TCP protocol
pub const IPV4_TCP: u8 = 0x02;

// =============================================================================
// Error Codes
// =============================================================================

/// Error code for successful operation
pub const E_NO_ERROR: u8 = 0x00;

/// Error code for unsupported host protocol
pub const E_HOST_PROTOCOL_TYPE: u8 = 0x01;

/// Error code for unsupported protocol version
pub const E_VERSION_NOT_SUPPORTED: u8 = 0x02;

/// Error code for out-of-order sequence number
pub const E_SEQUENCE_NUMBER: u8 = 0x04;

/// Error code for connection type not supported
pub const E_CONNECTION_TYPE: u8 = 0x22;

/// Error code for connection option not supported
pub const E_CONNECTION_OPTION: u8 = 0x23;

/// Error code for no more connections available
pub const E_NO_MORE_CONNECTIONS: u8 = 0x24;

/// Error code for data connection error
pub const E_DATA_CONNECTION: u8 = 0x26;

/// Error code for KNX connection error
pub const E_KNX_CONNECTION: u8 = 0x27;

/// Error code for tunneling layer not supported
pub const E_TUNNELLING_LAYER: u8 = 0x29;

// =============================================================================
// cEMI Message Codes
// =============================================================================

/// cEMI Message Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CEMIMessageCode {
    /// `L_Data.req` - Data request
    LDataReq = 0x11,
    /// `L_Data.ind` - Data indication
    LDataInd = 0x29,
    /// `L_Data.con` - Data confirmation
    LDataCon = 0x2E,
    /// `L_Busmon.ind` - Bus monitor indication
    LBusmonInd = 0x2B,
    /// `M_PropRead.req` - Property read request (device management)
    MPropReadReq = 0xFC,
    /// `M_PropRead.con` - Property read confirmation
    MPropReadCon = 0xFB,
    /// `M_PropWrite.req` - Property write request
    MPropWriteReq = 0xF6,
    /// `M_PropWrite.con` - Property write confirmation
    MPropWriteCon = 0xF5,
    /// `M_PropInfo.ind` - Unsolicited property info
    MPropInfoInd = 0xF7,
    /// `M_FuncPropCommand.req` - Function property command
    MFuncPropCommandReq = 0xF8,
    /// `M_FuncPropStateRead.req` - Function property state read
    MFuncPropStateReadReq = 0xF9,
    /// `M_FuncProp.con` - Function property confirmation
    MFuncPropCon = 0xFA,
    /// `M_Reset.req` - Reset request
    MResetReq = 0xF1,
    /// `M_Reset.ind` - Reset indication
    MResetInd = 0xF0,
}

impl CEMIMessageCode {
    /// Convert u8 to `CEMIMessageCode`
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x11 => Some(Self::LDataReq),
            0x29 => Some(Self::LDataInd),
            0x2E => Some(Self::LDataCon),
            0x2B => Some(Self::LBusmonInd),
            0xFC => Some(Self::MPropReadReq),
            0xFB => Some(Self::MPropReadCon),
            0xF6 => Some(Self::MPropWriteReq),
            0xF5 => Some(Self::MPropWriteCon),
            0xF7 => Some(Self::MPropInfoInd),
            0xF8 => Some(Self::MFuncPropCommandReq),
            0xF9 => Some(Self::MFuncPropStateReadReq),
            0xFA => Some(Self::MFuncPropCon),
            0xF1 => Some(Self::MResetReq),
            0xF0 => Some(Self::MResetInd),
            _ => None,
        }
    }

    /// Convert `CEMIMessageCode` to u8
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a device-management message code
    pub const fn is_device_mgmt(self) -> bool {
        self.to_u8() >= 0xF0
    }
}

// =============================================================================
// KNX Priority
// =============================================================================

/// KNX message priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Priority {
    /// System priority
    System = 0b00,
    /// Normal priority (default)
    Normal = 0b01,
    /// Urgent priority
    Urgent = 0b10,
    /// Low priority
    Low = 0b11,
}

impl Priority {
    /// Convert u8 to Priority
    pub const fn from_u8(value: u8) -> Self {
        match value & 0b11 {
            0b00 => Self::System,
            0b01 => Self::Normal,
            0b10 => Self::Urgent,
            _ => Self::Low,
        }
    }

    /// Convert Priority to u8
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_round_trip() {
        for code in [
            0x0201u16, 0x0202, 0x0203, 0x0204, 0x0205, 0x0206, 0x0207, 0x0208, 0x0209, 0x020A,
            0x020B, 0x020C, 0x0310, 0x0311, 0x0420, 0x0421, 0x0422, 0x0423, 0x0424, 0x0425,
            0x0530, 0x0531, 0x0532, 0x0950, 0x0951, 0x0952, 0x0953, 0x0954, 0x0955,
        ] {
            let st = ServiceType::from_u16(code).unwrap();
            assert_eq!(st.to_u16(), code);
        }
    }

    #[test]
    fn test_unknown_service_type() {
        // Gira proprietary and other unassigned codes are not recognized
        assert!(ServiceType::from_u16(0x0801).is_none());
        assert!(ServiceType::from_u16(0xFFFF).is_none());
    }

    #[test]
    fn test_message_code_classes() {
        assert!(!CEMIMessageCode::LDataInd.is_device_mgmt());
        assert!(CEMIMessageCode::MPropReadCon.is_device_mgmt());
        assert_eq!(CEMIMessageCode::from_u8(0x2E), Some(CEMIMessageCode::LDataCon));
        assert_eq!(CEMIMessageCode::from_u8(0x42), None);
    }

    #[test]
    fn test_priority() {
        assert_eq!(Priority::from_u8(0b00), Priority::System);
        assert_eq!(Priority::from_u8(0b11), Priority::Low);
        assert_eq!(Priority::default().to_u8(), 0b01);
    }
}
