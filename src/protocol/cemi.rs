//! Common External Message Interface (cEMI) implementation.
//!
//! cEMI provides the standardized framing for KNX telegrams carried over
//! KNXnet/IP. This module handles parsing and building of cEMI frames:
//! `L_Data` for link-layer communication, `L_Busmon` for busmonitor
//! indications and the `M_*` device-management frames used on local
//! device management connections.
//!
//! ## L_Data frame structure
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Message Code (1 byte)                    │
//! ├──────────────────────────────────────────┤
//! │ Additional Info Length (1 byte)          │
//! ├──────────────────────────────────────────┤
//! │ Additional Info (variable)               │
//! ├──────────────────────────────────────────┤
//! │ Control Field 1 (1 byte)                 │
//! │ Control Field 2 (1 byte)                 │
//! │ Source Address (2 bytes)                 │
//! │ Destination Address (2 bytes)            │
//! │ NPDU Length (1 byte)                     │
//! │ TPCI/APCI + data (NPDU length + 1)       │
//! └──────────────────────────────────────────┘
//! ```

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::error::{KnxError, Result};
use crate::protocol::constants::{CEMIMessageCode, Priority};

/// Highest standardized additional-info type code.
///
/// Types above this value are manufacturer specific and are stripped when
/// frames are brought into canonical form for confirmation matching.
const MAX_STANDARD_ADDITIONAL_INFO: u8 = 0x07;

/// Control Field 1 of `L_Data` frames
///
/// ```text
/// Bit 7: Frame Type (0=extended, 1=standard)
/// Bit 6: Reserved
/// Bit 5: Repeat (0=repeat on error, 1=do not repeat)
/// Bit 4: System Broadcast (0=system broadcast, 1=broadcast)
/// Bit 3-2: Priority (00=system, 01=normal, 10=urgent, 11=low)
/// Bit 1: Acknowledge Request
/// Bit 0: Confirm (0=no error, 1=error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlField1 {
    raw: u8,
}

impl From<u8> for ControlField1 {
    #[inline]
    fn from(raw: u8) -> Self {
        Self { raw }
    }
}

impl From<ControlField1> for u8 {
    #[inline]
    fn from(ctrl: ControlField1) -> u8 {
        ctrl.raw
    }
}

impl ControlField1 {
    /// Get raw byte value
    #[inline]
    pub const fn raw(self) -> u8 {
        self.raw
    }

    /// Check if frame is standard (true) or extended (false)
    #[inline]
    pub const fn is_standard_frame(self) -> bool {
        (self.raw & 0x80) != 0
    }

    /// Check if this frame is flagged as a system broadcast
    #[inline]
    pub const fn is_system_broadcast(self) -> bool {
        (self.raw & 0x10) == 0
    }

    /// Get priority
    #[inline]
    pub const fn priority(self) -> Priority {
        Priority::from_u8((self.raw >> 2) & 0x03)
    }

    /// Check if the confirm error flag is set
    #[inline]
    pub const fn has_error(self) -> bool {
        (self.raw & 0x01) != 0
    }

    /// Raw value with repeat, ack-request and confirm bits cleared.
    ///
    /// Servers differ in which of these they modify on the way through, so
    /// confirmation matching compares this normalized form.
    #[inline]
    pub const fn normalized(self) -> u8 {
        self.raw & !0x23
    }

    /// Create a new Control Field 1
    pub const fn new(priority: Priority, ack_requested: bool) -> Self {
        // Standard frame, repeat allowed, domain broadcast
        let mut raw = 0x80 | 0x10;
        raw |= (priority.to_u8() & 0x03) << 2;
        if ack_requested {
            raw |= 0x02;
        }
        Self { raw }
    }
}

impl Default for ControlField1 {
    #[inline]
    fn default() -> Self {
        // Standard frame, broadcast, normal priority
        Self { raw: 0x94 }
    }
}

/// Control Field 2 of `L_Data` frames
///
/// ```text
/// Bit 7: Destination Address Type (0=individual, 1=group)
/// Bit 6-4: Hop Count (0-7)
/// Bit 3-0: Extended Frame Format (0000=standard)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlField2 {
    raw: u8,
}

impl From<u8> for ControlField2 {
    #[inline]
    fn from(raw: u8) -> Self {
        Self { raw }
    }
}

impl From<ControlField2> for u8 {
    #[inline]
    fn from(ctrl: ControlField2) -> u8 {
        ctrl.raw
    }
}

impl ControlField2 {
    /// Get raw byte value
    #[inline]
    pub const fn raw(self) -> u8 {
        self.raw
    }

    /// Check if destination is a group address (true) or individual (false)
    #[inline]
    pub const fn is_group_address(self) -> bool {
        (self.raw & 0x80) != 0
    }

    /// Get hop count (0-7)
    #[inline]
    pub const fn hop_count(self) -> u8 {
        (self.raw >> 4) & 0x07
    }

    /// Create a new Control Field 2
    pub const fn new(is_group: bool, hop_count: u8) -> Self {
        let mut raw = 0u8;
        if is_group {
            raw |= 0x80;
        }
        raw |= (hop_count & 0x07) << 4;
        Self { raw }
    }
}

impl Default for ControlField2 {
    #[inline]
    fn default() -> Self {
        // Group address, hop count 6, standard format
        Self { raw: 0xE0 }
    }
}

/// KNX destination address, individual or group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnxAddress {
    /// Individual (physical) device address
    Individual(IndividualAddress),
    /// Group address; `0/0/0` is the broadcast destination
    Group(GroupAddress),
}

impl KnxAddress {
    /// The broadcast destination (group address 0)
    pub const BROADCAST: Self = Self::Group(GroupAddress::BROADCAST);

    /// Raw 16-bit address value
    pub const fn raw(self) -> u16 {
        match self {
            Self::Individual(a) => a.raw(),
            Self::Group(a) => a.raw(),
        }
    }

    /// Whether the group-address bit of control field 2 is set
    pub const fn is_group(self) -> bool {
        matches!(self, Self::Group(_))
    }
}

/// Transport Layer Protocol Control Information
///
/// The TPCI occupies the upper bits of the first NPDU octet and, for
/// control packets, the whole octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tpci {
    /// Unnumbered data (connectionless)
    UnnumberedData,
    /// Numbered data (connection-oriented) with 4-bit sequence
    NumberedData {
        /// Sequence number (0-15)
        sequence: u8,
    },
    /// T-CONNECT request
    Connect,
    /// T-DISCONNECT request
    Disconnect,
    /// Positive acknowledgment of a numbered data packet
    Ack {
        /// Acknowledged sequence number (0-15)
        sequence: u8,
    },
    /// Negative acknowledgment of a numbered data packet
    Nack {
        /// Rejected sequence number (0-15)
        sequence: u8,
    },
}

impl Tpci {
    /// Parse the TPCI from the first NPDU octet
    pub const fn from_byte(byte: u8) -> Self {
        let sequence = (byte >> 2) & 0x0F;
        match byte >> 6 {
            0b00 => Self::UnnumberedData,
            0b01 => Self::NumberedData { sequence },
            0b10 => {
                if byte & 0x01 == 0 {
                    Self::Connect
                } else {
                    Self::Disconnect
                }
            }
            _ => {
                if byte & 0x01 == 0 {
                    Self::Ack { sequence }
                } else {
                    Self::Nack { sequence }
                }
            }
        }
    }

    /// Control byte for this TPCI; data variants return the TPCI bits to
    /// be merged with the APCI
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::UnnumberedData => 0x00,
            Self::NumberedData { sequence } => 0x40 | ((sequence & 0x0F) << 2),
            Self::Connect => 0x80,
            Self::Disconnect => 0x81,
            Self::Ack { sequence } => 0xC2 | ((sequence & 0x0F) << 2),
            Self::Nack { sequence } => 0xC3 | ((sequence & 0x0F) << 2),
        }
    }

    /// Check if this is a data packet carrying an APCI
    pub const fn is_data(self) -> bool {
        matches!(self, Self::UnnumberedData | Self::NumberedData { .. })
    }
}

/// Extract the 10-bit APCI service code from a TPDU.
///
/// Returns `None` for control packets or truncated TPDUs.
pub fn apci(tpdu: &[u8]) -> Option<u16> {
    if tpdu.len() < 2 || !Tpci::from_byte(tpdu[0]).is_data() {
        return None;
    }
    Some(((u16::from(tpdu[0]) & 0x03) << 8) | u16::from(tpdu[1]))
}

/// cEMI `L_Data` frame (owned)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CemiLData {
    /// Message code (`L_Data.req` / `.con` / `.ind`)
    pub code: CEMIMessageCode,
    /// Raw additional-info TLV bytes (without the length octet)
    pub additional_info: Vec<u8>,
    /// Control field 1
    pub ctrl1: ControlField1,
    /// Control field 2
    pub ctrl2: ControlField2,
    /// Source address
    pub source: IndividualAddress,
    /// Destination address
    pub destination: KnxAddress,
    /// TPCI/APCI and data octets (NPDU without the length byte)
    pub tpdu: Vec<u8>,
}

impl CemiLData {
    /// Minimum encoded size: code + info length + ctrl1 + ctrl2 +
    /// source + destination + NPDU length + TPCI
    pub const MIN_SIZE: usize = 9;

    /// Create a new frame with default control fields
    pub fn new(
        code: CEMIMessageCode,
        source: IndividualAddress,
        destination: KnxAddress,
        tpdu: Vec<u8>,
        priority: Priority,
    ) -> Self {
        Self {
            code,
            additional_info: Vec::new(),
            ctrl1: ControlField1::new(priority, false),
            ctrl2: ControlField2::new(destination.is_group(), 6),
            source,
            destination,
            tpdu,
        }
    }

    /// Parse an `L_Data` frame from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(KnxError::wire_format(data.len()));
        }

        let code = CEMIMessageCode::from_u8(data[0]).ok_or(KnxError::wire_format(0))?;
        let info_len = data[1] as usize;
        let fixed = 2 + info_len;
        if data.len() < fixed + 7 {
            return Err(KnxError::wire_format(1));
        }
        let additional_info = data[2..fixed].to_vec();

        let ctrl1 = ControlField1::from(data[fixed]);
        let ctrl2 = ControlField2::from(data[fixed + 1]);
        let source = IndividualAddress::from(u16::from_be_bytes([data[fixed + 2], data[fixed + 3]]));
        let dest_raw = u16::from_be_bytes([data[fixed + 4], data[fixed + 5]]);
        let destination = if ctrl2.is_group_address() {
            KnxAddress::Group(GroupAddress::from(dest_raw))
        } else {
            KnxAddress::Individual(IndividualAddress::from(dest_raw))
        };

        let npdu_len = data[fixed + 6] as usize;
        let tpdu_end = fixed + 7 + npdu_len + 1;
        if data.len() < tpdu_end {
            return Err(KnxError::wire_format(fixed + 6));
        }
        let tpdu = data[fixed + 7..tpdu_end].to_vec();

        Ok(Self { code, additional_info, ctrl1, ctrl2, source, destination, tpdu })
    }

    /// Serialize the frame to its wire format
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::MIN_SIZE + self.additional_info.len() + self.tpdu.len());
        buf.push(self.code.to_u8());
        buf.push(self.additional_info.len() as u8);
        buf.extend_from_slice(&self.additional_info);
        buf.push(self.ctrl1.raw());
        buf.push(self.ctrl2.raw());
        buf.extend_from_slice(&self.source.raw().to_be_bytes());
        buf.extend_from_slice(&self.destination.raw().to_be_bytes());
        buf.push(self.tpdu.len().saturating_sub(1) as u8);
        buf.extend_from_slice(&self.tpdu);
        buf
    }

    /// The TPCI of this frame
    pub fn tpci(&self) -> Option<Tpci> {
        self.tpdu.first().map(|&b| Tpci::from_byte(b))
    }

    /// The 10-bit APCI, if this is a data frame
    pub fn apci(&self) -> Option<u16> {
        apci(&self.tpdu)
    }

    /// Copy with additional info restricted to standardized types.
    fn with_standard_info(&self) -> Self {
        let mut stripped = Vec::with_capacity(self.additional_info.len());
        let mut i = 0;
        while i + 2 <= self.additional_info.len() {
            let type_id = self.additional_info[i];
            let len = self.additional_info[i + 1] as usize;
            let end = (i + 2 + len).min(self.additional_info.len());
            if type_id <= MAX_STANDARD_ADDITIONAL_INFO {
                stripped.extend_from_slice(&self.additional_info[i..end]);
            }
            i = end;
        }
        let mut copy = self.clone();
        copy.additional_info = stripped;
        copy
    }

    /// Check whether `con` confirms this previously sent frame.
    ///
    /// Comparison is done on a canonicalized form: the message code is
    /// ignored, control field 1 is normalized, the source is zeroed when
    /// the server assigns it, and non-standard additional info is
    /// stripped. A confirmation whose only difference is a hop count
    /// decremented by exactly one still matches.
    pub fn is_confirmation(&self, con: &Self, server_assigns_source: bool) -> bool {
        if con.code != CEMIMessageCode::LDataCon {
            return false;
        }
        let sent = self.with_standard_info();
        let con = con.with_standard_info();

        if sent.destination != con.destination
            || sent.additional_info != con.additional_info
            || sent.tpdu != con.tpdu
            || sent.ctrl1.normalized() != con.ctrl1.normalized()
        {
            return false;
        }
        if !server_assigns_source && sent.source != con.source {
            return false;
        }

        let hops_sent = sent.ctrl2.hop_count();
        let hops_con = con.ctrl2.hop_count();
        let ctrl2_rest_equal = (sent.ctrl2.raw() & !0x70) == (con.ctrl2.raw() & !0x70);
        ctrl2_rest_equal && (hops_sent == hops_con || hops_con + 1 == hops_sent)
    }
}

/// cEMI `L_Busmon.ind` frame (owned)
///
/// Carries a raw bus frame including checksum, prefixed by the usual
/// additional-info block (commonly status and timestamp info).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CemiBusmon {
    /// Raw additional-info TLV bytes
    pub additional_info: Vec<u8>,
    /// Raw frame as seen on the bus
    pub raw_frame: Vec<u8>,
}

impl CemiBusmon {
    /// Parse an `L_Busmon.ind` frame from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(KnxError::wire_format(data.len()));
        }
        if data[0] != CEMIMessageCode::LBusmonInd.to_u8() {
            return Err(KnxError::wire_format(0));
        }
        let info_len = data[1] as usize;
        if data.len() < 2 + info_len {
            return Err(KnxError::wire_format(1));
        }
        Ok(Self {
            additional_info: data[2..2 + info_len].to_vec(),
            raw_frame: data[2 + info_len..].to_vec(),
        })
    }

    /// Serialize the frame to its wire format
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.additional_info.len() + self.raw_frame.len());
        buf.push(CEMIMessageCode::LBusmonInd.to_u8());
        buf.push(self.additional_info.len() as u8);
        buf.extend_from_slice(&self.additional_info);
        buf.extend_from_slice(&self.raw_frame);
        buf
    }
}

/// cEMI device-management frame (owned)
///
/// Covers `M_PropRead`/`M_PropWrite` requests and confirmations,
/// `M_PropInfo.ind`, the function-property services and `M_Reset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CemiDevMgmt {
    /// Message code (one of the `M_*` codes)
    pub code: CEMIMessageCode,
    /// Interface object type
    pub object_type: u16,
    /// Object instance (1-based)
    pub instance: u8,
    /// Property identifier
    pub pid: u8,
    /// Number of elements (4 bit); zero signals an error confirmation
    pub elements: u8,
    /// Start index into the property array (12 bit)
    pub start_index: u16,
    /// Property data, or a single error/return code
    pub data: Vec<u8>,
}

impl CemiDevMgmt {
    /// Create a property read request
    pub fn prop_read(object_type: u16, instance: u8, pid: u8, elements: u8, start: u16) -> Self {
        Self {
            code: CEMIMessageCode::MPropReadReq,
            object_type,
            instance,
            pid,
            elements,
            start_index: start,
            data: Vec::new(),
        }
    }

    /// Create a property write request
    pub fn prop_write(object_type: u16, instance: u8, pid: u8, elements: u8, start: u16, data: Vec<u8>) -> Self {
        Self {
            code: CEMIMessageCode::MPropWriteReq,
            object_type,
            instance,
            pid,
            elements,
            start_index: start,
            data,
        }
    }

    /// Create a function-property frame (command or state read)
    pub fn func_prop(code: CEMIMessageCode, object_type: u16, instance: u8, pid: u8, data: Vec<u8>) -> Self {
        Self { code, object_type, instance, pid, elements: 0, start_index: 0, data }
    }

    /// Whether this frame layout carries elements/start-index fields
    const fn has_array_fields(code: CEMIMessageCode) -> bool {
        matches!(
            code,
            CEMIMessageCode::MPropReadReq
                | CEMIMessageCode::MPropReadCon
                | CEMIMessageCode::MPropWriteReq
                | CEMIMessageCode::MPropWriteCon
                | CEMIMessageCode::MPropInfoInd
        )
    }

    /// Parse a device-management frame from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(KnxError::wire_format(0));
        }
        let code = CEMIMessageCode::from_u8(data[0]).ok_or(KnxError::wire_format(0))?;
        if !code.is_device_mgmt() {
            return Err(KnxError::wire_format(0));
        }
        if matches!(code, CEMIMessageCode::MResetReq | CEMIMessageCode::MResetInd) {
            return Ok(Self {
                code,
                object_type: 0,
                instance: 0,
                pid: 0,
                elements: 0,
                start_index: 0,
                data: Vec::new(),
            });
        }

        if Self::has_array_fields(code) {
            if data.len() < 7 {
                return Err(KnxError::wire_format(data.len()));
            }
            let elems_start = u16::from_be_bytes([data[5], data[6]]);
            Ok(Self {
                code,
                object_type: u16::from_be_bytes([data[1], data[2]]),
                instance: data[3],
                pid: data[4],
                elements: (elems_start >> 12) as u8,
                start_index: elems_start & 0x0FFF,
                data: data[7..].to_vec(),
            })
        } else {
            if data.len() < 5 {
                return Err(KnxError::wire_format(data.len()));
            }
            Ok(Self {
                code,
                object_type: u16::from_be_bytes([data[1], data[2]]),
                instance: data[3],
                pid: data[4],
                elements: 0,
                start_index: 0,
                data: data[5..].to_vec(),
            })
        }
    }

    /// Serialize the frame to its wire format
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(7 + self.data.len());
        buf.push(self.code.to_u8());
        if matches!(self.code, CEMIMessageCode::MResetReq | CEMIMessageCode::MResetInd) {
            return buf;
        }
        buf.extend_from_slice(&self.object_type.to_be_bytes());
        buf.push(self.instance);
        buf.push(self.pid);
        if Self::has_array_fields(self.code) {
            let elems_start = (u16::from(self.elements) << 12) | (self.start_index & 0x0FFF);
            buf.extend_from_slice(&elems_start.to_be_bytes());
        }
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Check if this is an error confirmation (`elements == 0` with a
    /// single error code octet)
    pub fn is_error_response(&self) -> bool {
        self.elements == 0 && Self::has_array_fields(self.code)
    }

    /// The carried error code of an error confirmation
    pub fn error_code(&self) -> Option<u8> {
        if self.is_error_response() {
            self.data.first().copied()
        } else {
            None
        }
    }
}

/// Decoded cEMI frame of any supported message code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cemi {
    /// `L_Data.req` / `.con` / `.ind`
    LData(CemiLData),
    /// `L_Busmon.ind`
    Busmon(CemiBusmon),
    /// Device-management frames
    DevMgmt(CemiDevMgmt),
}

impl Cemi {
    /// Parse a cEMI frame, dispatching on the message code
    pub fn parse(data: &[u8]) -> Result<Self> {
        let code = data
            .first()
            .and_then(|&b| CEMIMessageCode::from_u8(b))
            .ok_or(KnxError::wire_format(0))?;
        match code {
            CEMIMessageCode::LDataReq | CEMIMessageCode::LDataInd | CEMIMessageCode::LDataCon => {
                CemiLData::parse(data).map(Self::LData)
            }
            CEMIMessageCode::LBusmonInd => CemiBusmon::parse(data).map(Self::Busmon),
            _ => CemiDevMgmt::parse(data).map(Self::DevMgmt),
        }
    }

    /// Serialize the frame to its wire format
    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            Self::LData(f) => f.to_vec(),
            Self::Busmon(f) => f.to_vec(),
            Self::DevMgmt(f) => f.to_vec(),
        }
    }

    /// The message code of the frame
    pub fn code(&self) -> CEMIMessageCode {
        match self {
            Self::LData(f) => f.code,
            Self::Busmon(_) => CEMIMessageCode::LBusmonInd,
            Self::DevMgmt(f) => f.code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ldata_ind() -> CemiLData {
        CemiLData::new(
            CEMIMessageCode::LDataInd,
            IndividualAddress::new(1, 1, 1).unwrap(),
            KnxAddress::Group(GroupAddress::new(1, 2, 3).unwrap()),
            vec![0x00, 0x81],
            Priority::Normal,
        )
    }

    #[test]
    fn test_ldata_round_trip() {
        let frame = ldata_ind();
        let bytes = frame.to_vec();
        // code, no additional info, ctrl1, ctrl2, src, dst, npdu len 1, tpdu
        assert_eq!(bytes[0], 0x29);
        assert_eq!(bytes[1], 0x00);
        assert_eq!(bytes[8], 0x01);
        let parsed = CemiLData::parse(&bytes).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_ldata_parse_group_write() {
        // L_Data.ind, no info, std frame normal prio, group dst 1/2/3,
        // source 1.1.1, GroupValue_Write with 6-bit data 1
        let data = [
            0x29, 0x00, 0x94, 0xE0, 0x11, 0x01, 0x0A, 0x03, 0x01, 0x00, 0x81,
        ];
        let frame = CemiLData::parse(&data).unwrap();
        assert_eq!(frame.code, CEMIMessageCode::LDataInd);
        assert!(frame.ctrl2.is_group_address());
        assert_eq!(frame.apci(), Some(0x081));
        assert_eq!(frame.tpdu, vec![0x00, 0x81]);
    }

    #[test]
    fn test_ldata_truncated() {
        let data = [0x29, 0x00, 0x94, 0xE0, 0x11, 0x01, 0x0A, 0x03, 0x05, 0x00];
        assert!(CemiLData::parse(&data).is_err());
    }

    #[test]
    fn test_confirmation_match() {
        let sent = CemiLData::new(
            CEMIMessageCode::LDataReq,
            IndividualAddress::from(0),
            KnxAddress::Group(GroupAddress::new(1, 2, 3).unwrap()),
            vec![0x00, 0x81],
            Priority::Normal,
        );
        let mut con = sent.clone();
        con.code = CEMIMessageCode::LDataCon;
        con.source = IndividualAddress::new(1, 1, 250).unwrap();
        assert!(sent.is_confirmation(&con, true));
        assert!(!sent.is_confirmation(&con, false));
    }

    #[test]
    fn test_confirmation_hop_count_leniency() {
        let sent = ldata_ind();
        let mut con = sent.clone();
        con.code = CEMIMessageCode::LDataCon;
        con.ctrl2 = ControlField2::new(true, 5);
        assert!(sent.is_confirmation(&con, false));

        // two hops difference no longer matches
        con.ctrl2 = ControlField2::new(true, 4);
        assert!(!sent.is_confirmation(&con, false));
    }

    #[test]
    fn test_confirmation_strips_nonstandard_info() {
        let sent = ldata_ind();
        let mut con = sent.clone();
        con.code = CEMIMessageCode::LDataCon;
        // manufacturer-specific additional info (type 0xFE)
        con.additional_info = vec![0xFE, 0x02, 0xAA, 0xBB];
        assert!(sent.is_confirmation(&con, false));
    }

    #[test]
    fn test_busmon_round_trip() {
        let frame = CemiBusmon {
            additional_info: vec![0x03, 0x01, 0x00],
            raw_frame: vec![0xBC, 0x11, 0x01, 0x0A, 0x03, 0xE1, 0x00, 0x81, 0x5A],
        };
        let bytes = frame.to_vec();
        assert_eq!(bytes[0], 0x2B);
        assert_eq!(CemiBusmon::parse(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_devmgmt_round_trip() {
        let req = CemiDevMgmt::prop_read(0, 1, 56, 1, 1);
        let bytes = req.to_vec();
        assert_eq!(bytes, [0xFC, 0x00, 0x00, 0x01, 0x38, 0x10, 0x01]);
        assert_eq!(CemiDevMgmt::parse(&bytes).unwrap(), req);
    }

    #[test]
    fn test_devmgmt_error_response() {
        // M_PropRead.con with 0 elements and error code 0x07
        let data = [0xFB, 0x00, 0x00, 0x01, 0x38, 0x00, 0x01, 0x07];
        let con = CemiDevMgmt::parse(&data).unwrap();
        assert!(con.is_error_response());
        assert_eq!(con.error_code(), Some(0x07));
    }

    #[test]
    fn test_reset_frames() {
        let reset = CemiDevMgmt {
            code: CEMIMessageCode::MResetReq,
            object_type: 0,
            instance: 0,
            pid: 0,
            elements: 0,
            start_index: 0,
            data: Vec::new(),
        };
        assert_eq!(reset.to_vec(), [0xF1]);
        assert_eq!(CemiDevMgmt::parse(&[0xF0]).unwrap().code, CEMIMessageCode::MResetInd);
    }

    #[test]
    fn test_tpci_control_bytes() {
        assert_eq!(Tpci::Connect.to_byte(), 0x80);
        assert_eq!(Tpci::Disconnect.to_byte(), 0x81);
        assert_eq!(Tpci::Ack { sequence: 3 }.to_byte(), 0xCE);
        assert_eq!(Tpci::Nack { sequence: 3 }.to_byte(), 0xCF);
        assert_eq!(Tpci::NumberedData { sequence: 2 }.to_byte(), 0x48);
        assert!(matches!(Tpci::from_byte(0x48), Tpci::NumberedData { sequence: 2 }));
        assert!(matches!(Tpci::from_byte(0x80), Tpci::Connect));
        assert!(matches!(Tpci::from_byte(0x81), Tpci::Disconnect));
        assert!(matches!(Tpci::from_byte(0xCE), Tpci::Ack { sequence: 3 }));
    }

    #[test]
    fn test_apci_extraction() {
        assert_eq!(apci(&[0x00, 0x81]), Some(0x081));
        assert_eq!(apci(&[0x03, 0x00]), Some(0x300));
        // control packet has no APCI
        assert_eq!(apci(&[0x80]), None);
    }

    #[test]
    fn test_cemi_dispatch() {
        let ld = ldata_ind().to_vec();
        assert!(matches!(Cemi::parse(&ld).unwrap(), Cemi::LData(_)));
        let dm = CemiDevMgmt::prop_read(0, 1, 56, 1, 1).to_vec();
        assert!(matches!(Cemi::parse(&dm).unwrap(), Cemi::DevMgmt(_)));
        assert!(Cemi::parse(&[0x42]).is_err());
    }
}
