//! KNX IP Secure service bodies (0x0950 .. 0x0955).
//!
//! This module covers the wire format only; key agreement, MAC
//! computation and payload encryption live in [`crate::secure`].
//!
//! ## Secure wrapper layout
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ Session ID (2 bytes)                       │
//! │ Sequence Information (6 bytes)             │
//! │ KNX Serial Number (6 bytes)                │
//! │ Message Tag (2 bytes)                      │
//! │ Encrypted KNXnet/IP frame (variable)       │
//! │ Message Authentication Code (16 bytes)     │
//! └────────────────────────────────────────────┘
//! ```

use crate::error::{KnxError, Result};
use crate::protocol::constants::ServiceType;
use crate::protocol::frame::{make_frame, Hpai};

/// Length of the X25519 public value on the wire
pub const KEY_LENGTH: usize = 32;

/// Length of the message authentication code
pub const MAC_LENGTH: usize = 16;

/// Encode a 48-bit value big-endian
pub fn encode_u48(value: u64) -> [u8; 6] {
    let b = value.to_be_bytes();
    [b[2], b[3], b[4], b[5], b[6], b[7]]
}

/// Decode a big-endian 48-bit value
pub fn decode_u48(data: &[u8]) -> u64 {
    u64::from_be_bytes([0, 0, data[0], data[1], data[2], data[3], data[4], data[5]])
}

/// `SESSION_REQUEST` service (0x0951)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    /// Control endpoint; `Tcp` for stream transports
    pub control_endpoint: Hpai,
    /// Client ECDH public value
    pub public_key: [u8; KEY_LENGTH],
}

impl SessionRequest {
    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(Hpai::SIZE + KEY_LENGTH);
        self.control_endpoint.encode(&mut body);
        body.extend_from_slice(&self.public_key);
        make_frame(ServiceType::SessionRequest.to_u16(), &body)
    }

    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Hpai::SIZE + KEY_LENGTH {
            return Err(KnxError::wire_format(data.len()));
        }
        let control_endpoint = Hpai::parse(data)?;
        let mut public_key = [0u8; KEY_LENGTH];
        public_key.copy_from_slice(&data[Hpai::SIZE..Hpai::SIZE + KEY_LENGTH]);
        Ok(Self { control_endpoint, public_key })
    }
}

/// `SESSION_RESPONSE` service (0x0952)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResponse {
    /// Assigned session identifier; zero is reserved
    pub session_id: u16,
    /// Server ECDH public value
    pub public_key: [u8; KEY_LENGTH],
    /// Authentication code over the handshake values
    pub mac: [u8; MAC_LENGTH],
}

impl SessionResponse {
    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(2 + KEY_LENGTH + MAC_LENGTH);
        body.extend_from_slice(&self.session_id.to_be_bytes());
        body.extend_from_slice(&self.public_key);
        body.extend_from_slice(&self.mac);
        make_frame(ServiceType::SessionResponse.to_u16(), &body)
    }

    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 + KEY_LENGTH + MAC_LENGTH {
            return Err(KnxError::wire_format(data.len()));
        }
        let session_id = u16::from_be_bytes([data[0], data[1]]);
        let mut public_key = [0u8; KEY_LENGTH];
        public_key.copy_from_slice(&data[2..2 + KEY_LENGTH]);
        let mut mac = [0u8; MAC_LENGTH];
        mac.copy_from_slice(&data[2 + KEY_LENGTH..2 + KEY_LENGTH + MAC_LENGTH]);
        Ok(Self { session_id, public_key, mac })
    }
}

/// `SESSION_AUTHENTICATE` service (0x0953)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAuthenticate {
    /// Authenticating user (1..=127)
    pub user_id: u8,
    /// Authentication code computed with the user key
    pub mac: [u8; MAC_LENGTH],
}

impl SessionAuthenticate {
    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(2 + MAC_LENGTH);
        body.push(0x00);
        body.push(self.user_id);
        body.extend_from_slice(&self.mac);
        make_frame(ServiceType::SessionAuthenticate.to_u16(), &body)
    }

    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 + MAC_LENGTH {
            return Err(KnxError::wire_format(data.len()));
        }
        let mut mac = [0u8; MAC_LENGTH];
        mac.copy_from_slice(&data[2..2 + MAC_LENGTH]);
        Ok(Self { user_id: data[1], mac })
    }
}

/// Session status codes carried in `SESSION_STATUS`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatusCode {
    /// Authentication succeeded
    AuthSuccess = 0,
    /// Authentication failed
    AuthFailed = 1,
    /// Session exists but is not authenticated
    Unauthenticated = 2,
    /// Session timed out
    Timeout = 3,
    /// Keep-alive for an idle session
    KeepAlive = 4,
    /// Session is being closed
    Close = 5,
}

impl SessionStatusCode {
    /// Convert u8 to a status code
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::AuthSuccess),
            1 => Some(Self::AuthFailed),
            2 => Some(Self::Unauthenticated),
            3 => Some(Self::Timeout),
            4 => Some(Self::KeepAlive),
            5 => Some(Self::Close),
            _ => None,
        }
    }
}

/// `SESSION_STATUS` service (0x0954)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    /// Status code
    pub status: SessionStatusCode,
}

impl SessionStatus {
    /// Create a new session status
    pub const fn new(status: SessionStatusCode) -> Self {
        Self { status }
    }

    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        make_frame(ServiceType::SessionStatus.to_u16(), &[self.status as u8, 0x00])
    }

    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(KnxError::wire_format(0));
        }
        let status = SessionStatusCode::from_u8(data[0]).ok_or(KnxError::wire_format(0))?;
        Ok(Self { status })
    }
}

/// `SECURE_WRAPPER` service (0x0950)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureWrapper {
    /// Session the envelope belongs to; zero on the multicast channel
    pub session_id: u16,
    /// Sequence information: monotonic counter (sessions) or millisecond
    /// timestamp (secure routing), 48 bits
    pub sequence: u64,
    /// KNX serial number of the sender
    pub serial: [u8; 6],
    /// Message tag; zero for normal session traffic
    pub tag: u16,
    /// Encrypted KNXnet/IP frame
    pub ciphertext: Vec<u8>,
    /// Authentication code
    pub mac: [u8; MAC_LENGTH],
}

impl SecureWrapper {
    /// Fixed part of the body: session id, sequence, serial, tag, MAC
    pub const FIXED_SIZE: usize = 2 + 6 + 6 + 2 + MAC_LENGTH;

    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(Self::FIXED_SIZE + self.ciphertext.len());
        body.extend_from_slice(&self.session_id.to_be_bytes());
        body.extend_from_slice(&encode_u48(self.sequence));
        body.extend_from_slice(&self.serial);
        body.extend_from_slice(&self.tag.to_be_bytes());
        body.extend_from_slice(&self.ciphertext);
        body.extend_from_slice(&self.mac);
        make_frame(ServiceType::SecureWrapper.to_u16(), &body)
    }

    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::FIXED_SIZE {
            return Err(KnxError::wire_format(data.len()));
        }
        let mut serial = [0u8; 6];
        serial.copy_from_slice(&data[8..14]);
        let mut mac = [0u8; MAC_LENGTH];
        mac.copy_from_slice(&data[data.len() - MAC_LENGTH..]);
        Ok(Self {
            session_id: u16::from_be_bytes([data[0], data[1]]),
            sequence: decode_u48(&data[2..8]),
            serial,
            tag: u16::from_be_bytes([data[14], data[15]]),
            ciphertext: data[16..data.len() - MAC_LENGTH].to_vec(),
            mac,
        })
    }
}

/// `GROUP_SYNC` service (0x0955), fixed total length 0x24
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSync {
    /// Sender timer value in milliseconds (48 bits)
    pub timestamp: u64,
    /// KNX serial number of the sender
    pub serial: [u8; 6],
    /// Message tag correlating sync responses to our own sync
    pub tag: u16,
    /// Authentication code
    pub mac: [u8; MAC_LENGTH],
}

impl GroupSync {
    /// Body size: timestamp, serial, tag, MAC
    pub const SIZE: usize = 6 + 6 + 2 + MAC_LENGTH;

    /// Build the complete frame
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(Self::SIZE);
        body.extend_from_slice(&encode_u48(self.timestamp));
        body.extend_from_slice(&self.serial);
        body.extend_from_slice(&self.tag.to_be_bytes());
        body.extend_from_slice(&self.mac);
        make_frame(ServiceType::GroupSync.to_u16(), &body)
    }

    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(KnxError::wire_format(data.len()));
        }
        let mut serial = [0u8; 6];
        serial.copy_from_slice(&data[6..12]);
        let mut mac = [0u8; MAC_LENGTH];
        mac.copy_from_slice(&data[14..14 + MAC_LENGTH]);
        Ok(Self {
            timestamp: decode_u48(&data[..6]),
            serial,
            tag: u16::from_be_bytes([data[12], data[13]]),
            mac,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u48_round_trip() {
        let value = 0x0000_1234_5678_9ABC;
        assert_eq!(decode_u48(&encode_u48(value)), value);
        assert_eq!(encode_u48(1), [0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_session_request_round_trip() {
        let req = SessionRequest { control_endpoint: Hpai::Tcp, public_key: [0x42; 32] };
        let frame = req.build();
        assert_eq!(&frame[2..4], &[0x09, 0x51]);
        // header + HPAI + key
        assert_eq!(frame.len(), 6 + 8 + 32);
        assert_eq!(SessionRequest::parse(&frame[6..]).unwrap(), req);
    }

    #[test]
    fn test_session_response_round_trip() {
        let res = SessionResponse { session_id: 1, public_key: [0x24; 32], mac: [0xAB; 16] };
        let frame = res.build();
        assert_eq!(frame.len(), 6 + 2 + 32 + 16);
        assert_eq!(SessionResponse::parse(&frame[6..]).unwrap(), res);
    }

    #[test]
    fn test_session_authenticate_round_trip() {
        let auth = SessionAuthenticate { user_id: 2, mac: [0x11; 16] };
        let frame = auth.build();
        assert_eq!(frame[7], 2);
        assert_eq!(SessionAuthenticate::parse(&frame[6..]).unwrap(), auth);
    }

    #[test]
    fn test_session_status_codes() {
        for (code, value) in [
            (SessionStatusCode::AuthSuccess, 0u8),
            (SessionStatusCode::KeepAlive, 4),
            (SessionStatusCode::Close, 5),
        ] {
            let frame = SessionStatus::new(code).build();
            assert_eq!(frame[6], value);
            assert_eq!(SessionStatus::parse(&frame[6..]).unwrap().status, code);
        }
        assert!(SessionStatus::parse(&[0x17, 0x00]).is_err());
    }

    #[test]
    fn test_secure_wrapper_round_trip() {
        let wrapper = SecureWrapper {
            session_id: 1,
            sequence: 0x0000_0000_0001,
            serial: [0, 0, 0, 0, 0, 1],
            tag: 0,
            ciphertext: vec![0xDE, 0xAD, 0xBE, 0xEF],
            mac: [0x55; 16],
        };
        let frame = wrapper.build();
        assert_eq!(&frame[2..4], &[0x09, 0x50]);
        assert_eq!(SecureWrapper::parse(&frame[6..]).unwrap(), wrapper);
    }

    #[test]
    fn test_group_sync_round_trip() {
        let sync = GroupSync {
            timestamp: 123_456,
            serial: [0, 0, 0, 0, 0, 1],
            tag: 0x1234,
            mac: [0x77; 16],
        };
        let frame = sync.build();
        // fixed total length 0x24
        assert_eq!(frame.len(), 0x24);
        assert_eq!(&frame[4..6], &[0x00, 0x24]);
        assert_eq!(GroupSync::parse(&frame[6..]).unwrap(), sync);
    }
}
