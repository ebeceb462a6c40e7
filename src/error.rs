//! Error types for KNXnet/IP operations.
//!
//! This module provides the single error type returned by all operations of
//! the stack, with helper constructors used throughout the crate and
//! predicates for the error classes callers commonly branch on.

use core::fmt;
use std::io;

/// Result type alias for KNX operations.
pub type Result<T> = core::result::Result<T, KnxError>;

/// Secure-session failure variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SecureErrorKind {
    /// Session handshake failed (bad response, rejected authentication)
    Handshake,
    /// Message authentication code did not verify
    MacMismatch,
    /// Received sequence number below the expected receive sequence
    Replay,
    /// Secure session is not in a state that permits the operation
    SessionState,
}

/// KNX protocol error type.
///
/// This is the main error type returned by all operations. The variants
/// follow the failure classes of the protocol stack: terminated
/// connections, bounded waits that elapsed, malformed or semantically
/// wrong frames, negative remote responses and secure-session failures.
#[derive(Debug)]
pub enum KnxError {
    /// Connection or session already terminated
    Closed,
    /// No response within the configured wait window
    Timeout,
    /// All send attempts exhausted without a service acknowledgment
    AckTimeout,
    /// Well-formed frame with a semantic mismatch (wrong channel, bad
    /// length field, unexpected service type)
    InvalidResponse,
    /// Malformed bytes; `offset` is the position where decoding failed
    WireFormat {
        /// Byte offset into the decoded buffer
        offset: usize,
    },
    /// Positive response carrying a non-success status code
    RemoteError {
        /// Status code as carried on the wire
        code: u8,
    },
    /// Extended-service explicit failure return code (> 0x7F)
    NegativeReturnCode(u8),
    /// Secure session failure (handshake, MAC mismatch, replay)
    Secure(SecureError),
    /// The underlying KNX network link is gone
    LinkClosed,
    /// A transport-layer destination disconnected; carries its raw
    /// individual address
    Disconnect(u16),
    /// A blocking operation was cancelled by a concurrent close
    Interrupted,
    /// Out-of-range value at the API boundary
    IllegalArgument(&'static str),
    /// Caller attempted a non-blocking send while an acknowledgment is outstanding
    BusyState,
    /// Socket-level failure
    Io(io::Error),
}

/// Secure session error with the failing phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureError {
    kind: SecureErrorKind,
}

impl SecureError {
    pub(crate) const fn new(kind: SecureErrorKind) -> Self {
        Self { kind }
    }

    /// Check if the session handshake failed
    pub fn is_handshake(&self) -> bool {
        matches!(self.kind, SecureErrorKind::Handshake)
    }

    /// Check if a message authentication code failed to verify
    pub fn is_mac_mismatch(&self) -> bool {
        matches!(self.kind, SecureErrorKind::MacMismatch)
    }

    /// Check if a replayed sequence number was rejected
    pub fn is_replay(&self) -> bool {
        matches!(self.kind, SecureErrorKind::Replay)
    }
}

impl KnxError {
    #[inline]
    pub(crate) const fn closed() -> Self {
        Self::Closed
    }

    #[inline]
    pub(crate) const fn timeout() -> Self {
        Self::Timeout
    }

    #[inline]
    pub(crate) const fn ack_timeout() -> Self {
        Self::AckTimeout
    }

    #[inline]
    pub(crate) const fn invalid_response() -> Self {
        Self::InvalidResponse
    }

    #[inline]
    pub(crate) const fn wire_format(offset: usize) -> Self {
        Self::WireFormat { offset }
    }

    #[inline]
    pub(crate) const fn remote_error(code: u8) -> Self {
        Self::RemoteError { code }
    }

    #[inline]
    pub(crate) const fn negative_return_code(code: u8) -> Self {
        Self::NegativeReturnCode(code)
    }

    #[inline]
    pub(crate) const fn secure_handshake() -> Self {
        Self::Secure(SecureError::new(SecureErrorKind::Handshake))
    }

    #[inline]
    pub(crate) const fn secure_mac_mismatch() -> Self {
        Self::Secure(SecureError::new(SecureErrorKind::MacMismatch))
    }

    #[inline]
    pub(crate) const fn secure_replay() -> Self {
        Self::Secure(SecureError::new(SecureErrorKind::Replay))
    }

    #[inline]
    pub(crate) const fn secure_session_state() -> Self {
        Self::Secure(SecureError::new(SecureErrorKind::SessionState))
    }

    #[inline]
    pub(crate) const fn link_closed() -> Self {
        Self::LinkClosed
    }

    #[inline]
    pub(crate) const fn disconnect(address: u16) -> Self {
        Self::Disconnect(address)
    }

    #[inline]
    pub(crate) const fn interrupted() -> Self {
        Self::Interrupted
    }

    #[inline]
    pub(crate) const fn illegal_argument(what: &'static str) -> Self {
        Self::IllegalArgument(what)
    }

    #[inline]
    pub(crate) const fn busy_state() -> Self {
        Self::BusyState
    }

    /// Check if this is a timeout of any kind (response or acknowledgment)
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout | Self::AckTimeout)
    }

    /// Check if the connection is terminated
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed | Self::LinkClosed)
    }

    /// Check if decoding failed on malformed bytes
    pub fn is_wire_format(&self) -> bool {
        matches!(self, Self::WireFormat { .. })
    }
}

impl fmt::Display for KnxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::AckTimeout => write!(f, "no acknowledgment after all send attempts"),
            Self::InvalidResponse => write!(f, "invalid response"),
            Self::WireFormat { offset } => write!(f, "malformed frame at byte {offset}"),
            Self::RemoteError { code } => write!(f, "remote error status 0x{code:02x}"),
            Self::NegativeReturnCode(code) => write!(f, "negative return code 0x{code:02x}"),
            Self::Secure(e) => write!(f, "secure session error: {:?}", e.kind),
            Self::LinkClosed => write!(f, "network link closed"),
            Self::Disconnect(addr) => {
                write!(f, "transport disconnect from {}.{}.{}", addr >> 12, (addr >> 8) & 0xF, addr & 0xFF)
            }
            Self::Interrupted => write!(f, "operation interrupted"),
            Self::IllegalArgument(what) => write!(f, "illegal argument: {what}"),
            Self::BusyState => write!(f, "send pending, connection busy"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for KnxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for KnxError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_predicate() {
        assert!(KnxError::timeout().is_timeout());
        assert!(KnxError::ack_timeout().is_timeout());
        assert!(!KnxError::closed().is_timeout());
    }

    #[test]
    fn test_wire_format_offset() {
        let err = KnxError::wire_format(4);
        assert!(err.is_wire_format());
        assert_eq!(format!("{err}"), "malformed frame at byte 4");
    }

    #[test]
    fn test_secure_kinds() {
        match KnxError::secure_replay() {
            KnxError::Secure(e) => assert!(e.is_replay()),
            _ => panic!("wrong variant"),
        }
        match KnxError::secure_mac_mismatch() {
            KnxError::Secure(e) => assert!(e.is_mac_mismatch()),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_io_conversion() {
        let err: KnxError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(matches!(err, KnxError::Io(_)));
    }
}
