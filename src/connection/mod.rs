//! KNXnet/IP client connections.
//!
//! Tunneling and local device management share one send/acknowledgment
//! state machine ([`base`]): per-connection sequence counters, bounded
//! send retries, confirmation waits, a heartbeat monitor and a graceful
//! disconnect path. The concrete connection types add the cEMI framing
//! rules of their service.

pub(crate) mod base;
mod devmgmt;
mod tunnel;

pub use devmgmt::DeviceMgmtConnection;
pub use tunnel::{TunnelConfig, TunnelConnection, TunnelLayer};

use crate::protocol::cemi::Cemi;

/// User-visible state of a client connection.
///
/// `Closed` is absorbing: once a connection reached it, it cannot be
/// reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum ConnectionState {
    /// Terminal error state
    UnknownError = -1,
    /// Terminated, or not yet connected
    Closed = 0,
    /// Connected and idle
    Ok = 1,
    /// A send awaits its service acknowledgment
    AckPending = 2,
    /// The last send ran out of acknowledgment attempts
    AckError = 3,
    /// Acknowledged, awaiting the cEMI `L_Data.con`
    CemiConPending = 4,
}

/// Blocking behavior of [`send`](tunnel::TunnelConnection::send).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingMode {
    /// Enqueue and return without waiting for the acknowledgment
    NonBlocking,
    /// Wait for the service acknowledgment
    WaitForAck,
    /// Wait for the service acknowledgment and the matching `L_Data.con`
    WaitForCon,
}

/// Who initiated a connection close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseInitiator {
    /// The local user of the connection
    User,
    /// The remote server
    Server,
    /// The stack itself (I/O failure, missed heartbeats)
    Internal,
}

/// Callbacks of a client connection.
///
/// Listener lists are copied before notification; a listener is never
/// invoked while connection locks are held, except that a confirmation
/// notification completes before the blocking send returns.
pub trait ConnectionListener: Send + Sync {
    /// A cEMI frame arrived on the connection
    fn frame_received(&self, frame: &Cemi) {
        let _ = frame;
    }

    /// The connection reached its terminal state
    fn connection_closed(&self, initiator: CloseInitiator, reason: &str) {
        let _ = (initiator, reason);
    }
}
