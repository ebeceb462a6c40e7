//! OSI-4 transport layer for connection-oriented and connectionless
//! KNX communication.
//!
//! The transport layer multiplexes destinations over one network link (a
//! tunneling or routing connection). A destination is the state machine
//! for one remote individual address:
//!
//! ```text
//! Disconnected ── connect ──→ Connecting ──→ OpenIdle
//!      ↑                                        │ send data-connected
//!      │        ACK at seq_send                 ↓
//!      └──── disconnect / NACK exhaustion ── OpenWait
//! ```
//!
//! Connection-oriented traffic carries 4-bit send/receive sequences in
//! the TPCI; data is repeated up to three times, each attempt waiting
//! 3 s for the positive acknowledgment.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::connection::{BlockingMode, CloseInitiator, ConnectionListener, TunnelConnection};
use crate::error::{KnxError, Result};
use crate::protocol::cemi::{Cemi, CemiLData, KnxAddress, Tpci};
use crate::protocol::constants::{CEMIMessageCode, Priority};
use crate::routing::{RoutingConnection, RoutingListener};

/// Repetitions of an unacknowledged data-connected send
const MAX_REPEAT: u32 = 3;

/// Wait for the transport acknowledgment per attempt
const ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Network link the transport layer runs on.
pub trait NetworkLink: Send + Sync {
    /// Send an `L_Data` frame; `confirm` requests waiting for the
    /// matching `L_Data.con`.
    fn send_frame(&self, frame: &CemiLData, confirm: bool) -> Result<()>;

    /// Check if the link is still usable
    fn is_open(&self) -> bool;
}

impl NetworkLink for TunnelConnection {
    fn send_frame(&self, frame: &CemiLData, confirm: bool) -> Result<()> {
        let mode = if confirm { BlockingMode::WaitForCon } else { BlockingMode::NonBlocking };
        self.send(frame, mode)
    }

    fn is_open(&self) -> bool {
        self.state() != crate::connection::ConnectionState::Closed
    }
}

impl NetworkLink for RoutingConnection {
    fn send_frame(&self, frame: &CemiLData, _confirm: bool) -> Result<()> {
        // routing is unconfirmed and carries indications
        let mut frame = frame.clone();
        frame.code = CEMIMessageCode::LDataInd;
        self.send(&frame)
    }

    fn is_open(&self) -> bool {
        true
    }
}

/// State of a transport-layer destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationState {
    /// No transport connection
    Disconnected,
    /// T-CONNECT sent
    Connecting,
    /// Connected, no send outstanding
    OpenIdle,
    /// Connected, awaiting the acknowledgment of a send
    OpenWait,
    /// Destroyed; the destination cannot be used again
    Destroyed,
}

/// Outcome of the acknowledgment wait, set by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckEvent {
    Positive,
    Negative,
}

struct DestShared {
    state: DestinationState,
    seq_send: u8,
    seq_rcv: u8,
    ack: Option<AckEvent>,
}

/// Transport-layer connection state for one remote individual address.
///
/// Only the transport layer that created a destination may operate on
/// it.
pub struct Destination {
    address: IndividualAddress,
    connection_oriented: bool,
    keep_alive: bool,
    verify_mode: bool,
    owner: Weak<TlInner>,
    shared: Mutex<DestShared>,
    cond: Condvar,
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("connection_oriented", &self.connection_oriented)
            .finish()
    }
}

impl Destination {
    /// The remote individual address
    pub fn address(&self) -> IndividualAddress {
        self.address
    }

    /// Current destination state
    pub fn state(&self) -> DestinationState {
        self.shared.lock().state
    }

    /// Whether the destination uses connection-oriented mode
    pub fn is_connection_oriented(&self) -> bool {
        self.connection_oriented
    }

    /// Whether keep-alive was requested at creation
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Whether the device is in verify mode
    pub fn verify_mode(&self) -> bool {
        self.verify_mode
    }

    fn transition(&self, state: DestinationState) {
        self.shared.lock().state = state;
        self.cond.notify_all();
    }
}

/// Callbacks of the transport layer.
pub trait TransportListener: Send + Sync {
    /// Broadcast frame (group address 0)
    fn broadcast(&self, frame: &CemiLData) {
        let _ = frame;
    }

    /// Group-addressed frame
    fn group(&self, frame: &CemiLData) {
        let _ = frame;
    }

    /// Connectionless data to our individual address
    fn data_individual(&self, frame: &CemiLData) {
        let _ = frame;
    }

    /// Connection-oriented data from an open destination
    fn data_connected(&self, frame: &CemiLData, destination: &Destination) {
        let _ = (frame, destination);
    }

    /// A destination was disconnected by the peer or by repetition
    /// exhaustion
    fn disconnected(&self, destination: &Destination) {
        let _ = destination;
    }

    /// The underlying network link is gone
    fn link_closed(&self) {}
}

struct TlInner {
    link: Arc<dyn NetworkLink>,
    local: Option<IndividualAddress>,
    destinations: Mutex<HashMap<IndividualAddress, Arc<Destination>>>,
    listeners: Mutex<Vec<Arc<dyn TransportListener>>>,
}

/// OSI-4 transport layer client.
#[derive(Clone)]
pub struct TransportLayer {
    inner: Arc<TlInner>,
}

impl std::fmt::Debug for TransportLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLayer")
            .field("destinations", &self.inner.destinations.lock().len())
            .finish()
    }
}

impl TransportLayer {
    /// Create a transport layer on an arbitrary network link. Inbound
    /// indications must be fed through [`Self::handle_indication`].
    pub fn new(link: Arc<dyn NetworkLink>, local: Option<IndividualAddress>) -> Self {
        Self {
            inner: Arc::new(TlInner {
                link,
                local,
                destinations: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a transport layer on a tunneling connection and wire up
    /// its inbound indications.
    pub fn on_tunnel(tunnel: &TunnelConnection) -> Self {
        let tl = Self::new(Arc::new(tunnel.clone()), tunnel.address());
        tunnel.add_listener(Arc::new(TunnelAdapter { inner: Arc::downgrade(&tl.inner) }));
        tl
    }

    /// Create a transport layer on a routing connection and wire up its
    /// inbound indications.
    pub fn on_routing(routing: &RoutingConnection, local: IndividualAddress) -> Self {
        let tl = Self::new(Arc::new(routing.clone()), Some(local));
        routing.add_listener(Arc::new(RoutingAdapter { inner: Arc::downgrade(&tl.inner) }));
        tl
    }

    /// Register a transport listener
    pub fn add_listener(&self, listener: Arc<dyn TransportListener>) {
        self.inner.listeners.lock().push(listener);
    }

    /// Create the destination state machine for a remote address.
    ///
    /// Only one destination per remote address may exist per transport
    /// layer; a duplicate is rejected.
    pub fn create_destination(
        &self,
        address: IndividualAddress,
        connection_oriented: bool,
        keep_alive: bool,
        verify_mode: bool,
    ) -> Result<Arc<Destination>> {
        let mut destinations = self.inner.destinations.lock();
        if destinations.contains_key(&address) {
            return Err(KnxError::illegal_argument("destination already exists"));
        }
        let destination = Arc::new(Destination {
            address,
            connection_oriented,
            keep_alive,
            verify_mode,
            owner: Arc::downgrade(&self.inner),
            shared: Mutex::new(DestShared {
                state: DestinationState::Disconnected,
                seq_send: 0,
                seq_rcv: 0,
                ack: None,
            }),
            cond: Condvar::new(),
        });
        destinations.insert(address, destination.clone());
        Ok(destination)
    }

    /// Destroy a destination; it can no longer be sent on.
    pub fn destroy_destination(&self, destination: &Arc<Destination>) {
        self.inner.destinations.lock().remove(&destination.address);
        destination.transition(DestinationState::Destroyed);
    }

    fn check_owner(&self, destination: &Destination) -> Result<()> {
        if destination.owner.as_ptr() != Arc::as_ptr(&self.inner) {
            return Err(KnxError::illegal_argument("destination belongs to another transport layer"));
        }
        Ok(())
    }

    /// Open the transport connection to a connection-oriented
    /// destination.
    pub fn connect(&self, destination: &Arc<Destination>) -> Result<()> {
        self.check_owner(destination)?;
        if !destination.connection_oriented {
            return Err(KnxError::illegal_argument("connect requires a connection-oriented destination"));
        }
        {
            let mut shared = destination.shared.lock();
            match shared.state {
                DestinationState::Disconnected => {}
                DestinationState::Destroyed => return Err(KnxError::closed()),
                // already connected
                _ => return Ok(()),
            }
            shared.state = DestinationState::Connecting;
            shared.seq_send = 0;
            shared.seq_rcv = 0;
        }

        let frame = self.control_frame(destination.address, Tpci::Connect);
        if let Err(e) = self.inner.link.send_frame(&frame, true) {
            destination.transition(DestinationState::Disconnected);
            return Err(e);
        }
        destination.transition(DestinationState::OpenIdle);
        debug!("transport connect to {}", destination.address);
        Ok(())
    }

    /// Close the transport connection of a destination.
    pub fn disconnect(&self, destination: &Arc<Destination>) -> Result<()> {
        self.check_owner(destination)?;
        let connected = !matches!(
            destination.state(),
            DestinationState::Disconnected | DestinationState::Destroyed
        );
        if connected {
            let frame = self.control_frame(destination.address, Tpci::Disconnect);
            let _ = self.inner.link.send_frame(&frame, true);
            destination.transition(DestinationState::Disconnected);
            self.inner.notify_disconnected(destination);
        }
        Ok(())
    }

    /// Send a TSDU on the transport connection of a destination.
    ///
    /// The first two octets of `tsdu` carry the APCI; the TPCI bits are
    /// filled in with the current send sequence. Retries up to three
    /// times on a missing or negative acknowledgment, then disconnects
    /// and fails with `Disconnect`.
    pub fn send_data_connected(
        &self,
        destination: &Arc<Destination>,
        tsdu: &[u8],
        priority: Priority,
    ) -> Result<()> {
        self.check_owner(destination)?;
        if tsdu.len() < 2 {
            return Err(KnxError::illegal_argument("TSDU of at least 2 octets"));
        }

        let seq;
        {
            let mut shared = destination.shared.lock();
            match shared.state {
                DestinationState::Connecting | DestinationState::OpenIdle => {}
                DestinationState::OpenWait => {
                    return Err(KnxError::busy_state());
                }
                _ => return Err(KnxError::disconnect(destination.address.raw())),
            }
            seq = shared.seq_send;
            shared.ack = None;
            shared.state = DestinationState::OpenWait;
        }

        let mut tpdu = tsdu.to_vec();
        tpdu[0] = (tpdu[0] & 0x03) | Tpci::NumberedData { sequence: seq }.to_byte();
        let frame = CemiLData::new(
            CEMIMessageCode::LDataReq,
            self.inner.local.unwrap_or(IndividualAddress::from(0)),
            KnxAddress::Individual(destination.address),
            tpdu,
            priority,
        );

        for attempt in 0..MAX_REPEAT {
            if let Err(e) = self.inner.link.send_frame(&frame, true) {
                destination.transition(DestinationState::Disconnected);
                self.inner.notify_disconnected(destination);
                return Err(e);
            }

            let deadline = Instant::now() + ACK_TIMEOUT;
            let mut shared = destination.shared.lock();
            while shared.ack.is_none() && shared.state == DestinationState::OpenWait {
                if destination.cond.wait_until(&mut shared, deadline).timed_out() {
                    break;
                }
            }
            match shared.ack.take() {
                Some(AckEvent::Positive) => {
                    shared.seq_send = (shared.seq_send + 1) & 0x0F;
                    shared.state = DestinationState::OpenIdle;
                    return Ok(());
                }
                Some(AckEvent::Negative) => {
                    debug!("transport NACK from {}, attempt {}", destination.address, attempt + 1);
                }
                None => {
                    if shared.state != DestinationState::OpenWait {
                        // peer disconnected while we were waiting
                        return Err(KnxError::disconnect(destination.address.raw()));
                    }
                    debug!("no transport ack from {}, attempt {}", destination.address, attempt + 1);
                }
            }
        }

        warn!("transport send to {} exhausted its repetitions", destination.address);
        destination.transition(DestinationState::Disconnected);
        let disconnect = self.control_frame(destination.address, Tpci::Disconnect);
        let _ = self.inner.link.send_frame(&disconnect, false);
        self.inner.notify_disconnected(destination);
        Err(KnxError::disconnect(destination.address.raw()))
    }

    /// Send connectionless data to an individual address.
    pub fn send_data_individual(
        &self,
        address: IndividualAddress,
        tsdu: &[u8],
        priority: Priority,
    ) -> Result<()> {
        if tsdu.len() < 2 {
            return Err(KnxError::illegal_argument("TSDU of at least 2 octets"));
        }
        let mut tpdu = tsdu.to_vec();
        tpdu[0] &= 0x03;
        let frame = CemiLData::new(
            CEMIMessageCode::LDataReq,
            self.inner.local.unwrap_or(IndividualAddress::from(0)),
            KnxAddress::Individual(address),
            tpdu,
            priority,
        );
        self.inner.link.send_frame(&frame, true)
    }

    /// Send data to a group address (group address 0 broadcasts).
    pub fn send_group(&self, group: GroupAddress, tsdu: &[u8], priority: Priority) -> Result<()> {
        if tsdu.len() < 2 {
            return Err(KnxError::illegal_argument("TSDU of at least 2 octets"));
        }
        let mut tpdu = tsdu.to_vec();
        tpdu[0] &= 0x03;
        let frame = CemiLData::new(
            CEMIMessageCode::LDataReq,
            self.inner.local.unwrap_or(IndividualAddress::from(0)),
            KnxAddress::Group(group),
            tpdu,
            priority,
        );
        self.inner.link.send_frame(&frame, true)
    }

    /// Send a broadcast (system or domain, depending on the frame's
    /// control bits handled by the link).
    pub fn broadcast(&self, tsdu: &[u8], priority: Priority) -> Result<()> {
        self.send_group(GroupAddress::BROADCAST, tsdu, priority)
    }

    /// Feed an inbound `L_Data.ind` into the transport layer.
    pub fn handle_indication(&self, frame: &CemiLData) {
        self.inner.handle_indication(frame);
    }

    fn control_frame(&self, to: IndividualAddress, tpci: Tpci) -> CemiLData {
        CemiLData::new(
            CEMIMessageCode::LDataReq,
            self.inner.local.unwrap_or(IndividualAddress::from(0)),
            KnxAddress::Individual(to),
            vec![tpci.to_byte()],
            Priority::System,
        )
    }
}

impl TlInner {
    fn listeners(&self) -> Vec<Arc<dyn TransportListener>> {
        self.listeners.lock().clone()
    }

    fn notify_disconnected(&self, destination: &Arc<Destination>) {
        for listener in self.listeners() {
            listener.disconnected(destination);
        }
    }

    fn handle_indication(self: &Arc<Self>, frame: &CemiLData) {
        match frame.destination {
            KnxAddress::Group(group) if group.raw() == 0 => {
                for listener in self.listeners() {
                    listener.broadcast(frame);
                }
            }
            KnxAddress::Group(_) => {
                for listener in self.listeners() {
                    listener.group(frame);
                }
            }
            KnxAddress::Individual(_) => self.handle_individual(frame),
        }
    }

    fn handle_individual(self: &Arc<Self>, frame: &CemiLData) {
        let Some(tpci) = frame.tpci() else {
            return;
        };
        let destination = self.destinations.lock().get(&frame.source).cloned();

        match tpci {
            Tpci::Connect => {
                // only meaningful in the server role: an existing
                // destination restarts with fresh sequence counters
                if let Some(dest) = destination {
                    let mut shared = dest.shared.lock();
                    shared.seq_send = 0;
                    shared.seq_rcv = 0;
                    shared.state = DestinationState::OpenIdle;
                    info!("transport connect from {}", frame.source);
                }
            }
            Tpci::Disconnect => {
                if let Some(dest) = destination {
                    if !matches!(
                        dest.state(),
                        DestinationState::Disconnected | DestinationState::Destroyed
                    ) {
                        info!("transport disconnect from {}", frame.source);
                        dest.transition(DestinationState::Disconnected);
                        self.notify_disconnected(&dest);
                    }
                }
            }
            Tpci::NumberedData { sequence } => match destination {
                Some(dest) if dest.connection_oriented => {
                    self.handle_data_connected(&dest, sequence, frame);
                }
                _ => self.disconnect_unknown_peer(frame.source),
            },
            Tpci::Ack { sequence } | Tpci::Nack { sequence } => match destination {
                Some(dest) => {
                    let positive = matches!(tpci, Tpci::Ack { .. });
                    let mut shared = dest.shared.lock();
                    if shared.state == DestinationState::OpenWait && sequence == shared.seq_send {
                        shared.ack =
                            Some(if positive { AckEvent::Positive } else { AckEvent::Negative });
                        drop(shared);
                        dest.cond.notify_all();
                    }
                }
                None => self.disconnect_unknown_peer(frame.source),
            },
            Tpci::UnnumberedData => {
                for listener in self.listeners() {
                    listener.data_individual(frame);
                }
            }
        }
    }

    fn handle_data_connected(&self, dest: &Arc<Destination>, sequence: u8, frame: &CemiLData) {
        let reply = {
            let mut shared = dest.shared.lock();
            if matches!(
                shared.state,
                DestinationState::Disconnected | DestinationState::Destroyed
            ) {
                None
            } else if sequence == shared.seq_rcv {
                shared.seq_rcv = (shared.seq_rcv + 1) & 0x0F;
                Some((Tpci::Ack { sequence }, true))
            } else if sequence == (shared.seq_rcv.wrapping_sub(1)) & 0x0F {
                // repetition: acknowledge without redelivering
                Some((Tpci::Ack { sequence }, false))
            } else {
                Some((Tpci::Nack { sequence }, false))
            }
        };

        let Some((tpci, deliver)) = reply else {
            return;
        };
        let control = CemiLData::new(
            CEMIMessageCode::LDataReq,
            self.local.unwrap_or(IndividualAddress::from(0)),
            KnxAddress::Individual(dest.address),
            vec![tpci.to_byte()],
            Priority::System,
        );
        // non-blocking: this runs on the link's receiver thread
        if let Err(e) = self.link.send_frame(&control, false) {
            debug!("transport acknowledgment send failed: {e}");
        }
        if deliver {
            for listener in self.listeners() {
                listener.data_connected(frame, dest);
            }
        }
    }

    /// A connection-oriented frame arrived from a peer we do not track:
    /// tell it to disconnect, unless the frame is our own echo.
    fn disconnect_unknown_peer(&self, peer: IndividualAddress) {
        if self.local == Some(peer) {
            return;
        }
        debug!("transport frame from untracked {peer}, replying disconnect");
        let control = CemiLData::new(
            CEMIMessageCode::LDataReq,
            self.local.unwrap_or(IndividualAddress::from(0)),
            KnxAddress::Individual(peer),
            vec![Tpci::Disconnect.to_byte()],
            Priority::System,
        );
        if let Err(e) = self.link.send_frame(&control, false) {
            debug!("transport disconnect send failed: {e}");
        }
    }
}

struct TunnelAdapter {
    inner: Weak<TlInner>,
}

impl ConnectionListener for TunnelAdapter {
    fn frame_received(&self, frame: &Cemi) {
        if let (Some(inner), Cemi::LData(ldata)) = (self.inner.upgrade(), frame) {
            if ldata.code == CEMIMessageCode::LDataInd {
                inner.handle_indication(ldata);
            }
        }
    }

    fn connection_closed(&self, _initiator: CloseInitiator, _reason: &str) {
        if let Some(inner) = self.inner.upgrade() {
            for listener in inner.listeners() {
                listener.link_closed();
            }
        }
    }
}

struct RoutingAdapter {
    inner: Weak<TlInner>,
}

impl RoutingListener for RoutingAdapter {
    fn indication(&self, frame: &Cemi) {
        if let (Some(inner), Cemi::LData(ldata)) = (self.inner.upgrade(), frame) {
            inner.handle_indication(ldata);
        }
    }

    fn closed(&self) {
        if let Some(inner) = self.inner.upgrade() {
            for listener in inner.listeners() {
                listener.link_closed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records sent frames and simulates acknowledgments.
    struct MockLink {
        sent: Mutex<Vec<CemiLData>>,
    }

    impl MockLink {
        fn new() -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()) })
        }
    }

    impl NetworkLink for MockLink {
        fn send_frame(&self, frame: &CemiLData, _confirm: bool) -> Result<()> {
            self.sent.lock().push(frame.clone());
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    fn peer() -> IndividualAddress {
        IndividualAddress::new(1, 1, 5).unwrap()
    }

    fn data_frame(from: IndividualAddress, tpci_byte: u8) -> CemiLData {
        CemiLData::new(
            CEMIMessageCode::LDataInd,
            from,
            KnxAddress::Individual(IndividualAddress::new(1, 1, 1).unwrap()),
            vec![tpci_byte, 0x00],
            Priority::Normal,
        )
    }

    #[test]
    fn test_duplicate_destination_rejected() {
        let tl = TransportLayer::new(MockLink::new(), None);
        tl.create_destination(peer(), true, false, false).unwrap();
        assert!(tl.create_destination(peer(), true, false, false).is_err());
    }

    #[test]
    fn test_connect_requires_connection_oriented() {
        let tl = TransportLayer::new(MockLink::new(), None);
        let dest = tl.create_destination(peer(), false, false, false).unwrap();
        assert!(tl.connect(&dest).is_err());
    }

    #[test]
    fn test_connect_sends_tconnect_with_system_priority() {
        let link = MockLink::new();
        let tl = TransportLayer::new(link.clone(), None);
        let dest = tl.create_destination(peer(), true, false, false).unwrap();
        tl.connect(&dest).unwrap();

        assert_eq!(dest.state(), DestinationState::OpenIdle);
        let sent = link.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].tpdu, vec![0x80]);
        assert_eq!(sent[0].ctrl1.priority(), Priority::System);
    }

    #[test]
    fn test_foreign_destination_rejected() {
        let tl1 = TransportLayer::new(MockLink::new(), None);
        let tl2 = TransportLayer::new(MockLink::new(), None);
        let dest = tl1.create_destination(peer(), true, false, false).unwrap();
        assert!(tl2.connect(&dest).is_err());
    }

    #[test]
    fn test_destroyed_destination_cannot_send() {
        let tl = TransportLayer::new(MockLink::new(), None);
        let dest = tl.create_destination(peer(), true, false, false).unwrap();
        tl.destroy_destination(&dest);
        assert_eq!(dest.state(), DestinationState::Destroyed);
        assert!(tl.send_data_connected(&dest, &[0x00, 0x00], Priority::Low).is_err());

        // the address is free again
        assert!(tl.create_destination(peer(), true, false, false).is_ok());
    }

    #[test]
    fn test_inbound_data_connected_sequence() {
        let link = MockLink::new();
        let tl = TransportLayer::new(link.clone(), Some(IndividualAddress::new(1, 1, 1).unwrap()));
        let dest = tl.create_destination(peer(), true, false, false).unwrap();
        tl.connect(&dest).unwrap();
        link.sent.lock().clear();

        struct Collect(Mutex<u32>);
        impl TransportListener for Collect {
            fn data_connected(&self, _frame: &CemiLData, _dest: &Destination) {
                *self.0.lock() += 1;
            }
        }
        let collect = Arc::new(Collect(Mutex::new(0)));
        tl.add_listener(collect.clone());

        // expected sequence 0: acked and delivered
        tl.handle_indication(&data_frame(peer(), 0x40));
        assert_eq!(*collect.0.lock(), 1);
        assert_eq!(link.sent.lock().last().unwrap().tpdu, vec![Tpci::Ack { sequence: 0 }.to_byte()]);

        // repetition of sequence 0: acked, not redelivered
        tl.handle_indication(&data_frame(peer(), 0x40));
        assert_eq!(*collect.0.lock(), 1);
        assert_eq!(link.sent.lock().last().unwrap().tpdu, vec![Tpci::Ack { sequence: 0 }.to_byte()]);

        // out-of-window sequence 5: NACK
        tl.handle_indication(&data_frame(peer(), 0x40 | (5 << 2)));
        assert_eq!(*collect.0.lock(), 1);
        assert_eq!(
            link.sent.lock().last().unwrap().tpdu,
            vec![Tpci::Nack { sequence: 5 }.to_byte()]
        );
    }

    #[test]
    fn test_untracked_peer_gets_disconnect() {
        let link = MockLink::new();
        let tl = TransportLayer::new(link.clone(), Some(IndividualAddress::new(1, 1, 1).unwrap()));
        tl.handle_indication(&data_frame(peer(), 0x40));
        assert_eq!(link.sent.lock().last().unwrap().tpdu, vec![0x81]);
    }

    #[test]
    fn test_own_echo_not_answered() {
        let link = MockLink::new();
        let local = IndividualAddress::new(1, 1, 1).unwrap();
        let tl = TransportLayer::new(link.clone(), Some(local));
        tl.handle_indication(&data_frame(local, 0x40));
        assert!(link.sent.lock().is_empty());
    }

    #[test]
    fn test_peer_disconnect_notifies() {
        let link = MockLink::new();
        let tl = TransportLayer::new(link.clone(), None);
        let dest = tl.create_destination(peer(), true, false, false).unwrap();
        tl.connect(&dest).unwrap();

        struct Notice(Mutex<bool>);
        impl TransportListener for Notice {
            fn disconnected(&self, _dest: &Destination) {
                *self.0.lock() = true;
            }
        }
        let notice = Arc::new(Notice(Mutex::new(false)));
        tl.add_listener(notice.clone());

        tl.handle_indication(&data_frame(peer(), 0x81));
        assert_eq!(dest.state(), DestinationState::Disconnected);
        assert!(*notice.0.lock());
    }

    #[test]
    fn test_send_data_connected_retries_then_disconnects() {
        // a link that never acknowledges: the send exhausts MAX_REPEAT
        let link = MockLink::new();
        let tl = TransportLayer::new(link.clone(), None);
        let dest = tl.create_destination(peer(), true, false, false).unwrap();
        tl.connect(&dest).unwrap();
        link.sent.lock().clear();

        // shorten the test: deliver a NACK from another thread per attempt
        let dest2 = dest.clone();
        let handle = std::thread::spawn(move || {
            for _ in 0..MAX_REPEAT {
                loop {
                    {
                        let mut shared = dest2.shared.lock();
                        if shared.state == DestinationState::OpenWait && shared.ack.is_none() {
                            shared.ack = Some(AckEvent::Negative);
                            drop(shared);
                            dest2.cond.notify_all();
                            break;
                        }
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        });

        let err = tl.send_data_connected(&dest, &[0x03, 0xD5], Priority::Low).unwrap_err();
        assert!(matches!(err, KnxError::Disconnect(_)));
        assert_eq!(dest.state(), DestinationState::Disconnected);
        // three data attempts plus the final disconnect
        assert_eq!(link.sent.lock().len(), MAX_REPEAT as usize + 1);
        handle.join().unwrap();
    }
}
