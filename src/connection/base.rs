//! Connection base: the send/acknowledgment state machine shared by
//! tunneling and local device management connections.
//!
//! ## State Machine
//!
//! ```text
//!            CONNECT_RES ok                   service ack
//! (created) ───────────────→ Ok ──── send ───→ AckPending ──┐
//!                            ↑                              │
//!                            │        L_Data.con            ↓
//!                            └──────────────────── CemiConPending
//!
//! any state ── disconnect / ack exhaustion / heartbeat loss ──→ Closed
//! ```
//!
//! `Closed` is absorbing. Blocking senders from multiple threads are
//! serialized in invocation order through a ticketed FIFO; non-blocking
//! senders do not queue but hold back blocking senders until their
//! datagram is out.

use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::connection::{BlockingMode, CloseInitiator, ConnectionListener, ConnectionState};
use crate::error::{KnxError, Result};
use crate::net::stream::{FrameSink, FrameTransport};
use crate::net::udp;
use crate::protocol::cemi::{Cemi, CemiLData};
use crate::protocol::constants::{ServiceType, E_NO_ERROR};
use crate::protocol::frame::{Hpai, KnxnetIpHeader};
use crate::addressing::IndividualAddress;
use crate::protocol::services::{
    ConnectRequest, ConnectResponse, ConnectionHeader, ConnectionStateRequest,
    ConnectionStateResponse, Crd, Cri, DataRequest, DisconnectRequest, DisconnectResponse,
    ServiceAck,
};

/// Wait for the CONNECT_RESPONSE
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait for the `L_Data.con` after the service acknowledgment
const CON_TIMEOUT: Duration = Duration::from_secs(3);

/// Wait for the DISCONNECT_RESPONSE during graceful close
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat period while the connection is up
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Wait for a CONNECTIONSTATE_RESPONSE per heartbeat attempt
const HEARTBEAT_WAIT: Duration = Duration::from_secs(10);

/// Heartbeat attempts before the connection is declared dead
const HEARTBEAT_ATTEMPTS: u32 = 4;

/// Delay between failed heartbeat attempts
const HEARTBEAT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Receiver poll granularity for observing shutdown
const RECV_POLL: Duration = Duration::from_millis(250);

/// Connection behavior that differs between tunneling and device management
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionKind {
    /// Tunneling connection (0x0420 requests, 1 s acknowledgment window)
    Tunnel,
    /// Local device management (0x0310 requests, 4 s acknowledgment window)
    DeviceMgmt,
}

impl ConnectionKind {
    pub(crate) const fn request_service(self) -> ServiceType {
        match self {
            Self::Tunnel => ServiceType::TunnelingRequest,
            Self::DeviceMgmt => ServiceType::DeviceConfigurationRequest,
        }
    }

    const fn ack_service(self) -> ServiceType {
        match self {
            Self::Tunnel => ServiceType::TunnelingAck,
            Self::DeviceMgmt => ServiceType::DeviceConfigurationAck,
        }
    }

    const fn response_timeout(self) -> Duration {
        match self {
            Self::Tunnel => Duration::from_secs(1),
            Self::DeviceMgmt => Duration::from_secs(4),
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Tunnel => "tunneling",
            Self::DeviceMgmt => "device management",
        }
    }
}

/// Tuning knobs of the base machinery
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionConfig {
    /// Datagram retransmissions per send
    pub max_send_attempts: u32,
    /// Announce a NAT-aware endpoint instead of the bound address
    pub nat_aware: bool,
    /// Zero the source address when matching confirmations
    pub server_assigns_source: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { max_send_attempts: 4, nat_aware: false, server_assigns_source: true }
    }
}

/// Sequence classification of an inbound data request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InboundSeq {
    /// The expected sequence number
    Expected,
    /// Exactly one behind: a repetition
    Repeat,
    /// Exactly one ahead: one frame was skipped
    Skipped,
    /// Outside the acceptance window
    Invalid,
}

/// Kind-specific service handling attached to a [`ConnectionCore`].
pub(crate) trait ServiceHandler: Send + Sync {
    /// Handle a kind-specific service body; true if consumed
    fn handle_service(&self, core: &ConnectionCore, service: ServiceType, body: &[u8]) -> bool;

    /// The connection reached its terminal state
    fn closed(&self) {}
}

enum Transport {
    Udp {
        socket: UdpSocket,
        control_endpoint: SocketAddrV4,
        data_endpoint: SocketAddrV4,
    },
    Stream(Arc<dyn FrameTransport>),
}

struct Shared {
    user_state: ConnectionState,
    internal_state: ConnectionState,
    seq_send: u8,
    seq_rcv: u8,
    keep_for_con: Option<CemiLData>,
    ack_error: Option<u8>,
    heartbeat_status: Option<u8>,
    disconnect_acked: bool,
}

#[derive(Default)]
struct SendFifo {
    next_ticket: u64,
    now_serving: u64,
    nonblocking: u32,
}

/// Shared machinery of client connections.
pub(crate) struct ConnectionCore {
    kind: ConnectionKind,
    cfg: ConnectionConfig,
    transport: Transport,
    channel_id: u8,
    assigned_address: Option<IndividualAddress>,
    local_hpai: Hpai,
    shared: Mutex<Shared>,
    cond: Condvar,
    fifo: Mutex<SendFifo>,
    fifo_cond: Condvar,
    handler: RwLock<Option<Arc<dyn ServiceHandler>>>,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    closing: AtomicBool,
}

impl ConnectionCore {
    /// Connect over UDP: CONNECT handshake, then receiver and heartbeat
    /// workers.
    pub(crate) fn open_udp(
        kind: ConnectionKind,
        server: SocketAddrV4,
        cri: Cri,
        cfg: ConnectionConfig,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<Arc<Self>> {
        let socket = udp::bind_ephemeral(std::net::Ipv4Addr::UNSPECIFIED)?;
        let local = match socket.local_addr()? {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => return Err(KnxError::illegal_argument("IPv4 socket")),
        };
        let local_hpai = if cfg.nat_aware { Hpai::Nat } else { Hpai::Udp(local) };

        let request = ConnectRequest::new(local_hpai, local_hpai, cri).build();
        socket.send_to(&request, server)?;

        udp::set_poll_interval(&socket, RECV_POLL)?;
        let response = wait_connect_response(&socket)?;
        if !response.is_ok() {
            return Err(KnxError::remote_error(response.status));
        }
        // NAT-aware servers leave the data endpoint unspecified
        let data_endpoint = response
            .data_endpoint
            .endpoint()
            .filter(|ep| !ep.ip().is_unspecified() && ep.port() != 0)
            .unwrap_or(server);

        let assigned_address = match response.crd {
            Crd::Tunnel { address } => Some(address),
            Crd::DeviceMgmt => None,
        };
        let core = Arc::new(Self {
            kind,
            cfg,
            transport: Transport::Udp { socket, control_endpoint: server, data_endpoint },
            channel_id: response.channel_id,
            assigned_address,
            local_hpai,
            shared: Mutex::new(Shared::new()),
            cond: Condvar::new(),
            fifo: Mutex::new(SendFifo::default()),
            fifo_cond: Condvar::new(),
            handler: RwLock::new(Some(handler)),
            listeners: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
        });
        info!("{} connection established, channel {}", kind.name(), core.channel_id);

        let receiver_socket = match &core.transport {
            Transport::Udp { socket, .. } => socket.try_clone()?,
            Transport::Stream(_) => unreachable!(),
        };
        let weak = Arc::downgrade(&core);
        thread::Builder::new()
            .name(format!("knx-recv ch{}", core.channel_id))
            .spawn(move || udp_receiver(&receiver_socket, &weak))
            .map_err(KnxError::Io)?;
        core.spawn_heartbeat()?;

        Ok(core)
    }

    /// Connect over an existing stream transport (a plain stream
    /// connection or a secure session). The transport's receiver
    /// dispatches our frames; no per-connection receiver is spawned.
    pub(crate) fn open_stream(
        kind: ConnectionKind,
        stream: Arc<dyn FrameTransport>,
        cri: Cri,
        cfg: ConnectionConfig,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<Arc<Self>> {
        let request = ConnectRequest::new(Hpai::Tcp, Hpai::Tcp, cri).build();
        let frame = stream.request_frame(&request, CONNECT_TIMEOUT)?;
        let header = KnxnetIpHeader::parse(&frame)?;
        if header.service() != Some(ServiceType::ConnectResponse) {
            return Err(KnxError::invalid_response());
        }
        let response = ConnectResponse::parse(&frame[KnxnetIpHeader::SIZE..])?;
        if !response.is_ok() {
            return Err(KnxError::remote_error(response.status));
        }

        let assigned_address = match response.crd {
            Crd::Tunnel { address } => Some(address),
            Crd::DeviceMgmt => None,
        };
        let core = Arc::new(Self {
            kind,
            cfg,
            transport: Transport::Stream(stream.clone()),
            channel_id: response.channel_id,
            assigned_address,
            local_hpai: Hpai::Tcp,
            shared: Mutex::new(Shared::new()),
            cond: Condvar::new(),
            fifo: Mutex::new(SendFifo::default()),
            fifo_cond: Condvar::new(),
            handler: RwLock::new(Some(handler)),
            listeners: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
        });
        info!("{} connection established, channel {}", kind.name(), core.channel_id);

        stream.attach_channel(core.channel_id, core.clone());
        core.spawn_heartbeat()?;
        Ok(core)
    }

    fn spawn_heartbeat(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        thread::Builder::new()
            .name(format!("knx-heartbeat ch{}", self.channel_id))
            .spawn(move || heartbeat_loop(&weak))
            .map_err(KnxError::Io)?;
        Ok(())
    }

    /// The server-assigned channel id
    pub(crate) fn channel_id(&self) -> u8 {
        self.channel_id
    }

    /// The tunneling address assigned by the server, if any
    pub(crate) fn assigned_address(&self) -> Option<IndividualAddress> {
        self.assigned_address
    }

    /// The user-visible connection state
    pub(crate) fn state(&self) -> ConnectionState {
        self.shared.lock().user_state
    }

    fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.lock().push(listener);
    }

    pub(crate) fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Deliver a cEMI frame to all listeners (copy-on-notify).
    pub(crate) fn notify_frame(&self, frame: &Cemi) {
        let listeners: Vec<_> = self.listeners.lock().clone();
        for listener in listeners {
            listener.frame_received(frame);
        }
    }

    fn send_raw(&self, frame: &[u8], to_data_endpoint: bool) -> Result<()> {
        match &self.transport {
            Transport::Udp { socket, control_endpoint, data_endpoint } => {
                let target = if to_data_endpoint { data_endpoint } else { control_endpoint };
                socket.send_to(frame, target).map(|_| ()).map_err(KnxError::Io)
            }
            Transport::Stream(stream) => stream.send_frame(frame),
        }
    }

    /// Send a control-endpoint frame (heartbeat, disconnect)
    pub(crate) fn send_control(&self, frame: &[u8]) -> Result<()> {
        self.send_raw(frame, false)
    }

    /// Send a data-endpoint frame (requests, acknowledgments)
    pub(crate) fn send_data(&self, frame: &[u8]) -> Result<()> {
        self.send_raw(frame, true)
    }

    fn is_stream(&self) -> bool {
        matches!(self.transport, Transport::Stream(_))
    }

    /// Send a cEMI frame on the connection.
    ///
    /// `keep` is the decoded `L_Data` frame to correlate against a later
    /// `L_Data.con`; pass it with [`BlockingMode::WaitForCon`].
    pub(crate) fn send_cemi(
        self: &Arc<Self>,
        cemi: Vec<u8>,
        keep: Option<CemiLData>,
        mode: BlockingMode,
    ) -> Result<()> {
        self.send_request(self.kind.request_service().to_u16(), cemi, keep, mode)
    }

    /// Send a connection-header service (data request or tunneling
    /// feature) through the acknowledgment machinery.
    pub(crate) fn send_request(
        self: &Arc<Self>,
        service_type: u16,
        payload: Vec<u8>,
        keep: Option<CemiLData>,
        mode: BlockingMode,
    ) -> Result<()> {
        match mode {
            BlockingMode::NonBlocking => self.send_nonblocking(service_type, payload),
            BlockingMode::WaitForAck => self.send_blocking(service_type, payload, None),
            BlockingMode::WaitForCon => self.send_blocking(service_type, payload, keep),
        }
    }

    fn check_sendable(state: ConnectionState) -> Result<()> {
        match state {
            ConnectionState::Ok | ConnectionState::AckError => Ok(()),
            ConnectionState::AckPending | ConnectionState::CemiConPending => {
                Err(KnxError::busy_state())
            }
            ConnectionState::Closed => Err(KnxError::closed()),
            ConnectionState::UnknownError => Err(KnxError::link_closed()),
        }
    }

    fn send_nonblocking(self: &Arc<Self>, service_type: u16, payload: Vec<u8>) -> Result<()> {
        let seq;
        {
            let mut shared = self.shared.lock();
            Self::check_sendable(shared.internal_state)?;
            seq = shared.seq_send;
            if !self.is_stream() {
                // ack outstanding; user state is left untouched
                shared.internal_state = ConnectionState::AckPending;
            }
        }
        self.fifo.lock().nonblocking += 1;

        let frame = DataRequest {
            service_type,
            header: ConnectionHeader::new(self.channel_id, seq),
            cemi: payload,
        }
        .build();
        let result = self.send_data(&frame);

        {
            let mut fifo = self.fifo.lock();
            fifo.nonblocking -= 1;
        }
        self.fifo_cond.notify_all();

        if let Err(e) = result {
            self.close_internal("send failed");
            return Err(e);
        }
        if self.is_stream() {
            self.shared.lock().seq_send = seq.wrapping_add(1);
        }
        Ok(())
    }

    fn send_blocking(
        self: &Arc<Self>,
        service_type: u16,
        payload: Vec<u8>,
        keep: Option<CemiLData>,
    ) -> Result<()> {
        let _permit = self.acquire_send_slot()?;
        let wait_for_con = keep.is_some();

        let seq;
        {
            let mut shared = self.shared.lock();
            // a non-blocking send may have left an acknowledgment pending
            let stale = Instant::now() + self.kind.response_timeout();
            while matches!(
                shared.internal_state,
                ConnectionState::AckPending | ConnectionState::CemiConPending
            ) {
                if self.cond.wait_until(&mut shared, stale).timed_out() {
                    // the outstanding ack of a non-blocking send got lost
                    shared.internal_state = ConnectionState::Ok;
                    break;
                }
            }
            Self::check_sendable(shared.internal_state)?;
            seq = shared.seq_send;
            shared.ack_error = None;
            shared.keep_for_con = keep;
            shared.internal_state = ConnectionState::AckPending;
            shared.user_state = ConnectionState::AckPending;
        }

        let frame = DataRequest {
            service_type,
            header: ConnectionHeader::new(self.channel_id, seq),
            cemi: payload,
        }
        .build();

        if self.is_stream() {
            if let Err(e) = self.send_data(&frame) {
                self.close_internal("send failed");
                return Err(e);
            }
            let mut shared = self.shared.lock();
            shared.seq_send = seq.wrapping_add(1);
            let next = if wait_for_con {
                ConnectionState::CemiConPending
            } else {
                ConnectionState::Ok
            };
            shared.internal_state = next;
            shared.user_state = next;
        } else {
            self.send_with_retry(&frame)?;
        }

        if wait_for_con {
            self.wait_for_confirmation()?;
        }
        Ok(())
    }

    /// Retransmit until acknowledged, up to `max_send_attempts`, each
    /// attempt waiting the kind's response timeout.
    fn send_with_retry(self: &Arc<Self>, frame: &[u8]) -> Result<()> {
        for _attempt in 0..self.cfg.max_send_attempts {
            if let Err(e) = self.send_data(frame) {
                self.close_internal("send failed");
                return Err(e);
            }

            let deadline = Instant::now() + self.kind.response_timeout();
            let mut shared = self.shared.lock();
            while shared.internal_state == ConnectionState::AckPending {
                if self.cond.wait_until(&mut shared, deadline).timed_out() {
                    break;
                }
            }
            match shared.internal_state {
                ConnectionState::AckPending => continue,
                ConnectionState::Closed => return Err(KnxError::closed()),
                ConnectionState::AckError => {
                    let code = shared.ack_error.unwrap_or(0);
                    shared.user_state = ConnectionState::AckError;
                    return Err(KnxError::remote_error(code));
                }
                _ => return Ok(()),
            }
        }

        warn!("no acknowledgment on channel {} after {} attempts", self.channel_id, self.cfg.max_send_attempts);
        self.close_internal("no service acknowledgment");
        Err(KnxError::ack_timeout())
    }

    /// Wait up to 3 s for the `L_Data.con` matching the kept frame.
    fn wait_for_confirmation(self: &Arc<Self>) -> Result<()> {
        let deadline = Instant::now() + CON_TIMEOUT;
        let mut shared = self.shared.lock();
        while shared.keep_for_con.is_some() {
            if shared.user_state == ConnectionState::Closed {
                return Err(KnxError::closed());
            }
            if self.cond.wait_until(&mut shared, deadline).timed_out() {
                shared.keep_for_con = None;
                shared.internal_state = ConnectionState::Ok;
                shared.user_state = ConnectionState::Ok;
                return Err(KnxError::timeout());
            }
        }
        if shared.user_state == ConnectionState::Closed {
            return Err(KnxError::closed());
        }
        Ok(())
    }

    /// Take a ticket in the fair send FIFO and wait for the turn.
    fn acquire_send_slot(self: &Arc<Self>) -> Result<SendPermit> {
        let ticket;
        {
            let mut fifo = self.fifo.lock();
            ticket = fifo.next_ticket;
            fifo.next_ticket += 1;
            while fifo.now_serving != ticket || fifo.nonblocking > 0 {
                if self.is_closed() {
                    // closed is absorbing: release the whole queue, every
                    // waiter fails the same way
                    fifo.now_serving = fifo.next_ticket;
                    self.fifo_cond.notify_all();
                    return Err(KnxError::closed());
                }
                self.fifo_cond.wait(&mut fifo);
            }
        }
        Ok(SendPermit { core: self.clone() })
    }

    /// Classify an inbound data-request sequence against `seq_rcv`.
    pub(crate) fn classify_recv_seq(&self, seq: u8) -> InboundSeq {
        let shared = self.shared.lock();
        let expected = shared.seq_rcv;
        if seq == expected {
            InboundSeq::Expected
        } else if seq == expected.wrapping_sub(1) {
            InboundSeq::Repeat
        } else if seq == expected.wrapping_add(1) {
            InboundSeq::Skipped
        } else {
            InboundSeq::Invalid
        }
    }

    /// Set `seq_rcv` to the successor of an accepted sequence.
    pub(crate) fn accept_recv_seq(&self, seq: u8) {
        self.shared.lock().seq_rcv = seq.wrapping_add(1);
    }

    /// Acknowledge an inbound data request.
    pub(crate) fn ack_inbound(&self, seq: u8) {
        let ack = match self.kind {
            ConnectionKind::Tunnel => ServiceAck::tunneling(self.channel_id, seq, E_NO_ERROR),
            ConnectionKind::DeviceMgmt => {
                ServiceAck::device_config(self.channel_id, seq, E_NO_ERROR)
            }
        };
        if let Err(e) = self.send_data(&ack.build()) {
            warn!("failed to acknowledge sequence {seq}: {e}");
        }
    }

    /// Correlate an `L_Data.con` with the kept frame of a blocking send.
    ///
    /// Returns true and wakes the sender when it matches. Listener
    /// delivery must happen before this call so the notification
    /// precedes the blocking send's return.
    pub(crate) fn match_confirmation(&self, con: &CemiLData) -> bool {
        let mut shared = self.shared.lock();
        let matches = shared
            .keep_for_con
            .as_ref()
            .is_some_and(|kept| kept.is_confirmation(con, self.cfg.server_assigns_source));
        if matches {
            if shared.internal_state == ConnectionState::AckPending {
                // the confirmation overtook (or replaced) the service ack
                shared.seq_send = shared.seq_send.wrapping_add(1);
            }
            shared.keep_for_con = None;
            shared.internal_state = ConnectionState::Ok;
            shared.user_state = ConnectionState::Ok;
            drop(shared);
            self.cond.notify_all();
        }
        matches
    }

    /// Handle one received frame; true if consumed.
    pub(crate) fn handle_frame(&self, header: &KnxnetIpHeader, body: &[u8]) -> bool {
        let Some(service) = header.service() else {
            debug!("ignoring unknown service type 0x{:04x}", header.service_type);
            return false;
        };

        if service == self.kind.ack_service() {
            return self.handle_ack(service, body);
        }
        match service {
            ServiceType::DisconnectRequest => self.handle_disconnect_request(body),
            ServiceType::DisconnectResponse => self.handle_disconnect_response(body),
            ServiceType::ConnectionstateResponse => self.handle_heartbeat_response(body),
            _ => {
                let handler = self.handler.read().clone();
                handler.is_some_and(|h| h.handle_service(self, service, body))
            }
        }
    }

    fn handle_ack(&self, service: ServiceType, body: &[u8]) -> bool {
        let Ok(ack) = ServiceAck::parse(service.to_u16(), body) else {
            debug!("dropping malformed service ack");
            return true;
        };
        if ack.header.channel_id != self.channel_id {
            return false;
        }

        let mut shared = self.shared.lock();
        if shared.internal_state != ConnectionState::AckPending
            || ack.header.sequence != shared.seq_send
        {
            debug!("ignoring unexpected ack, seq {}", ack.header.sequence);
            return true;
        }
        if ack.is_ok() {
            shared.seq_send = shared.seq_send.wrapping_add(1);
            let next = if shared.keep_for_con.is_some() {
                ConnectionState::CemiConPending
            } else {
                ConnectionState::Ok
            };
            shared.internal_state = next;
            if shared.user_state == ConnectionState::AckPending {
                shared.user_state = next;
            }
        } else {
            warn!("service ack with error status 0x{:02x}", ack.header.status);
            shared.ack_error = Some(ack.header.status);
            shared.internal_state = ConnectionState::AckError;
        }
        drop(shared);
        self.cond.notify_all();
        true
    }

    fn handle_disconnect_request(&self, body: &[u8]) -> bool {
        let Ok(request) = DisconnectRequest::parse(body) else {
            return true;
        };
        if request.channel_id != self.channel_id {
            return false;
        }
        let response = DisconnectResponse { channel_id: self.channel_id, status: E_NO_ERROR };
        let _ = self.send_control(&response.build());
        self.cleanup(CloseInitiator::Server, "server request");
        true
    }

    fn handle_disconnect_response(&self, body: &[u8]) -> bool {
        let Ok(response) = DisconnectResponse::parse(body) else {
            return true;
        };
        if response.channel_id != self.channel_id {
            return false;
        }
        self.shared.lock().disconnect_acked = true;
        self.cond.notify_all();
        true
    }

    fn handle_heartbeat_response(&self, body: &[u8]) -> bool {
        let Ok(response) = ConnectionStateResponse::parse(body) else {
            return true;
        };
        if response.channel_id != self.channel_id {
            return false;
        }
        self.shared.lock().heartbeat_status = Some(response.status);
        self.cond.notify_all();
        true
    }

    /// Graceful close initiated by the user.
    pub(crate) fn close(&self) {
        self.disconnect_and_cleanup(CloseInitiator::User, "user request");
    }

    /// Immediate close on a server-initiated condition (e.g. a reset
    /// indication); skips the disconnect exchange.
    pub(crate) fn close_server(&self, reason: &str) {
        self.cleanup(CloseInitiator::Server, reason);
    }

    fn close_internal(&self, reason: &str) {
        self.disconnect_and_cleanup(CloseInitiator::Internal, reason);
    }

    fn disconnect_and_cleanup(&self, initiator: CloseInitiator, reason: &str) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let request = DisconnectRequest::new(self.channel_id, self.local_hpai).build();
        if self.send_control(&request).is_ok() {
            let deadline = Instant::now() + DISCONNECT_TIMEOUT;
            let mut shared = self.shared.lock();
            while !shared.disconnect_acked {
                if self.cond.wait_until(&mut shared, deadline).timed_out() {
                    debug!("no disconnect response on channel {}", self.channel_id);
                    break;
                }
            }
        }
        self.finish_cleanup(initiator, reason);
    }

    /// Unconditional teardown without the disconnect exchange.
    fn cleanup(&self, initiator: CloseInitiator, reason: &str) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.finish_cleanup(initiator, reason);
    }

    fn finish_cleanup(&self, initiator: CloseInitiator, reason: &str) {
        {
            let mut shared = self.shared.lock();
            shared.user_state = ConnectionState::Closed;
            shared.internal_state = ConnectionState::Closed;
            shared.keep_for_con = None;
        }
        self.cond.notify_all();
        self.fifo_cond.notify_all();

        if let Transport::Stream(stream) = &self.transport {
            stream.detach_channel(self.channel_id);
        }
        if let Some(handler) = self.handler.write().take() {
            handler.closed();
        }
        let listeners: Vec<_> = self.listeners.lock().drain(..).collect();
        for listener in listeners {
            listener.connection_closed(initiator, reason);
        }
        info!("{} connection channel {} closed ({reason})", self.kind.name(), self.channel_id);
    }
}

impl FrameSink for ConnectionCore {
    fn handle_frame(&self, header: &KnxnetIpHeader, body: &[u8]) -> bool {
        ConnectionCore::handle_frame(self, header, body)
    }

    fn transport_closed(&self) {
        self.cleanup(CloseInitiator::Internal, "stream closed");
    }
}

/// RAII guard releasing the fair send FIFO.
struct SendPermit {
    core: Arc<ConnectionCore>,
}

impl Drop for SendPermit {
    fn drop(&mut self) {
        let mut fifo = self.core.fifo.lock();
        fifo.now_serving += 1;
        drop(fifo);
        self.core.fifo_cond.notify_all();
    }
}

impl Shared {
    fn new() -> Self {
        Self {
            user_state: ConnectionState::Ok,
            internal_state: ConnectionState::Ok,
            seq_send: 0,
            seq_rcv: 0,
            keep_for_con: None,
            ack_error: None,
            heartbeat_status: None,
            disconnect_acked: false,
        }
    }
}

fn wait_connect_response(socket: &UdpSocket) -> Result<ConnectResponse> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    let mut buf = [0u8; 512];
    while Instant::now() < deadline {
        let (len, _) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => return Err(e.into()),
        };
        let Ok(header) = KnxnetIpHeader::parse(&buf[..len]) else {
            continue;
        };
        if header.service() == Some(ServiceType::ConnectResponse) {
            return ConnectResponse::parse(&buf[KnxnetIpHeader::SIZE..len]);
        }
        debug!("ignoring {:?} while connecting", header.service());
    }
    Err(KnxError::timeout())
}

/// Receiver worker for UDP connections.
///
/// Every received frame is either dispatched exactly once through
/// [`ConnectionCore::handle_frame`] or deliberately dropped with a log
/// entry. The worker quits when the connection is dropped or closed.
fn udp_receiver(socket: &UdpSocket, weak: &Weak<ConnectionCore>) {
    let mut buf = [0u8; 512];
    loop {
        let Some(core) = weak.upgrade() else {
            return;
        };
        if core.is_closed() {
            return;
        }

        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(_) => {
                core.cleanup(CloseInitiator::Internal, "receive failed");
                return;
            }
        };

        // a datagram may carry several frames back to back
        let mut offset = 0;
        while offset + KnxnetIpHeader::SIZE <= len {
            let header = match KnxnetIpHeader::parse(&buf[offset..len]) {
                Ok(h) => h,
                Err(e) => {
                    debug!("dropping malformed datagram from {from}: {e}");
                    break;
                }
            };
            let total = header.total_length as usize;
            if offset + total > len {
                debug!("dropping truncated frame from {from}");
                break;
            }
            let body = &buf[offset + KnxnetIpHeader::SIZE..offset + total];
            if header.service_type == 0 {
                // zero service type frames are ignored
            } else if !core.handle_frame(&header, body) {
                debug!("dropping unhandled frame 0x{:04x} from {from}", header.service_type);
            }
            offset += total;
        }
    }
}

/// Heartbeat worker: every 60 s a CONNECTIONSTATE_REQUEST, up to 4
/// attempts with a 10 s response wait each; exhaustion closes the
/// connection.
fn heartbeat_loop(weak: &Weak<ConnectionCore>) {
    loop {
        // interval wait, interruptible by close
        let deadline = Instant::now() + HEARTBEAT_INTERVAL;
        loop {
            let Some(core) = weak.upgrade() else {
                return;
            };
            if core.is_closed() {
                return;
            }
            let mut shared = core.shared.lock();
            if core.cond.wait_until(&mut shared, deadline).timed_out() {
                break;
            }
        }

        let Some(core) = weak.upgrade() else {
            return;
        };
        let request =
            ConnectionStateRequest::new(core.channel_id, core.local_hpai).build();

        let mut responded = false;
        for attempt in 0..HEARTBEAT_ATTEMPTS {
            if core.is_closed() {
                return;
            }
            core.shared.lock().heartbeat_status = None;
            if let Err(e) = core.send_control(&request) {
                warn!("heartbeat send failed: {e}");
                break;
            }

            let deadline = Instant::now() + HEARTBEAT_WAIT;
            let mut shared = core.shared.lock();
            while shared.heartbeat_status.is_none() && !core.is_closed() {
                if core.cond.wait_until(&mut shared, deadline).timed_out() {
                    break;
                }
            }
            if let Some(status) = shared.heartbeat_status {
                if status != E_NO_ERROR {
                    warn!("connection state response status 0x{status:02x}");
                }
                responded = true;
                break;
            }
            drop(shared);
            debug!("no connection state response, attempt {}", attempt + 1);
            thread::sleep(HEARTBEAT_RETRY_DELAY);
        }

        if !responded && !core.is_closed() {
            core.cleanup(CloseInitiator::Internal, "no heartbeat response");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parameters() {
        assert_eq!(ConnectionKind::Tunnel.response_timeout(), Duration::from_secs(1));
        assert_eq!(ConnectionKind::DeviceMgmt.response_timeout(), Duration::from_secs(4));
        assert_eq!(ConnectionKind::Tunnel.ack_service(), ServiceType::TunnelingAck);
        assert_eq!(
            ConnectionKind::DeviceMgmt.request_service(),
            ServiceType::DeviceConfigurationRequest
        );
    }

    #[test]
    fn test_sendable_states() {
        assert!(ConnectionCore::check_sendable(ConnectionState::Ok).is_ok());
        assert!(ConnectionCore::check_sendable(ConnectionState::AckError).is_ok());
        assert!(matches!(
            ConnectionCore::check_sendable(ConnectionState::AckPending),
            Err(KnxError::BusyState)
        ));
        assert!(matches!(
            ConnectionCore::check_sendable(ConnectionState::Closed),
            Err(KnxError::Closed)
        ));
        assert!(matches!(
            ConnectionCore::check_sendable(ConnectionState::UnknownError),
            Err(KnxError::LinkClosed)
        ));
    }
}
