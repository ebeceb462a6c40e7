//! KNX IP Routing: unconfirmed multicast distribution of cEMI frames.
//!
//! One multicast socket is bound to the routing group; if the group
//! differs from the system setup multicast (224.0.23.12), a second
//! socket joins the setup group for system broadcasts and searches.
//!
//! Routing is unconfirmed, so flow control is cooperative:
//!
//! - at most 50 datagrams leave in any sliding 1-second window, with
//!   5 ms minimum spacing,
//! - `ROUTING_BUSY` notifications pause sending for the announced wait
//!   time plus a random backoff scaled by the busy counter, and throttle
//!   sends for `busy_counter × 100 ms` beyond that,
//! - our own multicast echo is suppressed through a bounded FIFO of
//!   recently sent frames (exact byte match, capacity 20).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use heapless::Deque;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;

use crate::error::{KnxError, Result};
use crate::protocol::cemi::{Cemi, CemiLData};
use crate::protocol::constants::{
    ServiceType, KNXNETIP_DEFAULT_PORT, SERVICE_ROUTING_SYSTEM_BROADCAST, SYSTEM_SETUP_MULTICAST,
};
use crate::protocol::frame::KnxnetIpHeader;
use crate::protocol::services::{RoutingBusy, RoutingIndication, RoutingLostMessage};
use crate::net::udp;

/// Maximum datagrams per sliding 1-second window
const MAX_DATAGRAMS_PER_SECOND: usize = 50;

/// Minimum spacing between consecutive datagrams
const MIN_SEND_SPACING: Duration = Duration::from_millis(5);

/// Capacity of the loopback suppression buffer
const LOOPBACK_CAPACITY: usize = 20;

/// Minimum spacing between counted routing-busy notifications
const BUSY_COUNT_SPACING: Duration = Duration::from_millis(10);

/// Period of the busy counter decrement task
const BUSY_DECREMENT_PERIOD: Duration = Duration::from_millis(5);

/// Receiver poll granularity
const RECV_POLL: Duration = Duration::from_millis(250);

/// Callbacks of a routing connection.
pub trait RoutingListener: Send + Sync {
    /// A routing indication arrived (loopback already suppressed)
    fn indication(&self, frame: &Cemi) {
        let _ = frame;
    }

    /// A router reported lost routing indications
    fn lost_message(&self, notice: &RoutingLostMessage) {
        let _ = notice;
    }

    /// The local send rate hit the datagram limit
    fn rate_limit_reached(&self) {}

    /// The routing connection was shut down
    fn closed(&self) {}
}

/// Hook interposed between the routing logic and the wire, used by
/// secure routing to wrap and unwrap frames.
pub(crate) trait RoutingInterceptor: Send + Sync {
    /// Transform an outgoing frame before it is sent
    fn wrap_outgoing(&self, frame: Vec<u8>) -> Result<Vec<u8>>;

    /// Process an incoming frame. Return the plain frame to continue
    /// normal routing processing with, or `None` when consumed.
    fn unwrap_incoming(
        &self,
        header: &KnxnetIpHeader,
        body: &[u8],
        source: SocketAddrV4,
    ) -> Option<Vec<u8>>;
}

/// Cooperative flow control state driven by `ROUTING_BUSY`.
struct FlowControl {
    busy_counter: u32,
    last_counted: Option<Instant>,
    current_wait_until: Instant,
    pause_sending_until: Instant,
    throttle_until: Instant,
    decrementer_running: bool,
    /// Departure times of the datagrams inside the sliding 1-second
    /// window; full means the send rate is exhausted
    sent_times: Deque<Instant, MAX_DATAGRAMS_PER_SECOND>,
    last_send: Option<Instant>,
}

impl FlowControl {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            busy_counter: 0,
            last_counted: None,
            current_wait_until: now,
            pause_sending_until: now,
            throttle_until: now,
            decrementer_running: false,
            sent_times: Deque::new(),
            last_send: None,
        }
    }
}

struct RoutingInner {
    socket: UdpSocket,
    group: SocketAddrV4,
    /// Extra socket joined to the system setup group, when the routing
    /// group differs from it
    sysbcast_socket: Option<UdpSocket>,
    /// Addresses considered our own when filtering busy notifications
    local_addresses: Vec<Ipv4Addr>,
    flow: Mutex<FlowControl>,
    loopback: Mutex<Deque<Vec<u8>, LOOPBACK_CAPACITY>>,
    listeners: Mutex<Vec<Arc<dyn RoutingListener>>>,
    interceptor: Mutex<Option<Arc<dyn RoutingInterceptor>>>,
    closing: AtomicBool,
}

/// KNX IP Routing connection.
///
/// # Examples
///
/// ```rust,no_run
/// use knx_netip::routing::RoutingConnection;
/// use std::net::Ipv4Addr;
///
/// let routing = RoutingConnection::open(Ipv4Addr::new(224, 0, 23, 12), Ipv4Addr::UNSPECIFIED)?;
/// # let frame: knx_netip::protocol::cemi::CemiLData = unimplemented!();
/// routing.send(&frame)?;
/// routing.close();
/// # Ok::<(), knx_netip::KnxError>(())
/// ```
#[derive(Clone)]
pub struct RoutingConnection {
    inner: Arc<RoutingInner>,
}

impl std::fmt::Debug for RoutingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingConnection").field("group", &self.inner.group).finish()
    }
}

impl RoutingConnection {
    /// Join the routing group on the given local interface and start the
    /// receiver workers.
    ///
    /// The routing multicast address must be 224.0.23.12 or above.
    pub fn open(group: Ipv4Addr, interface: Ipv4Addr) -> Result<Self> {
        Self::open_intercepted(group, interface, None)
    }

    pub(crate) fn open_intercepted(
        group: Ipv4Addr,
        interface: Ipv4Addr,
        interceptor: Option<Arc<dyn RoutingInterceptor>>,
    ) -> Result<Self> {
        if !group.is_multicast() || group.octets() < SYSTEM_SETUP_MULTICAST {
            return Err(KnxError::illegal_argument("routing multicast >= 224.0.23.12"));
        }

        let socket = udp::bind_multicast(group, KNXNETIP_DEFAULT_PORT, interface)?;
        udp::set_poll_interval(&socket, RECV_POLL)?;

        let setup_group: Ipv4Addr = SYSTEM_SETUP_MULTICAST.into();
        let sysbcast_socket = if group == setup_group {
            None
        } else {
            let s = udp::bind_multicast(setup_group, KNXNETIP_DEFAULT_PORT, interface)?;
            udp::set_poll_interval(&s, RECV_POLL)?;
            Some(s)
        };

        let mut local_addresses = vec![Ipv4Addr::LOCALHOST];
        if !interface.is_unspecified() {
            local_addresses.push(interface);
        }

        let inner = Arc::new(RoutingInner {
            socket,
            group: SocketAddrV4::new(group, KNXNETIP_DEFAULT_PORT),
            sysbcast_socket,
            local_addresses,
            flow: Mutex::new(FlowControl::new()),
            loopback: Mutex::new(Deque::new()),
            listeners: Mutex::new(Vec::new()),
            interceptor: Mutex::new(interceptor),
            closing: AtomicBool::new(false),
        });
        info!("joined routing group {group}");

        let recv_socket = inner.socket.try_clone()?;
        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name(format!("knx-routing {group}"))
            .spawn(move || receiver_loop(&recv_socket, &weak, false))
            .map_err(KnxError::Io)?;

        if let Some(sys) = &inner.sysbcast_socket {
            let recv_socket = sys.try_clone()?;
            let weak = Arc::downgrade(&inner);
            thread::Builder::new()
                .name("knx-routing sysbcast".into())
                .spawn(move || receiver_loop(&recv_socket, &weak, true))
                .map_err(KnxError::Io)?;
        }
        Ok(Self { inner })
    }

    /// Register a routing listener
    pub fn add_listener(&self, listener: Arc<dyn RoutingListener>) {
        self.inner.listeners.lock().push(listener);
    }

    /// Remove a previously registered listener
    pub fn remove_listener(&self, listener: &Arc<dyn RoutingListener>) {
        self.inner.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Send a cEMI frame as a routing indication.
    ///
    /// IP system broadcast frames bypass flow control and leave
    /// unencrypted on the system broadcast channel; everything else is
    /// paced by the busy/rate limits and recorded for loopback
    /// suppression.
    pub fn send(&self, frame: &CemiLData) -> Result<()> {
        if self.inner.closing.load(Ordering::Acquire) {
            return Err(KnxError::closed());
        }
        let cemi = frame.to_vec();

        if frame.ctrl1.is_system_broadcast() {
            let wire = RoutingIndication { cemi }.build_system_broadcast();
            let socket = self.inner.sysbcast_socket.as_ref().unwrap_or(&self.inner.socket);
            let target = SocketAddrV4::new(SYSTEM_SETUP_MULTICAST.into(), KNXNETIP_DEFAULT_PORT);
            socket.send_to(&wire, target)?;
            return Ok(());
        }

        self.pause_on_busy();
        self.enforce_rate_limit();

        // record before sending so the kernel echo always finds its entry
        {
            let mut loopback = self.inner.loopback.lock();
            if loopback.is_full() {
                loopback.pop_front();
            }
            let _ = loopback.push_back(cemi.clone());
        }

        let mut wire = RoutingIndication { cemi }.build();
        if let Some(interceptor) = self.inner.interceptor.lock().clone() {
            wire = interceptor.wrap_outgoing(wire)?;
        }
        self.inner.socket.send_to(&wire, self.inner.group)?;
        Ok(())
    }

    /// Send a pre-built KNXnet/IP frame on the routing group, subject to
    /// wrapping but not to loopback recording. Used for group syncs and
    /// busy notifications.
    pub(crate) fn send_raw(&self, frame: &[u8], wrap: bool) -> Result<()> {
        let wire = if wrap {
            match self.inner.interceptor.lock().clone() {
                Some(interceptor) => interceptor.wrap_outgoing(frame.to_vec())?,
                None => frame.to_vec(),
            }
        } else {
            frame.to_vec()
        };
        self.inner.socket.send_to(&wire, self.inner.group)?;
        Ok(())
    }

    /// Sleep while routers ask us to pause.
    fn pause_on_busy(&self) {
        loop {
            let (pause_until, throttle_until, busy) = {
                let flow = self.inner.flow.lock();
                (flow.pause_sending_until, flow.throttle_until, flow.busy_counter)
            };
            if busy == 0 {
                return;
            }
            let now = Instant::now();
            if now < pause_until {
                thread::sleep(pause_until - now);
                continue;
            }
            if now < throttle_until {
                thread::sleep(MIN_SEND_SPACING);
                continue;
            }
            return;
        }
    }

    /// Enforce at most 50 datagrams in any sliding 1-second window, with
    /// 5 ms spacing between consecutive datagrams.
    ///
    /// The window slides with real time: a datagram departs only once
    /// fewer than 50 departures lie within the last 1000 ms.
    fn enforce_rate_limit(&self) {
        let mut fire_event = false;
        loop {
            let sleep_for = {
                let mut flow = self.inner.flow.lock();
                let now = Instant::now();
                while flow
                    .sent_times
                    .front()
                    .map_or(false, |&sent| now.duration_since(sent) >= Duration::from_secs(1))
                {
                    flow.sent_times.pop_front();
                }
                if flow.sent_times.is_full() {
                    // the window frees up when its oldest departure ages out
                    fire_event = true;
                    let oldest = *flow.sent_times.front().unwrap();
                    Some(Duration::from_secs(1) - now.duration_since(oldest))
                } else if let Some(last) =
                    flow.last_send.filter(|last| now.duration_since(*last) < MIN_SEND_SPACING)
                {
                    Some(MIN_SEND_SPACING - now.duration_since(last))
                } else {
                    let _ = flow.sent_times.push_back(now);
                    flow.last_send = Some(now);
                    None
                }
            };
            match sleep_for {
                Some(d) => thread::sleep(d),
                None => break,
            }
        }
        if fire_event {
            debug!("routing send rate reached {MAX_DATAGRAMS_PER_SECOND}/s");
            for listener in self.inner.listeners.lock().clone() {
                listener.rate_limit_reached();
            }
        }
    }

    /// Leave the multicast groups and stop the receiver workers.
    pub fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        for listener in self.inner.listeners.lock().drain(..) {
            listener.closed();
        }
        info!("left routing group {}", self.inner.group.ip());
    }
}

impl RoutingInner {
    fn notify_indication(&self, cemi_bytes: &[u8]) {
        // suppress the echo of our own send: exact serialized bytes
        {
            let mut loopback = self.loopback.lock();
            if let Some(pos) = loopback.iter().position(|sent| sent == cemi_bytes) {
                // drop the matched entry and everything older
                for _ in 0..=pos {
                    loopback.pop_front();
                }
                return;
            }
        }
        match Cemi::parse(cemi_bytes) {
            Ok(cemi) => {
                for listener in self.listeners.lock().clone() {
                    listener.indication(&cemi);
                }
            }
            Err(e) => debug!("dropping undecodable routing indication: {e}"),
        }
    }

    fn handle_busy(self: &Arc<Self>, busy: &RoutingBusy, source: SocketAddrV4) {
        // our own busy notification is not flow-controlled
        if self.local_addresses.contains(source.ip()) {
            return;
        }

        let now = Instant::now();
        let end_of_wait = now + Duration::from_millis(u64::from(busy.wait_time_ms));
        let mut flow = self.flow.lock();
        if end_of_wait > flow.current_wait_until {
            flow.current_wait_until = end_of_wait;
        }
        if flow.last_counted.map_or(true, |last| now.duration_since(last) >= BUSY_COUNT_SPACING) {
            flow.busy_counter += 1;
            flow.last_counted = Some(now);
        }
        let random_wait_ms = rand::thread_rng().gen::<f64>() * f64::from(flow.busy_counter) * 50.0;
        flow.pause_sending_until =
            flow.current_wait_until + Duration::from_millis(random_wait_ms as u64);
        flow.throttle_until =
            flow.pause_sending_until + Duration::from_millis(u64::from(flow.busy_counter) * 100);
        debug!(
            "routing busy from {source}: wait {} ms, busy counter {}",
            busy.wait_time_ms, flow.busy_counter
        );

        if !flow.decrementer_running {
            flow.decrementer_running = true;
            let weak = Arc::downgrade(self);
            let _ = thread::Builder::new()
                .name("knx-busy-decrement".into())
                .spawn(move || busy_decrementer(&weak));
        }
    }
}

/// Recurring task decrementing the busy counter once the throttle window
/// passed, until it reaches zero.
fn busy_decrementer(weak: &Weak<RoutingInner>) {
    loop {
        thread::sleep(BUSY_DECREMENT_PERIOD);
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.closing.load(Ordering::Acquire) {
            return;
        }
        let mut flow = inner.flow.lock();
        if Instant::now() < flow.throttle_until {
            continue;
        }
        flow.busy_counter = flow.busy_counter.saturating_sub(1);
        if flow.busy_counter == 0 {
            flow.decrementer_running = false;
            return;
        }
    }
}

fn receiver_loop(socket: &UdpSocket, weak: &Weak<RoutingInner>, system_broadcast: bool) {
    let mut buf = [0u8; 512];
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.closing.load(Ordering::Acquire) {
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
            Err(e) => {
                warn!("routing receive failed: {e}");
                return;
            }
        };
        let SocketAddr::V4(source) = from else {
            continue;
        };

        let Ok(header) = KnxnetIpHeader::parse(&buf[..len]) else {
            debug!("dropping malformed routing datagram from {source}");
            continue;
        };
        if len < header.total_length as usize {
            debug!("dropping truncated routing frame from {source}");
            continue;
        }
        let mut body = buf[KnxnetIpHeader::SIZE..header.total_length as usize].to_vec();
        let mut service_type = header.service_type;

        // secure routing interposes unwrapping before normal processing;
        // the system broadcast channel always stays plain
        if !system_broadcast {
            if let Some(interceptor) = inner.interceptor.lock().clone() {
                match interceptor.unwrap_incoming(&header, &body, source) {
                    Some(plain) => {
                        let Ok(plain_header) = KnxnetIpHeader::parse(&plain) else {
                            continue;
                        };
                        service_type = plain_header.service_type;
                        body = plain[KnxnetIpHeader::SIZE..].to_vec();
                    }
                    None => continue,
                }
            }
        }

        match ServiceType::from_u16(service_type) {
            Some(ServiceType::RoutingIndication) => inner.notify_indication(&body),
            Some(ServiceType::SecureWrapper)
                if system_broadcast && service_type == SERVICE_ROUTING_SYSTEM_BROADCAST =>
            {
                // plain system broadcast on the setup channel
                inner.notify_indication(&body);
            }
            Some(ServiceType::RoutingLostMessage) => {
                if let Ok(lost) = RoutingLostMessage::parse(&body) {
                    warn!("router {source} lost {} messages", lost.lost_messages);
                    for listener in inner.listeners.lock().clone() {
                        listener.lost_message(&lost);
                    }
                }
            }
            Some(ServiceType::RoutingBusy) => {
                if let Ok(busy) = RoutingBusy::parse(&body) {
                    inner.handle_busy(&busy, source);
                }
            }
            Some(other) => debug!("ignoring {other:?} on routing group"),
            None => debug!("ignoring unknown service 0x{service_type:04x} on routing group"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::{GroupAddress, IndividualAddress};
    use crate::protocol::cemi::KnxAddress;
    use crate::protocol::constants::{CEMIMessageCode, Priority};

    fn inner_for_test() -> Arc<RoutingInner> {
        Arc::new(RoutingInner {
            socket: UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap(),
            group: SocketAddrV4::new(Ipv4Addr::new(224, 0, 23, 12), KNXNETIP_DEFAULT_PORT),
            sysbcast_socket: None,
            local_addresses: vec![Ipv4Addr::LOCALHOST],
            flow: Mutex::new(FlowControl::new()),
            loopback: Mutex::new(Deque::new()),
            listeners: Mutex::new(Vec::new()),
            interceptor: Mutex::new(None),
            closing: AtomicBool::new(false),
        })
    }

    fn test_frame(sub: u8) -> CemiLData {
        CemiLData::new(
            CEMIMessageCode::LDataInd,
            IndividualAddress::new(1, 1, 1).unwrap(),
            KnxAddress::Group(GroupAddress::new(1, 2, sub).unwrap()),
            vec![0x00, 0x81],
            Priority::Normal,
        )
    }

    struct CountingListener(Mutex<u32>);
    impl RoutingListener for CountingListener {
        fn indication(&self, _frame: &Cemi) {
            *self.0.lock() += 1;
        }
    }

    #[test]
    fn test_loopback_suppression() {
        let inner = inner_for_test();
        let listener = Arc::new(CountingListener(Mutex::new(0)));
        inner.listeners.lock().push(listener.clone());

        let sent = test_frame(1).to_vec();
        inner.loopback.lock().push_back(sent.clone()).unwrap();

        // the echo is suppressed
        inner.notify_indication(&sent);
        assert_eq!(*listener.0.lock(), 0);
        assert!(inner.loopback.lock().is_empty());

        // a second identical indication is delivered
        inner.notify_indication(&sent);
        assert_eq!(*listener.0.lock(), 1);
    }

    #[test]
    fn test_loopback_capacity_drops_oldest() {
        let inner = inner_for_test();
        for i in 0..=LOOPBACK_CAPACITY as u8 {
            let frame = test_frame(i).to_vec();
            let mut loopback = inner.loopback.lock();
            if loopback.is_full() {
                loopback.pop_front();
            }
            loopback.push_back(frame).unwrap();
        }
        let loopback = inner.loopback.lock();
        assert_eq!(loopback.len(), LOOPBACK_CAPACITY);
        // frame 0 was dropped
        assert!(loopback.iter().all(|f| f != &test_frame(0).to_vec()));
    }

    #[test]
    fn test_busy_from_local_interface_ignored() {
        let inner = inner_for_test();
        let busy = RoutingBusy { device_state: 0, wait_time_ms: 100, control: 0 };
        inner.handle_busy(&busy, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 3671));
        assert_eq!(inner.flow.lock().busy_counter, 0);
    }

    #[test]
    fn test_busy_updates_flow_state() {
        let inner = inner_for_test();
        let busy = RoutingBusy { device_state: 0, wait_time_ms: 100, control: 0 };
        let peer = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 50), 3671);
        let before = Instant::now();
        inner.handle_busy(&busy, peer);

        let flow = inner.flow.lock();
        assert_eq!(flow.busy_counter, 1);
        // wait end at least 100 ms out
        assert!(flow.current_wait_until >= before + Duration::from_millis(100));
        // random wait in [0, busy_counter * 50 ms]
        assert!(flow.pause_sending_until >= flow.current_wait_until);
        assert!(flow.pause_sending_until <= flow.current_wait_until + Duration::from_millis(50));
        // throttle 100 ms per busy count past the pause
        assert_eq!(flow.throttle_until, flow.pause_sending_until + Duration::from_millis(100));
    }

    #[test]
    fn test_busy_counts_spaced_by_10ms() {
        let inner = inner_for_test();
        let busy = RoutingBusy { device_state: 0, wait_time_ms: 20, control: 0 };
        let peer = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 50), 3671);
        inner.handle_busy(&busy, peer);
        // immediate second notification is not counted again
        inner.handle_busy(&busy, peer);
        assert_eq!(inner.flow.lock().busy_counter, 1);

        thread::sleep(Duration::from_millis(15));
        inner.handle_busy(&busy, peer);
        assert_eq!(inner.flow.lock().busy_counter, 2);
    }

    #[test]
    fn test_rate_limit_spacing() {
        let conn = RoutingConnection { inner: inner_for_test() };
        let start = Instant::now();
        for _ in 0..10 {
            conn.enforce_rate_limit();
        }
        // 10 sends at 5 ms spacing take at least 45 ms
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert_eq!(conn.inner.flow.lock().sent_times.len(), 10);
    }

    #[test]
    fn test_rate_limit_window_slides() {
        let conn = RoutingConnection { inner: inner_for_test() };

        struct RateEvents(Mutex<u32>);
        impl RoutingListener for RateEvents {
            fn rate_limit_reached(&self) {
                *self.0.lock() += 1;
            }
        }
        let events = Arc::new(RateEvents(Mutex::new(0)));
        conn.add_listener(events.clone());

        // a full burst of departures still inside the last second: the
        // next send must wait until the oldest one ages out, even though
        // a tumbling window would already have reset
        let burst = Instant::now() - Duration::from_millis(980);
        {
            let mut flow = conn.inner.flow.lock();
            for _ in 0..MAX_DATAGRAMS_PER_SECOND {
                flow.sent_times.push_back(burst).unwrap();
            }
        }

        let start = Instant::now();
        conn.enforce_rate_limit();
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert_eq!(*events.0.lock(), 1);

        let flow = conn.inner.flow.lock();
        assert!(flow.sent_times.len() <= MAX_DATAGRAMS_PER_SECOND);
        // every recorded departure lies within the sliding window
        let now = Instant::now();
        assert!(flow
            .sent_times
            .iter()
            .all(|&sent| now.duration_since(sent) < Duration::from_secs(1)));
    }

    #[test]
    fn test_group_address_validation() {
        assert!(RoutingConnection::open(Ipv4Addr::new(224, 0, 23, 11), Ipv4Addr::UNSPECIFIED)
            .is_err());
        assert!(RoutingConnection::open(Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::UNSPECIFIED)
            .is_err());
    }
}
