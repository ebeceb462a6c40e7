//! Stream connection for KNXnet/IP over TCP or Unix-domain sockets.
//!
//! A stream connection owns a single byte-stream socket. Transmit bytes
//! are serialized through one lock; a dedicated receiver thread
//! reassembles KNXnet/IP frames by the header total-length and dispatches
//! each frame exactly once:
//!
//! - secure envelopes go to the secure session registered for the
//!   session id,
//! - plain response frames go to the first waiter of an ongoing
//!   connect-style request (FIFO),
//! - everything else goes to the unsecured connection registered for the
//!   frame's channel id.
//!
//! Frames that match none of these are logged and dropped.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddrV4, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
#[cfg(unix)]
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{KnxError, Result};
use crate::net::EndpointAddress;
use crate::protocol::constants::ServiceType;
use crate::protocol::frame::KnxnetIpHeader;

/// Time allowed for establishing the TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Receiver of dispatched frames (a connection or a secure session).
pub(crate) trait FrameSink: Send + Sync {
    /// Offer a frame; return true if the sink consumed it
    fn handle_frame(&self, header: &KnxnetIpHeader, body: &[u8]) -> bool;

    /// The underlying transport is gone
    fn transport_closed(&self);
}

/// Frame-oriented transport a client connection can run on: a plain
/// stream connection, or a secure session interposing its envelope.
pub(crate) trait FrameTransport: Send + Sync {
    /// Send a complete KNXnet/IP frame
    fn send_frame(&self, frame: &[u8]) -> Result<()>;

    /// Send a request frame and wait for the next plain response frame
    fn request_frame(&self, frame: &[u8], timeout: Duration) -> Result<Vec<u8>>;

    /// Attach the connection serving a channel id
    fn attach_channel(&self, channel_id: u8, sink: Arc<dyn FrameSink>);

    /// Detach a channel
    fn detach_channel(&self, channel_id: u8);
}

impl FrameTransport for StreamConnection {
    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        self.send(frame)
    }

    fn request_frame(&self, frame: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        self.request(frame, timeout)
    }

    fn attach_channel(&self, channel_id: u8, sink: Arc<dyn FrameSink>) {
        self.register_channel(channel_id, sink);
    }

    fn detach_channel(&self, channel_id: u8) {
        self.unregister_channel(channel_id);
    }
}

enum StreamSocket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Uds(UnixStream),
}

impl StreamSocket {
    fn try_clone(&self) -> std::io::Result<Self> {
        match self {
            Self::Tcp(s) => s.try_clone().map(Self::Tcp),
            #[cfg(unix)]
            Self::Uds(s) => s.try_clone().map(Self::Uds),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.write_all(data),
            #[cfg(unix)]
            Self::Uds(s) => s.write_all(data),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Self::Uds(s) => s.read(buf),
        }
    }

    fn shutdown(&self) {
        match self {
            Self::Tcp(s) => {
                let _ = s.shutdown(Shutdown::Both);
            }
            #[cfg(unix)]
            Self::Uds(s) => {
                let _ = s.shutdown(Shutdown::Both);
            }
        }
    }
}

struct Waiter {
    id: u64,
    sender: mpsc::Sender<Vec<u8>>,
}

struct StreamInner {
    remote: EndpointAddress,
    socket: Mutex<StreamSocket>,
    open: AtomicBool,
    waiter_ids: AtomicU64,
    /// FIFO of one-shot request waiters for plain response frames
    waiters: Mutex<VecDeque<Waiter>>,
    /// Unsecured connections by channel id
    channels: Mutex<HashMap<u8, Arc<dyn FrameSink>>>,
    /// Secure sessions by session id
    sessions: Mutex<HashMap<u16, Arc<dyn FrameSink>>>,
}

/// Connection over a byte-stream transport, shared by the plain and
/// secure connection types built on top of it.
#[derive(Clone)]
pub struct StreamConnection {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("remote", &self.inner.remote)
            .field("open", &self.inner.open.load(Ordering::Relaxed))
            .finish()
    }
}

impl StreamConnection {
    /// Open a TCP stream connection to a KNXnet/IP server.
    pub fn connect_tcp(server: SocketAddrV4) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&server.into(), CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        Self::start(StreamSocket::Tcp(stream), EndpointAddress::Tcp(server))
    }

    /// Open a Unix-domain stream connection to a KNXnet/IP server.
    #[cfg(unix)]
    pub fn connect_uds(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref())?;
        Self::start(StreamSocket::Uds(stream), EndpointAddress::uds(path.as_ref()))
    }

    fn start(socket: StreamSocket, remote: EndpointAddress) -> Result<Self> {
        let reader = socket.try_clone()?;
        let inner = Arc::new(StreamInner {
            remote,
            socket: Mutex::new(socket),
            open: AtomicBool::new(true),
            waiter_ids: AtomicU64::new(0),
            waiters: Mutex::new(VecDeque::new()),
            channels: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name(format!("knx-stream {}", inner.remote))
            .spawn(move || receiver_loop(reader, &weak))
            .map_err(KnxError::Io)?;

        Ok(Self { inner })
    }

    /// The remote endpoint of this connection
    pub fn remote(&self) -> &EndpointAddress {
        &self.inner.remote
    }

    /// Check if the stream is still usable
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Send a complete KNXnet/IP frame; bytes of concurrent senders do
    /// not interleave.
    pub fn send(&self, frame: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(KnxError::closed());
        }
        let mut socket = self.inner.socket.lock();
        socket.write_all(frame).map_err(|e| {
            self.shutdown();
            KnxError::Io(e)
        })
    }

    /// Send a request frame and wait for the next plain response frame.
    ///
    /// Waiters queue in FIFO order, so concurrent connect-style requests
    /// receive their responses in send order.
    pub fn request(&self, frame: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let (tx, rx) = mpsc::channel();
        let id = self.inner.waiter_ids.fetch_add(1, Ordering::Relaxed);
        self.inner.waiters.lock().push_back(Waiter { id, sender: tx });

        if let Err(e) = self.send(frame) {
            self.inner.waiters.lock().retain(|w| w.id != id);
            return Err(e);
        }

        match rx.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.inner.waiters.lock().retain(|w| w.id != id);
                Err(KnxError::timeout())
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(KnxError::closed()),
        }
    }

    /// Register the unsecured connection serving a channel id
    pub(crate) fn register_channel(&self, channel_id: u8, sink: Arc<dyn FrameSink>) {
        self.inner.channels.lock().insert(channel_id, sink);
    }

    /// Remove a channel registration
    pub(crate) fn unregister_channel(&self, channel_id: u8) {
        self.inner.channels.lock().remove(&channel_id);
    }

    /// Register the secure session serving a session id
    pub(crate) fn register_session(&self, session_id: u16, sink: Arc<dyn FrameSink>) {
        self.inner.sessions.lock().insert(session_id, sink);
    }

    /// Remove a session registration
    pub(crate) fn unregister_session(&self, session_id: u16) {
        self.inner.sessions.lock().remove(&session_id);
    }

    /// Close the stream; the receiver thread exits and all registered
    /// sinks are notified.
    pub fn close(&self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        if self.inner.open.swap(false, Ordering::AcqRel) {
            self.inner.socket.lock().shutdown();
        }
    }
}

/// Whether the frame is answered through the connect-request waiter FIFO
fn is_request_response(service: ServiceType) -> bool {
    matches!(
        service,
        ServiceType::ConnectResponse
            | ServiceType::SessionResponse
            | ServiceType::SearchResponse
            | ServiceType::SearchResponseExtended
            | ServiceType::DescriptionResponse
    )
}

/// Channel id position inside the body, by service layout
fn channel_id_of(service: ServiceType, body: &[u8]) -> Option<u8> {
    match service {
        ServiceType::ConnectionstateRequest
        | ServiceType::ConnectionstateResponse
        | ServiceType::DisconnectRequest
        | ServiceType::DisconnectResponse => body.first().copied(),
        ServiceType::TunnelingRequest
        | ServiceType::TunnelingAck
        | ServiceType::TunnelingFeatureGet
        | ServiceType::TunnelingFeatureResponse
        | ServiceType::TunnelingFeatureSet
        | ServiceType::TunnelingFeatureInfo
        | ServiceType::DeviceConfigurationRequest
        | ServiceType::DeviceConfigurationAck => body.get(1).copied(),
        _ => None,
    }
}

fn receiver_loop(mut socket: StreamSocket, inner: &std::sync::Weak<StreamInner>) {
    let mut pending: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        // reassemble complete frames from the pending buffer
        while pending.len() >= KnxnetIpHeader::SIZE {
            let header = match KnxnetIpHeader::parse(&pending) {
                Ok(h) => h,
                Err(e) => {
                    // framing lost, the stream cannot recover
                    warn!("closing stream on unparsable header: {e}");
                    if let Some(inner) = inner.upgrade() {
                        StreamConnection { inner }.shutdown();
                    }
                    return;
                }
            };
            let total = header.total_length as usize;
            if pending.len() < total {
                break;
            }
            let frame: Vec<u8> = pending.drain(..total).collect();
            match inner.upgrade() {
                Some(strong) => dispatch(&strong, &header, frame),
                None => return,
            }
        }

        let n = match socket.read(&mut chunk) {
            Ok(0) => 0,
            Ok(n) => n,
            Err(_) => 0,
        };
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&chunk[..n]);
    }

    // EOF or socket error: notify every attached sink once
    if let Some(strong) = inner.upgrade() {
        strong.open.store(false, Ordering::Release);
        strong.waiters.lock().clear();
        let channels: Vec<_> = strong.channels.lock().values().cloned().collect();
        let sessions: Vec<_> = strong.sessions.lock().values().cloned().collect();
        for sink in channels.into_iter().chain(sessions) {
            sink.transport_closed();
        }
        debug!("stream connection to {} closed", strong.remote);
    }
}

fn dispatch(inner: &Arc<StreamInner>, header: &KnxnetIpHeader, frame: Vec<u8>) {
    let Some(service) = header.service() else {
        debug!("ignoring frame with unknown service type 0x{:04x}", header.service_type);
        return;
    };
    let body = &frame[KnxnetIpHeader::SIZE..];

    if service == ServiceType::SecureWrapper {
        if body.len() >= 2 {
            let session_id = u16::from_be_bytes([body[0], body[1]]);
            if let Some(sink) = inner.sessions.lock().get(&session_id).cloned() {
                if sink.handle_frame(header, body) {
                    return;
                }
            }
        }
        debug!("dropping secure wrapper without matching session");
        return;
    }

    if is_request_response(service) {
        if let Some(waiter) = inner.waiters.lock().pop_front() {
            let _ = waiter.sender.send(frame);
            return;
        }
    }

    if let Some(channel_id) = channel_id_of(service, body) {
        if let Some(sink) = inner.channels.lock().get(&channel_id).cloned() {
            if sink.handle_frame(header, body) {
                return;
            }
        }
    }

    debug!("dropping undispatched {service:?} frame on stream connection");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};

    #[test]
    fn test_request_response_services() {
        assert!(is_request_response(ServiceType::ConnectResponse));
        assert!(is_request_response(ServiceType::SessionResponse));
        assert!(!is_request_response(ServiceType::TunnelingRequest));
    }

    #[test]
    fn test_channel_id_positions() {
        // connection header: len, channel, seq, status
        assert_eq!(channel_id_of(ServiceType::TunnelingRequest, &[4, 21, 0, 0]), Some(21));
        assert_eq!(channel_id_of(ServiceType::DisconnectRequest, &[21, 0]), Some(21));
        assert_eq!(channel_id_of(ServiceType::SearchRequest, &[0; 8]), None);
    }

    #[test]
    fn test_stream_request_round_trip() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            std::net::SocketAddr::V6(_) => unreachable!(),
        };

        let server = thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = peer.read(&mut buf).unwrap();
            // echo a description response frame back
            assert_eq!(buf[..2], [0x06, 0x10]);
            assert!(n >= 6);
            let reply = crate::protocol::frame::make_frame(0x0204, &dib_body());
            peer.write_all(&reply).unwrap();
        });

        let conn = StreamConnection::connect_tcp(addr).unwrap();
        let request = crate::protocol::frame::make_frame(0x0203, &[8, 2, 0, 0, 0, 0, 0, 0]);
        let response = conn.request(&request, Duration::from_secs(3)).unwrap();
        assert_eq!(&response[2..4], &[0x02, 0x04]);
        conn.close();
        server.join().unwrap();
    }

    fn dib_body() -> Vec<u8> {
        let device = crate::protocol::services::DeviceDib {
            knx_medium: 0x20,
            device_status: 0,
            address: crate::addressing::IndividualAddress::new(1, 1, 0).unwrap(),
            project_installation_id: 0,
            serial_number: [0; 6],
            routing_multicast: [224, 0, 23, 12],
            mac_address: [0; 6],
            friendly_name: "stream test".into(),
        };
        let mut body = Vec::new();
        device.encode(&mut body);
        crate::protocol::services::ServiceFamiliesDib { families: vec![(2, 1)] }.encode(&mut body);
        body
    }
}
