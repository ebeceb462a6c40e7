//! KNX IP Secure unicast session over a stream transport.
//!
//! ## Handshake
//!
//! ```text
//! Client                                Server
//!   |                                      |
//!   |-- SESSION_REQUEST (client pubkey) -->|
//!   |<- SESSION_RESPONSE (id, pubkey, MAC)-|   verify with device auth key
//!   |                                      |
//!   |   session key = SHA-256(X25519)[..16]
//!   |                                      |
//!   |-- SESSION_AUTHENTICATE (wrapped) --->|
//!   |<- SESSION_STATUS AuthSuccess --------|   (wrapped)
//!   |                                      |
//!   |-- SESSION_STATUS KeepAlive --------->|   every 30 s
//! ```
//!
//! Tunneling and device management connections run inside the session:
//! their frames are wrapped into secure envelopes with a strictly
//! increasing 48-bit send sequence; received envelopes must carry a
//! sequence at least the expected receive sequence, message tag zero and
//! a valid MAC before any payload is exposed.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;
#[cfg(unix)]
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::connection::{DeviceMgmtConnection, TunnelConfig, TunnelConnection};
use crate::error::{KnxError, Result};
use crate::net::stream::{FrameSink, FrameTransport, StreamConnection};
use crate::security::Security;
use crate::protocol::constants::ServiceType;
use crate::protocol::frame::{Hpai, KnxnetIpHeader};
use crate::protocol::secure::{
    SecureWrapper, SessionAuthenticate, SessionRequest, SessionResponse, SessionStatus,
    SessionStatusCode, KEY_LENGTH,
};
use crate::secure::crypto;

/// Session setup must complete within this window
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Keep-alive period for idle sessions
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Lifecycle of a secure session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session established
    Idle,
    /// Session keys agreed, user not yet authenticated
    Unauthenticated,
    /// User authenticated, session fully usable
    Authenticated,
}

/// Credentials and identity for a secure session.
///
/// Zeroed keys defer to the [`Security`] store: the user key must then
/// be stored for the server endpoint, and a missing stored device
/// authentication key skips server authentication.
#[derive(Clone)]
pub struct SecureSessionConfig {
    /// Authenticating user (1..=127)
    pub user_id: u8,
    /// Password-derived user key; all-zero resolves the key stored for
    /// the server in the security store
    pub user_key: [u8; 16],
    /// Device authentication key; all-zero first consults the security
    /// store, and without a stored key server authentication is skipped
    pub device_auth_key: [u8; 16],
    /// KNX serial number announced in secure envelopes
    pub serial: [u8; 6],
}

impl SecureSessionConfig {
    /// Configuration for a user whose keys live in the security store.
    pub fn for_user(user_id: u8, serial: [u8; 6]) -> Self {
        Self { user_id, user_key: [0; 16], device_auth_key: [0; 16], serial }
    }
}

impl std::fmt::Debug for SecureSessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // keys stay out of debug output
        f.debug_struct("SecureSessionConfig").field("user_id", &self.user_id).finish()
    }
}

struct Waiter {
    id: u64,
    sender: mpsc::Sender<Vec<u8>>,
}

struct SessionShared {
    state: SessionState,
    send_seq: u64,
    recv_seq: u64,
    auth_status: Option<SessionStatusCode>,
}

struct SessionInner {
    stream: StreamConnection,
    session_id: u16,
    session_key: [u8; 16],
    serial: [u8; 6],
    shared: Mutex<SessionShared>,
    cond: Condvar,
    waiter_ids: AtomicU64,
    waiters: Mutex<VecDeque<Waiter>>,
    channels: Mutex<HashMap<u8, Arc<dyn FrameSink>>>,
    closing: AtomicBool,
}

/// KNX IP Secure session.
///
/// # Examples
///
/// ```rust,no_run
/// use knx_netip::secure::{SecureSession, SecureSessionConfig};
/// use knx_netip::connection::TunnelConfig;
///
/// let config = SecureSessionConfig {
///     user_id: 2,
///     user_key: [0x11; 16],
///     device_auth_key: [0; 16],
///     serial: [0, 0, 0, 0, 0, 1],
/// };
/// let server = "192.168.1.10:3671".parse().unwrap();
/// let session = SecureSession::connect_tcp(server, config)?;
/// let tunnel = session.open_tunnel()?;
/// # Ok::<(), knx_netip::KnxError>(())
/// ```
#[derive(Clone)]
pub struct SecureSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("session_id", &self.inner.session_id)
            .field("state", &self.state())
            .finish()
    }
}

impl SecureSession {
    /// Establish a secure session over TCP.
    pub fn connect_tcp(server: SocketAddrV4, config: SecureSessionConfig) -> Result<Self> {
        let stream = StreamConnection::connect_tcp(server)?;
        Self::connect_over(stream, config)
    }

    /// Establish a secure session over a Unix-domain socket.
    #[cfg(unix)]
    pub fn connect_uds(path: impl AsRef<Path>, config: SecureSessionConfig) -> Result<Self> {
        let stream = StreamConnection::connect_uds(path)?;
        Self::connect_over(stream, config)
    }

    /// Establish a secure session on an existing stream connection,
    /// resolving zeroed credentials from the process-default security
    /// store.
    pub fn connect_over(stream: StreamConnection, config: SecureSessionConfig) -> Result<Self> {
        Self::connect_over_with(stream, config, Security::default_instance().clone())
    }

    /// Establish a secure session with an explicit security store.
    pub fn connect_over_with(
        stream: StreamConnection,
        mut config: SecureSessionConfig,
        security: Arc<Security>,
    ) -> Result<Self> {
        if config.user_id == 0 || config.user_id > 127 {
            return Err(KnxError::illegal_argument("user id 1..=127"));
        }
        // zeroed credentials defer to the security store
        if config.user_key == [0u8; 16] {
            config.user_key = security
                .user_key(stream.remote(), config.user_id)
                .ok_or(KnxError::illegal_argument("no user key stored for this server"))?;
        }
        if config.device_auth_key == [0u8; 16] {
            if let Some(key) = security.device_auth_key(stream.remote()) {
                config.device_auth_key = key;
            }
        }

        // 1. ephemeral key pair, session request
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let client_key = PublicKey::from(&secret);
        let request = SessionRequest {
            control_endpoint: Hpai::Tcp,
            public_key: *client_key.as_bytes(),
        }
        .build();
        let frame = stream.request(&request, SETUP_TIMEOUT)?;
        let header = KnxnetIpHeader::parse(&frame)?;
        if header.service() != Some(ServiceType::SessionResponse) {
            return Err(KnxError::secure_handshake());
        }
        let response = SessionResponse::parse(&frame[KnxnetIpHeader::SIZE..])?;
        if response.session_id == 0 {
            // zero is reserved for the multicast channel
            return Err(KnxError::secure_handshake());
        }

        // 2. authenticate the server with the device auth key
        if config.device_auth_key == [0u8; 16] {
            warn!("device authentication key not set, skipping server authentication");
        } else {
            let mut data = Vec::with_capacity(KnxnetIpHeader::SIZE + 2 + KEY_LENGTH);
            data.extend_from_slice(&frame[..KnxnetIpHeader::SIZE]);
            data.extend_from_slice(&response.session_id.to_be_bytes());
            data.extend_from_slice(&crypto::xor_keys(client_key.as_bytes(), &response.public_key));
            let expected = crypto::handshake_mac(&config.device_auth_key, &data);
            if expected != response.mac {
                return Err(KnxError::secure_mac_mismatch());
            }
        }

        // 3. derive the session key from the shared secret
        let server_key = PublicKey::from(response.public_key);
        let shared = secret.diffie_hellman(&server_key);
        let session_key = crypto::derive_session_key(shared.as_bytes());

        let inner = Arc::new(SessionInner {
            stream: stream.clone(),
            session_id: response.session_id,
            session_key,
            serial: config.serial,
            shared: Mutex::new(SessionShared {
                state: SessionState::Unauthenticated,
                send_seq: 0,
                recv_seq: 0,
                auth_status: None,
            }),
            cond: Condvar::new(),
            waiter_ids: AtomicU64::new(0),
            waiters: Mutex::new(VecDeque::new()),
            channels: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
        });
        stream.register_session(response.session_id, inner.clone());
        let session = Self { inner };

        // 4. authenticate the user; the frame travels wrapped
        let mut data = Vec::new();
        let auth_header = KnxnetIpHeader::new(ServiceType::SessionAuthenticate.to_u16(), 2 + 16);
        auth_header.encode(&mut data);
        data.extend_from_slice(&[0x00, config.user_id]);
        data.extend_from_slice(&crypto::xor_keys(client_key.as_bytes(), &response.public_key));
        let mac = crypto::handshake_mac(&config.user_key, &data);
        let auth = SessionAuthenticate { user_id: config.user_id, mac }.build();
        session.send_wrapped(&auth)?;

        // 5. wait for the authentication status
        let deadline = Instant::now() + SETUP_TIMEOUT;
        {
            let mut shared = session.inner.shared.lock();
            while shared.auth_status.is_none() {
                if session.inner.cond.wait_until(&mut shared, deadline).timed_out() {
                    drop(shared);
                    session.close();
                    return Err(KnxError::timeout());
                }
            }
            match shared.auth_status {
                Some(SessionStatusCode::AuthSuccess) => {
                    shared.state = SessionState::Authenticated;
                }
                status => {
                    drop(shared);
                    warn!("session authentication failed: {status:?}");
                    session.close();
                    return Err(KnxError::secure_handshake());
                }
            }
        }
        info!("secure session {} authenticated", session.inner.session_id);

        // 6. periodic keep-alive
        let weak = Arc::downgrade(&session.inner);
        thread::Builder::new()
            .name(format!("knx-keepalive s{}", session.inner.session_id))
            .spawn(move || keepalive_loop(&weak))
            .map_err(KnxError::Io)?;

        Ok(session)
    }

    /// The server-assigned session id
    pub fn session_id(&self) -> u16 {
        self.inner.session_id
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.inner.shared.lock().state
    }

    /// Open a link-layer tunnel inside this session.
    pub fn open_tunnel(&self) -> Result<TunnelConnection> {
        let config = TunnelConfig::for_endpoint(self.inner.stream.remote().clone());
        self.open_tunnel_with(&config)
    }

    /// Open a tunnel inside this session with explicit configuration.
    pub fn open_tunnel_with(&self, config: &TunnelConfig) -> Result<TunnelConnection> {
        TunnelConnection::open_over(Arc::new(self.clone()), config)
    }

    /// Open a device management connection inside this session.
    pub fn open_device_mgmt(&self) -> Result<DeviceMgmtConnection> {
        DeviceMgmtConnection::open_over(Arc::new(self.clone()))
    }

    /// Wrap a plain KNXnet/IP frame and send it on the stream.
    fn send_wrapped(&self, plain: &[u8]) -> Result<()> {
        if self.inner.closing.load(Ordering::Acquire) {
            return Err(KnxError::closed());
        }
        let wire = self.inner.wrap(plain)?;
        self.inner.stream.send(&wire)
    }

    /// Close the session: a Close status is sent and all contained
    /// connections are shut down.
    pub fn close(&self) {
        self.inner.close_session(true);
    }
}

impl SessionInner {
    /// Build a secure envelope around a plain frame.
    fn wrap(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let seq = {
            let mut shared = self.shared.lock();
            let seq = shared.send_seq;
            shared.send_seq += 1;
            seq
        };

        let total = KnxnetIpHeader::SIZE + SecureWrapper::FIXED_SIZE + plain.len();
        let mut assoc = Vec::with_capacity(KnxnetIpHeader::SIZE + 2);
        KnxnetIpHeader {
            service_type: ServiceType::SecureWrapper.to_u16(),
            total_length: total as u16,
        }
        .encode(&mut assoc);
        assoc.extend_from_slice(&self.session_id.to_be_bytes());

        let (ciphertext, mac) =
            crypto::ccm_encrypt(&self.session_key, seq, &self.serial, 0, &assoc, plain);
        Ok(SecureWrapper {
            session_id: self.session_id,
            sequence: seq,
            serial: self.serial,
            tag: 0,
            ciphertext,
            mac,
        }
        .build())
    }

    /// Verify and open a secure envelope.
    fn unwrap(&self, body: &[u8]) -> Result<Vec<u8>> {
        let wrapper = SecureWrapper::parse(body)?;
        if wrapper.session_id != self.session_id {
            return Err(KnxError::secure_session_state());
        }
        if wrapper.tag != 0 {
            // session traffic always carries tag zero
            return Err(KnxError::secure_handshake());
        }
        {
            let shared = self.shared.lock();
            if wrapper.sequence < shared.recv_seq {
                return Err(KnxError::secure_replay());
            }
        }

        let total = KnxnetIpHeader::SIZE + body.len();
        let mut assoc = Vec::with_capacity(KnxnetIpHeader::SIZE + 2);
        KnxnetIpHeader {
            service_type: ServiceType::SecureWrapper.to_u16(),
            total_length: total as u16,
        }
        .encode(&mut assoc);
        assoc.extend_from_slice(&wrapper.session_id.to_be_bytes());

        let plain = crypto::ccm_decrypt(
            &self.session_key,
            wrapper.sequence,
            &wrapper.serial,
            wrapper.tag,
            &assoc,
            &wrapper.ciphertext,
            &wrapper.mac,
        )?;
        // accepted sequences are strictly increasing
        self.shared.lock().recv_seq = wrapper.sequence + 1;
        Ok(plain)
    }

    /// Dispatch an unwrapped plain frame like the stream connection
    /// would: status frames to the session, responses to the first
    /// waiter, channel frames to the contained connection.
    fn dispatch_plain(&self, plain: &[u8]) {
        let Ok(header) = KnxnetIpHeader::parse(plain) else {
            debug!("dropping unparsable frame from secure envelope");
            return;
        };
        let body = &plain[KnxnetIpHeader::SIZE..];

        match header.service() {
            Some(ServiceType::SessionStatus) => {
                if let Ok(status) = SessionStatus::parse(body) {
                    self.handle_status(status.status);
                }
            }
            Some(
                ServiceType::ConnectResponse
                | ServiceType::SearchResponse
                | ServiceType::SearchResponseExtended
                | ServiceType::DescriptionResponse,
            ) => {
                if let Some(waiter) = self.waiters.lock().pop_front() {
                    let _ = waiter.sender.send(plain.to_vec());
                } else {
                    debug!("dropping response frame without waiter in session {}", self.session_id);
                }
            }
            Some(_) => {
                let channel_id = channel_id_of(body, header.service_type);
                let sink = channel_id.and_then(|id| self.channels.lock().get(&id).cloned());
                match sink {
                    Some(sink) => {
                        if !sink.handle_frame(&header, body) {
                            debug!("contained connection refused frame 0x{:04x}", header.service_type);
                        }
                    }
                    None => debug!(
                        "dropping frame 0x{:04x} without contained connection",
                        header.service_type
                    ),
                }
            }
            None => debug!("ignoring unknown service 0x{:04x} in session", header.service_type),
        }
    }

    fn handle_status(&self, status: SessionStatusCode) {
        match status {
            SessionStatusCode::KeepAlive => {}
            SessionStatusCode::Close => {
                info!("session {} closed by server", self.session_id);
                self.close_session(false);
            }
            SessionStatusCode::Timeout => {
                warn!("session {} timed out on server", self.session_id);
                self.close_session(false);
            }
            code => {
                let mut shared = self.shared.lock();
                shared.auth_status = Some(code);
                drop(shared);
                self.cond.notify_all();
            }
        }
    }

    fn close_session(&self, send_close: bool) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if send_close {
            let status = SessionStatus::new(SessionStatusCode::Close).build();
            if let Ok(wire) = self.wrap(&status) {
                let _ = self.stream.send(&wire);
            }
        }
        {
            let mut shared = self.shared.lock();
            shared.state = SessionState::Idle;
        }
        self.cond.notify_all();
        self.waiters.lock().clear();
        self.stream.unregister_session(self.session_id);

        // contained connections terminate with the session
        let channels: Vec<_> = self.channels.lock().drain().map(|(_, sink)| sink).collect();
        for sink in channels {
            sink.transport_closed();
        }
        self.stream.close();
    }
}

/// Channel id position inside a plain frame body, mirroring the stream
/// connection's dispatch.
fn channel_id_of(body: &[u8], service_type: u16) -> Option<u8> {
    match service_type {
        0x0207 | 0x0208 | 0x0209 | 0x020A => body.first().copied(),
        0x0310 | 0x0311 | 0x0420..=0x0425 => body.get(1).copied(),
        _ => None,
    }
}

impl FrameSink for SessionInner {
    fn handle_frame(&self, _header: &KnxnetIpHeader, body: &[u8]) -> bool {
        match self.unwrap(body) {
            Ok(plain) => {
                self.dispatch_plain(&plain);
                true
            }
            Err(e) => {
                warn!("rejecting secure envelope: {e}");
                true
            }
        }
    }

    fn transport_closed(&self) {
        self.close_session(false);
    }
}

impl FrameTransport for SecureSession {
    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        self.send_wrapped(frame)
    }

    fn request_frame(&self, frame: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let (tx, rx) = mpsc::channel();
        let id = self.inner.waiter_ids.fetch_add(1, Ordering::Relaxed);
        self.inner.waiters.lock().push_back(Waiter { id, sender: tx });

        if let Err(e) = self.send_wrapped(frame) {
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

    fn attach_channel(&self, channel_id: u8, sink: Arc<dyn FrameSink>) {
        self.inner.channels.lock().insert(channel_id, sink);
    }

    fn detach_channel(&self, channel_id: u8) {
        self.inner.channels.lock().remove(&channel_id);
    }
}

/// Keep-alive worker: a wrapped KeepAlive status every 30 s; a send
/// failure ends the session and the stream.
fn keepalive_loop(weak: &Weak<SessionInner>) {
    loop {
        thread::sleep(KEEPALIVE_INTERVAL);
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.closing.load(Ordering::Acquire) {
            return;
        }

        let status = SessionStatus::new(SessionStatusCode::KeepAlive).build();
        let result = inner.wrap(&status).and_then(|wire| inner.stream.send(&wire));
        if let Err(e) = result {
            warn!("keep-alive failed on session {}: {e}", inner.session_id);
            inner.close_session(false);
            return;
        }
        debug!("keep-alive sent on session {}", inner.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner_for_test() -> Arc<SessionInner> {
        use std::net::{Ipv4Addr, TcpListener};
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            std::net::SocketAddr::V6(_) => unreachable!(),
        };
        let accept = thread::spawn(move || listener.accept().unwrap());
        let stream = StreamConnection::connect_tcp(addr).unwrap();
        let _peer = accept.join().unwrap();

        Arc::new(SessionInner {
            stream,
            session_id: 1,
            session_key: [0x0F; 16],
            serial: [0, 0, 0, 0, 0, 1],
            shared: Mutex::new(SessionShared {
                state: SessionState::Authenticated,
                send_seq: 0,
                recv_seq: 0,
                auth_status: None,
            }),
            cond: Condvar::new(),
            waiter_ids: AtomicU64::new(0),
            waiters: Mutex::new(VecDeque::new()),
            channels: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
        })
    }

    #[test]
    fn test_zeroed_user_key_requires_stored_key() {
        use std::net::{Ipv4Addr, TcpListener};
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            std::net::SocketAddr::V6(_) => unreachable!(),
        };
        let accept = thread::spawn(move || listener.accept().unwrap());
        let stream = StreamConnection::connect_tcp(addr).unwrap();
        let _peer = accept.join().unwrap();

        // an empty store cannot resolve the zeroed user key
        let config = SecureSessionConfig::for_user(2, [0, 0, 0, 0, 0, 1]);
        let err = SecureSession::connect_over_with(stream, config, Security::new()).unwrap_err();
        assert!(matches!(err, KnxError::IllegalArgument(_)));
    }

    #[test]
    fn test_stored_credentials_resolve() {
        let security = Security::new();
        let server = crate::net::EndpointAddress::tcp(
            "192.168.1.10:3671".parse().unwrap(),
        );
        security.set_user_key(server.clone(), 2, [0x11; 16]);
        security.set_device_auth_key(server.clone(), [0x22; 16]);

        assert_eq!(security.user_key(&server, 2), Some([0x11; 16]));
        assert_eq!(security.device_auth_key(&server), Some([0x22; 16]));
    }

    #[test]
    fn test_wrap_unwrap_round_trip() {
        let inner = inner_for_test();
        let plain = crate::protocol::frame::make_frame(0x0420, &[4, 1, 0, 0, 0x29, 0x00]);
        let wire = inner.wrap(&plain).unwrap();

        let header = KnxnetIpHeader::parse(&wire).unwrap();
        assert_eq!(header.service(), Some(ServiceType::SecureWrapper));
        let unwrapped = inner.unwrap(&wire[KnxnetIpHeader::SIZE..]).unwrap();
        assert_eq!(unwrapped, plain);
    }

    #[test]
    fn test_replay_rejected() {
        let inner = inner_for_test();
        let plain = crate::protocol::frame::make_frame(0x0420, &[4, 1, 0, 0]);
        let wire = inner.wrap(&plain).unwrap();

        inner.unwrap(&wire[KnxnetIpHeader::SIZE..]).unwrap();
        // the same sequence a second time is a replay
        let err = inner.unwrap(&wire[KnxnetIpHeader::SIZE..]).unwrap_err();
        assert!(matches!(err, KnxError::Secure(e) if e.is_replay()));
    }

    #[test]
    fn test_send_sequence_strictly_increasing() {
        let inner = inner_for_test();
        let plain = crate::protocol::frame::make_frame(0x0420, &[4, 1, 0, 0]);
        inner.wrap(&plain).unwrap();
        inner.wrap(&plain).unwrap();
        assert_eq!(inner.shared.lock().send_seq, 2);
    }

    #[test]
    fn test_nonzero_tag_rejected() {
        let inner = inner_for_test();
        let plain = crate::protocol::frame::make_frame(0x0420, &[4, 1, 0, 0]);
        let wire = inner.wrap(&plain).unwrap();
        let mut wrapper = SecureWrapper::parse(&wire[KnxnetIpHeader::SIZE..]).unwrap();
        wrapper.tag = 5;
        let tampered = wrapper.build();
        assert!(inner.unwrap(&tampered[KnxnetIpHeader::SIZE..]).is_err());
    }
}
