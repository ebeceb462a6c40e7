//! KNXnet/IP tunneling connection.
//!
//! A tunnel carries cEMI `L_Data` frames between the client and a server
//! that bridges onto the KNX medium. Sends run through the base
//! acknowledgment machinery; inbound requests are validated against the
//! receive sequence and acknowledged.
//!
//! ## Inbound sequence window
//!
//! Only the expected sequence and its predecessor are accepted. A frame
//! that skips exactly one sequence can optionally re-align the receive
//! counter ([`TunnelConfig::resync_on_skip`], default on), a pragmatic
//! recovery for servers that lost our acknowledgment.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::addressing::IndividualAddress;
use crate::connection::base::{
    ConnectionConfig, ConnectionCore, ConnectionKind, InboundSeq, ServiceHandler,
};
use crate::connection::{BlockingMode, ConnectionListener, ConnectionState};
use crate::error::{KnxError, Result};
use crate::net::stream::{FrameTransport, StreamConnection};
use crate::net::EndpointAddress;
use crate::protocol::cemi::{Cemi, CemiLData};
use crate::protocol::constants::{CEMIMessageCode, ServiceType, TUNNEL_BUSMONITOR, TUNNEL_LINKLAYER};
use crate::protocol::services::{Cri, DataRequest, TunnelingFeature};

/// Wait for a tunneling feature response
const FEATURE_TIMEOUT: Duration = Duration::from_secs(3);

/// KNX layer of a tunnel connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelLayer {
    /// Data link layer (the normal mode)
    #[default]
    LinkLayer,
    /// Busmonitor mode; such tunnels are receive-only
    Busmonitor,
}

impl TunnelLayer {
    const fn code(self) -> u8 {
        match self {
            Self::LinkLayer => TUNNEL_LINKLAYER,
            Self::Busmonitor => TUNNEL_BUSMONITOR,
        }
    }
}

/// Configuration of a tunneling connection
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Server endpoint
    pub server: EndpointAddress,
    /// KNX layer to request
    pub layer: TunnelLayer,
    /// Announce a NAT-aware endpoint (UDP only)
    pub nat_aware: bool,
    /// Re-align the receive sequence on a one-frame skip
    pub resync_on_skip: bool,
    /// Request a specific tunneling address (extended CRI)
    pub tunneling_address: Option<IndividualAddress>,
}

impl TunnelConfig {
    /// Configuration for a link-layer tunnel over UDP
    pub fn new(server: SocketAddrV4) -> Self {
        Self {
            server: EndpointAddress::Udp(server),
            layer: TunnelLayer::LinkLayer,
            nat_aware: false,
            resync_on_skip: true,
            tunneling_address: None,
        }
    }

    /// Configuration for a tunnel over any endpoint
    pub fn for_endpoint(server: EndpointAddress) -> Self {
        Self {
            server,
            layer: TunnelLayer::LinkLayer,
            nat_aware: false,
            resync_on_skip: true,
            tunneling_address: None,
        }
    }

    /// Request busmonitor mode
    pub fn busmonitor(mut self) -> Self {
        self.layer = TunnelLayer::Busmonitor;
        self
    }

    /// Use NAT-aware addressing
    pub fn nat(mut self) -> Self {
        self.nat_aware = true;
        self
    }

    fn cri(&self) -> Cri {
        Cri::Tunnel { layer: self.layer.code(), address: self.tunneling_address }
    }
}

struct TunnelHandler {
    layer: TunnelLayer,
    resync_on_skip: bool,
    feature_response: Mutex<Option<TunnelingFeature>>,
    feature_cond: Condvar,
}

/// KNXnet/IP tunneling connection.
///
/// # Examples
///
/// ```rust,no_run
/// use knx_netip::connection::{BlockingMode, TunnelConfig, TunnelConnection};
/// # fn frame() -> knx_netip::protocol::cemi::CemiLData { unimplemented!() }
///
/// let server = "192.168.1.10:3671".parse().unwrap();
/// let tunnel = TunnelConnection::open(TunnelConfig::new(server))?;
/// tunnel.send(&frame(), BlockingMode::WaitForCon)?;
/// tunnel.close();
/// # Ok::<(), knx_netip::KnxError>(())
/// ```
#[derive(Clone)]
pub struct TunnelConnection {
    core: Arc<ConnectionCore>,
    handler: Arc<TunnelHandler>,
}

impl std::fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("channel", &self.core.channel_id())
            .field("state", &self.state())
            .finish()
    }
}

impl TunnelConnection {
    /// Open a tunnel to the configured server.
    pub fn open(config: TunnelConfig) -> Result<Self> {
        let handler = Arc::new(TunnelHandler {
            layer: config.layer,
            resync_on_skip: config.resync_on_skip,
            feature_response: Mutex::new(None),
            feature_cond: Condvar::new(),
        });
        let base_cfg = ConnectionConfig { nat_aware: config.nat_aware, ..Default::default() };

        let core = match &config.server {
            EndpointAddress::Udp(server) => ConnectionCore::open_udp(
                ConnectionKind::Tunnel,
                *server,
                config.cri(),
                base_cfg,
                handler.clone(),
            )?,
            EndpointAddress::Tcp(server) => {
                let stream = StreamConnection::connect_tcp(*server)?;
                ConnectionCore::open_stream(
                    ConnectionKind::Tunnel,
                    Arc::new(stream),
                    config.cri(),
                    base_cfg,
                    handler.clone(),
                )?
            }
            #[cfg(unix)]
            EndpointAddress::Uds(path) => {
                let stream = StreamConnection::connect_uds(path)?;
                ConnectionCore::open_stream(
                    ConnectionKind::Tunnel,
                    Arc::new(stream),
                    config.cri(),
                    base_cfg,
                    handler.clone(),
                )?
            }
            #[cfg(not(unix))]
            EndpointAddress::Uds(_) => {
                return Err(KnxError::illegal_argument("unix-domain sockets unsupported"))
            }
        };
        Ok(Self { core, handler })
    }

    /// Open a tunnel through an existing stream transport (plain stream
    /// or secure session).
    pub(crate) fn open_over(
        transport: Arc<dyn FrameTransport>,
        config: &TunnelConfig,
    ) -> Result<Self> {
        let handler = Arc::new(TunnelHandler {
            layer: config.layer,
            resync_on_skip: config.resync_on_skip,
            feature_response: Mutex::new(None),
            feature_cond: Condvar::new(),
        });
        let core = ConnectionCore::open_stream(
            ConnectionKind::Tunnel,
            transport,
            config.cri(),
            ConnectionConfig::default(),
            handler.clone(),
        )?;
        Ok(Self { core, handler })
    }

    /// The server-assigned channel id
    pub fn channel_id(&self) -> u8 {
        self.core.channel_id()
    }

    /// The tunneling individual address assigned by the server
    pub fn address(&self) -> Option<IndividualAddress> {
        self.core.assigned_address()
    }

    /// The user-visible connection state
    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    /// Register a connection listener
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.core.add_listener(listener);
    }

    /// Remove a previously registered listener
    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.core.remove_listener(listener);
    }

    /// Send a cEMI `L_Data` frame.
    ///
    /// Busmonitor tunnels are receive-only and reject every send. With
    /// [`BlockingMode::WaitForCon`] the call returns after the matching
    /// `L_Data.con` arrived (listeners see it first).
    pub fn send(&self, frame: &CemiLData, mode: BlockingMode) -> Result<()> {
        if self.handler.layer == TunnelLayer::Busmonitor {
            return Err(KnxError::illegal_argument("busmonitor tunnel is receive-only"));
        }
        let keep = (mode == BlockingMode::WaitForCon).then(|| frame.clone());
        self.core.send_cemi(frame.to_vec(), keep, mode)
    }

    /// Convenience for a blocking send waiting for the confirmation
    pub fn send_blocking(&self, frame: &CemiLData) -> Result<()> {
        self.send(frame, BlockingMode::WaitForCon)
    }

    /// Read an interface feature value.
    pub fn feature_get(&self, feature_id: u8) -> Result<Vec<u8>> {
        self.feature_request(ServiceType::TunnelingFeatureGet, feature_id, Vec::new())
    }

    /// Set an interface feature value; returns the confirmed value.
    pub fn feature_set(&self, feature_id: u8, value: Vec<u8>) -> Result<Vec<u8>> {
        self.feature_request(ServiceType::TunnelingFeatureSet, feature_id, value)
    }

    fn feature_request(&self, service: ServiceType, feature_id: u8, value: Vec<u8>) -> Result<Vec<u8>> {
        let mut payload = vec![feature_id, 0x00];
        payload.extend_from_slice(&value);
        self.handler.feature_response.lock().take();
        self.core
            .send_request(service.to_u16(), payload, None, BlockingMode::WaitForAck)?;

        let deadline = Instant::now() + FEATURE_TIMEOUT;
        let mut response = self.handler.feature_response.lock();
        loop {
            if let Some(feature) = response.take() {
                if feature.feature_id != feature_id {
                    return Err(KnxError::invalid_response());
                }
                if feature.return_code != 0 {
                    return Err(KnxError::remote_error(feature.return_code));
                }
                return Ok(feature.value);
            }
            if self.handler.feature_cond.wait_until(&mut response, deadline).timed_out() {
                return Err(KnxError::timeout());
            }
        }
    }

    /// Gracefully close the tunnel.
    pub fn close(&self) {
        self.core.close();
    }
}

impl TunnelHandler {
    fn handle_request(&self, core: &ConnectionCore, body: &[u8]) -> bool {
        let Ok(request) = DataRequest::parse(ServiceType::TunnelingRequest.to_u16(), body) else {
            debug!("dropping malformed tunneling request");
            return true;
        };
        if request.header.channel_id != core.channel_id() {
            return false;
        }

        let seq = request.header.sequence;
        match core.classify_recv_seq(seq) {
            InboundSeq::Expected => {
                core.ack_inbound(seq);
                core.accept_recv_seq(seq);
            }
            InboundSeq::Repeat => {
                // repetition of the last frame: acknowledge, do not redeliver
                core.ack_inbound(seq);
                return true;
            }
            InboundSeq::Skipped if self.resync_on_skip => {
                warn!("tunneling sequence skipped one frame, re-aligning to {seq}");
                core.ack_inbound(seq);
                core.accept_recv_seq(seq);
            }
            InboundSeq::Skipped | InboundSeq::Invalid => {
                warn!("ignoring tunneling request with out-of-window sequence {seq}");
                return true;
            }
        }

        match Cemi::parse(&request.cemi) {
            Ok(cemi) => self.dispatch(core, &cemi),
            Err(e) => debug!("dropping undecodable cEMI frame: {e}"),
        }
        true
    }

    fn dispatch(&self, core: &ConnectionCore, cemi: &Cemi) {
        match cemi {
            Cemi::LData(frame) if frame.code == CEMIMessageCode::LDataCon => {
                // confirmation listeners run before the blocking sender returns
                core.notify_frame(cemi);
                core.match_confirmation(frame);
            }
            Cemi::LData(_) | Cemi::Busmon(_) => core.notify_frame(cemi),
            Cemi::DevMgmt(_) => debug!("ignoring device management frame on tunnel"),
        }
    }

    fn handle_feature(&self, core: &ConnectionCore, service: ServiceType, body: &[u8]) -> bool {
        let Ok(feature) = TunnelingFeature::parse(service.to_u16(), body) else {
            return true;
        };
        if feature.header.channel_id != core.channel_id() {
            return false;
        }
        core.ack_inbound(feature.header.sequence);
        core.accept_recv_seq(feature.header.sequence);
        if service == ServiceType::TunnelingFeatureInfo {
            debug!("interface feature info, id {}", feature.feature_id);
            return true;
        }
        *self.feature_response.lock() = Some(feature);
        self.feature_cond.notify_all();
        true
    }
}

impl ServiceHandler for TunnelHandler {
    fn handle_service(&self, core: &ConnectionCore, service: ServiceType, body: &[u8]) -> bool {
        match service {
            ServiceType::TunnelingRequest => self.handle_request(core, body),
            ServiceType::TunnelingFeatureResponse | ServiceType::TunnelingFeatureInfo => {
                self.handle_feature(core, service, body)
            }
            _ => false,
        }
    }

    fn closed(&self) {
        self.feature_cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TunnelConfig::new("127.0.0.1:3671".parse().unwrap());
        assert_eq!(config.layer, TunnelLayer::LinkLayer);
        assert!(config.resync_on_skip);
        assert!(!config.nat_aware);
        assert_eq!(config.cri(), Cri::tunnel_link_layer());
    }

    #[test]
    fn test_busmonitor_cri() {
        let config = TunnelConfig::new("127.0.0.1:3671".parse().unwrap()).busmonitor();
        assert_eq!(config.cri(), Cri::tunnel_busmonitor());
    }

    #[test]
    fn test_extended_cri_with_address() {
        let mut config = TunnelConfig::new("127.0.0.1:3671".parse().unwrap());
        let addr = IndividualAddress::new(1, 1, 240).unwrap();
        config.tunneling_address = Some(addr);
        assert_eq!(config.cri(), Cri::Tunnel { layer: TUNNEL_LINKLAYER, address: Some(addr) });
    }
}
