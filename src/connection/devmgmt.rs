//! KNXnet/IP local device management connection.
//!
//! Carries cEMI device-management frames (`M_PropRead`, `M_PropWrite`,
//! function properties, reset) to read and write interface-object
//! properties of the server itself. Confirmations are matched against
//! requests by object type, object instance and property id through a
//! per-connection inbound FIFO.

use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::connection::base::{
    ConnectionConfig, ConnectionCore, ConnectionKind, InboundSeq, ServiceHandler,
};
use crate::connection::{BlockingMode, ConnectionListener, ConnectionState};
use crate::error::{KnxError, Result};
use crate::net::stream::{FrameTransport, StreamConnection};
use crate::net::EndpointAddress;
use crate::protocol::cemi::{Cemi, CemiDevMgmt};
use crate::protocol::constants::{CEMIMessageCode, ServiceType};
use crate::protocol::services::{Cri, DataRequest};

/// Wait for a matching confirmation in the inbound FIFO
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(4);

/// cEMI transport-data message codes accepted on this connection
const TDATA_CODES: [u8; 4] = [0x41, 0x89, 0x4A, 0x94];

struct DevMgmtHandler {
    queue: Mutex<VecDeque<CemiDevMgmt>>,
    cond: Condvar,
}

/// Local device management connection.
///
/// # Examples
///
/// ```rust,no_run
/// use knx_netip::connection::DeviceMgmtConnection;
///
/// let server = "192.168.1.10:3671".parse().unwrap();
/// let dm = DeviceMgmtConnection::open(server)?;
/// // read MAX_APDULENGTH from the device object
/// let data = dm.property_read(0, 1, 56, 1, 1)?;
/// dm.close();
/// # Ok::<(), knx_netip::KnxError>(())
/// ```
#[derive(Clone)]
pub struct DeviceMgmtConnection {
    core: Arc<ConnectionCore>,
    handler: Arc<DevMgmtHandler>,
}

impl std::fmt::Debug for DeviceMgmtConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMgmtConnection")
            .field("channel", &self.core.channel_id())
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceMgmtConnection {
    /// Open a device management connection over UDP.
    pub fn open(server: SocketAddrV4) -> Result<Self> {
        Self::open_endpoint(EndpointAddress::Udp(server))
    }

    /// Open a device management connection to any endpoint.
    pub fn open_endpoint(server: EndpointAddress) -> Result<Self> {
        let handler = Arc::new(DevMgmtHandler { queue: Mutex::new(VecDeque::new()), cond: Condvar::new() });
        let cfg = ConnectionConfig::default();

        let core = match &server {
            EndpointAddress::Udp(addr) => ConnectionCore::open_udp(
                ConnectionKind::DeviceMgmt,
                *addr,
                Cri::DeviceMgmt,
                cfg,
                handler.clone(),
            )?,
            EndpointAddress::Tcp(addr) => {
                let stream = StreamConnection::connect_tcp(*addr)?;
                ConnectionCore::open_stream(
                    ConnectionKind::DeviceMgmt,
                    Arc::new(stream),
                    Cri::DeviceMgmt,
                    cfg,
                    handler.clone(),
                )?
            }
            #[cfg(unix)]
            EndpointAddress::Uds(path) => {
                let stream = StreamConnection::connect_uds(path)?;
                ConnectionCore::open_stream(
                    ConnectionKind::DeviceMgmt,
                    Arc::new(stream),
                    Cri::DeviceMgmt,
                    cfg,
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

    /// Open a device management connection through an existing stream
    /// transport (plain stream or secure session).
    pub(crate) fn open_over(transport: Arc<dyn FrameTransport>) -> Result<Self> {
        let handler = Arc::new(DevMgmtHandler { queue: Mutex::new(VecDeque::new()), cond: Condvar::new() });
        let core = ConnectionCore::open_stream(
            ConnectionKind::DeviceMgmt,
            transport,
            Cri::DeviceMgmt,
            ConnectionConfig::default(),
            handler.clone(),
        )?;
        Ok(Self { core, handler })
    }

    /// The server-assigned channel id
    pub fn channel_id(&self) -> u8 {
        self.core.channel_id()
    }

    /// The user-visible connection state
    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    /// Register a connection listener
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.core.add_listener(listener);
    }

    /// Send a device-management cEMI frame.
    pub fn send(&self, frame: &CemiDevMgmt, mode: BlockingMode) -> Result<()> {
        self.core.send_cemi(frame.to_vec(), None, mode)
    }

    /// Send a raw cEMI frame; only device-management and transport-data
    /// message codes are accepted on this connection.
    pub fn send_raw(&self, cemi: Vec<u8>, mode: BlockingMode) -> Result<()> {
        let accepted = cemi.first().is_some_and(|&code| {
            CEMIMessageCode::from_u8(code).is_some_and(CEMIMessageCode::is_device_mgmt)
                || TDATA_CODES.contains(&code)
        });
        if !accepted {
            return Err(KnxError::illegal_argument("device management accepts M_* and T-Data frames"));
        }
        self.core.send_cemi(cemi, None, mode)
    }

    /// Read elements of an interface-object property.
    ///
    /// Returns the raw property data of the confirmation. A confirmation
    /// with zero elements carries an error code, surfaced as
    /// `RemoteError`.
    pub fn property_read(
        &self,
        object_type: u16,
        instance: u8,
        pid: u8,
        elements: u8,
        start: u16,
    ) -> Result<Vec<u8>> {
        let request = CemiDevMgmt::prop_read(object_type, instance, pid, elements, start);
        self.send(&request, BlockingMode::WaitForAck)?;
        let con = self.find_frame(CEMIMessageCode::MPropReadCon, object_type, instance, pid)?;
        match con.error_code() {
            Some(code) => Err(KnxError::remote_error(code)),
            None => Ok(con.data),
        }
    }

    /// Write elements of an interface-object property.
    pub fn property_write(
        &self,
        object_type: u16,
        instance: u8,
        pid: u8,
        elements: u8,
        start: u16,
        data: Vec<u8>,
    ) -> Result<()> {
        let request = CemiDevMgmt::prop_write(object_type, instance, pid, elements, start, data);
        self.send(&request, BlockingMode::WaitForAck)?;
        let con = self.find_frame(CEMIMessageCode::MPropWriteCon, object_type, instance, pid)?;
        match con.error_code() {
            Some(code) => Err(KnxError::remote_error(code)),
            None => Ok(()),
        }
    }

    /// Invoke a function property; returns return code and data of the
    /// confirmation.
    pub fn func_property_command(
        &self,
        object_type: u16,
        instance: u8,
        pid: u8,
        data: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let request = CemiDevMgmt::func_prop(
            CEMIMessageCode::MFuncPropCommandReq,
            object_type,
            instance,
            pid,
            data,
        );
        self.send(&request, BlockingMode::WaitForAck)?;
        let con = self.find_frame(CEMIMessageCode::MFuncPropCon, object_type, instance, pid)?;
        Ok(con.data)
    }

    /// Read the state of a function property.
    pub fn func_property_state(
        &self,
        object_type: u16,
        instance: u8,
        pid: u8,
        data: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let request = CemiDevMgmt::func_prop(
            CEMIMessageCode::MFuncPropStateReadReq,
            object_type,
            instance,
            pid,
            data,
        );
        self.send(&request, BlockingMode::WaitForAck)?;
        let con = self.find_frame(CEMIMessageCode::MFuncPropCon, object_type, instance, pid)?;
        Ok(con.data)
    }

    /// Pop inbound confirmations until one matches the given message
    /// code, object type, instance and property id.
    ///
    /// Non-matching confirmations are discarded. Fails with
    /// `InvalidResponse` when no matching confirmation shows up.
    fn find_frame(
        &self,
        code: CEMIMessageCode,
        object_type: u16,
        instance: u8,
        pid: u8,
    ) -> Result<CemiDevMgmt> {
        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        let mut queue = self.handler.queue.lock();
        loop {
            while let Some(frame) = queue.pop_front() {
                if frame.code == code
                    && frame.object_type == object_type
                    && frame.instance == instance
                    && frame.pid == pid
                {
                    return Ok(frame);
                }
                debug!("discarding unmatched confirmation {:?}", frame.code);
            }
            if self.state() == ConnectionState::Closed {
                return Err(KnxError::closed());
            }
            if self.handler.cond.wait_until(&mut queue, deadline).timed_out() {
                return Err(KnxError::invalid_response());
            }
        }
    }

    /// Gracefully close the connection.
    pub fn close(&self) {
        self.core.close();
    }
}

impl DevMgmtHandler {
    fn handle_request(&self, core: &ConnectionCore, body: &[u8]) -> bool {
        let Ok(request) =
            DataRequest::parse(ServiceType::DeviceConfigurationRequest.to_u16(), body)
        else {
            debug!("dropping malformed device configuration request");
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
                core.ack_inbound(seq);
                return true;
            }
            InboundSeq::Skipped | InboundSeq::Invalid => {
                warn!("ignoring device configuration request with sequence {seq}");
                return true;
            }
        }

        if request.cemi.first().is_some_and(|code| TDATA_CODES.contains(code)) {
            debug!("ignoring transport-data frame on device management connection");
            return true;
        }
        match Cemi::parse(&request.cemi) {
            Ok(Cemi::DevMgmt(frame)) => self.dispatch(core, frame),
            Ok(_) => debug!("ignoring link-layer frame on device management connection"),
            Err(e) => debug!("dropping undecodable cEMI frame: {e}"),
        }
        true
    }

    fn dispatch(&self, core: &ConnectionCore, frame: CemiDevMgmt) {
        if frame.code == CEMIMessageCode::MResetInd {
            warn!("server reset indication, closing device management connection");
            core.close_server("server reset");
            return;
        }
        core.notify_frame(&Cemi::DevMgmt(frame.clone()));
        if matches!(
            frame.code,
            CEMIMessageCode::MPropReadCon
                | CEMIMessageCode::MPropWriteCon
                | CEMIMessageCode::MFuncPropCon
        ) {
            self.queue.lock().push_back(frame);
            self.cond.notify_all();
        }
    }
}

impl ServiceHandler for DevMgmtHandler {
    fn handle_service(&self, core: &ConnectionCore, service: ServiceType, body: &[u8]) -> bool {
        match service {
            ServiceType::DeviceConfigurationRequest => self.handle_request(core, body),
            _ => false,
        }
    }

    fn closed(&self) {
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tdata_codes_accepted() {
        for code in TDATA_CODES {
            assert!(CEMIMessageCode::from_u8(code).is_none());
        }
    }

    #[test]
    fn test_find_frame_matching() {
        let handler =
            Arc::new(DevMgmtHandler { queue: Mutex::new(VecDeque::new()), cond: Condvar::new() });
        handler.queue.lock().push_back(CemiDevMgmt::prop_read(0, 1, 56, 1, 1));
        let mut con = CemiDevMgmt::prop_read(0, 1, 56, 1, 1);
        con.code = CEMIMessageCode::MPropReadCon;
        con.data = vec![0x00, 0xFE];
        handler.queue.lock().push_back(con.clone());

        // the unmatched request frame ahead of the confirmation is discarded
        let mut queue = handler.queue.lock();
        let mut found = None;
        while let Some(frame) = queue.pop_front() {
            if frame.code == CEMIMessageCode::MPropReadCon && frame.pid == 56 {
                found = Some(frame);
                break;
            }
        }
        assert_eq!(found, Some(con));
    }
}
