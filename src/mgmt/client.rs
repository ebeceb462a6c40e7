//! Application-layer management client.
//!
//! Wraps a transport layer, encodes APCI requests and matches responses
//! in a per-client inbound queue. Every expected response type opens an
//! "active window"; indications arriving outside any window are dropped,
//! stale queue entries are purged.
//!
//! Point-to-point services address a [`Destination`]; broadcast services
//! (individual address programming, domain addresses, network
//! parameters) go out with system priority on the broadcast address.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::addressing::IndividualAddress;
use crate::error::{KnxError, Result};
use crate::mgmt::{apci, crc16_ccitt, pdt_element_size, service_mask, tpdu};
use crate::protocol::cemi::CemiLData;
use crate::protocol::constants::Priority;
use crate::security::Security;
use crate::transport_layer::{Destination, TransportLayer, TransportListener};

/// Default response window
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Queue entries older than this are purged unconditionally
const QUEUE_MAX_AGE: Duration = Duration::from_secs(10);

/// Fallback maximum APDU length when the device does not answer
const DEFAULT_MAX_APDU: usize = 15;

/// Device object interface object index
const DEVICE_OBJECT_INDEX: u8 = 0;

/// PID.MAX_APDULENGTH in the device object
const PID_MAX_APDU_LENGTH: u8 = 56;

/// PID of the features-supported bitmask in the device object
const PID_FEATURES_SUPPORTED: u8 = 89;

/// Security interface object type
const SECURITY_OBJECT_TYPE: u16 = 17;

/// PID of the tool key in the security object
const PID_TOOL_KEY: u16 = 56;

/// Reply of a master reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartReply {
    /// Error code (0 = success, 1 = access denied, 2 = unsupported
    /// erase code, 3 = invalid channel)
    pub error_code: u8,
    /// Worst-case restart process time in seconds
    pub process_time: u16,
}

/// Description of one interface-object property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyDescription {
    /// Interface object index
    pub object_index: u8,
    /// Property identifier
    pub pid: u8,
    /// Property index within the object
    pub prop_index: u8,
    /// Write access enabled
    pub write_enabled: bool,
    /// Property data type
    pub pdt: u8,
    /// Maximum number of elements
    pub max_elements: u16,
    /// Read/write access levels
    pub access: u8,
}

struct Indication {
    frame: CemiLData,
    received: Instant,
}

struct McInner {
    tl: TransportLayer,
    security: Arc<Security>,
    response_timeout: Mutex<Duration>,
    queue: Mutex<Vec<Indication>>,
    cond: Condvar,
    /// Response APCI -> window expiry
    active: Mutex<HashMap<u16, Instant>>,
    max_apdu: Mutex<HashMap<IndividualAddress, usize>>,
    features: Mutex<HashMap<IndividualAddress, [u8; 10]>>,
    ext_memory: Mutex<HashMap<IndividualAddress, bool>>,
}

/// Application-layer management client.
///
/// # Examples
///
/// ```rust,no_run
/// use knx_netip::connection::{TunnelConfig, TunnelConnection};
/// use knx_netip::mgmt::ManagementClient;
/// use knx_netip::transport_layer::TransportLayer;
///
/// let tunnel = TunnelConnection::open(TunnelConfig::new("192.168.1.10:3671".parse().unwrap()))?;
/// let tl = TransportLayer::on_tunnel(&tunnel);
/// let mc = ManagementClient::new(tl);
///
/// let device = "1.1.5".parse().unwrap();
/// let dest = mc.transport_layer().create_destination(device, true, false, false)?;
/// mc.transport_layer().connect(&dest)?;
/// let descriptor = mc.read_device_desc(&dest, 0)?;
/// # Ok::<(), knx_netip::KnxError>(())
/// ```
#[derive(Clone)]
pub struct ManagementClient {
    inner: Arc<McInner>,
}

impl std::fmt::Debug for ManagementClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementClient").finish()
    }
}

struct McListener {
    inner: Weak<McInner>,
}

impl McListener {
    fn offer(&self, frame: &CemiLData) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let Some(apci) = frame.apci() else {
            return;
        };
        // only frames inside an active response window enter the queue
        let accepted = {
            let mut active = inner.active.lock();
            let now = Instant::now();
            active.retain(|_, expiry| *expiry > now);
            active.keys().any(|&code| apci & service_mask(code) == code)
        };
        if accepted {
            inner
                .queue
                .lock()
                .push(Indication { frame: frame.clone(), received: Instant::now() });
            inner.cond.notify_all();
        }
    }
}

impl TransportListener for McListener {
    fn broadcast(&self, frame: &CemiLData) {
        self.offer(frame);
    }

    fn data_individual(&self, frame: &CemiLData) {
        self.offer(frame);
    }

    fn data_connected(&self, frame: &CemiLData, _destination: &Destination) {
        self.offer(frame);
    }
}

impl ManagementClient {
    /// Create a management client with the process-default security
    /// store.
    pub fn new(tl: TransportLayer) -> Self {
        Self::with_security(tl, Security::default_instance().clone())
    }

    /// Create a management client with an explicit security store.
    pub fn with_security(tl: TransportLayer, security: Arc<Security>) -> Self {
        let inner = Arc::new(McInner {
            tl,
            security,
            response_timeout: Mutex::new(RESPONSE_TIMEOUT),
            queue: Mutex::new(Vec::new()),
            cond: Condvar::new(),
            active: Mutex::new(HashMap::new()),
            max_apdu: Mutex::new(HashMap::new()),
            features: Mutex::new(HashMap::new()),
            ext_memory: Mutex::new(HashMap::new()),
        });
        inner.tl.add_listener(Arc::new(McListener { inner: Arc::downgrade(&inner) }));
        Self { inner }
    }

    /// The wrapped transport layer
    pub fn transport_layer(&self) -> &TransportLayer {
        &self.inner.tl
    }

    /// Change the response window used by all services
    pub fn set_response_timeout(&self, timeout: Duration) {
        *self.inner.response_timeout.lock() = timeout;
    }

    fn response_timeout(&self) -> Duration {
        *self.inner.response_timeout.lock()
    }

    // =========================================================================
    // Queue machinery
    // =========================================================================

    /// Open a response window for the given APCI.
    fn expect(&self, response_apci: u16, window: Duration) {
        self.inner.active.lock().insert(response_apci, Instant::now() + window);
    }

    /// Collect matching responses until the deadline.
    ///
    /// With `one_response` the first match returns immediately; without,
    /// all matches arriving before the deadline are returned. No match
    /// at all fails with `Timeout`.
    fn wait_responses(
        &self,
        response_apci: u16,
        filter: impl Fn(&CemiLData) -> bool,
        one_response: bool,
        window: Duration,
    ) -> Result<Vec<CemiLData>> {
        let deadline = Instant::now() + window;
        let mask = service_mask(response_apci);
        let mut found = Vec::new();
        let mut queue = self.inner.queue.lock();
        loop {
            let now = Instant::now();
            queue.retain(|entry| now.duration_since(entry.received) < QUEUE_MAX_AGE);

            let mut i = 0;
            while i < queue.len() {
                let matches = queue[i].frame.apci().is_some_and(|a| a & mask == response_apci)
                    && filter(&queue[i].frame);
                if matches {
                    found.push(queue.remove(i).frame);
                } else {
                    i += 1;
                }
            }
            if one_response && !found.is_empty() {
                return Ok(found);
            }
            if self.inner.cond.wait_until(&mut queue, deadline).timed_out() {
                self.inner.active.lock().remove(&response_apci);
                if found.is_empty() {
                    return Err(KnxError::timeout());
                }
                return Ok(found);
            }
        }
    }

    fn send_to(&self, dest: &Arc<Destination>, tsdu: Vec<u8>, priority: Priority) -> Result<()> {
        if dest.is_connection_oriented() {
            self.inner.tl.send_data_connected(dest, &tsdu, priority)
        } else {
            self.inner.tl.send_data_individual(dest.address(), &tsdu, priority)
        }
    }

    /// Point-to-point request with a single expected response.
    fn request_one(
        &self,
        dest: &Arc<Destination>,
        tsdu: Vec<u8>,
        response_apci: u16,
        filter: impl Fn(&CemiLData) -> bool,
    ) -> Result<CemiLData> {
        let window = self.response_timeout();
        self.expect(response_apci, window);
        self.send_to(dest, tsdu, Priority::Low)?;
        let from = dest.address();
        let mut frames = self.wait_responses(
            response_apci,
            |frame| frame.source == from && filter(frame),
            true,
            window,
        )?;
        Ok(frames.remove(0))
    }

    /// Broadcast request collecting responses for the whole window.
    fn broadcast_collect(
        &self,
        tsdu: Vec<u8>,
        response_apci: u16,
        filter: impl Fn(&CemiLData) -> bool,
        one_response: bool,
        window: Duration,
    ) -> Result<Vec<CemiLData>> {
        self.expect(response_apci, window);
        self.inner.tl.broadcast(&tsdu, Priority::System)?;
        self.wait_responses(response_apci, filter, one_response, window)
    }

    // =========================================================================
    // Individual address programming
    // =========================================================================

    /// Read the individual addresses of devices in programming mode.
    pub fn read_address(&self) -> Result<Vec<IndividualAddress>> {
        let window = self.response_timeout();
        let frames = self.broadcast_collect(
            tpdu(apci::IND_ADDR_READ, 0, &[]),
            apci::IND_ADDR_RESPONSE,
            |_| true,
            false,
            window,
        )?;
        Ok(frames.into_iter().map(|f| f.source).collect())
    }

    /// Program the individual address of the device in programming mode.
    pub fn write_address(&self, address: IndividualAddress) -> Result<()> {
        self.inner
            .tl
            .broadcast(&tpdu(apci::IND_ADDR_WRITE, 0, &address.raw().to_be_bytes()), Priority::System)
    }

    /// Read the individual address of the device with the given serial
    /// number.
    pub fn read_address_serial(&self, serial: [u8; 6]) -> Result<IndividualAddress> {
        let window = self.response_timeout();
        let frames = self.broadcast_collect(
            tpdu(apci::IND_ADDR_SN_READ, 0, &serial),
            apci::IND_ADDR_SN_RESPONSE,
            move |frame| asdu(frame).len() >= 6 && asdu(frame)[..6] == serial,
            true,
            window,
        )?;
        Ok(frames[0].source)
    }

    /// Program the individual address of the device with the given
    /// serial number.
    pub fn write_address_serial(&self, serial: [u8; 6], address: IndividualAddress) -> Result<()> {
        let mut data = Vec::with_capacity(12);
        data.extend_from_slice(&serial);
        data.extend_from_slice(&address.raw().to_be_bytes());
        data.extend_from_slice(&[0; 4]);
        self.inner.tl.broadcast(&tpdu(apci::IND_ADDR_SN_WRITE, 0, &data), Priority::System)
    }

    // =========================================================================
    // Domain addresses
    // =========================================================================

    /// Read the domain addresses of devices in programming mode.
    pub fn read_domain(&self) -> Result<Vec<Vec<u8>>> {
        let window = self.response_timeout();
        let frames = self.broadcast_collect(
            tpdu(apci::DOMAIN_READ, 0, &[]),
            apci::DOMAIN_RESPONSE,
            |_| true,
            false,
            window,
        )?;
        Ok(frames.iter().map(|f| asdu(f).to_vec()).collect())
    }

    /// Selective domain address read: devices in `domain` with an
    /// address in `[start, start + range]` answer.
    pub fn read_domain_selective(
        &self,
        domain: [u8; 2],
        start: IndividualAddress,
        range: u8,
    ) -> Result<Vec<Vec<u8>>> {
        let mut data = Vec::with_capacity(5);
        data.extend_from_slice(&domain);
        data.extend_from_slice(&start.raw().to_be_bytes());
        data.push(range);
        let window = self.response_timeout();
        let frames = self.broadcast_collect(
            tpdu(apci::DOMAIN_SELECTIVE_READ, 0, &data),
            apci::DOMAIN_RESPONSE,
            |_| true,
            false,
            window,
        )?;
        Ok(frames.iter().map(|f| asdu(f).to_vec()).collect())
    }

    /// Write the domain address of the device in programming mode.
    ///
    /// Classic PL domains are 2 octets, RF domains 6 octets. The 21-octet
    /// KNX IP domain requires data security, which this stack does not
    /// provide.
    pub fn write_domain(&self, domain: &[u8]) -> Result<()> {
        match domain.len() {
            2 | 6 => {}
            21 => return Err(KnxError::illegal_argument("KNX IP domain requires data security")),
            _ => return Err(KnxError::illegal_argument("domain of 2 or 6 octets")),
        }
        self.inner.tl.broadcast(&tpdu(apci::DOMAIN_WRITE, 0, domain), Priority::System)
    }

    /// Read the domain address of the device with the given serial
    /// number.
    pub fn read_domain_serial(&self, serial: [u8; 6]) -> Result<Vec<u8>> {
        let window = self.response_timeout();
        let frames = self.broadcast_collect(
            tpdu(apci::DOMAIN_SN_READ, 0, &serial),
            apci::DOMAIN_SN_RESPONSE,
            move |frame| asdu(frame).len() >= 6 && asdu(frame)[..6] == serial,
            true,
            window,
        )?;
        Ok(asdu(&frames[0])[6..].to_vec())
    }

    // =========================================================================
    // Device descriptor, restart
    // =========================================================================

    /// Read device descriptor type 0 (mask version) or 2.
    pub fn read_device_desc(&self, dest: &Arc<Destination>, descriptor_type: u8) -> Result<Vec<u8>> {
        if descriptor_type != 0 && descriptor_type != 2 {
            return Err(KnxError::illegal_argument("descriptor type 0 or 2"));
        }
        let frame = self.request_one(
            dest,
            tpdu(apci::DEVICE_DESC_READ, descriptor_type, &[]),
            apci::DEVICE_DESC_RESPONSE,
            move |frame| frame.tpdu.get(1).is_some_and(|b| b & 0x3F == descriptor_type),
        )?;
        Ok(asdu(&frame).to_vec())
    }

    /// Basic restart of a device; unconfirmed.
    pub fn restart(&self, dest: &Arc<Destination>) -> Result<()> {
        self.send_to(dest, tpdu(apci::RESTART, 0, &[]), Priority::Low)
    }

    /// Master reset with erase code and channel. The reply carries an
    /// error code and the worst-case process time.
    pub fn restart_master(
        &self,
        dest: &Arc<Destination>,
        erase_code: u8,
        channel: u8,
    ) -> Result<RestartReply> {
        let frame = self.request_one(
            dest,
            tpdu(apci::RESTART, 0x01, &[erase_code, channel]),
            apci::RESTART_RESPONSE,
            |frame| asdu(frame).len() >= 3,
        )?;
        let data = asdu(&frame);
        let reply = RestartReply {
            error_code: data[0],
            process_time: u16::from_be_bytes([data[1], data[2]]),
        };
        if reply.error_code > 3 {
            return Err(KnxError::remote_error(reply.error_code));
        }
        Ok(reply)
    }

    // =========================================================================
    // Interface object properties (3-octet header)
    // =========================================================================

    /// Read the description of a property, selected by PID or, with
    /// PID 0, by property index.
    pub fn read_property_desc(
        &self,
        dest: &Arc<Destination>,
        object_index: u8,
        pid: u8,
        prop_index: u8,
    ) -> Result<PropertyDescription> {
        let frame = self.request_one(
            dest,
            tpdu(apci::PROPERTY_DESC_READ, 0, &[object_index, pid, prop_index]),
            apci::PROPERTY_DESC_RESPONSE,
            move |frame| {
                let d = asdu(frame);
                d.len() >= 7 && d[0] == object_index && (pid == 0 || d[1] == pid)
            },
        )?;
        let d = asdu(&frame);
        if d[3] == 0 && d[4] == 0 && d[5] == 0 {
            // a device answers an unknown property with zeroed description
            return Err(KnxError::remote_error(0));
        }
        Ok(PropertyDescription {
            object_index: d[0],
            pid: d[1],
            prop_index: d[2],
            write_enabled: d[3] & 0x80 != 0,
            pdt: d[3] & 0x3F,
            max_elements: u16::from_be_bytes([d[4], d[5]]) & 0x0FFF,
            access: d[6],
        })
    }

    /// Scan all property descriptions of an interface object.
    ///
    /// A scan step that times out is retried once before the scan ends.
    pub fn scan_properties(
        &self,
        dest: &Arc<Destination>,
        object_index: u8,
    ) -> Result<Vec<PropertyDescription>> {
        let mut found = Vec::new();
        for prop_index in 0u8..=255 {
            let mut result = self.read_property_desc(dest, object_index, 0, prop_index);
            if matches!(result, Err(KnxError::Timeout)) {
                debug!("property scan timeout at index {prop_index}, retrying once");
                result = self.read_property_desc(dest, object_index, 0, prop_index);
            }
            match result {
                Ok(desc) => found.push(desc),
                Err(KnxError::RemoteError { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    /// Read property elements, chunking multi-element reads by the
    /// destination's maximum APDU length and the property's element
    /// size.
    ///
    /// The returned data is the concatenation of all rows; its length
    /// equals `elements` times the PDT element size.
    pub fn read_property(
        &self,
        dest: &Arc<Destination>,
        object_index: u8,
        pid: u8,
        start: u16,
        elements: u8,
    ) -> Result<Vec<u8>> {
        if start > 0x0FFF {
            return Err(KnxError::illegal_argument("start index 0..=4095"));
        }
        let element_size = if elements > 1 {
            self.read_property_desc(dest, object_index, pid, 0)
                .map(|desc| pdt_element_size(desc.pdt))
                .unwrap_or(1)
        } else {
            1
        };
        let max_asdu = self.max_apdu_length(dest).saturating_sub(1);
        let per_read = (((max_asdu.saturating_sub(4)) / element_size).max(1) as u8).min(15);

        let mut out = Vec::new();
        let mut remaining = elements;
        let mut index = start;
        while remaining > 0 {
            let count = remaining.min(per_read);
            let row = self.read_property_once(dest, object_index, pid, index, count)?;
            out.extend_from_slice(&row);
            remaining -= count;
            index += u16::from(count);
        }
        Ok(out)
    }

    fn read_property_once(
        &self,
        dest: &Arc<Destination>,
        object_index: u8,
        pid: u8,
        start: u16,
        elements: u8,
    ) -> Result<Vec<u8>> {
        let header = prop_header(object_index, pid, elements, start);
        let frame = self.request_one(
            dest,
            tpdu(apci::PROPERTY_READ, 0, &header),
            apci::PROPERTY_RESPONSE,
            move |frame| {
                let d = asdu(frame);
                d.len() >= 4 && d[0] == object_index && d[1] == pid
            },
        )?;
        let d = asdu(&frame);
        let returned = d[2] >> 4;
        if returned == 0 {
            // zero elements signal the property access failure
            return Err(KnxError::remote_error(d.get(4).copied().unwrap_or(0)));
        }
        Ok(d[4..].to_vec())
    }

    /// Write property elements.
    pub fn write_property(
        &self,
        dest: &Arc<Destination>,
        object_index: u8,
        pid: u8,
        start: u16,
        elements: u8,
        data: &[u8],
    ) -> Result<()> {
        let mut body = prop_header(object_index, pid, elements, start).to_vec();
        body.extend_from_slice(data);
        let frame = self.request_one(
            dest,
            tpdu(apci::PROPERTY_WRITE, 0, &body),
            apci::PROPERTY_RESPONSE,
            move |frame| {
                let d = asdu(frame);
                d.len() >= 4 && d[0] == object_index && d[1] == pid
            },
        )?;
        let d = asdu(&frame);
        if d[2] >> 4 == 0 {
            return Err(KnxError::remote_error(d.get(4).copied().unwrap_or(0)));
        }
        Ok(())
    }

    // =========================================================================
    // Extended property services
    // =========================================================================

    /// Read elements of a property, addressing the interface object by
    /// its 16-bit type and 12-bit instance.
    pub fn read_property_ext(
        &self,
        dest: &Arc<Destination>,
        object_type: u16,
        instance: u16,
        pid: u16,
        start: u16,
        elements: u8,
    ) -> Result<Vec<u8>> {
        let header = ext_prop_header(object_type, instance, pid, start, elements)?;
        let frame = self.request_one(
            dest,
            tpdu(apci::PROPERTY_EXT_READ, 0, &header),
            apci::PROPERTY_EXT_RESPONSE,
            move |frame| asdu(frame).len() >= 8 && asdu(frame)[..5] == header[..5],
        )?;
        let d = asdu(&frame);
        if d[7] == 0 {
            // zero elements: a single return code follows
            let code = d.get(8).copied().unwrap_or(0);
            return Err(KnxError::negative_return_code(code));
        }
        Ok(d[8..].to_vec())
    }

    /// Write elements of a property through the extended service.
    ///
    /// Writing the tool key of the security object stages the new key:
    /// the stored tool key is replaced on success and restored on
    /// failure.
    pub fn write_property_ext(
        &self,
        dest: &Arc<Destination>,
        object_type: u16,
        instance: u16,
        pid: u16,
        start: u16,
        elements: u8,
        data: &[u8],
    ) -> Result<()> {
        let tool_key_update = object_type == SECURITY_OBJECT_TYPE
            && instance == 1
            && pid == PID_TOOL_KEY
            && data.len() == 16;
        let staged_old = if tool_key_update {
            let mut key = [0u8; 16];
            key.copy_from_slice(data);
            self.inner.security.set_device_tool_key(dest.address(), key)
        } else {
            None
        };

        let result = self.write_property_ext_once(dest, object_type, instance, pid, start, elements, data);
        if tool_key_update && result.is_err() {
            // roll the staged key back
            match staged_old {
                Some(old) => {
                    self.inner.security.set_device_tool_key(dest.address(), old);
                }
                None => {
                    self.inner.security.remove_device_tool_key(dest.address());
                }
            }
        }
        result
    }

    fn write_property_ext_once(
        &self,
        dest: &Arc<Destination>,
        object_type: u16,
        instance: u16,
        pid: u16,
        start: u16,
        elements: u8,
        data: &[u8],
    ) -> Result<()> {
        let header = ext_prop_header(object_type, instance, pid, start, elements)?;
        let mut body = header.to_vec();
        body.extend_from_slice(data);
        let frame = self.request_one(
            dest,
            tpdu(apci::PROPERTY_EXT_WRITE, 0, &body),
            apci::PROPERTY_EXT_WRITE_RESPONSE,
            move |frame| asdu(frame).len() >= 8 && asdu(frame)[..5] == header[..5],
        )?;
        let d = asdu(&frame);
        let code = d.get(8).copied().unwrap_or(0);
        if code > 0x7F {
            return Err(KnxError::negative_return_code(code));
        }
        Ok(())
    }

    /// Read an extended property description.
    pub fn read_property_ext_desc(
        &self,
        dest: &Arc<Destination>,
        object_type: u16,
        instance: u16,
        pid: u16,
        prop_index: u16,
    ) -> Result<Vec<u8>> {
        let mut header = Vec::with_capacity(7);
        header.extend_from_slice(&object_type.to_be_bytes());
        header.extend_from_slice(&pack_instance_pid(instance, pid)?);
        header.extend_from_slice(&prop_index.to_be_bytes());
        let head5: [u8; 5] = header[..5].try_into().unwrap();
        let frame = self.request_one(
            dest,
            tpdu(apci::PROPERTY_EXT_DESC_READ, 0, &header),
            apci::PROPERTY_EXT_DESC_RESPONSE,
            move |frame| asdu(frame).len() >= 5 && asdu(frame)[..5] == head5,
        )?;
        Ok(asdu(&frame).to_vec())
    }

    // =========================================================================
    // Function properties
    // =========================================================================

    /// Invoke a function property of an interface object.
    pub fn function_property_command(
        &self,
        dest: &Arc<Destination>,
        object_index: u8,
        pid: u8,
        data: &[u8],
    ) -> Result<(u8, Vec<u8>)> {
        let mut body = vec![object_index, pid];
        body.extend_from_slice(data);
        let frame = self.request_one(
            dest,
            tpdu(apci::FUNC_PROPERTY_COMMAND, 0, &body),
            apci::FUNC_PROPERTY_STATE_RESPONSE,
            move |frame| {
                let d = asdu(frame);
                d.len() >= 3 && d[0] == object_index && d[1] == pid
            },
        )?;
        let d = asdu(&frame);
        let code = d[2];
        if code > 0x7F {
            return Err(KnxError::negative_return_code(code));
        }
        Ok((code, d[3..].to_vec()))
    }

    /// Read the state of a function property.
    pub fn function_property_state(
        &self,
        dest: &Arc<Destination>,
        object_index: u8,
        pid: u8,
        data: &[u8],
    ) -> Result<(u8, Vec<u8>)> {
        let mut body = vec![object_index, pid];
        body.extend_from_slice(data);
        let frame = self.request_one(
            dest,
            tpdu(apci::FUNC_PROPERTY_STATE_READ, 0, &body),
            apci::FUNC_PROPERTY_STATE_RESPONSE,
            move |frame| {
                let d = asdu(frame);
                d.len() >= 3 && d[0] == object_index && d[1] == pid
            },
        )?;
        let d = asdu(&frame);
        Ok((d[2], d[3..].to_vec()))
    }

    /// Invoke a function property addressed by object type, instance and
    /// PID, carrying a service id.
    pub fn function_property_ext_command(
        &self,
        dest: &Arc<Destination>,
        object_type: u16,
        instance: u16,
        pid: u16,
        service_id: u8,
        data: &[u8],
    ) -> Result<(u8, Vec<u8>)> {
        self.function_property_ext(dest, apci::FUNC_PROPERTY_EXT_COMMAND, object_type, instance, pid, service_id, data)
    }

    /// Read a function property state addressed by object type, instance
    /// and PID.
    pub fn function_property_ext_state(
        &self,
        dest: &Arc<Destination>,
        object_type: u16,
        instance: u16,
        pid: u16,
        service_id: u8,
        data: &[u8],
    ) -> Result<(u8, Vec<u8>)> {
        self.function_property_ext(dest, apci::FUNC_PROPERTY_EXT_STATE_READ, object_type, instance, pid, service_id, data)
    }

    fn function_property_ext(
        &self,
        dest: &Arc<Destination>,
        service: u16,
        object_type: u16,
        instance: u16,
        pid: u16,
        service_id: u8,
        data: &[u8],
    ) -> Result<(u8, Vec<u8>)> {
        let mut body = Vec::with_capacity(6 + data.len());
        body.extend_from_slice(&object_type.to_be_bytes());
        body.extend_from_slice(&pack_instance_pid(instance, pid)?);
        body.push(service_id);
        body.extend_from_slice(data);
        let head5: [u8; 5] = body[..5].try_into().unwrap();
        let frame = self.request_one(
            dest,
            tpdu(service, 0, &body),
            apci::FUNC_PROPERTY_EXT_STATE_RESPONSE,
            move |frame| asdu(frame).len() >= 6 && asdu(frame)[..5] == head5,
        )?;
        let d = asdu(&frame);
        let code = d[5];
        if code > 0x7F {
            return Err(KnxError::negative_return_code(code));
        }
        Ok((code, d[6..].to_vec()))
    }

    // =========================================================================
    // ADC, memory
    // =========================================================================

    /// Read an A/D converter channel; requires a connection-oriented
    /// destination.
    pub fn read_adc(&self, dest: &Arc<Destination>, channel: u8, repeat: u8) -> Result<u16> {
        if channel > 63 {
            return Err(KnxError::illegal_argument("ADC channel 0..=63"));
        }
        if !dest.is_connection_oriented() {
            return Err(KnxError::illegal_argument("ADC read requires connection-oriented mode"));
        }
        let frame = self.request_one(
            dest,
            tpdu(apci::ADC_READ, channel, &[repeat]),
            apci::ADC_RESPONSE,
            move |frame| frame.tpdu.get(1).is_some_and(|b| b & 0x3F == channel),
        )?;
        let d = asdu(&frame);
        if d.len() < 3 {
            return Err(KnxError::invalid_response());
        }
        Ok(u16::from_be_bytes([d[1], d[2]]))
    }

    /// Read device memory.
    ///
    /// Addresses or lengths beyond the classic service switch to the
    /// extended service (24-bit address, up to 250 octets), probing the
    /// device for support on first use.
    pub fn read_memory(&self, dest: &Arc<Destination>, address: u32, bytes: usize) -> Result<Vec<u8>> {
        if bytes == 0 {
            return Err(KnxError::illegal_argument("memory read of at least 1 octet"));
        }
        let needs_extended = address > 0xFFFF || address as usize + bytes > 0x1_0000;
        let use_extended = needs_extended || self.extended_memory_supported(dest);
        if needs_extended && !self.extended_memory_supported(dest) {
            return Err(KnxError::illegal_argument("device lacks extended memory services"));
        }

        let chunk_limit = if use_extended { 250 } else { 63 };
        let max_payload = self.max_apdu_length(dest).saturating_sub(if use_extended { 5 } else { 4 });
        let per_read = chunk_limit.min(max_payload.max(1));

        let mut out = Vec::with_capacity(bytes);
        let mut addr = address;
        let mut remaining = bytes;
        while remaining > 0 {
            let count = remaining.min(per_read);
            let chunk = if use_extended {
                self.read_memory_ext_once(dest, addr, count)?
            } else {
                self.read_memory_once(dest, addr as u16, count)?
            };
            out.extend_from_slice(&chunk);
            addr += count as u32;
            remaining -= count;
        }
        Ok(out)
    }

    fn read_memory_once(&self, dest: &Arc<Destination>, address: u16, count: usize) -> Result<Vec<u8>> {
        let frame = self.request_one(
            dest,
            tpdu(apci::MEMORY_READ, count as u8, &address.to_be_bytes()),
            apci::MEMORY_RESPONSE,
            move |frame| {
                let d = asdu(frame);
                d.len() >= 2 && u16::from_be_bytes([d[0], d[1]]) == address
            },
        )?;
        let returned = frame.tpdu[1] & 0x3F;
        if returned == 0 {
            return Err(KnxError::remote_error(0));
        }
        Ok(asdu(&frame)[2..].to_vec())
    }

    fn read_memory_ext_once(&self, dest: &Arc<Destination>, address: u32, count: usize) -> Result<Vec<u8>> {
        let mut body = vec![count as u8];
        body.extend_from_slice(&address.to_be_bytes()[1..]);
        let frame = self.request_one(
            dest,
            tpdu(apci::MEMORY_EXT_READ, 0, &body),
            apci::MEMORY_EXT_READ_RESPONSE,
            move |frame| {
                let d = asdu(frame);
                d.len() >= 4 && d[1..4] == address.to_be_bytes()[1..]
            },
        )?;
        let d = asdu(&frame);
        if d[0] != 0 {
            return Err(KnxError::negative_return_code(d[0]));
        }
        Ok(d[4..].to_vec())
    }

    /// Write device memory, switching to the extended service like
    /// [`Self::read_memory`]. With the destination in verify mode the
    /// written range is read back and compared.
    pub fn write_memory(&self, dest: &Arc<Destination>, address: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(KnxError::illegal_argument("memory write of at least 1 octet"));
        }
        let needs_extended = address > 0xFFFF || address as usize + data.len() > 0x1_0000;
        let use_extended = needs_extended || self.extended_memory_supported(dest);
        if needs_extended && !self.extended_memory_supported(dest) {
            return Err(KnxError::illegal_argument("device lacks extended memory services"));
        }

        let chunk_limit = if use_extended { 250 } else { 63 };
        let max_payload = self.max_apdu_length(dest).saturating_sub(if use_extended { 5 } else { 4 });
        let per_write = chunk_limit.min(max_payload.max(1));

        let mut addr = address;
        let mut rest = data;
        while !rest.is_empty() {
            let count = rest.len().min(per_write);
            if use_extended {
                self.write_memory_ext_once(dest, addr, &rest[..count])?;
            } else {
                self.write_memory_once(dest, addr as u16, &rest[..count])?;
            }
            addr += count as u32;
            rest = &rest[count..];
        }

        if dest.verify_mode() {
            let readback = self.read_memory(dest, address, data.len())?;
            if readback != data {
                return Err(KnxError::remote_error(0));
            }
        }
        Ok(())
    }

    fn write_memory_once(&self, dest: &Arc<Destination>, address: u16, data: &[u8]) -> Result<()> {
        let mut body = address.to_be_bytes().to_vec();
        body.extend_from_slice(data);
        // classic memory write is unconfirmed unless the device echoes
        self.send_to(dest, tpdu(apci::MEMORY_WRITE, data.len() as u8, &body), Priority::Low)
    }

    fn write_memory_ext_once(&self, dest: &Arc<Destination>, address: u32, data: &[u8]) -> Result<()> {
        let mut body = vec![data.len() as u8];
        body.extend_from_slice(&address.to_be_bytes()[1..]);
        body.extend_from_slice(data);
        let frame = self.request_one(
            dest,
            tpdu(apci::MEMORY_EXT_WRITE, 0, &body),
            apci::MEMORY_EXT_WRITE_RESPONSE,
            move |frame| {
                let d = asdu(frame);
                d.len() >= 4 && d[1..4] == address.to_be_bytes()[1..]
            },
        )?;
        let d = asdu(&frame);
        match d[0] {
            0 => Ok(()),
            // SuccessWithCrc: the reply carries a CRC over the written data
            1 => {
                if d.len() < 6 {
                    return Err(KnxError::invalid_response());
                }
                let crc = u16::from_be_bytes([d[4], d[5]]);
                if crc != crc16_ccitt(data) {
                    warn!("extended memory write CRC mismatch at 0x{address:06x}");
                    return Err(KnxError::invalid_response());
                }
                Ok(())
            }
            code => Err(KnxError::negative_return_code(code)),
        }
    }

    /// Probe whether the device supports the extended memory services,
    /// caching the outcome per destination. The features-supported mask
    /// (device object PID 89) is consulted first; a missing mask falls
    /// back to a trial read.
    fn extended_memory_supported(&self, dest: &Arc<Destination>) -> bool {
        if let Some(&cached) = self.inner.ext_memory.lock().get(&dest.address()) {
            return cached;
        }
        let supported = match self.supported_features(dest) {
            // extended memory services flag in the first mask octet
            Ok(mask) => mask[0] & 0x01 != 0,
            Err(_) => {
                // trial: any answer, even a negative one, proves support
                match self.read_memory_ext_once(dest, 0, 1) {
                    Ok(_) | Err(KnxError::NegativeReturnCode(_)) => true,
                    Err(_) => false,
                }
            }
        };
        self.inner.ext_memory.lock().insert(dest.address(), supported);
        supported
    }

    /// The features-supported mask of a device (device object PID 89,
    /// 80 bits), cached per destination.
    pub fn supported_features(&self, dest: &Arc<Destination>) -> Result<[u8; 10]> {
        if let Some(&mask) = self.inner.features.lock().get(&dest.address()) {
            return Ok(mask);
        }
        let data = self.read_property(dest, DEVICE_OBJECT_INDEX, PID_FEATURES_SUPPORTED, 1, 1)?;
        if data.len() < 10 {
            return Err(KnxError::invalid_response());
        }
        let mut mask = [0u8; 10];
        mask.copy_from_slice(&data[..10]);
        self.inner.features.lock().insert(dest.address(), mask);
        Ok(mask)
    }

    /// Maximum APDU length of a device, queried once from the device
    /// object (PID 56) and cached; defaults to 15 octets.
    pub fn max_apdu_length(&self, dest: &Arc<Destination>) -> usize {
        if let Some(&len) = self.inner.max_apdu.lock().get(&dest.address()) {
            return len;
        }
        let len = self
            .read_property_once(dest, DEVICE_OBJECT_INDEX, PID_MAX_APDU_LENGTH, 1, 1)
            .ok()
            .filter(|data| data.len() >= 2)
            .map_or(DEFAULT_MAX_APDU, |data| usize::from(u16::from_be_bytes([data[0], data[1]])));
        self.inner.max_apdu.lock().insert(dest.address(), len);
        len
    }

    // =========================================================================
    // Authorization
    // =========================================================================

    /// Authorize with an access key; returns the granted level
    /// (255 means free access).
    pub fn authorize(&self, dest: &Arc<Destination>, key: [u8; 4]) -> Result<u8> {
        let mut body = vec![0u8];
        body.extend_from_slice(&key);
        let frame = self.request_one(
            dest,
            tpdu(apci::AUTHORIZE, 0, &body),
            apci::AUTHORIZE_RESPONSE,
            |frame| !asdu(frame).is_empty(),
        )?;
        Ok(asdu(&frame)[0])
    }

    /// Write the access key for a level (0..=254; deleting with level
    /// 255 means free access). Returns the level granted by the device.
    pub fn write_key(&self, dest: &Arc<Destination>, level: u8, key: [u8; 4]) -> Result<u8> {
        let mut body = vec![level];
        body.extend_from_slice(&key);
        let frame = self.request_one(
            dest,
            tpdu(apci::KEY_WRITE, 0, &body),
            apci::KEY_RESPONSE,
            |frame| !asdu(frame).is_empty(),
        )?;
        let granted = asdu(&frame)[0];
        if granted == 0xFF && level != 0xFF {
            return Err(KnxError::remote_error(granted));
        }
        Ok(granted)
    }

    // =========================================================================
    // Network parameters
    // =========================================================================

    /// Read a network parameter; broadcast with collection over the
    /// given window.
    pub fn read_network_parameter(
        &self,
        object_type: u16,
        pid: u8,
        test_info: &[u8],
        window: Duration,
    ) -> Result<Vec<Vec<u8>>> {
        let mut body = object_type.to_be_bytes().to_vec();
        body.push(pid);
        body.extend_from_slice(test_info);
        let frames = self.broadcast_collect(
            tpdu(apci::NET_PARAM_READ, 0, &body),
            apci::NET_PARAM_RESPONSE,
            |_| true,
            false,
            window,
        )?;
        Ok(frames.iter().map(|f| asdu(f).to_vec()).collect())
    }

    /// Write a network parameter; unconfirmed broadcast.
    pub fn write_network_parameter(&self, object_type: u16, pid: u8, value: &[u8]) -> Result<()> {
        let mut body = object_type.to_be_bytes().to_vec();
        body.push(pid);
        body.extend_from_slice(value);
        self.inner.tl.broadcast(&tpdu(apci::NET_PARAM_WRITE, 0, &body), Priority::System)
    }

    /// Read a system network parameter with a per-operand response
    /// window.
    pub fn read_system_network_parameter(
        &self,
        object_type: u16,
        pid: u16,
        operand: u8,
        window: Duration,
    ) -> Result<Vec<Vec<u8>>> {
        let mut body = object_type.to_be_bytes().to_vec();
        body.push((pid >> 4) as u8);
        body.push(((pid & 0x0F) << 4) as u8);
        body.push(operand);
        let frames = self.broadcast_collect(
            tpdu(apci::SYS_NET_PARAM_READ, 0, &body),
            apci::SYS_NET_PARAM_RESPONSE,
            |_| true,
            false,
            window,
        )?;
        Ok(frames.iter().map(|f| asdu(f).to_vec()).collect())
    }

    /// Write a system network parameter; unconfirmed broadcast.
    pub fn write_system_network_parameter(
        &self,
        object_type: u16,
        pid: u16,
        value: &[u8],
    ) -> Result<()> {
        let mut body = object_type.to_be_bytes().to_vec();
        body.push((pid >> 4) as u8);
        body.push(((pid & 0x0F) << 4) as u8);
        body.extend_from_slice(value);
        self.inner.tl.broadcast(&tpdu(apci::SYS_NET_PARAM_WRITE, 0, &body), Priority::System)
    }
}

/// Application-layer service data: everything after the two APCI octets.
fn asdu(frame: &CemiLData) -> &[u8] {
    frame.tpdu.get(2..).unwrap_or(&[])
}

/// Classic property service header: object index, PID, element count
/// (4 bit) and start index (12 bit).
fn prop_header(object_index: u8, pid: u8, elements: u8, start: u16) -> [u8; 4] {
    [
        object_index,
        pid,
        (elements << 4) | ((start >> 8) as u8 & 0x0F),
        start as u8,
    ]
}

/// Extended property header: object type (16 bit), instance (12 bit),
/// PID (12 bit), start (16 bit), element count (8 bit).
fn ext_prop_header(
    object_type: u16,
    instance: u16,
    pid: u16,
    start: u16,
    elements: u8,
) -> Result<[u8; 8]> {
    let packed = pack_instance_pid(instance, pid)?;
    Ok([
        (object_type >> 8) as u8,
        object_type as u8,
        packed[0],
        packed[1],
        packed[2],
        (start >> 8) as u8,
        start as u8,
        elements,
    ])
}

/// Pack a 12-bit object instance and 12-bit PID into three octets.
fn pack_instance_pid(instance: u16, pid: u16) -> Result<[u8; 3]> {
    if instance > 0x0FFF {
        return Err(KnxError::illegal_argument("object instance 0..=4095"));
    }
    if pid > 0x0FFF {
        return Err(KnxError::illegal_argument("property id 0..=4095"));
    }
    Ok([
        (instance >> 4) as u8,
        (((instance & 0x0F) << 4) as u8) | (pid >> 8) as u8,
        pid as u8,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cemi::{CemiLData, KnxAddress};
    use crate::protocol::constants::CEMIMessageCode;
    use crate::transport_layer::NetworkLink;

    fn local() -> IndividualAddress {
        IndividualAddress::new(1, 1, 1).unwrap()
    }

    fn device() -> IndividualAddress {
        IndividualAddress::new(1, 1, 5).unwrap()
    }

    /// Link that answers property services like a device with a
    /// 15-octet APDU and a 16-bit property under PID 54.
    struct ScriptedLink {
        tl: Mutex<Option<TransportLayer>>,
    }

    impl ScriptedLink {
        fn answer(&self, tsdu: &[u8]) -> Option<Vec<u8>> {
            let apci = ((u16::from(tsdu[0]) & 0x03) << 8) | u16::from(tsdu[1]);
            let d = &tsdu[2..];
            match apci {
                apci::PROPERTY_DESC_READ => {
                    // PDT unsigned int (2 octets), 12 elements max
                    Some(tpdu(
                        apci::PROPERTY_DESC_RESPONSE,
                        0,
                        &[d[0], 54, 0, 0x04, 0x00, 0x0C, 0x00],
                    ))
                }
                apci::PROPERTY_READ if d[1] == PID_MAX_APDU_LENGTH => {
                    let mut body = d[..4].to_vec();
                    body.extend_from_slice(&[0x00, 0x0F]);
                    Some(tpdu(apci::PROPERTY_RESPONSE, 0, &body))
                }
                apci::PROPERTY_READ if d[1] == 54 => {
                    let elements = d[2] >> 4;
                    let start = (u16::from(d[2] & 0x0F) << 8) | u16::from(d[3]);
                    let mut body = d[..4].to_vec();
                    for i in 0..elements {
                        let value = 0x1100 + start + u16::from(i);
                        body.extend_from_slice(&value.to_be_bytes());
                    }
                    Some(tpdu(apci::PROPERTY_RESPONSE, 0, &body))
                }
                _ => None,
            }
        }
    }

    impl NetworkLink for ScriptedLink {
        fn send_frame(&self, frame: &CemiLData, _confirm: bool) -> Result<()> {
            if let Some(response) = self.answer(&frame.tpdu) {
                let tl = self.tl.lock().clone().unwrap();
                let reply = CemiLData::new(
                    CEMIMessageCode::LDataInd,
                    device(),
                    KnxAddress::Individual(local()),
                    response,
                    Priority::Low,
                );
                std::thread::spawn(move || tl.handle_indication(&reply));
            }
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_chunked_property_read() {
        let link = Arc::new(ScriptedLink { tl: Mutex::new(None) });
        let tl = TransportLayer::new(link.clone(), Some(local()));
        *link.tl.lock() = Some(tl.clone());
        let mc = ManagementClient::with_security(tl.clone(), Security::new());

        let dest = tl.create_destination(device(), false, false, false).unwrap();

        // max APDU 15 with 2-octet elements: (14 - 4) / 2 = 5 per read,
        // so 8 elements arrive in two rows concatenated to 16 octets
        let data = mc.read_property(&dest, 0, 54, 1, 8).unwrap();
        assert_eq!(data.len(), 16);
        for (i, chunk) in data.chunks_exact(2).enumerate() {
            let value = u16::from_be_bytes([chunk[0], chunk[1]]);
            assert_eq!(value, 0x1101 + i as u16);
        }
    }

    #[test]
    fn test_max_apdu_cached() {
        let link = Arc::new(ScriptedLink { tl: Mutex::new(None) });
        let tl = TransportLayer::new(link.clone(), Some(local()));
        *link.tl.lock() = Some(tl.clone());
        let mc = ManagementClient::with_security(tl.clone(), Security::new());

        let dest = tl.create_destination(device(), false, false, false).unwrap();
        assert_eq!(mc.max_apdu_length(&dest), 15);
        // the cached value is served without another exchange
        assert_eq!(mc.max_apdu_length(&dest), 15);
    }

    #[test]
    fn test_prop_header_packing() {
        let h = prop_header(0, 56, 1, 1);
        assert_eq!(h, [0, 56, 0x10, 0x01]);
        let h = prop_header(3, 54, 8, 0x234);
        assert_eq!(h, [3, 54, 0x82, 0x34]);
    }

    #[test]
    fn test_ext_prop_header_packing() {
        let h = ext_prop_header(17, 1, 56, 1, 1).unwrap();
        assert_eq!(h, [0x00, 0x11, 0x00, 0x10, 0x38, 0x00, 0x01, 0x01]);
        assert!(ext_prop_header(0, 0x1000, 0, 0, 1).is_err());
        assert!(ext_prop_header(0, 0, 0x1000, 0, 1).is_err());
    }

    #[test]
    fn test_pack_instance_pid() {
        assert_eq!(pack_instance_pid(0xABC, 0xDEF).unwrap(), [0xAB, 0xCD, 0xEF]);
    }

    #[test]
    fn test_asdu_extraction() {
        use crate::protocol::cemi::KnxAddress;
        use crate::protocol::constants::CEMIMessageCode;
        let frame = CemiLData::new(
            CEMIMessageCode::LDataInd,
            IndividualAddress::new(1, 1, 5).unwrap(),
            KnxAddress::Individual(IndividualAddress::new(1, 1, 1).unwrap()),
            vec![0x03, 0xD6, 0x00, 0x38, 0x10, 0x01, 0x00, 0xFE],
            Priority::Low,
        );
        assert_eq!(frame.apci(), Some(apci::PROPERTY_RESPONSE));
        assert_eq!(asdu(&frame), &[0x00, 0x38, 0x10, 0x01, 0x00, 0xFE]);
    }
}
