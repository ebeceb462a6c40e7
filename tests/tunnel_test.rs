//! Integration tests driving client connections against an in-process
//! KNXnet/IP server on the loopback interface.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use knx_netip::addressing::{GroupAddress, IndividualAddress};
use knx_netip::connection::{
    BlockingMode, ConnectionListener, ConnectionState, DeviceMgmtConnection, TunnelConfig,
    TunnelConnection,
};
use knx_netip::protocol::cemi::{Cemi, CemiDevMgmt, CemiLData, KnxAddress};
use knx_netip::protocol::constants::{CEMIMessageCode, Priority};
use knx_netip::protocol::frame::{Hpai, KnxnetIpHeader};
use knx_netip::protocol::services::{
    ConnectRequest, ConnectResponse, ConnectionHeader, Crd, DataRequest, DisconnectRequest,
    DisconnectResponse, ServiceAck,
};

const CHANNEL: u8 = 21;

fn server_assigned_source() -> IndividualAddress {
    IndividualAddress::new(1, 1, 250).unwrap()
}

/// Minimal tunneling server: answers the connect exchange, acknowledges
/// every tunneling request, echoes an `L_Data.con`, and answers the
/// disconnect exchange.
fn spawn_tunnel_server() -> (SocketAddrV4, thread::JoinHandle<()>) {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = match socket.local_addr().unwrap() {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => unreachable!(),
    };

    let handle = thread::spawn(move || {
        socket.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut buf = [0u8; 512];
        let mut server_seq = 0u8;

        loop {
            let Ok((len, client)) = socket.recv_from(&mut buf) else {
                return;
            };
            let header = KnxnetIpHeader::parse(&buf[..len]).unwrap();
            let body = &buf[KnxnetIpHeader::SIZE..header.total_length as usize];

            match header.service_type {
                0x0205 => {
                    ConnectRequest::parse(body).unwrap();
                    let response = ConnectResponse {
                        channel_id: CHANNEL,
                        status: 0,
                        data_endpoint: Hpai::Udp(addr),
                        crd: Crd::Tunnel { address: server_assigned_source() },
                    };
                    socket.send_to(&response.build(), client).unwrap();
                }
                0x0420 => {
                    let request = DataRequest::parse(0x0420, body).unwrap();
                    let seq = request.header.sequence;
                    let ack = ServiceAck::tunneling(CHANNEL, seq, 0);
                    socket.send_to(&ack.build(), client).unwrap();

                    // echo the confirmation with the server-assigned source
                    let mut con = CemiLData::parse(&request.cemi).unwrap();
                    con.code = CEMIMessageCode::LDataCon;
                    con.source = server_assigned_source();
                    let echo = DataRequest::tunneling(
                        ConnectionHeader::new(CHANNEL, server_seq),
                        con.to_vec(),
                    );
                    server_seq = server_seq.wrapping_add(1);
                    socket.send_to(&echo.build(), client).unwrap();
                }
                0x0421 => {
                    // client acknowledges our confirmation echo
                }
                0x0207 => {
                    let response = [CHANNEL, 0x00];
                    let frame = knx_netip::protocol::frame::make_frame(0x0208, &response);
                    socket.send_to(&frame, client).unwrap();
                }
                0x0209 => {
                    DisconnectRequest::parse(body).unwrap();
                    let response = DisconnectResponse { channel_id: CHANNEL, status: 0 };
                    socket.send_to(&response.build(), client).unwrap();
                    return;
                }
                other => panic!("unexpected service 0x{other:04x}"),
            }
        }
    });
    (addr, handle)
}

struct FrameCollector {
    confirmations: Mutex<Vec<CemiLData>>,
    indications: AtomicU32,
}

impl ConnectionListener for FrameCollector {
    fn frame_received(&self, frame: &Cemi) {
        if let Cemi::LData(ldata) = frame {
            if ldata.code == CEMIMessageCode::LDataCon {
                self.confirmations.lock().push(ldata.clone());
            } else {
                self.indications.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn group_write_frame() -> CemiLData {
    CemiLData::new(
        CEMIMessageCode::LDataReq,
        IndividualAddress::from(0),
        KnxAddress::Group(GroupAddress::new(0, 0, 1).unwrap()),
        vec![0x00, 0x81],
        Priority::Normal,
    )
}

#[test]
fn tunnel_send_wait_for_con() {
    let (server, handle) = spawn_tunnel_server();

    let tunnel = TunnelConnection::open(TunnelConfig::new(server)).unwrap();
    assert_eq!(tunnel.channel_id(), CHANNEL);
    assert_eq!(tunnel.state(), ConnectionState::Ok);
    assert_eq!(tunnel.address(), Some(server_assigned_source()));

    let collector = Arc::new(FrameCollector {
        confirmations: Mutex::new(Vec::new()),
        indications: AtomicU32::new(0),
    });
    tunnel.add_listener(collector.clone());

    // blocking send: ack plus confirmation echo bring the state back to OK
    tunnel.send(&group_write_frame(), BlockingMode::WaitForCon).unwrap();
    assert_eq!(tunnel.state(), ConnectionState::Ok);

    // the listener saw the confirmation before the send returned
    let confirmations = collector.confirmations.lock();
    assert_eq!(confirmations.len(), 1);
    assert_eq!(confirmations[0].source, server_assigned_source());
    drop(confirmations);

    tunnel.close();
    assert_eq!(tunnel.state(), ConnectionState::Closed);
    handle.join().unwrap();
}

#[test]
fn tunnel_send_after_close_fails() {
    let (server, handle) = spawn_tunnel_server();
    let tunnel = TunnelConnection::open(TunnelConfig::new(server)).unwrap();
    tunnel.close();

    // closed is absorbing
    assert_eq!(tunnel.state(), ConnectionState::Closed);
    let err = tunnel.send(&group_write_frame(), BlockingMode::WaitForAck).unwrap_err();
    assert!(err.is_closed());
    handle.join().unwrap();
}

#[test]
fn busmonitor_tunnel_rejects_sends() {
    let (server, handle) = spawn_tunnel_server();
    let tunnel =
        TunnelConnection::open(TunnelConfig::new(server).busmonitor()).unwrap();

    let err = tunnel.send(&group_write_frame(), BlockingMode::NonBlocking).unwrap_err();
    assert!(matches!(err, knx_netip::KnxError::IllegalArgument(_)));

    tunnel.close();
    handle.join().unwrap();
}

/// Repetitions of an inbound tunneling request are acknowledged but not
/// redelivered.
#[test]
fn tunnel_inbound_repetition_suppressed() {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = match socket.local_addr().unwrap() {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => unreachable!(),
    };

    let handle = thread::spawn(move || {
        socket.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut buf = [0u8; 512];

        // connect exchange
        let (len, client) = socket.recv_from(&mut buf).unwrap();
        let header = KnxnetIpHeader::parse(&buf[..len]).unwrap();
        assert_eq!(header.service_type, 0x0205);
        let response = ConnectResponse {
            channel_id: CHANNEL,
            status: 0,
            data_endpoint: Hpai::Udp(addr),
            crd: Crd::Tunnel { address: server_assigned_source() },
        };
        socket.send_to(&response.build(), client).unwrap();

        // the same indication twice with sequence 0
        let ind = CemiLData::new(
            CEMIMessageCode::LDataInd,
            server_assigned_source(),
            KnxAddress::Group(GroupAddress::new(1, 2, 3).unwrap()),
            vec![0x00, 0x81],
            Priority::Normal,
        );
        let request = DataRequest::tunneling(ConnectionHeader::new(CHANNEL, 0), ind.to_vec());
        for _ in 0..2 {
            socket.send_to(&request.build(), client).unwrap();
            // await the acknowledgment so ordering is deterministic
            loop {
                let (len, _) = socket.recv_from(&mut buf).unwrap();
                let header = KnxnetIpHeader::parse(&buf[..len]).unwrap();
                if header.service_type == 0x0421 {
                    let ack = ServiceAck::parse(0x0421, &buf[6..len]).unwrap();
                    assert_eq!(ack.header.sequence, 0);
                    break;
                }
            }
        }

        // disconnect exchange on close
        loop {
            let (len, client) = socket.recv_from(&mut buf).unwrap();
            let header = KnxnetIpHeader::parse(&buf[..len]).unwrap();
            if header.service_type == 0x0209 {
                let response = DisconnectResponse { channel_id: CHANNEL, status: 0 };
                socket.send_to(&response.build(), client).unwrap();
                return;
            }
        }
    });

    let tunnel = TunnelConnection::open(TunnelConfig::new(addr)).unwrap();
    let collector = Arc::new(FrameCollector {
        confirmations: Mutex::new(Vec::new()),
        indications: AtomicU32::new(0),
    });
    tunnel.add_listener(collector.clone());

    // both datagrams are acked by the client; give delivery a moment
    thread::sleep(Duration::from_millis(500));
    assert_eq!(collector.indications.load(Ordering::Relaxed), 1);

    tunnel.close();
    handle.join().unwrap();
}

/// Device management: property read round trip with the confirmation
/// delivered in a server-side configuration request.
#[test]
fn device_mgmt_property_read() {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = match socket.local_addr().unwrap() {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => unreachable!(),
    };

    let handle = thread::spawn(move || {
        socket.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut buf = [0u8; 512];

        let (len, client) = socket.recv_from(&mut buf).unwrap();
        let header = KnxnetIpHeader::parse(&buf[..len]).unwrap();
        assert_eq!(header.service_type, 0x0205);
        let response = ConnectResponse {
            channel_id: CHANNEL,
            status: 0,
            data_endpoint: Hpai::Udp(addr),
            crd: Crd::DeviceMgmt,
        };
        socket.send_to(&response.build(), client).unwrap();

        loop {
            let (len, client) = socket.recv_from(&mut buf).unwrap();
            let header = KnxnetIpHeader::parse(&buf[..len]).unwrap();
            let body = &buf[KnxnetIpHeader::SIZE..header.total_length as usize];
            match header.service_type {
                0x0310 => {
                    let request = DataRequest::parse(0x0310, body).unwrap();
                    let ack = ServiceAck::device_config(CHANNEL, request.header.sequence, 0);
                    socket.send_to(&ack.build(), client).unwrap();

                    let read = CemiDevMgmt::parse(&request.cemi).unwrap();
                    assert_eq!(read.code, CEMIMessageCode::MPropReadReq);
                    assert_eq!(read.pid, 56);

                    // MAX_APDULENGTH = 254
                    let mut con = read.clone();
                    con.code = CEMIMessageCode::MPropReadCon;
                    con.data = vec![0x00, 0xFE];
                    let reply =
                        DataRequest::device_config(ConnectionHeader::new(CHANNEL, 0), con.to_vec());
                    socket.send_to(&reply.build(), client).unwrap();
                }
                0x0311 => {
                    // client acknowledged our confirmation
                }
                0x0209 => {
                    let response = DisconnectResponse { channel_id: CHANNEL, status: 0 };
                    socket.send_to(&response.build(), client).unwrap();
                    return;
                }
                other => panic!("unexpected service 0x{other:04x}"),
            }
        }
    });

    let dm = DeviceMgmtConnection::open(addr).unwrap();
    let data = dm.property_read(0, 1, 56, 1, 1).unwrap();
    assert_eq!(data, vec![0x00, 0xFE]);

    dm.close();
    handle.join().unwrap();
}
