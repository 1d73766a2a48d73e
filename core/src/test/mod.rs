//! End-to-end scenarios driven through [`Switch`] with raw Ethernet frames

mod nat;
mod udp;

use std::net::SocketAddr;

use crossbeam_channel::Receiver;
use smoltcp::wire::EthernetAddress;

use crate::config::SwitchConfig;
use crate::packet::{Frame, FramePayload, IpPacket, TcpFlags, TcpSegment, build_frame};
use crate::reactor::VirtualReactor;
use crate::stack::{InboundFrame, OutboundFrame};
use crate::switch::Switch;

pub const VNI: u32 = 1314;
pub const SYN_MAC: EthernetAddress = EthernetAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
pub const CLIENT_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x05]);
pub const SERVER_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x20]);
pub const CLIENT_PORT: u32 = 3;
pub const SERVER_PORT: u32 = 4;

pub fn sa(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// `10.0.0.0/24` with `10.0.0.1 -> aa:bb:cc:dd:ee:ff`
pub struct Harness {
    pub sw: Switch<VirtualReactor>,
    pub rx: Receiver<OutboundFrame>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SwitchConfig::default())
    }

    pub fn with_config(config: SwitchConfig) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut sw = Switch::new(&config, VirtualReactor::new(), tx);
        sw.add_network(VNI, "10.0.0.0/24".parse().unwrap(), None)
            .unwrap();
        sw.add_ip(VNI, "10.0.0.1".parse().unwrap(), SYN_MAC).unwrap();
        Self { sw, rx }
    }

    /// Sends an IP packet from `src_mac` on `port`, addressed to the synthetic MAC
    pub fn send(&mut self, port: u32, src_mac: EthernetAddress, ip: IpPacket) {
        let frame = build_frame(src_mac, SYN_MAC, ip.ethertype(), &ip.emit().unwrap());
        self.sw.input(InboundFrame {
            vni: VNI,
            port,
            frame,
        });
    }

    pub fn client_tcp(&mut self, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) {
        let ip = tcp("10.0.0.5:4000", "10.0.0.1:80", seq, ack, flags, payload);
        self.send(CLIENT_PORT, CLIENT_MAC, ip);
    }

    /// IP packets sent so far, with the port they left on
    pub fn out(&mut self) -> Vec<(Option<u32>, IpPacket)> {
        self.rx
            .try_iter()
            .filter_map(|f| match Frame::parse(&f.frame).unwrap().payload {
                FramePayload::Ip(ip) => Some((f.port, ip)),
                _ => None,
            })
            .collect()
    }

    /// TCP segments sent so far
    pub fn segments(&mut self) -> Vec<TcpSegment> {
        self.out()
            .into_iter()
            .filter_map(|(_, ip)| ip.tcp_segment().cloned())
            .collect()
    }
}

pub fn tcp(src: &str, dst: &str, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> IpPacket {
    let (src, dst) = (sa(src), sa(dst));
    let mut seg = TcpSegment::new(src.port(), dst.port(), seq, ack, flags);
    seg.window = 65535;
    seg.payload = payload.to_vec();
    IpPacket::tcp(src, dst, seg)
}
