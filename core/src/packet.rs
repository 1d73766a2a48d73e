//! Frame and packet codec on top of `smoltcp::wire`
//!
//! Frames are decoded into owned representations so the NAT engine can
//! rewrite addresses and ports freely; checksums are recomputed on emit.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bitflags::bitflags;
use smoltcp::phy::{ChecksumCapabilities, Medium};
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, HardwareAddress, Icmpv4DstUnreachable, Icmpv4Message, Icmpv4Packet, Icmpv4Repr,
    Icmpv4TimeExceeded, Icmpv6DstUnreachable, Icmpv6Packet, Icmpv6Repr, Icmpv6TimeExceeded,
    IpAddress, IpProtocol, Ipv4Packet, Ipv4Repr, Ipv6Packet, Ipv6Repr, NdiscNeighborFlags,
    NdiscRepr, RawHardwareAddress, TcpOption, TcpPacket, TcpSeqNumber, UdpPacket,
};

use crate::error::{Error, Result};

/// Default hop limit of packets generated by the switch
pub const DEFAULT_HOP_LIMIT: u8 = 64;

/// Neighbour discovery messages are only valid with this hop limit
pub const NDISC_HOP_LIMIT: u8 = 255;

/// Transport bytes of the offending packet carried in an ICMP error
pub const ICMP_QUOTE_LEN: usize = 64;

bitflags! {
    /// Control bits of a TCP header, as read through `TcpPacket`
    #[derive(Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
    }
}

impl TcpFlags {
    pub fn fin(self) -> bool {
        self.contains(Self::FIN)
    }

    pub fn syn(self) -> bool {
        self.contains(Self::SYN)
    }

    pub fn rst(self) -> bool {
        self.contains(Self::RST)
    }

    pub fn psh(self) -> bool {
        self.contains(Self::PSH)
    }

    pub fn ack(self) -> bool {
        self.contains(Self::ACK)
    }

    fn read(tcp: &TcpPacket<&[u8]>) -> Self {
        let mut flags = Self::empty();
        flags.set(Self::FIN, tcp.fin());
        flags.set(Self::SYN, tcp.syn());
        flags.set(Self::RST, tcp.rst());
        flags.set(Self::PSH, tcp.psh());
        flags.set(Self::ACK, tcp.ack());
        flags
    }

    fn write(self, tcp: &mut TcpPacket<&mut [u8]>) {
        tcp.clear_flags();
        tcp.set_fin(self.fin());
        tcp.set_syn(self.syn());
        tcp.set_rst(self.rst());
        tcp.set_psh(self.psh());
        tcp.set_ack(self.ack());
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::SYN, "SYN"),
            (Self::ACK, "ACK"),
            (Self::FIN, "FIN"),
            (Self::RST, "RST"),
            (Self::PSH, "PSH"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", set.join("|"))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    /// Window scale shift count
    pub window_scale: Option<u8>,
    pub payload: Vec<u8>,
}

impl fmt::Display for TcpSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} [{}] seq {} ack {} win {} len {}",
            self.src_port,
            self.dst_port,
            self.flags,
            self.seq,
            self.ack,
            self.window,
            self.payload.len()
        )
    }
}

impl TcpSegment {
    pub fn new(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: TcpFlags) -> Self {
        Self {
            src_port,
            dst_port,
            seq,
            ack,
            flags,
            window: 0,
            mss: None,
            window_scale: None,
            payload: vec![],
        }
    }

    fn parse(buf: &[u8]) -> Result<Self> {
        let tcp = TcpPacket::new_checked(buf)?;
        let flags = TcpFlags::read(&tcp);

        let mut mss = None;
        let mut window_scale = None;
        let mut options = tcp.options();
        while !options.is_empty() {
            let Ok((rest, option)) = TcpOption::parse(options) else {
                break;
            };
            match option {
                TcpOption::EndOfList => break,
                TcpOption::MaxSegmentSize(v) => mss = Some(v),
                TcpOption::WindowScale(s) => window_scale = Some(s),
                _ => {}
            }
            options = rest;
        }

        Ok(Self {
            src_port: tcp.src_port(),
            dst_port: tcp.dst_port(),
            seq: tcp.seq_number().0 as u32,
            ack: tcp.ack_number().0 as u32,
            flags,
            window: tcp.window_len(),
            mss,
            window_scale,
            payload: tcp.payload().to_vec(),
        })
    }

    fn emit(&self, src: IpAddr, dst: IpAddr) -> Vec<u8> {
        let mut options_len: usize = 0;
        if self.mss.is_some() {
            options_len += 4;
        }
        if self.window_scale.is_some() {
            options_len += 3;
        }
        let header_len = 20 + options_len.div_ceil(4) * 4;

        let mut buf = vec![0u8; header_len + self.payload.len()];
        let mut tcp = TcpPacket::new_unchecked(&mut buf[..]);
        tcp.set_src_port(self.src_port);
        tcp.set_dst_port(self.dst_port);
        tcp.set_seq_number(TcpSeqNumber(self.seq as i32));
        tcp.set_ack_number(TcpSeqNumber(self.ack as i32));
        tcp.set_header_len(header_len as u8);
        self.flags.write(&mut tcp);
        tcp.set_window_len(self.window);
        tcp.set_urgent_at(0);
        {
            let mut options = tcp.options_mut();
            if let Some(mss) = self.mss {
                options = TcpOption::MaxSegmentSize(mss).emit(options);
            }
            if let Some(shift) = self.window_scale {
                options = TcpOption::WindowScale(shift).emit(options);
            }
            // remaining bytes are END-OF-LIST
            options.fill(0);
        }
        tcp.payload_mut().copy_from_slice(&self.payload);
        tcp.fill_checksum(&IpAddress::from(src), &IpAddress::from(dst));
        buf
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

impl UdpDatagram {
    fn parse(buf: &[u8]) -> Result<Self> {
        let udp = UdpPacket::new_checked(buf)?;
        Ok(Self {
            src_port: udp.src_port(),
            dst_port: udp.dst_port(),
            payload: udp.payload().to_vec(),
        })
    }

    fn emit(&self, src: IpAddr, dst: IpAddr) -> Vec<u8> {
        let len = 8 + self.payload.len();
        let mut buf = vec![0u8; len];
        let mut udp = UdpPacket::new_unchecked(&mut buf[..]);
        udp.set_src_port(self.src_port);
        udp.set_dst_port(self.dst_port);
        udp.set_len(len as u16);
        udp.payload_mut().copy_from_slice(&self.payload);
        udp.fill_checksum(&IpAddress::from(src), &IpAddress::from(dst));
        buf
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpEcho {
    pub request: bool,
    pub ident: u16,
    pub seq_no: u16,
    pub data: Vec<u8>,
}

impl IcmpEcho {
    fn emit(&self, src: IpAddr, dst: IpAddr) -> Result<Vec<u8>> {
        let (ident, seq_no, data) = (self.ident, self.seq_no, &self.data[..]);
        match (src, dst) {
            (IpAddr::V4(_), IpAddr::V4(_)) => {
                let repr = if self.request {
                    Icmpv4Repr::EchoRequest { ident, seq_no, data }
                } else {
                    Icmpv4Repr::EchoReply { ident, seq_no, data }
                };
                Ok(emit_icmpv4(&repr))
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                let repr = if self.request {
                    Icmpv6Repr::EchoRequest { ident, seq_no, data }
                } else {
                    Icmpv6Repr::EchoReply { ident, seq_no, data }
                };
                Ok(emit_icmpv6(&repr, src, dst))
            }
            (src, dst) => Err(family_mismatch(src, dst)),
        }
    }
}

/// IPv6 neighbour solicitation or advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdiscMessage {
    /// Solicitation when set, advertisement otherwise
    pub solicit: bool,
    pub target: Ipv6Addr,
    /// Source (solicitation) or target (advertisement) link-layer address option
    pub lladdr: Option<EthernetAddress>,
}

impl NdiscMessage {
    fn emit(&self, src: Ipv6Addr, dst: Ipv6Addr) -> Vec<u8> {
        let lladdr = self.lladdr.map(RawHardwareAddress::from);
        let repr = if self.solicit {
            NdiscRepr::NeighborSolicit {
                target_addr: self.target,
                lladdr,
            }
        } else {
            NdiscRepr::NeighborAdvert {
                flags: NdiscNeighborFlags::SOLICITED | NdiscNeighborFlags::OVERRIDE,
                target_addr: self.target,
                lladdr,
            }
        };
        emit_icmpv6(&Icmpv6Repr::Ndisc(repr), src, dst)
    }

    fn from_repr(repr: NdiscRepr<'_>) -> Option<Self> {
        let (solicit, target, lladdr) = match repr {
            NdiscRepr::NeighborSolicit {
                target_addr,
                lladdr,
            } => (true, target_addr, lladdr),
            NdiscRepr::NeighborAdvert {
                target_addr,
                lladdr,
                ..
            } => (false, target_addr, lladdr),
            _ => return None,
        };
        let lladdr = lladdr.and_then(|raw| match raw.parse(Medium::Ethernet) {
            Ok(HardwareAddress::Ethernet(mac)) => Some(mac),
            _ => None,
        });
        Some(Self {
            solicit,
            target,
            lladdr,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpErrorKind {
    TimeExceeded,
    PortUnreachable,
}

/// ICMP error quoting the start of the packet that caused it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpError {
    pub kind: IcmpErrorKind,
    /// Header fields of the quoted packet
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: IpProtocol,
    pub hop_limit: u8,
    /// Leading transport bytes of the quoted packet
    pub data: Vec<u8>,
}

impl IcmpError {
    pub fn quoting(kind: IcmpErrorKind, ip: &IpPacket) -> Result<Self> {
        let mut data = ip.transport_bytes()?;
        data.truncate(ICMP_QUOTE_LEN);
        Ok(Self {
            kind,
            src: ip.src,
            dst: ip.dst,
            protocol: ip.transport.protocol(ip.is_ipv4()),
            hop_limit: ip.hop_limit,
            data,
        })
    }

    fn emit(&self, src: IpAddr, dst: IpAddr) -> Result<Vec<u8>> {
        let data = &self.data[..];
        match (src, dst, self.src, self.dst) {
            (IpAddr::V4(_), IpAddr::V4(_), IpAddr::V4(src_addr), IpAddr::V4(dst_addr)) => {
                let header = Ipv4Repr {
                    src_addr,
                    dst_addr,
                    next_header: self.protocol,
                    payload_len: data.len(),
                    hop_limit: self.hop_limit,
                };
                let repr = match self.kind {
                    IcmpErrorKind::TimeExceeded => Icmpv4Repr::TimeExceeded {
                        reason: Icmpv4TimeExceeded::TtlExpired,
                        header,
                        data,
                    },
                    IcmpErrorKind::PortUnreachable => Icmpv4Repr::DstUnreachable {
                        reason: Icmpv4DstUnreachable::PortUnreachable,
                        header,
                        data,
                    },
                };
                Ok(emit_icmpv4(&repr))
            }
            (IpAddr::V6(outer_src), IpAddr::V6(outer_dst), IpAddr::V6(src_addr), IpAddr::V6(dst_addr)) => {
                let header = Ipv6Repr {
                    src_addr,
                    dst_addr,
                    next_header: self.protocol,
                    payload_len: data.len(),
                    hop_limit: self.hop_limit,
                };
                let repr = match self.kind {
                    IcmpErrorKind::TimeExceeded => Icmpv6Repr::TimeExceeded {
                        reason: Icmpv6TimeExceeded::HopLimitExceeded,
                        header,
                        data,
                    },
                    IcmpErrorKind::PortUnreachable => Icmpv6Repr::DstUnreachable {
                        reason: Icmpv6DstUnreachable::PortUnreachable,
                        header,
                        data,
                    },
                };
                Ok(emit_icmpv6(&repr, outer_src, outer_dst))
            }
            _ => Err(family_mismatch(self.src, dst)),
        }
    }

    /// Source and destination ports of the quoted TCP or UDP packet
    pub fn quoted_ports(&self) -> Option<(u16, u16)> {
        if !matches!(self.protocol, IpProtocol::Tcp | IpProtocol::Udp) || self.data.len() < 4 {
            return None;
        }
        let port = |i: usize| u16::from_be_bytes([self.data[i], self.data[i + 1]]);
        Some((port(0), port(2)))
    }
}

fn emit_icmpv4(repr: &Icmpv4Repr<'_>) -> Vec<u8> {
    let mut buf = vec![0u8; repr.buffer_len()];
    repr.emit(
        &mut Icmpv4Packet::new_unchecked(&mut buf[..]),
        &ChecksumCapabilities::default(),
    );
    buf
}

fn emit_icmpv6(repr: &Icmpv6Repr<'_>, src: Ipv6Addr, dst: Ipv6Addr) -> Vec<u8> {
    let mut buf = vec![0u8; repr.buffer_len()];
    repr.emit(
        &src,
        &dst,
        &mut Icmpv6Packet::new_unchecked(&mut buf[..]),
        &ChecksumCapabilities::default(),
    );
    buf
}

fn family_mismatch(src: IpAddr, dst: IpAddr) -> Error {
    Error::Packet(format!("address family mismatch: {} -> {}", src, dst))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp(TcpSegment),
    Udp(UdpDatagram),
    IcmpEcho(IcmpEcho),
    Ndisc(NdiscMessage),
    IcmpError(IcmpError),
    /// Anything else, carried through untouched
    Other { protocol: u8, payload: Vec<u8> },
}

impl Transport {
    fn protocol(&self, v4: bool) -> IpProtocol {
        match self {
            Self::Tcp(_) => IpProtocol::Tcp,
            Self::Udp(_) => IpProtocol::Udp,
            Self::IcmpEcho(_) | Self::IcmpError(_) if v4 => IpProtocol::Icmp,
            Self::IcmpEcho(_) | Self::IcmpError(_) | Self::Ndisc(_) => IpProtocol::Icmpv6,
            Self::Other { protocol, .. } => IpProtocol::from(*protocol),
        }
    }
}

/// A decoded IPv4 or IPv6 packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPacket {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub hop_limit: u8,
    pub transport: Transport,
}

impl IpPacket {
    pub fn new(src: IpAddr, dst: IpAddr, transport: Transport) -> Self {
        Self {
            src,
            dst,
            hop_limit: DEFAULT_HOP_LIMIT,
            transport,
        }
    }

    pub fn tcp(src: SocketAddr, dst: SocketAddr, segment: TcpSegment) -> Self {
        debug_assert_eq!(segment.src_port, src.port());
        Self::new(src.ip(), dst.ip(), Transport::Tcp(segment))
    }

    pub fn udp(src: SocketAddr, dst: SocketAddr, payload: Vec<u8>) -> Self {
        Self::new(
            src.ip(),
            dst.ip(),
            Transport::Udp(UdpDatagram {
                src_port: src.port(),
                dst_port: dst.port(),
                payload,
            }),
        )
    }

    pub fn parse_ipv4(buf: &[u8]) -> Result<Self> {
        let ip = Ipv4Packet::new_checked(buf)?;
        let src = IpAddr::V4(ip.src_addr());
        let dst = IpAddr::V4(ip.dst_addr());
        let payload = ip.payload();
        let transport = match ip.next_header() {
            IpProtocol::Tcp => Transport::Tcp(TcpSegment::parse(payload)?),
            IpProtocol::Udp => Transport::Udp(UdpDatagram::parse(payload)?),
            IpProtocol::Icmp => parse_icmpv4(payload)?,
            other => Transport::Other {
                protocol: other.into(),
                payload: payload.to_vec(),
            },
        };
        Ok(Self {
            src,
            dst,
            hop_limit: ip.hop_limit(),
            transport,
        })
    }

    pub fn parse_ipv6(buf: &[u8]) -> Result<Self> {
        let ip = Ipv6Packet::new_checked(buf)?;
        let src = IpAddr::V6(ip.src_addr());
        let dst = IpAddr::V6(ip.dst_addr());
        let payload = ip.payload();
        let transport = match ip.next_header() {
            IpProtocol::Tcp => Transport::Tcp(TcpSegment::parse(payload)?),
            IpProtocol::Udp => Transport::Udp(UdpDatagram::parse(payload)?),
            IpProtocol::Icmpv6 => parse_icmpv6(ip.src_addr(), ip.dst_addr(), payload)?,
            other => Transport::Other {
                protocol: other.into(),
                payload: payload.to_vec(),
            },
        };
        Ok(Self {
            src,
            dst,
            hop_limit: ip.hop_limit(),
            transport,
        })
    }

    pub fn is_ipv4(&self) -> bool {
        self.src.is_ipv4()
    }

    pub fn ethertype(&self) -> EthernetProtocol {
        if self.is_ipv4() {
            EthernetProtocol::Ipv4
        } else {
            EthernetProtocol::Ipv6
        }
    }

    pub fn ports(&self) -> Option<(u16, u16)> {
        match &self.transport {
            Transport::Tcp(t) => Some((t.src_port, t.dst_port)),
            Transport::Udp(u) => Some((u.src_port, u.dst_port)),
            _ => None,
        }
    }

    pub fn src_endpoint(&self) -> Option<SocketAddr> {
        self.ports().map(|(s, _)| SocketAddr::new(self.src, s))
    }

    pub fn dst_endpoint(&self) -> Option<SocketAddr> {
        self.ports().map(|(_, d)| SocketAddr::new(self.dst, d))
    }

    /// Rewrites source and destination address and port
    pub fn rewrite(&mut self, src: SocketAddr, dst: SocketAddr) {
        self.src = src.ip();
        self.dst = dst.ip();
        match &mut self.transport {
            Transport::Tcp(t) => {
                t.src_port = src.port();
                t.dst_port = dst.port();
            }
            Transport::Udp(u) => {
                u.src_port = src.port();
                u.dst_port = dst.port();
            }
            _ => {}
        }
    }

    pub fn tcp_segment(&self) -> Option<&TcpSegment> {
        match &self.transport {
            Transport::Tcp(t) => Some(t),
            _ => None,
        }
    }

    pub fn udp_datagram(&self) -> Option<&UdpDatagram> {
        match &self.transport {
            Transport::Udp(u) => Some(u),
            _ => None,
        }
    }

    fn transport_bytes(&self) -> Result<Vec<u8>> {
        Ok(match &self.transport {
            Transport::Tcp(t) => t.emit(self.src, self.dst),
            Transport::Udp(u) => u.emit(self.src, self.dst),
            Transport::IcmpEcho(e) => e.emit(self.src, self.dst)?,
            Transport::Ndisc(n) => match (self.src, self.dst) {
                (IpAddr::V6(src), IpAddr::V6(dst)) => n.emit(src, dst),
                (src, dst) => return Err(family_mismatch(src, dst)),
            },
            Transport::IcmpError(e) => e.emit(self.src, self.dst)?,
            Transport::Other { payload, .. } => payload.clone(),
        })
    }

    /// Serializes the packet with fresh IP and transport checksums
    pub fn emit(&self) -> Result<Vec<u8>> {
        let body = self.transport_bytes()?;
        let next_header = self.transport.protocol(self.is_ipv4());

        match (self.src, self.dst) {
            (IpAddr::V4(src_addr), IpAddr::V4(dst_addr)) => {
                let repr = Ipv4Repr {
                    src_addr,
                    dst_addr,
                    next_header,
                    payload_len: body.len(),
                    hop_limit: self.hop_limit,
                };
                let mut buf = vec![0u8; repr.buffer_len() + body.len()];
                let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
                repr.emit(&mut ip, &ChecksumCapabilities::default());
                ip.payload_mut().copy_from_slice(&body);
                Ok(buf)
            }
            (IpAddr::V6(src_addr), IpAddr::V6(dst_addr)) => {
                let repr = Ipv6Repr {
                    src_addr,
                    dst_addr,
                    next_header,
                    payload_len: body.len(),
                    hop_limit: self.hop_limit,
                };
                let mut buf = vec![0u8; repr.buffer_len() + body.len()];
                let mut ip = Ipv6Packet::new_unchecked(&mut buf[..]);
                repr.emit(&mut ip);
                ip.payload_mut().copy_from_slice(&body);
                Ok(buf)
            }
            (src, dst) => Err(family_mismatch(src, dst)),
        }
    }
}

impl fmt::Display for IpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.transport {
            Transport::Tcp(t) => write!(
                f,
                "tcp {} -> {} [{}] seq={} ack={} len={}",
                SocketAddr::new(self.src, t.src_port),
                SocketAddr::new(self.dst, t.dst_port),
                t.flags,
                t.seq,
                t.ack,
                t.payload.len()
            ),
            Transport::Udp(u) => write!(
                f,
                "udp {} -> {} len={}",
                SocketAddr::new(self.src, u.src_port),
                SocketAddr::new(self.dst, u.dst_port),
                u.payload.len()
            ),
            Transport::IcmpEcho(e) => write!(
                f,
                "icmp echo {} {} -> {} id={} seq={}",
                if e.request { "request" } else { "reply" },
                self.src,
                self.dst,
                e.ident,
                e.seq_no
            ),
            Transport::Ndisc(n) => write!(
                f,
                "neighbour {} {} -> {} target={}",
                if n.solicit { "solicitation" } else { "advertisement" },
                self.src,
                self.dst,
                n.target
            ),
            Transport::IcmpError(e) => write!(
                f,
                "icmp {:?} {} -> {} quoting {} -> {}",
                e.kind, self.src, self.dst, e.src, e.dst
            ),
            Transport::Other { protocol, payload } => write!(
                f,
                "ip proto {} {} -> {} len={}",
                protocol,
                self.src,
                self.dst,
                payload.len()
            ),
        }
    }
}

fn parse_icmpv4(buf: &[u8]) -> Result<Transport> {
    let icmp = Icmpv4Packet::new_checked(buf)?;
    let known = matches!(
        icmp.msg_type(),
        Icmpv4Message::EchoRequest
            | Icmpv4Message::EchoReply
            | Icmpv4Message::DstUnreachable
            | Icmpv4Message::TimeExceeded
    );
    let repr = match Icmpv4Repr::parse(&icmp, &ChecksumCapabilities::default()) {
        Ok(repr) if known => repr,
        _ => return Ok(other_icmp(IpProtocol::Icmp, buf)),
    };
    let echo = |request, ident, seq_no, data: &[u8]| {
        Transport::IcmpEcho(IcmpEcho {
            request,
            ident,
            seq_no,
            data: data.to_vec(),
        })
    };
    let error = |kind, header: Ipv4Repr, data: &[u8]| {
        Transport::IcmpError(IcmpError {
            kind,
            src: IpAddr::V4(header.src_addr),
            dst: IpAddr::V4(header.dst_addr),
            protocol: header.next_header,
            hop_limit: header.hop_limit,
            data: data.to_vec(),
        })
    };
    Ok(match repr {
        Icmpv4Repr::EchoRequest { ident, seq_no, data } => echo(true, ident, seq_no, data),
        Icmpv4Repr::EchoReply { ident, seq_no, data } => echo(false, ident, seq_no, data),
        Icmpv4Repr::TimeExceeded { header, data, .. } => {
            error(IcmpErrorKind::TimeExceeded, header, data)
        }
        Icmpv4Repr::DstUnreachable {
            reason: Icmpv4DstUnreachable::PortUnreachable,
            header,
            data,
        } => error(IcmpErrorKind::PortUnreachable, header, data),
        _ => other_icmp(IpProtocol::Icmp, buf),
    })
}

fn parse_icmpv6(src: Ipv6Addr, dst: Ipv6Addr, buf: &[u8]) -> Result<Transport> {
    let icmp = Icmpv6Packet::new_checked(buf)?;
    let Ok(repr) = Icmpv6Repr::parse(&src, &dst, &icmp, &ChecksumCapabilities::default()) else {
        return Ok(other_icmp(IpProtocol::Icmpv6, buf));
    };
    let echo = |request, ident, seq_no, data: &[u8]| {
        Transport::IcmpEcho(IcmpEcho {
            request,
            ident,
            seq_no,
            data: data.to_vec(),
        })
    };
    let error = |kind, header: Ipv6Repr, data: &[u8]| {
        Transport::IcmpError(IcmpError {
            kind,
            src: IpAddr::V6(header.src_addr),
            dst: IpAddr::V6(header.dst_addr),
            protocol: header.next_header,
            hop_limit: header.hop_limit,
            data: data.to_vec(),
        })
    };
    Ok(match repr {
        Icmpv6Repr::EchoRequest { ident, seq_no, data } => echo(true, ident, seq_no, data),
        Icmpv6Repr::EchoReply { ident, seq_no, data } => echo(false, ident, seq_no, data),
        Icmpv6Repr::Ndisc(ndisc) => match NdiscMessage::from_repr(ndisc) {
            Some(msg) => Transport::Ndisc(msg),
            None => other_icmp(IpProtocol::Icmpv6, buf),
        },
        Icmpv6Repr::TimeExceeded { header, data, .. } => {
            error(IcmpErrorKind::TimeExceeded, header, data)
        }
        Icmpv6Repr::DstUnreachable {
            reason: Icmpv6DstUnreachable::PortUnreachable,
            header,
            data,
        } => error(IcmpErrorKind::PortUnreachable, header, data),
        _ => other_icmp(IpProtocol::Icmpv6, buf),
    })
}

fn other_icmp(protocol: IpProtocol, buf: &[u8]) -> Transport {
    Transport::Other {
        protocol: protocol.into(),
        payload: buf.to_vec(),
    }
}

/// Decoded IPv4-over-Ethernet ARP message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpMessage {
    pub request: bool,
    pub sender_mac: EthernetAddress,
    pub sender_ip: Ipv4Addr,
    pub target_mac: EthernetAddress,
    pub target_ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    Arp(ArpMessage),
    Ip(IpPacket),
    Unsupported(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub src_mac: EthernetAddress,
    pub dst_mac: EthernetAddress,
    pub payload: FramePayload,
}

impl Frame {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let frame = EthernetFrame::new_checked(buf)?;
        let payload = match frame.ethertype() {
            EthernetProtocol::Arp => FramePayload::Arp(parse_arp(frame.payload())?),
            EthernetProtocol::Ipv4 => FramePayload::Ip(IpPacket::parse_ipv4(frame.payload())?),
            EthernetProtocol::Ipv6 => FramePayload::Ip(IpPacket::parse_ipv6(frame.payload())?),
            other => FramePayload::Unsupported(other.into()),
        };
        Ok(Self {
            src_mac: frame.src_addr(),
            dst_mac: frame.dst_addr(),
            payload,
        })
    }
}

fn parse_arp(buf: &[u8]) -> Result<ArpMessage> {
    let repr = ArpRepr::parse(&ArpPacket::new_checked(buf)?)?;
    let ArpRepr::EthernetIpv4 {
        operation,
        source_hardware_addr,
        source_protocol_addr,
        target_hardware_addr,
        target_protocol_addr,
    } = repr
    else {
        return Err(Error::Packet("unsupported arp payload".to_string()));
    };
    let request = match operation {
        ArpOperation::Request => true,
        ArpOperation::Reply => false,
        _ => return Err(Error::Packet("unsupported arp operation".to_string())),
    };
    Ok(ArpMessage {
        request,
        sender_mac: source_hardware_addr,
        sender_ip: source_protocol_addr,
        target_mac: target_hardware_addr,
        target_ip: target_protocol_addr,
    })
}

pub fn build_frame(
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    ethertype: EthernetProtocol,
    payload: &[u8],
) -> Vec<u8> {
    let repr = EthernetRepr {
        src_addr: src_mac,
        dst_addr: dst_mac,
        ethertype,
    };
    let mut buf = vec![0u8; repr.buffer_len() + payload.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
    repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(payload);
    buf
}

/// Builds a complete ARP frame. Requests are broadcast, replies go to the target MAC.
pub fn build_arp_frame(msg: &ArpMessage) -> Vec<u8> {
    let repr = ArpRepr::EthernetIpv4 {
        operation: if msg.request {
            ArpOperation::Request
        } else {
            ArpOperation::Reply
        },
        source_hardware_addr: msg.sender_mac,
        source_protocol_addr: msg.sender_ip,
        target_hardware_addr: msg.target_mac,
        target_protocol_addr: msg.target_ip,
    };
    let mut body = vec![0u8; repr.buffer_len()];
    repr.emit(&mut ArpPacket::new_unchecked(&mut body[..]));
    let dst = if msg.request {
        EthernetAddress::BROADCAST
    } else {
        msg.target_mac
    };
    build_frame(msg.sender_mac, dst, EthernetProtocol::Arp, &body)
}

/// Solicited-node multicast group of `ip` (RFC 4291 2.7.1)
pub fn solicited_node(ip: Ipv6Addr) -> Ipv6Addr {
    let o = ip.octets();
    Ipv6Addr::new(
        0xff02,
        0,
        0,
        0,
        0,
        1,
        0xff00 | u16::from(o[13]),
        u16::from_be_bytes([o[14], o[15]]),
    )
}

/// Ethernet group address an IPv6 multicast destination maps to (RFC 2464 7)
pub fn ipv6_multicast_mac(ip: Ipv6Addr) -> EthernetAddress {
    let o = ip.octets();
    EthernetAddress([0x33, 0x33, o[12], o[13], o[14], o[15]])
}

/// Builds a neighbour solicitation for `target`, sent to its solicited-node group
pub fn build_neighbour_solicit(
    sender_ip: Ipv6Addr,
    sender_mac: EthernetAddress,
    target: Ipv6Addr,
) -> Result<Vec<u8>> {
    let group = solicited_node(target);
    let mut ip = IpPacket::new(
        IpAddr::V6(sender_ip),
        IpAddr::V6(group),
        Transport::Ndisc(NdiscMessage {
            solicit: true,
            target,
            lladdr: Some(sender_mac),
        }),
    );
    ip.hop_limit = NDISC_HOP_LIMIT;
    Ok(build_frame(
        sender_mac,
        ipv6_multicast_mac(group),
        EthernetProtocol::Ipv6,
        &ip.emit()?,
    ))
}

/// Builds the advertisement answering a solicitation for the synthetic `target`
pub fn build_neighbour_advert(
    target: Ipv6Addr,
    target_mac: EthernetAddress,
    dst_ip: Ipv6Addr,
    dst_mac: EthernetAddress,
) -> Result<Vec<u8>> {
    let mut ip = IpPacket::new(
        IpAddr::V6(target),
        IpAddr::V6(dst_ip),
        Transport::Ndisc(NdiscMessage {
            solicit: false,
            target,
            lladdr: Some(target_mac),
        }),
    );
    ip.hop_limit = NDISC_HOP_LIMIT;
    Ok(build_frame(
        target_mac,
        dst_mac,
        EthernetProtocol::Ipv6,
        &ip.emit()?,
    ))
}

/// A packet moving through the L3 pipeline of one network
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    pub vni: u32,
    /// Port the frame arrived on, `None` for locally generated packets
    pub in_port: Option<u32>,
    pub src_mac: Option<EthernetAddress>,
    pub ip: IpPacket,
    /// Set once the NAT engine resolved the packet; routing lookup is skipped
    pub fastpath: bool,
}

impl PacketBuffer {
    pub fn from_input(vni: u32, in_port: u32, src_mac: EthernetAddress, ip: IpPacket) -> Self {
        Self {
            vni,
            in_port: Some(in_port),
            src_mac: Some(src_mac),
            ip,
            fastpath: false,
        }
    }

    pub fn local(vni: u32, ip: IpPacket) -> Self {
        Self {
            vni,
            in_port: None,
            src_mac: None,
            ip,
            fastpath: false,
        }
    }
}

impl fmt::Display for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vni={} {}", self.vni, self.ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_tcp_options_and_checksum() {
        let mut seg = TcpSegment::new(4000, 80, 1000, 0, TcpFlags::SYN);
        seg.window = 65535;
        seg.mss = Some(1460);
        seg.window_scale = Some(7);
        let pkt = IpPacket::tcp(addr("10.0.0.5:4000"), addr("10.0.0.1:80"), seg);
        let bytes = pkt.emit().unwrap();

        let ip = Ipv4Packet::new_checked(&bytes[..]).unwrap();
        assert!(ip.verify_checksum());
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        assert!(tcp.verify_checksum(&ip.src_addr().into(), &ip.dst_addr().into()));
        assert_eq!(tcp.header_len(), 28);

        let parsed = IpPacket::parse_ipv4(&bytes).unwrap();
        let t = parsed.tcp_segment().unwrap();
        assert_eq!(t.mss, Some(1460));
        assert_eq!(t.window_scale, Some(7));
        assert!(t.flags.syn() && !t.flags.ack());
    }

    #[test]
    fn test_rewrite_recomputes_checksums() {
        let mut pkt = IpPacket::udp(addr("10.0.0.5:5353"), addr("10.0.0.1:53"), b"query".to_vec());
        pkt.rewrite(addr("10.0.0.1:53"), addr("10.0.0.20:9053"));
        let bytes = pkt.emit().unwrap();

        let ip = Ipv4Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(ip.dst_addr(), "10.0.0.20".parse::<Ipv4Addr>().unwrap());
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert!(udp.verify_checksum(&ip.src_addr().into(), &ip.dst_addr().into()));
        assert_eq!(udp.dst_port(), 9053);
        assert_eq!(udp.payload(), b"query");
    }

    #[test]
    fn test_ipv6_tcp() {
        let seg = TcpSegment::new(1234, 443, 7, 9, TcpFlags::ACK | TcpFlags::PSH);
        let mut pkt = IpPacket::tcp(addr("[fd00::5]:1234"), addr("[fd00::1]:443"), seg);
        if let Transport::Tcp(t) = &mut pkt.transport {
            t.payload = b"hey".to_vec();
        }
        let parsed = IpPacket::parse_ipv6(&pkt.emit().unwrap()).unwrap();
        assert_eq!(parsed.src_endpoint(), Some(addr("[fd00::5]:1234")));
        let t = parsed.tcp_segment().unwrap();
        assert_eq!(t.flags, TcpFlags::ACK | TcpFlags::PSH);
        assert_eq!(t.payload, b"hey");
    }

    #[test]
    fn test_arp_frame() {
        let msg = ArpMessage {
            request: true,
            sender_mac: EthernetAddress([0, 0x11, 0x22, 0x33, 0x44, 0x55]),
            sender_ip: "10.0.0.5".parse().unwrap(),
            target_mac: EthernetAddress([0; 6]),
            target_ip: "10.0.0.1".parse().unwrap(),
        };
        let frame = Frame::parse(&build_arp_frame(&msg)).unwrap();
        assert_eq!(frame.dst_mac, EthernetAddress::BROADCAST);
        assert_eq!(frame.payload, FramePayload::Arp(msg));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        assert!(matches!(Frame::parse(&[0u8; 10]), Err(Error::Packet(_))));
    }

    #[test]
    fn test_flags_display() {
        assert_eq!((TcpFlags::SYN | TcpFlags::ACK).to_string(), "SYN|ACK");
        assert_eq!(TcpFlags::empty().to_string(), "-");
    }

    #[test]
    fn test_icmpv6_echo() {
        let echo = IcmpEcho {
            request: true,
            ident: 42,
            seq_no: 7,
            data: b"abc".to_vec(),
        };
        let pkt = IpPacket::new(
            "fd00::5".parse().unwrap(),
            "fd00::1".parse().unwrap(),
            Transport::IcmpEcho(echo.clone()),
        );
        let bytes = pkt.emit().unwrap();
        let ip = Ipv6Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(ip.next_header(), IpProtocol::Icmpv6);
        let icmp = Icmpv6Packet::new_checked(ip.payload()).unwrap();
        assert!(icmp.verify_checksum(&ip.src_addr(), &ip.dst_addr()));

        let parsed = IpPacket::parse_ipv6(&bytes).unwrap();
        assert_eq!(parsed.transport, Transport::IcmpEcho(echo));
    }

    #[test]
    fn test_neighbour_solicit_frame() {
        let mac = EthernetAddress([0x02, 0, 0, 0, 0, 0x05]);
        let target: Ipv6Addr = "fd00::1:2a".parse().unwrap();
        let raw = build_neighbour_solicit("fd00::5".parse().unwrap(), mac, target).unwrap();

        let frame = Frame::parse(&raw).unwrap();
        assert_eq!(frame.src_mac, mac);
        assert_eq!(frame.dst_mac, EthernetAddress([0x33, 0x33, 0xff, 0x01, 0x00, 0x2a]));
        let FramePayload::Ip(ip) = frame.payload else {
            panic!("not ip");
        };
        assert_eq!(ip.dst, "ff02::1:ff01:2a".parse::<IpAddr>().unwrap());
        assert_eq!(ip.hop_limit, NDISC_HOP_LIMIT);
        assert_eq!(
            ip.transport,
            Transport::Ndisc(NdiscMessage {
                solicit: true,
                target,
                lladdr: Some(mac),
            })
        );
    }

    #[test]
    fn test_neighbour_advert_frame() {
        let mac = EthernetAddress([0x02, 0, 0, 0, 0, 0x01]);
        let peer = EthernetAddress([0x02, 0, 0, 0, 0, 0x05]);
        let raw = build_neighbour_advert(
            "fd00::1".parse().unwrap(),
            mac,
            "fd00::5".parse().unwrap(),
            peer,
        )
        .unwrap();

        let eth = EthernetFrame::new_checked(&raw[..]).unwrap();
        let ip = Ipv6Packet::new_checked(eth.payload()).unwrap();
        let icmp = Icmpv6Packet::new_checked(ip.payload()).unwrap();
        assert!(icmp.verify_checksum(&ip.src_addr(), &ip.dst_addr()));
        let repr = NdiscRepr::parse(&icmp).unwrap();
        let NdiscRepr::NeighborAdvert { flags, .. } = repr else {
            panic!("not an advertisement");
        };
        assert!(flags.contains(NdiscNeighborFlags::SOLICITED | NdiscNeighborFlags::OVERRIDE));

        let frame = Frame::parse(&raw).unwrap();
        assert_eq!((frame.src_mac, frame.dst_mac), (mac, peer));
        let FramePayload::Ip(ip) = frame.payload else {
            panic!("not ip");
        };
        let Transport::Ndisc(na) = ip.transport else {
            panic!("not ndisc");
        };
        assert!(!na.solicit);
        assert_eq!(na.lladdr, Some(mac));
    }

    #[test]
    fn test_icmp_error_quotes_offending_packet() {
        let mut payload = vec![0u8; 100];
        payload[0] = 0x5a;
        let mut inner = IpPacket::udp(addr("10.0.0.5:5000"), addr("10.0.0.1:9"), payload);
        inner.hop_limit = 1;
        let error = IcmpError::quoting(IcmpErrorKind::PortUnreachable, &inner).unwrap();
        assert_eq!(error.data.len(), ICMP_QUOTE_LEN);
        assert_eq!(error.quoted_ports(), Some((5000, 9)));

        let pkt = IpPacket::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.5".parse().unwrap(),
            Transport::IcmpError(error.clone()),
        );
        let bytes = pkt.emit().unwrap();
        let ip = Ipv4Packet::new_checked(&bytes[..]).unwrap();
        let icmp = Icmpv4Packet::new_checked(ip.payload()).unwrap();
        assert!(icmp.verify_checksum());
        assert_eq!(icmp.msg_type(), Icmpv4Message::DstUnreachable);

        let parsed = IpPacket::parse_ipv4(&bytes).unwrap();
        assert_eq!(parsed.transport, Transport::IcmpError(error));
    }

    #[test]
    fn test_icmpv6_time_exceeded() {
        let inner = IpPacket::udp(addr("[fd00::5]:5000"), addr("[fd01::9]:53"), b"q".to_vec());
        let error = IcmpError::quoting(IcmpErrorKind::TimeExceeded, &inner).unwrap();
        let pkt = IpPacket::new(
            "fd00::1".parse().unwrap(),
            "fd00::5".parse().unwrap(),
            Transport::IcmpError(error),
        );
        let parsed = IpPacket::parse_ipv6(&pkt.emit().unwrap()).unwrap();
        let Transport::IcmpError(e) = parsed.transport else {
            panic!("not an icmp error");
        };
        assert_eq!(e.kind, IcmpErrorKind::TimeExceeded);
        assert_eq!(e.dst, "fd01::9".parse::<IpAddr>().unwrap());
        assert_eq!(e.protocol, IpProtocol::Udp);
        assert_eq!(e.quoted_ports(), Some((5000, 53)));
    }

    #[test]
    fn test_icmp_error_family_mismatch() {
        let inner = IpPacket::udp(addr("[fd00::5]:5000"), addr("[fd00::1]:9"), b"q".to_vec());
        let error = IcmpError::quoting(IcmpErrorKind::PortUnreachable, &inner).unwrap();
        let pkt = IpPacket::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.5".parse().unwrap(),
            Transport::IcmpError(error),
        );
        assert!(pkt.emit().is_err());
    }

    #[test]
    fn test_tcp_flags_on_the_wire() {
        let all = TcpFlags::FIN | TcpFlags::SYN | TcpFlags::RST | TcpFlags::PSH | TcpFlags::ACK;
        let seg = TcpSegment::new(1, 2, 0, 0, all);
        let pkt = IpPacket::tcp(addr("10.0.0.5:1"), addr("10.0.0.1:2"), seg);
        let bytes = pkt.emit().unwrap();
        let ip = Ipv4Packet::new_checked(&bytes[..]).unwrap();
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        assert!(tcp.fin() && tcp.syn() && tcp.rst() && tcp.psh() && tcp.ack());
        assert!(!tcp.urg());
        assert_eq!(IpPacket::parse_ipv4(&bytes).unwrap().tcp_segment().unwrap().flags, all);
    }
}
