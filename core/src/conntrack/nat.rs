//! Stateful NAT flows and the TCP tracking state machine

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use log::*;
use serde::{Deserialize, Serialize};

use super::{NatId, Tuple};
use super::tcp::TcpState;
use crate::packet::{IpPacket, PacketBuffer, TcpFlags, TcpSegment, Transport};
use crate::reactor::{Reactor, TimerEvent, TimerId};

/// Idle timeouts of TCP NAT flows, per tracked state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpTimeouts {
    pub syn_sent_ms: u64,
    pub syn_received_ms: u64,
    pub established_ms: u64,
    /// FIN_WAIT_1, FIN_WAIT_2 and CLOSING
    pub fin_wait_ms: u64,
    pub close_wait_ms: u64,
    pub last_ack_ms: u64,
    pub time_wait_ms: u64,
    pub closed_ms: u64,
}

impl Default for TcpTimeouts {
    fn default() -> Self {
        Self {
            syn_sent_ms: 120 * 1000,
            syn_received_ms: 60 * 1000,
            established_ms: 432_000 * 1000,
            fin_wait_ms: 120 * 1000,
            close_wait_ms: 60 * 1000,
            last_ack_ms: 30 * 1000,
            time_wait_ms: 120 * 1000,
            closed_ms: 10 * 1000,
        }
    }
}

impl TcpTimeouts {
    pub fn for_state(&self, state: TcpState) -> u64 {
        match state {
            TcpState::SynSent => self.syn_sent_ms,
            TcpState::SynReceived => self.syn_received_ms,
            TcpState::Established => self.established_ms,
            TcpState::FinWait1 | TcpState::FinWait2 | TcpState::Closing => self.fin_wait_ms,
            TcpState::CloseWait => self.close_wait_ms,
            TcpState::LastAck => self.last_ack_ms,
            TcpState::TimeWait => self.time_wait_ms,
            TcpState::Closed => self.closed_ms,
        }
    }
}

pub const UDP_TIMEOUT_MS: u64 = 120 * 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatTimeouts {
    pub tcp: TcpTimeouts,
    pub udp_ms: u64,
}

impl Default for NatTimeouts {
    fn default() -> Self {
        Self {
            tcp: TcpTimeouts::default(),
            udp_ms: UDP_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server, rewritten onto the second leg
    Forward,
    /// Server to client, rewritten onto the first leg
    Backhaul,
}

/// Computes the tracked state after observing a segment
///
/// `None` means the state is unchanged. RST moves any state to CLOSED.
pub fn next_tcp_state(state: TcpState, dir: Direction, flags: TcpFlags) -> Option<TcpState> {
    use Direction::*;
    use TcpState::*;

    if flags.rst() {
        return Some(Closed);
    }
    let (syn, ack, fin) = (flags.syn(), flags.ack(), flags.fin());
    match (state, dir) {
        (Closed | TimeWait, _) if syn && !ack => Some(SynSent),
        (SynSent, Backhaul) if syn && ack => Some(SynReceived),
        (SynReceived, Forward) if !syn && ack => Some(Established),
        (Established, Backhaul) if fin => Some(CloseWait),
        (Established, Forward) if fin => Some(FinWait1),
        (FinWait1, Backhaul) if ack && fin => Some(TimeWait),
        (FinWait1, Backhaul) if ack => Some(FinWait2),
        (FinWait2, Backhaul) if fin => Some(TimeWait),
        (CloseWait, Forward) if fin && ack => Some(TimeWait),
        (CloseWait, Forward) if fin => Some(Closing),
        (Closing, _) if ack => Some(TimeWait),
        _ => None,
    }
}

fn direction_of(pkb: &PacketBuffer, leg2: &Tuple) -> Direction {
    if pkb.ip.src_endpoint() == Some(leg2.remote) {
        Direction::Backhaul
    } else {
        Direction::Forward
    }
}

/// Rewrites the packet onto the leg facing its destination and marks it fast-pathed
///
/// Backhaul packets leave from `leg1.local` towards `leg1.remote`, forward
/// packets from `leg2.local` towards `leg2.remote`.
pub fn apply_nat(pkb: &mut PacketBuffer, leg1: &Tuple, leg2: &Tuple, dir: Direction) {
    let (src, dst) = match dir {
        Direction::Backhaul => (leg1.local, leg1.remote),
        Direction::Forward => (leg2.local, leg2.remote),
    };
    trace!("nat {:?}: {} rewritten to {} -> {}", dir, pkb, src, dst);
    pkb.ip.rewrite(src, dst);
    pkb.fastpath = true;
}

fn rearm(
    reactor: &mut dyn Reactor,
    timer: &mut Option<TimerId>,
    ms: u64,
    event: TimerEvent,
) {
    if let Some(t) = timer.take() {
        reactor.cancel_timer(t);
    }
    *timer = Some(reactor.delay(ms, event));
}

/// A translated TCP flow
#[derive(Debug)]
pub struct TcpNat {
    pub id: NatId,
    pub vni: u32,
    /// Client-facing leg: `remote` is the client, `local` the address it talks to
    pub leg1: Tuple,
    /// Server-facing leg: `remote` is the server, `local` the translated source
    pub leg2: Tuple,
    pub state: TcpState,
    pub timer: Option<TimerId>,
    /// Set while a PROXY protocol header still has to be delivered to the server
    pub proxy_header: Option<ProxyHeader>,
}

impl TcpNat {
    pub fn new(id: NatId, vni: u32, leg1: Tuple, leg2: Tuple) -> Self {
        Self {
            id,
            vni,
            leg1,
            leg2,
            state: TcpState::Closed,
            timer: None,
            proxy_header: None,
        }
    }

    pub fn cancel_timer(&mut self, reactor: &mut dyn Reactor) {
        if let Some(t) = self.timer.take() {
            reactor.cancel_timer(t);
        }
    }
}

impl fmt::Display for TcpNat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tcp nat #{} {} => {} [{}]",
            self.id, self.leg1, self.leg2, self.state
        )
    }
}

/// A translated UDP flow
#[derive(Debug)]
pub struct UdpNat {
    pub id: NatId,
    pub vni: u32,
    pub leg1: Tuple,
    pub leg2: Tuple,
    pub timer: Option<TimerId>,
}

impl UdpNat {
    pub fn new(id: NatId, vni: u32, leg1: Tuple, leg2: Tuple) -> Self {
        Self {
            id,
            vni,
            leg1,
            leg2,
            timer: None,
        }
    }

    pub fn cancel_timer(&mut self, reactor: &mut dyn Reactor) {
        if let Some(t) = self.timer.take() {
            reactor.cancel_timer(t);
        }
    }
}

impl fmt::Display for UdpNat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "udp nat #{} {} => {}", self.id, self.leg1, self.leg2)
    }
}

/// Progress of the PROXY protocol header of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyHeader {
    Pending,
    /// Carried to the server, waiting for its ACK
    Sent,
}

const PROXY_V2_SIGNATURE: [u8; 12] = *b"\r\n\r\n\0\r\nQUIT\n";

/// Builds a PROXY protocol v2 header announcing a TCP stream from `src` to `dst`
///
/// Mixed families are announced as IPv6, with the v4 side mapped.
pub fn proxy_v2_header(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let mut addrs = Vec::with_capacity(36);
    let family = match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            addrs.extend_from_slice(&s.octets());
            addrs.extend_from_slice(&d.octets());
            0x11
        }
        (s, d) => {
            let v6 = |ip: IpAddr| match ip {
                IpAddr::V4(a) => a.to_ipv6_mapped(),
                IpAddr::V6(a) => a,
            };
            addrs.extend_from_slice(&v6(s).octets());
            addrs.extend_from_slice(&v6(d).octets());
            0x21
        }
    };
    addrs.extend_from_slice(&src.port().to_be_bytes());
    addrs.extend_from_slice(&dst.port().to_be_bytes());

    let mut hdr = Vec::with_capacity(16 + addrs.len());
    hdr.extend_from_slice(&PROXY_V2_SIGNATURE);
    // version 2, PROXY command
    hdr.push(0x21);
    hdr.push(family);
    hdr.extend_from_slice(&(addrs.len() as u16).to_be_bytes());
    hdr.extend_from_slice(&addrs);
    hdr
}

/// Outcome of the PROXY protocol handshake step
enum ProxyStep {
    Continue,
    /// The packet was turned into the header segment for the server
    HeaderSent,
    Drop,
}

/// Interposes the header between the server's SYN-ACK and the client's
///
/// The client's SYN reaches the server with its sequence number lowered by
/// the header length, so once the server acknowledges the header both ends
/// agree on sequence numbers and no later segment needs adjusting. The
/// server's SYN-ACK is answered by the switch with the header, and the ACK
/// for it is handed to the client as the SYN-ACK.
fn proxy_step(pkb: &mut PacketBuffer, nat: &mut TcpNat, dir: Direction) -> ProxyStep {
    let Some(header) = nat.proxy_header else {
        return ProxyStep::Continue;
    };
    let (leg1, leg2) = (nat.leg1, nat.leg2);
    let Transport::Tcp(seg) = &mut pkb.ip.transport else {
        return ProxyStep::Continue;
    };
    let (syn, ack) = (seg.flags.syn(), seg.flags.ack());
    let len = proxy_v2_header(leg1.remote, leg1.local).len() as u32;

    match (nat.state, dir) {
        (TcpState::Closed | TcpState::TimeWait, Direction::Forward) if syn && !ack => {
            seg.seq = seg.seq.wrapping_sub(len);
        }
        (TcpState::SynSent, Direction::Forward) => {
            if !syn || ack {
                trace!("{}: client segment before the proxy header is acked, dropped", nat);
                return ProxyStep::Drop;
            }
            seg.seq = seg.seq.wrapping_sub(len);
        }
        (TcpState::SynSent, Direction::Backhaul) if syn && ack => {
            let mut hdr = TcpSegment::new(
                leg2.local.port(),
                leg2.remote.port(),
                seg.ack,
                seg.seq.wrapping_add(1),
                TcpFlags::PSH | TcpFlags::ACK,
            );
            hdr.window = seg.window;
            hdr.payload = proxy_v2_header(leg1.remote, leg1.local);
            let mut ip = IpPacket::tcp(leg2.local, leg2.remote, hdr);
            ip.hop_limit = 255;
            pkb.ip = ip;
            pkb.fastpath = true;
            nat.proxy_header = Some(ProxyHeader::Sent);
            debug!("{}: proxy header sent to {}", nat, leg2.remote);
            return ProxyStep::HeaderSent;
        }
        (TcpState::SynSent, Direction::Backhaul) if ack => {
            if header != ProxyHeader::Sent {
                trace!("{}: server ack before the proxy header, dropped", nat);
                return ProxyStep::Drop;
            }
            as_syn_ack(seg);
        }
        (TcpState::SynReceived, Direction::Backhaul) => as_syn_ack(seg),
        (TcpState::SynReceived, Direction::Forward) if !syn && ack => {
            nat.proxy_header = None;
        }
        _ => {}
    }
    ProxyStep::Continue
}

/// Presents the server's ACK of the header to the client as its SYN-ACK
fn as_syn_ack(seg: &mut TcpSegment) {
    seg.seq = seg.seq.wrapping_sub(1);
    seg.flags = TcpFlags::SYN | TcpFlags::ACK;
}

/// Runs one packet of an existing TCP flow through the tracker and rewrites it
///
/// Returns false when the packet has to be dropped.
pub fn execute_tcp_nat(
    pkb: &mut PacketBuffer,
    nat: &mut TcpNat,
    reactor: &mut dyn Reactor,
    timeouts: &NatTimeouts,
) -> bool {
    let dir = direction_of(pkb, &nat.leg2);
    if pkb.ip.tcp_segment().is_none() {
        warn!("{}: not a tcp packet: {}", nat, pkb);
        return false;
    }
    let event = TimerEvent::NatIdle {
        vni: nat.vni,
        id: nat.id,
    };

    if pkb.ip.tcp_segment().is_some_and(|t| !t.flags.rst()) {
        match proxy_step(pkb, nat, dir) {
            ProxyStep::Continue => {}
            ProxyStep::HeaderSent => {
                rearm(reactor, &mut nat.timer, timeouts.tcp.for_state(nat.state), event);
                return true;
            }
            ProxyStep::Drop => return false,
        }
    }
    let Some(flags) = pkb.ip.tcp_segment().map(|t| t.flags) else {
        return false;
    };

    match next_tcp_state(nat.state, dir, flags) {
        Some(next) => {
            debug!("{}: {:?} [{}] -> {}", nat, dir, flags, next);
            nat.state = next;
        }
        None => trace!("{}: {:?} [{}] keeps state", nat, dir, flags),
    }
    rearm(reactor, &mut nat.timer, timeouts.tcp.for_state(nat.state), event);

    apply_nat(pkb, &nat.leg1, &nat.leg2, dir);
    true
}

/// Runs one packet of an existing UDP flow through the tracker and rewrites it
pub fn execute_udp_nat(
    pkb: &mut PacketBuffer,
    nat: &mut UdpNat,
    reactor: &mut dyn Reactor,
    timeouts: &NatTimeouts,
) {
    let dir = direction_of(pkb, &nat.leg2);
    let event = TimerEvent::NatIdle {
        vni: nat.vni,
        id: nat.id,
    };
    rearm(reactor, &mut nat.timer, timeouts.udp_ms, event);
    apply_nat(pkb, &nat.leg1, &nat.leg2, dir);
}
