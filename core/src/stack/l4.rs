//! TCP and UDP endpoints terminated by the switch
//!
//! Passive and active opens, in-order receive, window-limited send with
//! exponential retransmission, delayed ACKs and UDP datagram queues. There is
//! no congestion control, no SACK and no out-of-order reassembly.

use std::io;
use std::net::SocketAddr;

use log::*;

use super::{NetCtx, l3};
use crate::conntrack::Tuple;
use crate::conntrack::tcp::*;
use crate::error::{Error, Result};
use crate::packet::{IcmpErrorKind, IpPacket, PacketBuffer, TcpFlags, TcpSegment, Transport};
use crate::reactor::{Reactor, Readiness, TimerEvent};

/// Delivers a packet addressed to a synthetic IP
pub fn input(ctx: &mut NetCtx<'_>, pkb: PacketBuffer) {
    let (src, dst) = (pkb.ip.src, pkb.ip.dst);
    if let Some(dgram) = pkb.ip.udp_datagram() {
        let local = SocketAddr::new(dst, dgram.dst_port);
        if ctx.net.conntrack.lookup_udp_listen(local).is_none() {
            trace!("udp {}: nothing bound, datagram from {} refused", local, src);
            return l3::icmp_error(ctx, &pkb, IcmpErrorKind::PortUnreachable);
        }
    }
    match pkb.ip.transport {
        Transport::Tcp(seg) => {
            let remote = SocketAddr::new(src, seg.src_port);
            let local = SocketAddr::new(dst, seg.dst_port);
            tcp_input(ctx, local, remote, seg);
        }
        Transport::Udp(dgram) => {
            let remote = SocketAddr::new(src, dgram.src_port);
            let local = SocketAddr::new(dst, dgram.dst_port);
            udp_input(ctx, local, remote, dgram.payload);
        }
        _ => {}
    }
}

fn tcp_input(ctx: &mut NetCtx<'_>, local: SocketAddr, remote: SocketAddr, seg: TcpSegment) {
    let key = Tuple::new(local, remote);
    trace!("tcp {}: received [{}] seq={} ack={}", key, seg.flags, seg.seq, seg.ack);
    if ctx.net.conntrack.lookup_tcp(&key).is_some() {
        return handle_segment(ctx, key, seg);
    }
    if seg.flags.rst() {
        trace!("tcp {}: reset for unknown connection ignored", key);
        return;
    }
    if seg.flags.syn() && !seg.flags.ack() {
        if let Some(listen) = ctx.net.conntrack.lookup_tcp_listen_mut(local) {
            if listen.syn_backlog.len() >= MAX_SYN_BACKLOG_SIZE {
                warn!("tcp listen {}: syn backlog full, resetting {}", listen.local, remote);
                return send_rst_for(ctx, local, remote, &seg);
            }
            listen.syn_backlog.push(key);
            let entry = TcpEntry::new_passive(listen.local, remote, local, seg.seq);
            if let Err(e) = ctx.net.conntrack.create_tcp(entry) {
                warn!("tcp {}: {}", key, e);
                return;
            }
            return handle_segment(ctx, key, seg);
        }
    }
    trace!("tcp {}: no connection or listener", key);
    send_rst_for(ctx, local, remote, &seg);
}

fn handle_segment(ctx: &mut NetCtx<'_>, key: Tuple, seg: TcpSegment) {
    let Some(state) = ctx.net.conntrack.lookup_tcp(&key).map(TcpEntry::state) else {
        return;
    };
    if seg.flags.rst() {
        debug!("tcp {}: reset by peer in {}", key, state);
        return remove_connection(ctx, key);
    }
    match state {
        TcpState::Closed => on_closed(ctx, key, seg),
        TcpState::SynSent => on_syn_sent(ctx, key, seg),
        TcpState::SynReceived => on_syn_received(ctx, key, seg),
        _ => on_synchronized(ctx, key, seg),
    }
}

/// Peer MSS and window scale multiplier announced in a SYN
fn peer_options(seg: &TcpSegment) -> (usize, usize) {
    let mss = seg.mss.map_or(SND_DEFAULT_MSS, usize::from);
    let scale = seg.window_scale.map_or(1, |s| 1usize << s.min(14));
    (mss, scale)
}

fn on_closed(ctx: &mut NetCtx<'_>, key: Tuple, seg: TcpSegment) {
    if !seg.flags.syn() || seg.flags.ack() {
        return reset_connection(ctx, key);
    }
    let Some(entry) = ctx.net.conntrack.lookup_tcp_mut(&key) else {
        return;
    };
    let (mss, scale) = peer_options(&seg);
    entry.send.init(seg.window, mss, scale);
    if seg.window_scale.is_some() {
        entry.recv.set_window_shift(RCV_WINDOW_SHIFT);
    }
    entry.set_state(TcpState::SynReceived, ctx.reactor);
    let syn_ack = syn_segment(entry, TcpFlags::SYN | TcpFlags::ACK);
    entry.send.inc_all_seq();
    send_segment(ctx, key, syn_ack);
}

fn on_syn_received(ctx: &mut NetCtx<'_>, key: Tuple, seg: TcpSegment) {
    let Some(entry) = ctx.net.conntrack.lookup_tcp_mut(&key) else {
        return;
    };
    if seg.flags.syn() && !seg.flags.ack() {
        if u64::from(seg.seq) + 1 == entry.recv.acked_seq() {
            trace!("tcp {}: retransmitted syn, answering again", key);
            entry.send.dec_all_seq();
            let syn_ack = syn_segment(entry, TcpFlags::SYN | TcpFlags::ACK);
            entry.send.inc_all_seq();
            send_segment(ctx, key, syn_ack);
        }
        return;
    }
    if !seg.flags.ack() {
        trace!("tcp {}: segment without ack in SYN_RECEIVED, dropped", key);
        return;
    }
    if unwrap_seq(entry.send.ack_seq(), seg.ack) != entry.send.ack_seq() {
        debug!("tcp {}: handshake ack {} does not match, resetting", key, seg.ack);
        return reset_connection(ctx, key);
    }
    entry.set_state(TcpState::Established, ctx.reactor);

    let listen = match entry.parent {
        Some(parent) => ctx.net.conntrack.lookup_tcp_listen_mut(parent),
        None => None,
    };
    let Some(listen) = listen else {
        debug!("tcp {}: listener is gone, resetting", key);
        return reset_connection(ctx, key);
    };
    listen.syn_backlog.retain(|t| *t != key);
    listen.backlog.push_back(key);
    listen.readiness.set_readable(ctx.reactor, true);

    on_synchronized(ctx, key, seg);
}

fn on_syn_sent(ctx: &mut NetCtx<'_>, key: Tuple, seg: TcpSegment) {
    let Some(entry) = ctx.net.conntrack.lookup_tcp_mut(&key) else {
        return;
    };
    if !seg.flags.ack() {
        trace!("tcp {}: unexpected [{}] in SYN_SENT, dropped", key, seg.flags);
        return;
    }
    if !seg.flags.syn() || unwrap_seq(entry.send.ack_seq(), seg.ack) != entry.send.ack_seq() {
        return send_rst_for(ctx, key.local, key.remote, &seg);
    }
    entry.recv.set_initial_seq(u64::from(seg.seq) + 1);
    if seg.window_scale.is_none() {
        entry.recv.set_window_shift(0);
    }
    let (mss, scale) = peer_options(&seg);
    entry.send.init(seg.window, mss, scale);
    if let Some(t) = entry.retransmission_timer.take() {
        ctx.reactor.cancel_timer(t);
    }
    entry.set_state(TcpState::Established, ctx.reactor);
    send_ack(ctx, key);
}

enum Reply {
    Nothing,
    DelayedAck,
    Ack,
    Reset,
    Remove,
}

fn on_synchronized(ctx: &mut NetCtx<'_>, key: Tuple, seg: TcpSegment) {
    let Some(entry) = ctx.net.conntrack.lookup_tcp_mut(&key) else {
        return;
    };
    let expecting = entry.recv.expecting_seq();
    let seq = unwrap_seq(expecting, seg.seq);
    if seq != expecting {
        trace!("tcp {}: seq {} while expecting {}, dropped", key, seq, expecting);
        return send_ack(ctx, key);
    }

    let mut ack_advanced = false;
    if seg.flags.ack() {
        let progress = |e: &TcpEntry| (e.send.ack_seq(), e.send.fin_acked(), e.send.window());
        let before = progress(entry);
        entry.ack(unwrap_seq(before.0, seg.ack), seg.window, ctx.reactor);
        ack_advanced = progress(entry) != before;
    }

    let state = entry.state();
    let mut reply = Reply::Nothing;
    match state {
        TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {
            if !seg.payload.is_empty() {
                reply = if entry.store(seq, &seg.payload, ctx.reactor) > 0 {
                    Reply::DelayedAck
                } else {
                    Reply::Ack
                };
            }
            let fin_seq = seq + seg.payload.len() as u64;
            if seg.flags.fin() && fin_seq == entry.recv.expecting_seq() {
                if state == TcpState::Established {
                    entry.recv.inc_expecting_seq();
                    entry.set_state(TcpState::CloseWait, ctx.reactor);
                    reply = Reply::Ack;
                } else {
                    debug!("tcp {}: fin received in {}", key, state);
                    reply = Reply::Reset;
                }
            } else if state == TcpState::FinWait1 && entry.send.fin_acked() {
                entry.set_state(TcpState::FinWait2, ctx.reactor);
            }
        }
        TcpState::CloseWait => {
            if seg.flags.fin() {
                reply = Reply::Ack;
            }
        }
        TcpState::Closing => {
            if entry.send.fin_acked() {
                reply = Reply::Reset;
            }
        }
        TcpState::LastAck | TcpState::TimeWait => {
            if entry.send.fin_acked() {
                reply = Reply::Remove;
            } else if seg.flags.fin() {
                reply = Reply::Ack;
            }
        }
        TcpState::Closed | TcpState::SynSent | TcpState::SynReceived => {
            warn!("tcp {}: unexpected state {} for synchronized input", key, state);
        }
    }

    match reply {
        Reply::Reset => return reset_connection(ctx, key),
        Reply::Remove => return remove_connection(ctx, key),
        Reply::Ack => send_ack(ctx, key),
        Reply::DelayedAck => tcp_ack(ctx, key),
        Reply::Nothing => {}
    }
    if ack_advanced {
        start_transmission(ctx, key);
    }
}

fn send_segment(ctx: &mut NetCtx<'_>, key: Tuple, seg: TcpSegment) {
    trace!("tcp {}: sending [{}] seq={} ack={} len={}", key, seg.flags, seg.seq, seg.ack, seg.payload.len());
    l3::output_local(ctx, IpPacket::tcp(key.local, key.remote, seg));
}

fn syn_segment(entry: &TcpEntry, flags: TcpFlags) -> TcpSegment {
    let ack = if flags.ack() {
        entry.recv.expecting_seq() as u32
    } else {
        0
    };
    let mut seg = TcpSegment::new(
        entry.local.port(),
        entry.remote.port(),
        entry.send.fetch_seq() as u32,
        ack,
        flags,
    );
    // the window of a SYN is never scaled
    seg.window = entry.recv.window().min(usize::from(u16::MAX)) as u16;
    seg.mss = Some(RCV_MSS);
    let shift = entry.recv.window_shift();
    if shift > 0 {
        seg.window_scale = Some(shift);
    }
    seg
}

/// Sequence number of the next byte we would send, counting a FIN already on the wire
fn next_send_seq(entry: &TcpEntry) -> u64 {
    if entry.state().fin_sent() && !entry.send.has_more_data() {
        entry.send.latest_seq() + 1
    } else {
        entry.send.fetch_seq()
    }
}

fn control_segment(entry: &TcpEntry, seq: u64, flags: TcpFlags) -> TcpSegment {
    let mut seg = TcpSegment::new(
        entry.local.port(),
        entry.remote.port(),
        seq as u32,
        entry.recv.expecting_seq() as u32,
        flags,
    );
    seg.window = entry.recv.advertised_window();
    seg
}

/// Sends an ACK right away, superseding a pending delayed one
pub fn send_ack(ctx: &mut NetCtx<'_>, key: Tuple) {
    let Some(entry) = ctx.net.conntrack.lookup_tcp_mut(&key) else {
        return;
    };
    if let Some(t) = entry.delayed_ack_timer.take() {
        ctx.reactor.cancel_timer(t);
    }
    let seg = control_segment(entry, next_send_seq(entry), TcpFlags::ACK);
    send_segment(ctx, key, seg);
}

/// Acknowledges received data, delayed unless the receive window is exhausted
pub fn tcp_ack(ctx: &mut NetCtx<'_>, key: Tuple) {
    let vni = ctx.vni();
    let Some(entry) = ctx.net.conntrack.lookup_tcp_mut(&key) else {
        return;
    };
    if entry.recv.window() == 0 {
        return send_ack(ctx, key);
    }
    if entry.delayed_ack_timer.is_none() {
        let event = TimerEvent::TcpDelayedAck {
            vni,
            local: key.local,
            remote: key.remote,
        };
        entry.delayed_ack_timer = Some(ctx.reactor.delay(DELAYED_ACK_TIMEOUT_MS, event));
    }
}

pub fn on_delayed_ack_timer(ctx: &mut NetCtx<'_>, key: Tuple) {
    if let Some(entry) = ctx.net.conntrack.lookup_tcp_mut(&key) {
        entry.delayed_ack_timer = None;
        send_ack(ctx, key);
    }
}

fn arm_retransmission(entry: &mut TcpEntry, reactor: &mut dyn Reactor, vni: u32, count: u32) {
    if let Some(t) = entry.retransmission_timer.take() {
        reactor.cancel_timer(t);
    }
    let delay = (RTO_MIN_MS << count.min(16)).min(RTO_MAX_MS);
    let event = TimerEvent::TcpRetransmit {
        vni,
        local: entry.local,
        remote: entry.remote,
        begin_seq: entry.send.ack_seq() as u32,
        count,
    };
    entry.retransmission_timer = Some(reactor.delay(delay, event));
}

/// Whether anything still waits for an acknowledgement
fn outstanding(entry: &TcpEntry) -> bool {
    entry.send.has_more_data() || entry.need_to_send_fin()
}

fn data_segments(entry: &TcpEntry, segments: Vec<Segment>) -> Vec<TcpSegment> {
    segments
        .into_iter()
        .map(|s| {
            let mut seg = control_segment(entry, s.seq, TcpFlags::ACK | TcpFlags::PSH);
            seg.payload = s.data;
            seg
        })
        .collect()
}

/// Sends whatever new data the peer window allows, plus a FIN once the queue drained
///
/// Arms the retransmission timer while anything is unacknowledged; a connection
/// closed with data pending is reset once everything was delivered.
pub fn start_transmission(ctx: &mut NetCtx<'_>, key: Tuple) {
    let vni = ctx.vni();
    let Some(entry) = ctx.net.conntrack.lookup_tcp_mut(&key) else {
        return;
    };
    if matches!(
        entry.state(),
        TcpState::Closed | TcpState::SynSent | TcpState::SynReceived | TcpState::TimeWait
    ) {
        return;
    }
    let unsent = entry.send.fetch_unsent();
    let mut out = data_segments(entry, unsent);
    if out.is_empty() && !entry.send.has_more_data() && entry.need_to_send_fin() {
        let seq = entry.send.latest_seq();
        out.push(control_segment(entry, seq, TcpFlags::FIN | TcpFlags::ACK));
    }

    if !outstanding(entry) {
        if let Some(t) = entry.retransmission_timer.take() {
            ctx.reactor.cancel_timer(t);
        }
        if entry.require_closing() {
            debug!("tcp {}: drained after close, resetting", key);
            return reset_connection(ctx, key);
        }
    } else if entry.retransmission_timer.is_none() {
        arm_retransmission(entry, ctx.reactor, vni, 0);
    }
    for seg in out {
        send_segment(ctx, key, seg);
    }
}

/// Retransmission timer expiry; `count` is the number of the retransmission about to happen
pub fn on_retransmit_timer(ctx: &mut NetCtx<'_>, key: Tuple, begin_seq: u32, count: u32) {
    let vni = ctx.vni();
    let Some(entry) = ctx.net.conntrack.lookup_tcp_mut(&key) else {
        return;
    };
    entry.retransmission_timer = None;

    if entry.state() == TcpState::SynSent {
        if count > MAX_RETRANSMISSION_AFTER_CLOSING {
            debug!("tcp {}: connect timed out", key);
            return remove_connection(ctx, key);
        }
        entry.send.dec_all_seq();
        let syn = syn_segment(entry, TcpFlags::SYN);
        entry.send.inc_all_seq();
        arm_retransmission(entry, ctx.reactor, vni, count);
        return send_segment(ctx, key, syn);
    }

    let count = if entry.send.ack_seq() as u32 == begin_seq {
        count
    } else {
        0
    };
    if entry.require_closing() && count > MAX_RETRANSMISSION_AFTER_CLOSING {
        debug!("tcp {}: too many retransmissions after close, resetting", key);
        return reset_connection(ctx, key);
    }
    if !outstanding(entry) {
        if entry.require_closing() {
            return reset_connection(ctx, key);
        }
        return;
    }

    let segments = entry.send.fetch();
    let mut out = data_segments(entry, segments);
    if out.is_empty() && !entry.send.has_more_data() {
        let seq = entry.send.latest_seq();
        out.push(control_segment(entry, seq, TcpFlags::FIN | TcpFlags::ACK));
    }
    if !out.is_empty() {
        trace!("tcp {}: retransmission #{} of {} segments", key, count, out.len());
    }
    arm_retransmission(entry, ctx.reactor, vni, count);
    for seg in out {
        send_segment(ctx, key, seg);
    }
}

/// Replies to a segment that belongs to no connection
fn send_rst_for(ctx: &mut NetCtx<'_>, local: SocketAddr, remote: SocketAddr, seg: &TcpSegment) {
    if seg.flags.rst() {
        return;
    }
    let rst = if seg.flags.ack() {
        TcpSegment::new(local.port(), remote.port(), seg.ack, 0, TcpFlags::RST)
    } else {
        let len = seg.payload.len() as u32 + u32::from(seg.flags.syn()) + u32::from(seg.flags.fin());
        TcpSegment::new(
            local.port(),
            remote.port(),
            0,
            seg.seq.wrapping_add(len),
            TcpFlags::RST | TcpFlags::ACK,
        )
    };
    send_segment(ctx, Tuple::new(local, remote), rst);
}

/// Sends RST and forgets the connection
pub fn reset_connection(ctx: &mut NetCtx<'_>, key: Tuple) {
    let Some(entry) = ctx.net.conntrack.lookup_tcp(&key) else {
        return;
    };
    let rst = control_segment(entry, next_send_seq(entry), TcpFlags::RST | TcpFlags::ACK);
    send_segment(ctx, key, rst);
    remove_connection(ctx, key);
}

/// Forgets a connection, waking its adapter and detaching it from its listener
pub fn remove_connection(ctx: &mut NetCtx<'_>, key: Tuple) {
    let Some(mut entry) = ctx.net.conntrack.remove_tcp(&key) else {
        return;
    };
    entry.cancel_timers(ctx.reactor);
    entry.set_state(TcpState::Closed, ctx.reactor);
    entry.notify_readable(ctx.reactor);
    entry.notify_writable(ctx.reactor);

    let Some(parent) = entry.parent else {
        return;
    };
    if let Some(listen) = ctx.net.conntrack.lookup_tcp_listen_mut(parent) {
        listen.syn_backlog.retain(|t| *t != key);
        listen.backlog.retain(|t| *t != key);
        if listen.backlog.is_empty() {
            listen.readiness.set_readable(ctx.reactor, false);
        }
    }
}

/// Resets every connection of the network
pub fn reset_all(ctx: &mut NetCtx<'_>) {
    for key in ctx.net.conntrack.tcp_tuples() {
        reset_connection(ctx, key);
    }
}

/// Active open from a free ephemeral port of a synthetic IP
pub fn connect(ctx: &mut NetCtx<'_>, remote: SocketAddr, readiness: Readiness) -> Result<Tuple> {
    let vni = ctx.vni();
    let Some(local) = ctx.net.find_free_tcp_port(remote.is_ipv4()) else {
        return Err(Error::io(
            io::ErrorKind::AddrNotAvailable,
            format!("vni {}: no local address to connect to {} from", vni, remote),
        ));
    };
    let mut entry = TcpEntry::new_active(remote, local);
    entry.readiness = Some(readiness);
    entry.recv.set_window_shift(RCV_WINDOW_SHIFT);
    let syn = syn_segment(&entry, TcpFlags::SYN);
    entry.send.inc_all_seq();
    let key = entry.tuple();

    let entry = ctx.net.conntrack.create_tcp(entry)?;
    arm_retransmission(entry, ctx.reactor, vni, 0);
    send_segment(ctx, key, syn);
    Ok(key)
}

fn udp_input(ctx: &mut NetCtx<'_>, local: SocketAddr, remote: SocketAddr, payload: Vec<u8>) {
    let now = ctx.now_ms();
    let Some(listen) = ctx.net.conntrack.lookup_udp_listen_mut(local) else {
        trace!("udp {}: nothing bound, datagram from {} dropped", local, remote);
        return;
    };
    if !listen.accepts(remote) {
        trace!("udp {}: not connected to {}, dropped", local, remote);
        return;
    }
    if !listen.store(remote, payload) {
        warn!("udp {}: receive queue full, datagram from {} dropped", local, remote);
        return;
    }
    listen.readiness.set_readable(ctx.reactor, true);
    ctx.net.conntrack.record_udp(local, remote, now);
}

/// Flushes the send queue of a bound UDP address
pub fn send_udp(ctx: &mut NetCtx<'_>, local: SocketAddr) {
    let Some(listen) = ctx.net.conntrack.lookup_udp_listen_mut(local) else {
        return;
    };
    let datagrams: Vec<_> = listen.sending.drain(..).collect();
    for d in datagrams {
        trace!("udp {}: sending {} bytes to {}", local, d.data.len(), d.remote);
        l3::output_local(ctx, IpPacket::udp(local, d.remote, d.data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::testutil::*;

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn client_segment(seq: u32, ack: u32, flags: TcpFlags) -> PacketBuffer {
        let mut seg = TcpSegment::new(4000, 80, seq, ack, flags);
        seg.window = 65535;
        PacketBuffer::from_input(
            VNI,
            3,
            CLIENT_MAC,
            IpPacket::tcp(sa("10.0.0.5:4000"), sa("10.0.0.1:80"), seg),
        )
    }

    fn key() -> Tuple {
        Tuple::new(sa("10.0.0.1:80"), sa("10.0.0.5:4000"))
    }

    #[test]
    fn test_syn_to_closed_port_is_reset() {
        let mut f = Fixture::new();
        f.learn_client();
        input(&mut f.ctx(), client_segment(1000, 0, TcpFlags::SYN));
        let segs = f.tcp_out();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!(segs[0].ack, 1001);

        // segments carrying an ACK are reset with their own ack number
        input(&mut f.ctx(), client_segment(1000, 555, TcpFlags::ACK));
        let segs = f.tcp_out();
        assert_eq!((segs[0].flags, segs[0].seq), (TcpFlags::RST, 555));

        input(&mut f.ctx(), client_segment(1000, 555, TcpFlags::RST));
        assert!(f.tcp_out().is_empty());
    }

    #[test]
    fn test_passive_handshake() {
        let mut f = Fixture::new();
        f.learn_client();
        let listener = Readiness::new(1);
        f.net.conntrack.listen_tcp(sa("10.0.0.1:80"), listener.clone()).unwrap();

        input(&mut f.ctx(), client_segment(1000, 0, TcpFlags::SYN));
        let segs = f.tcp_out();
        assert_eq!(segs.len(), 1);
        let syn_ack = &segs[0];
        assert_eq!(syn_ack.flags, TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(syn_ack.ack, 1001);
        assert_eq!(syn_ack.mss, Some(RCV_MSS));
        // the client did not offer window scaling
        assert_eq!(syn_ack.window_scale, None);
        assert_eq!(f.net.conntrack.lookup_tcp_listen(sa("10.0.0.1:80")).unwrap().syn_backlog, vec![key()]);
        assert!(!listener.is_readable());

        input(&mut f.ctx(), client_segment(1001, syn_ack.seq.wrapping_add(1), TcpFlags::ACK));
        let entry = f.net.conntrack.lookup_tcp(&key()).unwrap();
        assert_eq!(entry.state(), TcpState::Established);
        let listen = f.net.conntrack.lookup_tcp_listen(sa("10.0.0.1:80")).unwrap();
        assert!(listen.syn_backlog.is_empty());
        assert_eq!(listen.backlog.front(), Some(&key()));
        assert!(listener.is_readable());
        assert!(f.tcp_out().is_empty());
    }

    #[test]
    fn test_retransmitted_syn_gets_same_syn_ack() {
        let mut f = Fixture::new();
        f.learn_client();
        f.net.conntrack.listen_tcp(sa("10.0.0.1:80"), Readiness::new(1)).unwrap();
        input(&mut f.ctx(), client_segment(1000, 0, TcpFlags::SYN));
        input(&mut f.ctx(), client_segment(1000, 0, TcpFlags::SYN));
        let segs = f.tcp_out();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0], segs[1]);
    }

    #[test]
    fn test_data_is_acked_after_delay() {
        let mut f = Fixture::new();
        f.learn_client();
        f.net.conntrack.listen_tcp(sa("10.0.0.1:80"), Readiness::new(1)).unwrap();
        input(&mut f.ctx(), client_segment(1000, 0, TcpFlags::SYN));
        let iss = f.tcp_out()[0].seq;
        input(&mut f.ctx(), client_segment(1001, iss.wrapping_add(1), TcpFlags::ACK));

        let mut data = client_segment(1001, iss.wrapping_add(1), TcpFlags::ACK | TcpFlags::PSH);
        if let Transport::Tcp(t) = &mut data.ip.transport {
            t.payload = b"hello".to_vec();
        }
        input(&mut f.ctx(), data);
        assert!(f.tcp_out().is_empty());
        assert_eq!(f.net.conntrack.lookup_tcp(&key()).unwrap().recv.size(), 5);

        let Some(TimerEvent::TcpDelayedAck { local, remote, .. }) = f.reactor.pop_due(DELAYED_ACK_TIMEOUT_MS) else {
            panic!("no delayed ack");
        };
        on_delayed_ack_timer(&mut f.ctx(), Tuple::new(local, remote));
        let segs = f.tcp_out();
        assert_eq!(segs.len(), 1);
        assert_eq!((segs[0].flags, segs[0].ack), (TcpFlags::ACK, 1006));

        // out of order data is dropped and answered with the expected sequence
        let mut ahead = client_segment(2000, iss.wrapping_add(1), TcpFlags::ACK);
        if let Transport::Tcp(t) = &mut ahead.ip.transport {
            t.payload = b"later".to_vec();
        }
        input(&mut f.ctx(), ahead);
        let segs = f.tcp_out();
        assert_eq!(segs[0].ack, 1006);
        assert_eq!(f.net.conntrack.lookup_tcp(&key()).unwrap().recv.size(), 5);
    }

    #[test]
    fn test_syn_backlog_limit() {
        let mut f = Fixture::new();
        f.learn_client();
        f.net.conntrack.listen_tcp(sa("10.0.0.1:80"), Readiness::new(1)).unwrap();
        for port in 0..MAX_SYN_BACKLOG_SIZE as u16 {
            let seg = TcpSegment::new(10000 + port, 80, 1, 0, TcpFlags::SYN);
            let ip = IpPacket::tcp(SocketAddr::new(sa("10.0.0.5:1").ip(), 10000 + port), sa("10.0.0.1:80"), seg);
            input(&mut f.ctx(), PacketBuffer::from_input(VNI, 3, CLIENT_MAC, ip));
        }
        f.tcp_out();
        input(&mut f.ctx(), client_segment(1000, 0, TcpFlags::SYN));
        let segs = f.tcp_out();
        assert_eq!(segs[0].flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!(f.net.conntrack.count_tcp(), MAX_SYN_BACKLOG_SIZE);
    }

    #[test]
    fn test_peer_reset_removes_connection() {
        let mut f = Fixture::new();
        f.learn_client();
        f.net.conntrack.listen_tcp(sa("10.0.0.1:80"), Readiness::new(1)).unwrap();
        input(&mut f.ctx(), client_segment(1000, 0, TcpFlags::SYN));
        input(&mut f.ctx(), client_segment(1001, 0, TcpFlags::RST));
        assert_eq!(f.net.conntrack.count_tcp(), 0);
        let listen = f.net.conntrack.lookup_tcp_listen(sa("10.0.0.1:80")).unwrap();
        assert!(listen.syn_backlog.is_empty());
        assert_eq!(f.reactor.pending_timers(), 0);
    }

    #[test]
    fn test_active_open_retransmits_syn() {
        let mut f = Fixture::new();
        f.net.arp_table.record(sa("10.0.0.9:1").ip(), CLIENT_MAC, true, 0);
        let r = Readiness::new(2);
        let key = connect(&mut f.ctx(), sa("10.0.0.9:443"), r.clone()).unwrap();
        assert_eq!(key.local.ip(), sa("10.0.0.1:1").ip());
        let syn = f.tcp_out();
        assert_eq!(syn[0].flags, TcpFlags::SYN);
        assert_eq!(syn[0].window_scale, Some(RCV_WINDOW_SHIFT));

        let Some(TimerEvent::TcpRetransmit { begin_seq, count, .. }) = f.reactor.pop_due(RTO_MIN_MS) else {
            panic!("no retransmission timer");
        };
        on_retransmit_timer(&mut f.ctx(), key, begin_seq, count + 1);
        assert_eq!(f.tcp_out(), syn);
        assert_eq!(f.reactor.next_deadline(), Some(RTO_MIN_MS + 2 * RTO_MIN_MS));
        assert!(!r.is_writable());
    }
}
