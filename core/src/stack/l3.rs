//! IP input, NAT dispatch, routing and neighbour resolution

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use log::*;
use smoltcp::wire::EthernetAddress;

use super::{Egress, NetCtx, l2, l4};
use crate::conntrack::Protocol;
use crate::conntrack::nat::{ProxyHeader, execute_tcp_nat, execute_udp_nat};
use crate::nat_rule::NatAction;
use crate::network::VirtualNetwork;
use crate::packet::{
    ArpMessage, IcmpEcho, IcmpError, IcmpErrorKind, IpPacket, NdiscMessage, PacketBuffer, Transport,
    build_arp_frame, build_frame, build_neighbour_advert, build_neighbour_solicit,
};
use crate::route::RouteTarget;

enum NatVerdict {
    /// Not part of a NAT flow
    Pass,
    Translated,
    Dropped,
}

/// L3 input of a packet received from a port or routed in from another network
pub fn input(ctx: &mut NetCtx<'_>, mut pkb: PacketBuffer) {
    learn_neighbour(ctx, &pkb);
    if let Transport::Ndisc(msg) = pkb.ip.transport {
        return ndisc_input(ctx, &pkb, msg);
    }

    if !pkb.fastpath {
        match nat_input(ctx, &mut pkb) {
            NatVerdict::Pass => {}
            NatVerdict::Translated => return after_nat(ctx, pkb),
            NatVerdict::Dropped => return,
        }
    }

    if ctx.net.ips.lookup(pkb.ip.dst).is_some() {
        return local_input(ctx, pkb);
    }
    if is_group_address(ctx.net, pkb.ip.dst) {
        trace!("vni {}: {} to group address, dropped", ctx.vni(), pkb.ip);
        return;
    }
    if pkb.ip.hop_limit <= 1 {
        debug!("vni {}: hop limit exceeded: {}", ctx.vni(), pkb.ip);
        return icmp_error(ctx, &pkb, IcmpErrorKind::TimeExceeded);
    }
    pkb.ip.hop_limit -= 1;
    route(ctx, pkb);
}

/// Sends a packet generated by the switch itself
pub fn output_local(ctx: &mut NetCtx<'_>, ip: IpPacket) {
    let pkb = PacketBuffer::local(ctx.vni(), ip);
    route(ctx, pkb);
}

fn learn_neighbour(ctx: &mut NetCtx<'_>, pkb: &PacketBuffer) {
    let Some(mac) = pkb.src_mac else {
        return;
    };
    let src = pkb.ip.src;
    if src.is_unspecified() || !ctx.net.contains_ip(src) || ctx.net.ips.lookup(src).is_some() {
        return;
    }
    let now = ctx.now_ms();
    ctx.net.arp_table.record(src, mac, false, now);
}

fn ndisc_input(ctx: &mut NetCtx<'_>, pkb: &PacketBuffer, msg: NdiscMessage) {
    let IpAddr::V6(src) = pkb.ip.src else {
        return;
    };
    let now = ctx.now_ms();
    if !msg.solicit {
        let target = IpAddr::V6(msg.target);
        let mac = msg.lladdr.or(pkb.src_mac);
        if let Some(mac) = mac {
            if ctx.net.contains_ip(target) && ctx.net.ips.lookup(target).is_none() {
                ctx.net.arp_table.record(target, mac, false, now);
            }
        }
        return;
    }

    let Some(target_mac) = ctx.net.ips.lookup(IpAddr::V6(msg.target)) else {
        return;
    };
    if src.is_unspecified() {
        debug!("vni {}: duplicate address detection for synthetic {}", ctx.vni(), msg.target);
        return;
    }
    let Some(dst_mac) = msg.lladdr.or(pkb.src_mac) else {
        return;
    };
    trace!("vni {}: neighbour advertisement for {}", ctx.vni(), msg.target);
    match build_neighbour_advert(msg.target, target_mac, src, dst_mac) {
        Ok(frame) => ctx.send_frame(pkb.in_port, None, frame),
        Err(e) => warn!("vni {}: cannot answer solicitation for {}: {}", ctx.vni(), msg.target, e),
    }
}

fn is_group_address(net: &VirtualNetwork, ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(a) => {
            a.is_broadcast() || a.is_multicast() || net.v4_network.broadcast() == Some(ip)
        }
        IpAddr::V6(a) => a.is_multicast(),
    }
}

fn nat_input(ctx: &mut NetCtx<'_>, pkb: &mut PacketBuffer) -> NatVerdict {
    let (Some(src), Some(dst)) = (pkb.ip.src_endpoint(), pkb.ip.dst_endpoint()) else {
        return NatVerdict::Pass;
    };
    let (protocol, new_flow) = match &pkb.ip.transport {
        Transport::Tcp(seg) => (Protocol::Tcp, seg.flags.syn() && !seg.flags.ack()),
        Transport::Udp(_) => (Protocol::Udp, true),
        _ => return NatVerdict::Pass,
    };

    match protocol {
        Protocol::Tcp => {
            if let Some(nat) = ctx.net.conntrack.lookup_tcp_nat(dst, src) {
                if !execute_tcp_nat(pkb, nat, ctx.reactor, ctx.timeouts) {
                    return NatVerdict::Dropped;
                }
                return NatVerdict::Translated;
            }
        }
        Protocol::Udp => {
            if let Some(nat) = ctx.net.conntrack.lookup_udp_nat(dst, src) {
                execute_udp_nat(pkb, nat, ctx.reactor, ctx.timeouts);
                return NatVerdict::Translated;
            }
        }
    }
    if !new_flow {
        return NatVerdict::Pass;
    }
    create_nat(ctx, pkb, protocol, src, dst)
}

fn create_nat(
    ctx: &mut NetCtx<'_>,
    pkb: &mut PacketBuffer,
    protocol: Protocol,
    src: SocketAddr,
    dst: SocketAddr,
) -> NatVerdict {
    let vni = ctx.vni();
    let Some(rule) = ctx.net.nat_rules.find(protocol, src, dst).cloned() else {
        return NatVerdict::Pass;
    };
    let server = match &rule.action {
        NatAction::Dnat { to } | NatAction::Fnat { to, .. } => *to,
        NatAction::Snat { .. } => dst,
    };
    let allocated = match rule.pool() {
        Some(pool) => match pool.allocate(protocol, server, &ctx.net.conntrack) {
            Some(a) => Some(a),
            None => {
                warn!("vni {}: nat rule {}: pool {} exhausted", vni, rule.alias, pool);
                return NatVerdict::Dropped;
            }
        },
        None => None,
    };
    let Some((leg1, leg2)) = rule.legs(src, dst, allocated) else {
        return NatVerdict::Dropped;
    };
    trace!("vni {}: {} matched nat rule {}", vni, pkb.ip, rule.alias);

    let created = match protocol {
        Protocol::Tcp => match ctx.net.conntrack.add_tcp_nat(vni, leg1, leg2) {
            Ok(nat) => {
                if rule.proxy_protocol {
                    nat.proxy_header = Some(ProxyHeader::Pending);
                }
                Ok(execute_tcp_nat(pkb, nat, ctx.reactor, ctx.timeouts))
            }
            Err(e) => Err(e),
        },
        Protocol::Udp => match ctx.net.conntrack.add_udp_nat(vni, leg1, leg2) {
            Ok(nat) => {
                execute_udp_nat(pkb, nat, ctx.reactor, ctx.timeouts);
                Ok(true)
            }
            Err(e) => Err(e),
        },
    };
    match created {
        Ok(true) => NatVerdict::Translated,
        Ok(false) => NatVerdict::Dropped,
        Err(e) => {
            warn!("vni {}: nat rule {}: {}", vni, rule.alias, e);
            NatVerdict::Dropped
        }
    }
}

fn after_nat(ctx: &mut NetCtx<'_>, pkb: PacketBuffer) {
    if ctx.net.ips.lookup(pkb.ip.dst).is_some() {
        local_input(ctx, pkb);
    } else {
        route(ctx, pkb);
    }
}

fn local_input(ctx: &mut NetCtx<'_>, pkb: PacketBuffer) {
    if let Transport::IcmpEcho(echo) = &pkb.ip.transport {
        if echo.request {
            trace!("vni {}: echo request {}", ctx.vni(), pkb.ip);
            let reply = IpPacket::new(
                pkb.ip.dst,
                pkb.ip.src,
                Transport::IcmpEcho(IcmpEcho {
                    request: false,
                    ..echo.clone()
                }),
            );
            return output_local(ctx, reply);
        }
    }
    match pkb.ip.transport {
        Transport::Tcp(_) | Transport::Udp(_) => l4::input(ctx, pkb),
        _ => trace!("vni {}: {} not handled locally, dropped", ctx.vni(), pkb.ip),
    }
}

/// Answers `pkb` with an ICMP error sent back to its source
///
/// Errors are never generated for ICMP errors or for packets without a
/// unicast source.
pub(crate) fn icmp_error(ctx: &mut NetCtx<'_>, pkb: &PacketBuffer, kind: IcmpErrorKind) {
    let ip = &pkb.ip;
    if matches!(ip.transport, Transport::IcmpError(_)) || ip.src.is_unspecified() || ip.src.is_multicast() {
        return;
    }
    // port unreachable comes from the address the packet was sent to
    let src = match kind {
        IcmpErrorKind::PortUnreachable => Some(ip.dst),
        IcmpErrorKind::TimeExceeded => routing_address(ctx.net, ip.is_ipv4()).map(|(a, _)| a),
    };
    let Some(src) = src else {
        trace!("vni {}: no synthetic address to report {:?} for {}", ctx.vni(), kind, ip);
        return;
    };
    let error = match IcmpError::quoting(kind, ip) {
        Ok(e) => e,
        Err(e) => {
            warn!("vni {}: cannot quote {}: {}", ctx.vni(), ip, e);
            return;
        }
    };
    output_local(ctx, IpPacket::new(src, ip.src, Transport::IcmpError(error)));
}

fn route(ctx: &mut NetCtx<'_>, mut pkb: PacketBuffer) {
    let dst = pkb.ip.dst;
    // translated packets to hosts of this network skip the route table
    if pkb.fastpath && ctx.net.contains_ip(dst) {
        return output_via(ctx, pkb, dst);
    }
    let Some(rule) = ctx.net.routes.lookup(dst) else {
        trace!("vni {}: no route for {}", ctx.vni(), pkb.ip);
        return;
    };
    trace!("vni {}: {} routed by {}", ctx.vni(), pkb.ip, rule);
    let target = rule.target;
    match target {
        RouteTarget::Vni(vni) if vni == ctx.vni() => output_via(ctx, pkb, dst),
        RouteTarget::Vni(vni) => {
            pkb.vni = vni;
            pkb.in_port = None;
            pkb.src_mac = None;
            ctx.out.push_back(Egress::Route { vni, pkb });
        }
        RouteTarget::Ip(next_hop) => output_via(ctx, pkb, next_hop),
    }
}

/// Source address and MAC the switch uses for traffic it originates in a family
fn routing_address(net: &VirtualNetwork, v4: bool) -> Option<(IpAddr, EthernetAddress)> {
    if v4 {
        net.ips.find_any_v4_for_routing()
    } else {
        net.ips.find_any_v6_for_routing()
    }
}

fn output_via(ctx: &mut NetCtx<'_>, pkb: PacketBuffer, next_hop: IpAddr) {
    let v4 = pkb.ip.is_ipv4();
    let src_mac = match ctx.net.ips.lookup(pkb.ip.src) {
        Some(mac) => Some(mac),
        None => routing_address(ctx.net, v4).map(|(_, mac)| mac),
    };
    let Some(src_mac) = src_mac else {
        warn!(
            "vni {}: no synthetic {} address to send {} from",
            ctx.vni(),
            if v4 { "ipv4" } else { "ipv6" },
            pkb.ip
        );
        return;
    };

    let now = ctx.now_ms();
    let dst_mac = ctx
        .net
        .arp_table
        .lookup(next_hop, now)
        .or_else(|| ctx.net.ips.lookup(next_hop));
    let Some(dst_mac) = dst_mac else {
        trace!("vni {}: {} unresolved, dropping {}", ctx.vni(), next_hop, pkb.ip);
        match next_hop {
            IpAddr::V4(target) => arp_request(ctx, target),
            IpAddr::V6(target) => neighbour_solicit(ctx, target),
        }
        return;
    };
    if ctx.net.ips.is_synthetic_mac(dst_mac) {
        warn!(
            "vni {}: next hop {} ({}) is the switch itself, dropping {}",
            ctx.vni(),
            next_hop,
            dst_mac,
            pkb.ip
        );
        return;
    }

    let body = match pkb.ip.emit() {
        Ok(b) => b,
        Err(e) => {
            warn!("vni {}: cannot emit {}: {}", ctx.vni(), pkb.ip, e);
            return;
        }
    };
    let frame = build_frame(src_mac, dst_mac, pkb.ip.ethertype(), &body);
    l2::switch(ctx, None, dst_mac, frame);
}

fn arp_request(ctx: &mut NetCtx<'_>, target_ip: Ipv4Addr) {
    let Some((IpAddr::V4(sender_ip), sender_mac)) = ctx.net.ips.find_any_v4_for_routing() else {
        warn!("vni {}: no synthetic ipv4 address to resolve {}", ctx.vni(), target_ip);
        return;
    };
    let msg = ArpMessage {
        request: true,
        sender_mac,
        sender_ip,
        target_mac: EthernetAddress([0; 6]),
        target_ip,
    };
    ctx.send_frame(None, None, build_arp_frame(&msg));
}

fn neighbour_solicit(ctx: &mut NetCtx<'_>, target: Ipv6Addr) {
    let Some((IpAddr::V6(sender_ip), sender_mac)) = ctx.net.ips.find_any_v6_for_routing() else {
        warn!("vni {}: no synthetic ipv6 address to resolve {}", ctx.vni(), target);
        return;
    };
    match build_neighbour_solicit(sender_ip, sender_mac, target) {
        Ok(frame) => ctx.send_frame(None, None, frame),
        Err(e) => warn!("vni {}: cannot solicit {}: {}", ctx.vni(), target, e),
    }
}
