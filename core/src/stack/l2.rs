//! Ethernet switching, MAC learning and ARP

use std::net::IpAddr;

use log::*;
use smoltcp::wire::EthernetAddress;

use super::{NetCtx, l3};
use crate::error::Result;
use crate::packet::{ArpMessage, Frame, FramePayload, PacketBuffer, build_arp_frame};

/// Handles one frame received on `port`. Undecodable frames are an error and nothing is learned.
pub fn input(ctx: &mut NetCtx<'_>, port: u32, raw: Vec<u8>) -> Result<()> {
    let frame = Frame::parse(&raw)?;
    let now = ctx.now_ms();

    if frame.src_mac.is_unicast() && !ctx.net.ips.is_synthetic_mac(frame.src_mac) {
        if ctx.net.mac_table.record(frame.src_mac, port, false, now) {
            trace!(
                "vni {}: learned {} on port {}",
                ctx.vni(),
                frame.src_mac,
                port
            );
        }
    }

    match frame.payload {
        FramePayload::Arp(msg) => arp_input(ctx, port, frame.dst_mac, msg, raw),
        FramePayload::Ip(ip) => {
            let to_switch = ctx.net.ips.is_synthetic_mac(frame.dst_mac);
            let group = frame.dst_mac.is_broadcast() || frame.dst_mac.is_multicast();
            if !to_switch {
                switch(ctx, Some(port), frame.dst_mac, raw);
            }
            if to_switch || group {
                let pkb = PacketBuffer::from_input(ctx.vni(), port, frame.src_mac, ip);
                l3::input(ctx, pkb);
            }
        }
        FramePayload::Unsupported(ethertype) => {
            trace!("vni {}: switching ethertype {:#06x}", ctx.vni(), ethertype);
            switch(ctx, Some(port), frame.dst_mac, raw);
        }
    }
    Ok(())
}

fn arp_input(
    ctx: &mut NetCtx<'_>,
    port: u32,
    dst_mac: EthernetAddress,
    msg: ArpMessage,
    raw: Vec<u8>,
) {
    let sender = IpAddr::V4(msg.sender_ip);
    if ctx.net.v4_network.contains(sender) && ctx.net.ips.lookup(sender).is_none() {
        let now = ctx.now_ms();
        ctx.net.arp_table.record(sender, msg.sender_mac, false, now);
    }

    let target = IpAddr::V4(msg.target_ip);
    if msg.request {
        if let Some(mac) = ctx.net.ips.lookup(target) {
            trace!("vni {}: arp reply for {}", ctx.vni(), target);
            let reply = ArpMessage {
                request: false,
                sender_mac: mac,
                sender_ip: msg.target_ip,
                target_mac: msg.sender_mac,
                target_ip: msg.sender_ip,
            };
            ctx.send_frame(Some(port), None, build_arp_frame(&reply));
            return;
        }
    } else if ctx.net.ips.is_synthetic_mac(dst_mac) {
        // replies to our own requests are only learned
        return;
    }
    switch(ctx, Some(port), dst_mac, raw);
}

/// Forwards a frame to the port `dst_mac` was learned on, or floods it
pub(crate) fn switch(
    ctx: &mut NetCtx<'_>,
    in_port: Option<u32>,
    dst_mac: EthernetAddress,
    raw: Vec<u8>,
) {
    if dst_mac.is_unicast() {
        let now = ctx.now_ms();
        if let Some(port) = ctx.net.mac_table.lookup(dst_mac, now) {
            if Some(port) == in_port {
                trace!(
                    "vni {}: {} is on the input port, dropped",
                    ctx.vni(),
                    dst_mac
                );
                return;
            }
            ctx.send_frame(Some(port), None, raw);
            return;
        }
    }
    ctx.send_frame(None, in_port, raw);
}
