//! Datagram exchange through a bound synthetic address

use super::*;
use crate::conntrack::Tuple;
use crate::fd::{VSwitchDatagramFd, VirtualFd};
use crate::network::EPHEMERAL_PORTS;
use crate::packet::{IcmpErrorKind, Transport};

fn client_udp(h: &mut Harness, src: &str, dst: &str, payload: &[u8]) {
    h.send(CLIENT_PORT, CLIENT_MAC, IpPacket::udp(sa(src), sa(dst), payload.to_vec()));
}

#[test]
fn test_query_and_reply() {
    let mut h = Harness::new();
    let mut fd = VSwitchDatagramFd::new(VNI);
    h.sw.with_network(VNI, |ctx| fd.bind(ctx, sa("10.0.0.1:53")))
        .unwrap()
        .unwrap();
    assert!(fd.is_writable());
    assert!(!fd.is_readable());

    client_udp(&mut h, "10.0.0.5:5000", "10.0.0.1:53", b"query");
    client_udp(&mut h, "10.0.0.5:5001", "10.0.0.1:53", b"second");
    assert!(fd.is_readable());

    let mut buf = [0u8; 32];
    let (n, from) = h
        .sw
        .with_network(VNI, |ctx| fd.receive(ctx, &mut buf))
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!((&buf[..n], from), (&b"query"[..], sa("10.0.0.5:5000")));
    assert!(fd.is_readable());

    let sent = h
        .sw
        .with_network(VNI, |ctx| fd.send(ctx, b"answer", from))
        .unwrap()
        .unwrap();
    assert_eq!(sent, 6);
    let out = h.out();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, Some(CLIENT_PORT));
    assert_eq!(out[0].1.src_endpoint(), Some(sa("10.0.0.1:53")));
    assert_eq!(out[0].1.dst_endpoint(), Some(from));
    assert_eq!(out[0].1.udp_datagram().unwrap().payload, b"answer");

    // too small a buffer consumes the datagram
    let mut small = [0u8; 2];
    let got = h.sw.with_network(VNI, |ctx| fd.receive(ctx, &mut small)).unwrap().unwrap();
    assert!(got.is_none());
    assert!(!fd.is_readable());
}

#[test]
fn test_exchange_expires_on_sweep() {
    let mut h = Harness::new();
    let mut fd = VSwitchDatagramFd::new(VNI);
    h.sw.with_network(VNI, |ctx| fd.bind(ctx, sa("10.0.0.1:53")))
        .unwrap()
        .unwrap();
    client_udp(&mut h, "10.0.0.5:5000", "10.0.0.1:53", b"q");
    let tuple = Tuple::new(sa("10.0.0.1:53"), sa("10.0.0.5:5000"));
    assert!(h.sw.network(VNI).unwrap().conntrack.lookup_udp(&tuple).is_some());

    let config = SwitchConfig::default();
    h.sw.advance(config.udp_timeout_ms + config.table_sweep_interval_ms);
    assert!(h.sw.network(VNI).unwrap().conntrack.lookup_udp(&tuple).is_none());
    // the bound address outlives the exchange
    assert_eq!(h.sw.network(VNI).unwrap().conntrack.count_udp_listen(), 1);
}

#[test]
fn test_connected_fd_filters_peers() {
    let mut h = Harness::new();
    let mut fd = VSwitchDatagramFd::new(VNI);
    h.sw.with_network(VNI, |ctx| fd.connect(ctx, sa("10.0.0.5:5000")))
        .unwrap()
        .unwrap();
    let local = fd.local_address().unwrap();
    assert_eq!(local.ip(), "10.0.0.1".parse::<std::net::IpAddr>().unwrap());
    assert!(EPHEMERAL_PORTS.contains(&local.port()));

    let dst = local.to_string();
    client_udp(&mut h, "10.0.0.6:5000", &dst, b"stranger");
    assert!(!fd.is_readable());
    client_udp(&mut h, "10.0.0.5:5000", &dst, b"peer");
    assert!(fd.is_readable());

    h.sw.with_network(VNI, |ctx| fd.close(ctx)).unwrap();
    assert!(fd.is_closed());
    assert_eq!(h.sw.network(VNI).unwrap().conntrack.count_udp_listen(), 0);
    let err = h.sw.with_network(VNI, |ctx| fd.send(ctx, b"x", sa("10.0.0.5:5000"))).unwrap();
    assert!(err.is_err());
}

#[test]
fn test_unbound_port_answers_port_unreachable() {
    let mut h = Harness::new();
    client_udp(&mut h, "10.0.0.5:5000", "10.0.0.1:9999", b"anyone?");
    let out = h.out();
    assert_eq!(out.len(), 1);
    let (port, ip) = &out[0];
    assert_eq!(*port, Some(CLIENT_PORT));
    assert_eq!(ip.src, "10.0.0.1".parse::<std::net::IpAddr>().unwrap());
    assert_eq!(ip.dst, "10.0.0.5".parse::<std::net::IpAddr>().unwrap());
    let Transport::IcmpError(e) = &ip.transport else {
        panic!("not an icmp error: {}", ip);
    };
    assert_eq!(e.kind, IcmpErrorKind::PortUnreachable);
    assert_eq!(e.quoted_ports(), Some((5000, 9999)));

    // once bound the same datagram is delivered
    let mut fd = VSwitchDatagramFd::new(VNI);
    h.sw.with_network(VNI, |ctx| fd.bind(ctx, sa("10.0.0.1:9999")))
        .unwrap()
        .unwrap();
    client_udp(&mut h, "10.0.0.5:5000", "10.0.0.1:9999", b"anyone?");
    assert!(h.out().is_empty());
    assert!(fd.is_readable());
}
