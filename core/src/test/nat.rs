//! Translated flows between hosts of the network

use std::net::Ipv4Addr;

use super::*;
use crate::conntrack::Protocol;
use crate::conntrack::nat::proxy_v2_header;
use crate::conntrack::tcp::TcpState;
use crate::nat_rule::{NatAction, NatRule, SnatPool};
use crate::packet::{ArpMessage, build_arp_frame};

fn learn_server(h: &mut Harness) {
    let frame = build_arp_frame(&ArpMessage {
        request: true,
        sender_mac: SERVER_MAC,
        sender_ip: Ipv4Addr::new(10, 0, 0, 20),
        target_mac: EthernetAddress([0; 6]),
        target_ip: Ipv4Addr::new(10, 0, 0, 1),
    });
    h.sw.input(InboundFrame {
        vni: VNI,
        port: SERVER_PORT,
        frame,
    });
    h.rx.try_iter().count();
}

fn rule(protocol: Protocol, port: u16, action: NatAction) -> NatRule {
    NatRule {
        alias: "web".to_string(),
        protocol,
        src: None,
        dst: Some("10.0.0.1/32".parse().unwrap()),
        dst_port: Some(port),
        action,
        proxy_protocol: false,
    }
}

fn dnat(protocol: Protocol) -> NatRule {
    rule(protocol, 80, NatAction::Dnat { to: sa("10.0.0.20:8080") })
}

fn nat_state(h: &Harness) -> Option<TcpState> {
    h.sw.network(VNI)?.conntrack.tcp_nats().next().map(|n| n.state)
}

#[test]
fn test_dnat_rewrites_both_directions() {
    let mut h = Harness::new();
    learn_server(&mut h);
    h.sw.add_nat_rule(VNI, dnat(Protocol::Tcp)).unwrap();
    let (syn, ack, fin) = (TcpFlags::SYN, TcpFlags::ACK, TcpFlags::FIN);

    h.send(CLIENT_PORT, CLIENT_MAC, tcp("10.0.0.5:4000", "10.0.0.1:80", 1, 0, syn, &[]));
    let out = h.out();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, Some(SERVER_PORT));
    assert_eq!(out[0].1.src_endpoint(), Some(sa("10.0.0.5:4000")));
    assert_eq!(out[0].1.dst_endpoint(), Some(sa("10.0.0.20:8080")));
    assert_eq!(nat_state(&h), Some(TcpState::SynSent));

    h.send(SERVER_PORT, SERVER_MAC, tcp("10.0.0.20:8080", "10.0.0.5:4000", 9, 2, syn | ack, &[]));
    let out = h.out();
    assert_eq!(out[0].0, Some(CLIENT_PORT));
    assert_eq!(out[0].1.src_endpoint(), Some(sa("10.0.0.1:80")));
    assert_eq!(out[0].1.dst_endpoint(), Some(sa("10.0.0.5:4000")));
    assert_eq!(out[0].1.tcp_segment().unwrap().flags, syn | ack);
    assert_eq!(nat_state(&h), Some(TcpState::SynReceived));

    let steps = [
        (true, ack, TcpState::Established),
        (true, ack | TcpFlags::PSH, TcpState::Established),
        (true, fin | ack, TcpState::FinWait1),
        (false, fin | ack, TcpState::TimeWait),
        (true, ack, TcpState::TimeWait),
    ];
    for (forward, flags, expected) in steps {
        if forward {
            h.send(CLIENT_PORT, CLIENT_MAC, tcp("10.0.0.5:4000", "10.0.0.1:80", 2, 10, flags, b"x"));
        } else {
            h.send(SERVER_PORT, SERVER_MAC, tcp("10.0.0.20:8080", "10.0.0.5:4000", 10, 3, flags, &[]));
        }
        assert_eq!(h.out().len(), 1);
        assert_eq!(nat_state(&h), Some(expected), "after {}", flags);
    }

    let time_wait = SwitchConfig::default().tcp_timeouts.time_wait_ms;
    h.sw.advance(time_wait);
    assert_eq!(nat_state(&h), None);
    let conntrack = &h.sw.network(VNI).unwrap().conntrack;
    assert!(!conntrack.is_nat_tracked(Protocol::Tcp, sa("10.0.0.1:80"), sa("10.0.0.5:4000")));
}

#[test]
fn test_proxy_protocol_header_prefixes_server_stream() {
    let mut h = Harness::new();
    learn_server(&mut h);
    let mut rule = dnat(Protocol::Tcp);
    rule.proxy_protocol = true;
    h.sw.add_nat_rule(VNI, rule).unwrap();
    let (syn, ack) = (TcpFlags::SYN, TcpFlags::ACK);
    let header = proxy_v2_header(sa("10.0.0.5:4000"), sa("10.0.0.1:80"));
    let len = header.len() as u32;

    h.send(CLIENT_PORT, CLIENT_MAC, tcp("10.0.0.5:4000", "10.0.0.1:80", 100, 0, syn, &[]));
    let out = h.out();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].1.tcp_segment().unwrap().seq, 100 - len);

    // the switch answers the SYN-ACK itself, nothing reaches the client
    h.send(SERVER_PORT, SERVER_MAC, tcp("10.0.0.20:8080", "10.0.0.5:4000", 9, 101 - len, syn | ack, &[]));
    let out = h.out();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, Some(SERVER_PORT));
    assert_eq!(out[0].1.dst_endpoint(), Some(sa("10.0.0.20:8080")));
    let seg = out[0].1.tcp_segment().unwrap();
    assert_eq!((seg.seq, seg.ack), (101 - len, 10));
    assert_eq!(seg.payload, header);

    h.send(SERVER_PORT, SERVER_MAC, tcp("10.0.0.20:8080", "10.0.0.5:4000", 10, 101, ack, &[]));
    let out = h.out();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, Some(CLIENT_PORT));
    assert_eq!(out[0].1.src_endpoint(), Some(sa("10.0.0.1:80")));
    let seg = out[0].1.tcp_segment().unwrap();
    assert_eq!((seg.seq, seg.ack, seg.flags), (9, 101, syn | ack));
    assert_eq!(nat_state(&h), Some(TcpState::SynReceived));

    h.send(CLIENT_PORT, CLIENT_MAC, tcp("10.0.0.5:4000", "10.0.0.1:80", 101, 10, ack, b"GET"));
    let out = h.out();
    assert_eq!(out[0].1.tcp_segment().unwrap().seq, 101);
    assert_eq!(nat_state(&h), Some(TcpState::Established));
}

#[test]
fn test_reset_closes_nat_flow() {
    let mut h = Harness::new();
    learn_server(&mut h);
    h.sw.add_nat_rule(VNI, dnat(Protocol::Tcp)).unwrap();
    h.send(CLIENT_PORT, CLIENT_MAC, tcp("10.0.0.5:4000", "10.0.0.1:80", 1, 0, TcpFlags::SYN, &[]));
    h.send(SERVER_PORT, SERVER_MAC, tcp("10.0.0.20:8080", "10.0.0.5:4000", 0, 2, TcpFlags::RST | TcpFlags::ACK, &[]));
    assert_eq!(h.out().len(), 2);
    assert_eq!(nat_state(&h), Some(TcpState::Closed));

    // a non-SYN segment never creates a flow
    h.send(CLIENT_PORT, CLIENT_MAC, tcp("10.0.0.5:4001", "10.0.0.1:80", 1, 0, TcpFlags::ACK, &[]));
    assert_eq!(h.sw.network(VNI).unwrap().conntrack.count_tcp_nat(), 1);
}

#[test]
fn test_udp_nat_idle_expiry_removes_both_legs() {
    let mut h = Harness::new();
    learn_server(&mut h);
    h.sw.add_nat_rule(VNI, dnat(Protocol::Udp)).unwrap();
    let udp_ms = SwitchConfig::default().udp_timeout_ms;

    h.send(CLIENT_PORT, CLIENT_MAC, IpPacket::udp(sa("10.0.0.5:5000"), sa("10.0.0.1:80"), b"q".to_vec()));
    let out = h.out();
    assert_eq!(out[0].1.dst_endpoint(), Some(sa("10.0.0.20:8080")));

    // traffic in either direction keeps the flow alive
    h.sw.advance(udp_ms - 1);
    h.send(SERVER_PORT, SERVER_MAC, IpPacket::udp(sa("10.0.0.20:8080"), sa("10.0.0.5:5000"), b"a".to_vec()));
    let out = h.out();
    assert_eq!(out[0].1.src_endpoint(), Some(sa("10.0.0.1:80")));
    h.sw.advance(udp_ms - 1);

    let conntrack = &h.sw.network(VNI).unwrap().conntrack;
    assert_eq!(conntrack.count_udp_nat(), 1);
    h.sw.advance(1);
    let conntrack = &h.sw.network(VNI).unwrap().conntrack;
    assert_eq!(conntrack.count_udp_nat(), 0);
    assert!(!conntrack.is_nat_tracked(Protocol::Udp, sa("10.0.0.1:80"), sa("10.0.0.5:5000")));
    assert!(!conntrack.is_nat_tracked(Protocol::Udp, sa("10.0.0.5:5000"), sa("10.0.0.20:8080")));
}

#[test]
fn test_fnat_allocates_from_pool() {
    let mut h = Harness::new();
    learn_server(&mut h);
    let pool = SnatPool {
        ip: "10.0.0.1".parse().unwrap(),
        first_port: 20000,
        last_port: 20001,
    };
    let fnat = rule(
        Protocol::Tcp,
        8080,
        NatAction::Fnat {
            pool: pool.clone(),
            to: sa("10.0.0.20:80"),
        },
    );
    h.sw.add_nat_rule(VNI, fnat).unwrap();

    let mut allocated = vec![];
    for port in [4000, 4001] {
        let src = format!("10.0.0.5:{}", port);
        h.send(CLIENT_PORT, CLIENT_MAC, tcp(&src, "10.0.0.1:8080", 1, 0, TcpFlags::SYN, &[]));
        let (_, ip) = h.out().pop().unwrap();
        let from = ip.src_endpoint().unwrap();
        assert_eq!(from.ip(), pool.ip);
        assert!((20000..=20001).contains(&from.port()));
        assert_eq!(ip.dst_endpoint(), Some(sa("10.0.0.20:80")));
        allocated.push(from);
    }
    assert_ne!(allocated[0], allocated[1]);

    // the pool is exhausted
    h.send(CLIENT_PORT, CLIENT_MAC, tcp("10.0.0.5:4002", "10.0.0.1:8080", 1, 0, TcpFlags::SYN, &[]));
    assert!(h.out().is_empty());

    let back = tcp("10.0.0.20:80", &allocated[1].to_string(), 5, 2, TcpFlags::SYN | TcpFlags::ACK, &[]);
    h.send(SERVER_PORT, SERVER_MAC, back);
    let (port, ip) = h.out().pop().unwrap();
    assert_eq!(port, Some(CLIENT_PORT));
    assert_eq!(ip.src_endpoint(), Some(sa("10.0.0.1:8080")));
    assert_eq!(ip.dst_endpoint(), Some(sa("10.0.0.5:4001")));
}
