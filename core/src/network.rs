//! One isolated virtual network

use std::net::{IpAddr, SocketAddr};

use log::*;
use rand::Rng;
use smoltcp::wire::EthernetAddress;

use crate::conntrack::Conntrack;
use crate::error::{Error, Result};
use crate::ips::SyntheticIpHolder;
use crate::nat_rule::{NatRule, NatRuleTable};
use crate::net::Cidr;
use crate::route::{RouteRule, RouteTable};
use crate::tables::{ArpTable, MacTable};

/// Ephemeral ports handed to active opens and auto-bound datagram sockets
pub const EPHEMERAL_PORTS: std::ops::Range<u16> = 30720..32768;
const PORT_PICK_RETRIES: usize = 100;

/// Address tables, routes and tracked flows of one VNI
pub struct VirtualNetwork {
    pub vni: u32,
    pub v4_network: Cidr,
    pub v6_network: Option<Cidr>,
    pub mac_table: MacTable,
    pub arp_table: ArpTable,
    pub ips: SyntheticIpHolder,
    pub routes: RouteTable,
    pub nat_rules: NatRuleTable,
    pub conntrack: Conntrack,
}

impl VirtualNetwork {
    pub fn new(
        vni: u32,
        v4_network: Cidr,
        v6_network: Option<Cidr>,
        mac_table_timeout_ms: u64,
        arp_table_timeout_ms: u64,
    ) -> Result<Self> {
        if !v4_network.is_ipv4() {
            return Err(Error::Validation(format!(
                "{} is not an ipv4 network",
                v4_network
            )));
        }
        if let Some(v6) = v6_network {
            if v6.is_ipv4() {
                return Err(Error::Validation(format!("{} is not an ipv6 network", v6)));
            }
        }
        Ok(Self {
            vni,
            v4_network,
            v6_network,
            mac_table: MacTable::new(mac_table_timeout_ms),
            arp_table: ArpTable::new(arp_table_timeout_ms),
            ips: SyntheticIpHolder::new(v4_network, v6_network),
            routes: RouteTable::new(vni, v4_network, v6_network),
            nat_rules: NatRuleTable::new(),
            conntrack: Conntrack::new(),
        })
    }

    /// Whether `ip` falls within one of the network prefixes
    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        self.v4_network.contains(ip) || self.v6_network.is_some_and(|n| n.contains(ip))
    }

    pub fn add_ip(&mut self, ip: IpAddr, mac: EthernetAddress) -> Result<()> {
        self.ips.add(ip, mac)
    }

    pub fn remove_ip(&mut self, ip: IpAddr) -> Result<EthernetAddress> {
        self.ips.remove(ip)
    }

    pub fn add_route(&mut self, rule: RouteRule) -> Result<()> {
        self.routes.add_rule(rule)
    }

    pub fn remove_route(&mut self, alias: &str) -> Result<RouteRule> {
        self.routes.del_rule(alias)
    }

    /// Adds a NAT rule; pool addresses must be synthetic so replies reach the switch
    pub fn add_nat_rule(&mut self, rule: NatRule) -> Result<()> {
        if let Some(pool) = rule.pool() {
            if self.ips.lookup(pool.ip).is_none() {
                return Err(Error::Validation(format!(
                    "snat pool address {} is not a synthetic ip of vni {}",
                    pool.ip, self.vni
                )));
            }
        }
        self.nat_rules.add(rule)
    }

    pub fn remove_nat_rule(&mut self, alias: &str) -> Result<NatRule> {
        self.nat_rules.remove(alias)
    }

    fn find_free_port(
        &self,
        v4: bool,
        is_used: impl Fn(&Conntrack, SocketAddr) -> bool,
    ) -> Option<SocketAddr> {
        let candidates: Vec<IpAddr> = self
            .ips
            .all_ips()
            .map(|(ip, _)| ip)
            .filter(|ip| ip.is_ipv4() == v4)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let mut rng = rand::rng();
        for _ in 0..PORT_PICK_RETRIES {
            let ip = candidates[rng.random_range(0..candidates.len())];
            let addr = SocketAddr::new(ip, rng.random_range(EPHEMERAL_PORTS));
            if !is_used(&self.conntrack, addr) {
                return Some(addr);
            }
        }
        warn!("vni {}: no free ephemeral port found", self.vni);
        None
    }

    /// Picks an unused ephemeral TCP endpoint on a synthetic IP of the given family
    pub fn find_free_tcp_port(&self, v4: bool) -> Option<SocketAddr> {
        self.find_free_port(v4, Conntrack::is_tcp_addr_used)
    }

    pub fn find_free_udp_port(&self, v4: bool) -> Option<SocketAddr> {
        self.find_free_port(v4, Conntrack::is_udp_addr_used)
    }

    /// Expires table entries and idle datagram exchanges
    pub fn sweep(&mut self, now_ms: u64, udp_timeout_ms: u64) {
        let macs = self.mac_table.expire(now_ms);
        let arps = self.arp_table.expire(now_ms);
        let udp = self.conntrack.expire_udp(now_ms, udp_timeout_ms);
        if macs + arps + udp > 0 {
            trace!(
                "vni {}: expired {} mac, {} arp, {} udp entries",
                self.vni, macs, arps, udp
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Readiness;
    use crate::tables::{ARP_TABLE_TIMEOUT_MS, MAC_TABLE_TIMEOUT_MS};

    const MAC: EthernetAddress = EthernetAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

    fn network() -> VirtualNetwork {
        VirtualNetwork::new(
            1314,
            "10.0.0.0/24".parse().unwrap(),
            Some("fd00::/64".parse().unwrap()),
            MAC_TABLE_TIMEOUT_MS,
            ARP_TABLE_TIMEOUT_MS,
        )
        .unwrap()
    }

    #[test]
    fn test_family_validation() {
        let r = VirtualNetwork::new(1, "fd00::/64".parse().unwrap(), None, 1, 1);
        assert!(matches!(r, Err(Error::Validation(_))));
        let r = VirtualNetwork::new(
            1,
            "10.0.0.0/8".parse().unwrap(),
            Some("10.1.0.0/16".parse().unwrap()),
            1,
            1,
        );
        assert!(matches!(r, Err(Error::Validation(_))));
    }

    #[test]
    fn test_contains_ip() {
        let n = network();
        assert!(n.contains_ip("10.0.0.9".parse().unwrap()));
        assert!(n.contains_ip("fd00::9".parse().unwrap()));
        assert!(!n.contains_ip("10.0.1.9".parse().unwrap()));
    }

    #[test]
    fn test_find_free_port() {
        let mut n = network();
        assert!(n.find_free_tcp_port(true).is_none());
        n.add_ip("10.0.0.1".parse().unwrap(), MAC).unwrap();
        let a = n.find_free_tcp_port(true).unwrap();
        assert_eq!(a.ip(), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert!(EPHEMERAL_PORTS.contains(&a.port()));
        assert!(n.find_free_udp_port(false).is_none());

        n.conntrack.listen_udp(a, Readiness::new(1)).unwrap();
        for _ in 0..50 {
            assert_ne!(n.find_free_udp_port(true), Some(a));
        }
    }

    #[test]
    fn test_pool_must_be_synthetic() {
        let mut n = network();
        let rule: NatRule = serde_json::from_str(
            r#"{"alias":"out","protocol":"udp","snat":{"pool":{"ip":"10.0.0.1","first_port":31000,"last_port":31100}}}"#,
        )
        .unwrap();
        assert!(matches!(
            n.add_nat_rule(rule.clone()),
            Err(Error::Validation(_))
        ));
        n.add_ip("10.0.0.1".parse().unwrap(), MAC).unwrap();
        n.add_nat_rule(rule).unwrap();
        assert_eq!(n.nat_rules.rules().len(), 1);
    }
}
