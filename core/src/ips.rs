//! Synthetic IP bindings of a virtual network

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;

use log::*;
use smoltcp::wire::EthernetAddress;

use crate::error::{Error, Result};
use crate::net::Cidr;

/// IP to MAC bindings for locally terminated endpoints
///
/// The forward map and the reverse index are only ever changed together.
#[derive(Debug, Clone)]
pub struct SyntheticIpHolder {
    v4_network: Cidr,
    v6_network: Option<Cidr>,
    ip_to_mac: BTreeMap<IpAddr, EthernetAddress>,
    mac_to_ips: HashMap<EthernetAddress, BTreeSet<IpAddr>>,
}

impl SyntheticIpHolder {
    pub fn new(v4_network: Cidr, v6_network: Option<Cidr>) -> Self {
        Self {
            v4_network,
            v6_network,
            ip_to_mac: BTreeMap::new(),
            mac_to_ips: HashMap::new(),
        }
    }

    pub fn add(&mut self, ip: IpAddr, mac: EthernetAddress) -> Result<()> {
        match ip {
            IpAddr::V4(_) => {
                if !self.v4_network.contains(ip) {
                    return Err(Error::Validation(format!(
                        "{} is not in network {}",
                        ip, self.v4_network
                    )));
                }
            }
            IpAddr::V6(_) => {
                let Some(v6) = self.v6_network else {
                    return Err(Error::Validation(
                        "this network does not support ipv6".to_string(),
                    ));
                };
                if !v6.contains(ip) {
                    return Err(Error::Validation(format!(
                        "{} is not in network {}",
                        ip, v6
                    )));
                }
            }
        }
        if self.ip_to_mac.contains_key(&ip) {
            return Err(Error::AlreadyExists(format!("synthetic ip {}", ip)));
        }

        debug!("synthetic ip {} -> {}", ip, mac);
        self.ip_to_mac.insert(ip, mac);
        self.mac_to_ips.entry(mac).or_default().insert(ip);
        Ok(())
    }

    pub fn remove(&mut self, ip: IpAddr) -> Result<EthernetAddress> {
        let Some(mac) = self.ip_to_mac.remove(&ip) else {
            return Err(Error::NotFound(format!("synthetic ip {}", ip)));
        };
        if let Some(ips) = self.mac_to_ips.get_mut(&mac) {
            ips.remove(&ip);
            if ips.is_empty() {
                self.mac_to_ips.remove(&mac);
            }
        }
        debug!("removed synthetic ip {} ({})", ip, mac);
        Ok(mac)
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<EthernetAddress> {
        self.ip_to_mac.get(&ip).copied()
    }

    pub fn lookup_by_mac(&self, mac: EthernetAddress) -> Option<&BTreeSet<IpAddr>> {
        self.mac_to_ips.get(&mac)
    }

    pub fn is_synthetic_mac(&self, mac: EthernetAddress) -> bool {
        self.mac_to_ips.contains_key(&mac)
    }

    pub fn all_ips(&self) -> impl Iterator<Item = (IpAddr, EthernetAddress)> + '_ {
        self.ip_to_mac.iter().map(|(ip, mac)| (*ip, *mac))
    }

    pub fn len(&self) -> usize {
        self.ip_to_mac.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ip_to_mac.is_empty()
    }

    /// Lowest synthetic IPv4 binding, used as the source for generated traffic
    pub fn find_any_v4_for_routing(&self) -> Option<(IpAddr, EthernetAddress)> {
        self.all_ips().find(|(ip, _)| ip.is_ipv4())
    }

    pub fn find_any_v6_for_routing(&self) -> Option<(IpAddr, EthernetAddress)> {
        self.all_ips().find(|(ip, _)| ip.is_ipv6())
    }
}
