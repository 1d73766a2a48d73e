//! JSON switch configuration

use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smoltcp::wire::EthernetAddress;

use crate::conntrack::nat::{NatTimeouts, TcpTimeouts, UDP_TIMEOUT_MS};
use crate::nat_rule::NatRule;
use crate::net::{Cidr, parse_mac};
use crate::route::{RouteRule, RouteTarget};
use crate::tables::{ARP_TABLE_TIMEOUT_MS, MAC_TABLE_TIMEOUT_MS};

/// Default interval of the MAC/ARP table sweep
pub const TABLE_SWEEP_INTERVAL_MS: u64 = 10 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    pub mac_table_timeout_ms: u64,
    pub arp_table_timeout_ms: u64,
    /// 0 disables the periodic sweep; entries still expire on lookup
    pub table_sweep_interval_ms: u64,
    pub udp_timeout_ms: u64,
    pub tcp_timeouts: TcpTimeouts,
    pub networks: Vec<NetworkConfig>,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            mac_table_timeout_ms: MAC_TABLE_TIMEOUT_MS,
            arp_table_timeout_ms: ARP_TABLE_TIMEOUT_MS,
            table_sweep_interval_ms: TABLE_SWEEP_INTERVAL_MS,
            udp_timeout_ms: UDP_TIMEOUT_MS,
            tcp_timeouts: TcpTimeouts::default(),
            networks: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub vni: u32,
    pub v4: Cidr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v6: Option<Cidr>,
    #[serde(default)]
    pub ips: Vec<IpConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub nat: Vec<NatRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    pub ip: IpAddr,
    #[serde(serialize_with = "serialize_mac", deserialize_with = "deserialize_mac")]
    pub mac: EthernetAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub alias: String,
    pub rule: Cidr,
    #[serde(flatten)]
    pub target: RouteTarget,
}

impl From<RouteConfig> for RouteRule {
    fn from(c: RouteConfig) -> Self {
        Self {
            alias: c.alias,
            rule: c.rule,
            target: c.target,
        }
    }
}

impl From<&RouteRule> for RouteConfig {
    fn from(r: &RouteRule) -> Self {
        Self {
            alias: r.alias.clone(),
            rule: r.rule,
            target: r.target,
        }
    }
}

fn serialize_mac<S: Serializer>(mac: &EthernetAddress, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.collect_str(mac)
}

fn deserialize_mac<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<EthernetAddress, D::Error> {
    let s = String::deserialize(d)?;
    parse_mac(&s).map_err(serde::de::Error::custom)
}

impl SwitchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config {}", path.display()))?;
        Self::from_json(&data).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)
            .with_context(|| format!("Cannot write config {}", path.display()))
    }

    pub fn nat_timeouts(&self) -> NatTimeouts {
        NatTimeouts {
            tcp: self.tcp_timeouts.clone(),
            udp_ms: self.udp_timeout_ms,
        }
    }
}
