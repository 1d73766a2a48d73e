//! Operator-provisioned address translation rules
//!
//! A rule only decides how a new flow is translated. Once the first packet
//! matched, the flow lives in conntrack and the rule is not consulted again.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use log::*;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::conntrack::{Conntrack, Protocol, Tuple};
use crate::error::{Error, Result};
use crate::net::Cidr;

/// Source address and port range handed out to translated flows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnatPool {
    pub ip: IpAddr,
    pub first_port: u16,
    pub last_port: u16,
}

impl SnatPool {
    /// Picks a pool port whose leg towards `remote` is not tracked yet
    ///
    /// Ports are released implicitly when the NAT flow holding them is removed.
    pub fn allocate(
        &self,
        protocol: Protocol,
        remote: SocketAddr,
        conntrack: &Conntrack,
    ) -> Option<SocketAddr> {
        let span = u32::from(self.last_port - self.first_port) + 1;
        let start = rand::rng().random_range(0..span);
        (0..span)
            .map(|i| self.first_port + ((start + i) % span) as u16)
            .map(|port| SocketAddr::new(self.ip, port))
            .find(|local| {
                let listening = match protocol {
                    Protocol::Tcp => conntrack.lookup_tcp_listen(*local).is_some(),
                    Protocol::Udp => conntrack.lookup_udp_listen(*local).is_some(),
                };
                !listening && !conntrack.is_nat_tracked(protocol, *local, remote)
            })
    }
}

impl fmt::Display for SnatPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.ip, self.first_port, self.last_port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatAction {
    /// Rewrite the destination, keep the client as source
    Dnat { to: SocketAddr },
    /// Rewrite the source to a pool address, keep the destination
    Snat { pool: SnatPool },
    /// Rewrite both
    Fnat { pool: SnatPool, to: SocketAddr },
}

impl fmt::Display for NatAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dnat { to } => write!(f, "dnat {}", to),
            Self::Snat { pool } => write!(f, "snat {}", pool),
            Self::Fnat { pool, to } => write!(f, "fnat {} {}", pool, to),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRule {
    pub alias: String,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<Cidr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<Cidr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<u16>,
    #[serde(flatten)]
    pub action: NatAction,
    /// Announce the client to the server with a PROXY protocol v2 header (TCP only)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub proxy_protocol: bool,
}

impl NatRule {
    pub fn matches(&self, protocol: Protocol, src: SocketAddr, dst: SocketAddr) -> bool {
        self.protocol == protocol
            && self.src.is_none_or(|c| c.contains(src.ip()))
            && self.dst.is_none_or(|c| c.contains(dst.ip()))
            && self.dst_port.is_none_or(|p| p == dst.port())
    }

    /// Addresses the rule rewrites to, checked for family consistency
    fn targets(&self) -> Vec<IpAddr> {
        match &self.action {
            NatAction::Dnat { to } => vec![to.ip()],
            NatAction::Snat { pool } => vec![pool.ip],
            NatAction::Fnat { pool, to } => vec![pool.ip, to.ip()],
        }
    }

    pub fn pool(&self) -> Option<&SnatPool> {
        match &self.action {
            NatAction::Dnat { .. } => None,
            NatAction::Snat { pool } | NatAction::Fnat { pool, .. } => Some(pool),
        }
    }

    /// Builds the two legs of a new flow from `client` to `orig_dst`
    ///
    /// `allocated` is the pool address for SNAT and FNAT, ignored for DNAT.
    pub fn legs(
        &self,
        client: SocketAddr,
        orig_dst: SocketAddr,
        allocated: Option<SocketAddr>,
    ) -> Option<(Tuple, Tuple)> {
        let leg1 = Tuple::new(orig_dst, client);
        let leg2 = match &self.action {
            NatAction::Dnat { to } => Tuple::new(client, *to),
            NatAction::Snat { .. } => Tuple::new(allocated?, orig_dst),
            NatAction::Fnat { to, .. } => Tuple::new(allocated?, *to),
        };
        Some((leg1, leg2))
    }
}

impl fmt::Display for NatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.alias, self.protocol)?;
        if let Some(src) = self.src {
            write!(f, " src {}", src)?;
        }
        if let Some(dst) = self.dst {
            write!(f, " dst {}", dst)?;
        }
        if let Some(port) = self.dst_port {
            write!(f, " port {}", port)?;
        }
        write!(f, " {}", self.action)?;
        if self.proxy_protocol {
            write!(f, " proxy-protocol")?;
        }
        Ok(())
    }
}

/// Ordered rules, first match wins
#[derive(Debug, Clone, Default)]
pub struct NatRuleTable {
    rules: Vec<NatRule>,
}

impl NatRuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: NatRule) -> Result<()> {
        if self.rules.iter().any(|r| r.alias == rule.alias) {
            return Err(Error::AlreadyExists(format!("nat rule {}", rule.alias)));
        }
        if rule.proxy_protocol && rule.protocol != Protocol::Tcp {
            return Err(Error::Validation(format!(
                "nat rule {}: proxy protocol needs tcp",
                rule.alias
            )));
        }
        if let Some(pool) = rule.pool() {
            if pool.first_port == 0 || pool.first_port > pool.last_port {
                return Err(Error::Validation(format!("invalid snat pool {}", pool)));
            }
        }
        let families = [rule.src, rule.dst]
            .into_iter()
            .flatten()
            .map(|c| c.is_ipv4())
            .chain(rule.targets().iter().map(|ip| ip.is_ipv4()))
            .collect::<Vec<_>>();
        if families.windows(2).any(|w| w[0] != w[1]) {
            return Err(Error::Validation(format!(
                "nat rule {} mixes address families",
                rule.alias
            )));
        }
        debug!("nat rule added: {}", rule);
        self.rules.push(rule);
        Ok(())
    }

    pub fn remove(&mut self, alias: &str) -> Result<NatRule> {
        let Some(idx) = self.rules.iter().position(|r| r.alias == alias) else {
            return Err(Error::NotFound(format!("nat rule {}", alias)));
        };
        let rule = self.rules.remove(idx);
        debug!("nat rule removed: {}", rule);
        Ok(rule)
    }

    pub fn find(&self, protocol: Protocol, src: SocketAddr, dst: SocketAddr) -> Option<&NatRule> {
        self.rules.iter().find(|r| r.matches(protocol, src, dst))
    }

    pub fn rules(&self) -> &[NatRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
