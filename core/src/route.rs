//! Per-network routing rules
//!
//! No rule is ever preceded by a rule whose block contains it, so the first
//! match in a linear scan is also the most specific one.

use std::fmt;
use std::net::IpAddr;

use log::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::net::Cidr;

pub const DEFAULT_RULE: &str = "default";
pub const DEFAULT_RULE_V6: &str = "default-v6";

/// Where packets matching a rule go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    /// Deliver inside the network with this VNI
    Vni(u32),
    /// Forward to a neighbour inside this network
    #[serde(rename = "via")]
    Ip(IpAddr),
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vni(vni) => write!(f, "vni {}", vni),
            Self::Ip(ip) => write!(f, "via {}", ip),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub alias: String,
    pub rule: Cidr,
    pub target: RouteTarget,
}

impl RouteRule {
    pub fn to_vni(alias: impl Into<String>, rule: Cidr, vni: u32) -> Self {
        Self {
            alias: alias.into(),
            rule,
            target: RouteTarget::Vni(vni),
        }
    }

    pub fn via(alias: impl Into<String>, rule: Cidr, ip: IpAddr) -> Self {
        Self {
            alias: alias.into(),
            rule,
            target: RouteTarget::Ip(ip),
        }
    }
}

impl fmt::Display for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.alias, self.rule, self.target)
    }
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    default_v4: RouteRule,
    default_v6: Option<RouteRule>,
    rules_v4: Vec<RouteRule>,
    rules_v6: Vec<RouteRule>,
}

impl RouteTable {
    /// Creates a table seeded with the default rules of the network
    pub fn new(vni: u32, v4_network: Cidr, v6_network: Option<Cidr>) -> Self {
        let default_v4 = RouteRule::to_vni(DEFAULT_RULE, v4_network, vni);
        let default_v6 = v6_network.map(|n| RouteRule::to_vni(DEFAULT_RULE_V6, n, vni));
        Self {
            rules_v4: vec![default_v4.clone()],
            rules_v6: default_v6.iter().cloned().collect(),
            default_v4,
            default_v6,
        }
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<&RouteRule> {
        let rules = if ip.is_ipv4() {
            &self.rules_v4
        } else {
            &self.rules_v6
        };
        rules.iter().find(|r| r.rule.contains(ip))
    }

    /// All rules, v4 first, each list in lookup order
    pub fn rules(&self) -> Vec<&RouteRule> {
        self.rules_v4.iter().chain(self.rules_v6.iter()).collect()
    }

    pub fn get(&self, alias: &str) -> Option<&RouteRule> {
        self.rules_v4
            .iter()
            .chain(self.rules_v6.iter())
            .find(|r| r.alias == alias)
    }

    pub fn add_rule(&mut self, rule: RouteRule) -> Result<()> {
        for existing in self.rules_v4.iter().chain(self.rules_v6.iter()) {
            if existing.alias == rule.alias {
                return Err(Error::AlreadyExists(format!("route {}", rule.alias)));
            }
            if existing.rule == rule.rule {
                return Err(Error::AlreadyExists(format!(
                    "route {} has the same network rule as the adding one: {}",
                    existing.alias, rule.rule
                )));
            }
        }

        if rule.alias == DEFAULT_RULE && rule != self.default_v4 {
            return Err(Error::Validation(format!(
                "validation failed for the rule with name {}",
                rule.alias
            )));
        }
        if rule.alias == DEFAULT_RULE_V6 && Some(&rule) != self.default_v6.as_ref() {
            return Err(Error::Validation(format!(
                "validation failed for the rule with name {}",
                rule.alias
            )));
        }
        if let RouteTarget::Ip(ip) = rule.target {
            if ip.is_ipv6() && self.default_v6.is_none() {
                return Err(Error::Validation(
                    "this network does not support ipv6".to_string(),
                ));
            }
            if ip.is_ipv4() != rule.rule.is_ipv4() {
                return Err(Error::Validation(format!(
                    "next hop {} is not in the same family as {}",
                    ip, rule.rule
                )));
            }
            let in_v4 = self.default_v4.rule.contains(ip);
            let in_v6 = self.default_v6.as_ref().is_some_and(|d| d.rule.contains(ip));
            if !in_v4 && !in_v6 {
                return Err(Error::Validation(format!(
                    "cannot specify an ip out of the network to redirect packets to: {}",
                    ip
                )));
            }
        }

        debug!("adding route {}", rule);
        if rule.rule.is_ipv4() {
            insert_ordered(&mut self.rules_v4, rule);
        } else {
            insert_ordered(&mut self.rules_v6, rule);
        }
        Ok(())
    }

    pub fn del_rule(&mut self, alias: &str) -> Result<RouteRule> {
        if alias == DEFAULT_RULE || alias == DEFAULT_RULE_V6 {
            return Err(Error::Validation(format!(
                "route {} cannot be removed",
                alias
            )));
        }
        for rules in [&mut self.rules_v4, &mut self.rules_v6] {
            if let Some(idx) = rules.iter().position(|r| r.alias == alias) {
                let removed = rules.remove(idx);
                debug!("removed route {}", removed);
                return Ok(removed);
            }
        }
        Err(Error::NotFound(format!("route {}", alias)))
    }
}

/// Places `rule` ahead of the first rule containing it
///
/// Every rule the new one contains already sits before that container, so no
/// rule ever follows a block that covers it.
fn insert_ordered(rules: &mut Vec<RouteRule>, rule: RouteRule) {
    match rules.iter().position(|r| r.rule.contains_cidr(&rule.rule)) {
        Some(i) => rules.insert(i, rule),
        None => rules.push(rule),
    }
}
