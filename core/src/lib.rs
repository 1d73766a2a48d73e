//! User-space virtual network switch
//!
//! A [`switch::Switch`] hosts isolated virtual networks keyed by VNI. Each
//! network learns MAC addresses, answers ARP for its synthetic IPs, routes
//! between networks and next hops, translates flows matching its NAT rules
//! and terminates TCP/UDP addressed to synthetic IPs, which applications
//! reach through the adapters in [`fd`].

pub mod comm;
pub mod config;
pub mod conntrack;
pub mod error;
pub mod fd;
pub mod ips;
pub mod nat_rule;
pub mod net;
pub mod network;
pub mod packet;
pub mod reactor;
pub mod route;
pub mod stack;
pub mod switch;
pub mod tables;

pub use error::{Error, Result};

#[cfg(test)]
pub mod test;
