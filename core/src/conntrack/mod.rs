//! Connection tracking
//!
//! Owns every L4 flow of one virtual network: listeners, connections the
//! switch terminates itself, datagram exchanges and translated NAT flows.
//! Socket adapters and the stack refer to entries by key only.

pub mod nat;
pub mod tcp;
pub mod udp;

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::io;
use std::net::SocketAddr;

use log::*;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use crate::error::{Error, Result};
use crate::net::wildcard_of;
use crate::reactor::{Readiness, Reactor};
use nat::{TcpNat, UdpNat};
use tcp::{TcpEntry, TcpListenEntry};
use udp::{UdpEntry, UdpListenEntry};

/// Identifier of a NAT flow, unique within its network
pub type NatId = u64;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Local and remote endpoint of one side of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tuple {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl Tuple {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self { local, remote }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.local, self.remote)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl FlowKey {
    pub fn new(protocol: Protocol, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            protocol,
            local,
            remote,
        }
    }
}

#[derive(Default)]
pub struct Conntrack {
    tcp_listen: HashMap<SocketAddr, TcpListenEntry>,
    tcp: HashMap<Tuple, TcpEntry>,
    udp_listen: HashMap<SocketAddr, UdpListenEntry>,
    udp: HashMap<Tuple, UdpEntry>,
    tcp_nats: HashMap<NatId, TcpNat>,
    udp_nats: HashMap<NatId, UdpNat>,
    /// Both legs of every NAT flow, keyed the way packets addressed to the leg look them up
    nat_index: HashMap<FlowKey, NatId>,
    next_nat_id: NatId,
}

impl Conntrack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen_tcp(&mut self, local: SocketAddr, readiness: Readiness) -> Result<()> {
        match self.tcp_listen.entry(local) {
            Entry::Occupied(_) => Err(Error::io(
                io::ErrorKind::AddrInUse,
                format!("tcp {} is already listening", local),
            )),
            Entry::Vacant(v) => {
                debug!("tcp listen {}", local);
                v.insert(TcpListenEntry::new(local, readiness));
                Ok(())
            }
        }
    }

    fn tcp_listen_key(&self, local: SocketAddr) -> Option<SocketAddr> {
        if self.tcp_listen.contains_key(&local) {
            return Some(local);
        }
        let wildcard = wildcard_of(local);
        self.tcp_listen.contains_key(&wildcard).then_some(wildcard)
    }

    /// Finds the listener for `local`, falling back to the wildcard address of the same port
    pub fn lookup_tcp_listen(&self, local: SocketAddr) -> Option<&TcpListenEntry> {
        self.tcp_listen.get(&self.tcp_listen_key(local)?)
    }

    pub fn lookup_tcp_listen_mut(&mut self, local: SocketAddr) -> Option<&mut TcpListenEntry> {
        let key = self.tcp_listen_key(local)?;
        self.tcp_listen.get_mut(&key)
    }

    pub fn remove_tcp_listen(&mut self, local: SocketAddr) -> Option<TcpListenEntry> {
        let entry = self.tcp_listen.remove(&local);
        if entry.is_some() {
            debug!("tcp listen {} removed", local);
        }
        entry
    }

    pub fn listen_udp(&mut self, local: SocketAddr, readiness: Readiness) -> Result<()> {
        match self.udp_listen.entry(local) {
            Entry::Occupied(_) => Err(Error::io(
                io::ErrorKind::AddrInUse,
                format!("udp {} is already bound", local),
            )),
            Entry::Vacant(v) => {
                debug!("udp listen {}", local);
                v.insert(UdpListenEntry::new(local, readiness));
                Ok(())
            }
        }
    }

    pub fn lookup_udp_listen(&self, local: SocketAddr) -> Option<&UdpListenEntry> {
        self.udp_listen.get(&local)
    }

    pub fn lookup_udp_listen_mut(&mut self, local: SocketAddr) -> Option<&mut UdpListenEntry> {
        self.udp_listen.get_mut(&local)
    }

    /// Removes a bound address together with the exchanges recorded on it
    pub fn remove_udp_listen(&mut self, local: SocketAddr) -> Option<UdpListenEntry> {
        let entry = self.udp_listen.remove(&local)?;
        self.udp.retain(|t, _| t.local != local);
        debug!("udp listen {} removed", local);
        Some(entry)
    }

    pub fn create_tcp(&mut self, entry: TcpEntry) -> Result<&mut TcpEntry> {
        match self.tcp.entry(entry.tuple()) {
            Entry::Occupied(o) => Err(Error::AlreadyExists(format!("tcp {}", o.key()))),
            Entry::Vacant(v) => {
                debug!("tcp {} created", entry);
                Ok(v.insert(entry))
            }
        }
    }

    pub fn lookup_tcp(&self, tuple: &Tuple) -> Option<&TcpEntry> {
        self.tcp.get(tuple)
    }

    pub fn lookup_tcp_mut(&mut self, tuple: &Tuple) -> Option<&mut TcpEntry> {
        self.tcp.get_mut(tuple)
    }

    pub fn remove_tcp(&mut self, tuple: &Tuple) -> Option<TcpEntry> {
        let entry = self.tcp.remove(tuple)?;
        debug!("tcp {} removed", entry);
        Some(entry)
    }

    pub fn tcp_tuples(&self) -> Vec<Tuple> {
        self.tcp.keys().copied().collect()
    }

    /// Records a datagram exchange, creating the entry or refreshing it
    pub fn record_udp(&mut self, local: SocketAddr, remote: SocketAddr, now_ms: u64) {
        self.udp
            .entry(Tuple::new(local, remote))
            .and_modify(|e| e.last_seen_ms = now_ms)
            .or_insert_with(|| {
                trace!("udp {}<->{} recorded", local, remote);
                UdpEntry {
                    remote,
                    local,
                    last_seen_ms: now_ms,
                }
            });
    }

    pub fn lookup_udp(&self, tuple: &Tuple) -> Option<&UdpEntry> {
        self.udp.get(tuple)
    }

    /// Drops datagram exchanges idle for longer than `timeout_ms`
    pub fn expire_udp(&mut self, now_ms: u64, timeout_ms: u64) -> usize {
        let before = self.udp.len();
        self.udp
            .retain(|_, e| now_ms.saturating_sub(e.last_seen_ms) < timeout_ms);
        before - self.udp.len()
    }

    /// Whether `local` is taken by a listener, a connection or a NAT leg
    pub fn is_tcp_addr_used(&self, local: SocketAddr) -> bool {
        self.tcp_listen.contains_key(&local)
            || self.tcp.keys().any(|t| t.local == local)
            || self
                .nat_index
                .keys()
                .any(|k| k.protocol == Protocol::Tcp && k.local == local)
    }

    pub fn is_udp_addr_used(&self, local: SocketAddr) -> bool {
        self.udp_listen.contains_key(&local)
            || self
                .nat_index
                .keys()
                .any(|k| k.protocol == Protocol::Udp && k.local == local)
    }

    /// Whether packets from `remote` to `local` already belong to a NAT flow
    pub fn is_nat_tracked(&self, protocol: Protocol, local: SocketAddr, remote: SocketAddr) -> bool {
        self.nat_index
            .contains_key(&FlowKey::new(protocol, local, remote))
    }

    fn index_legs(&mut self, protocol: Protocol, id: NatId, leg1: Tuple, leg2: Tuple) -> Result<()> {
        let k1 = FlowKey::new(protocol, leg1.local, leg1.remote);
        let k2 = FlowKey::new(protocol, leg2.local, leg2.remote);
        if self.nat_index.contains_key(&k1) || self.nat_index.contains_key(&k2) {
            return Err(Error::AlreadyExists(format!(
                "{} nat {} => {}",
                protocol, leg1, leg2
            )));
        }
        self.nat_index.insert(k1, id);
        self.nat_index.insert(k2, id);
        Ok(())
    }

    fn alloc_nat_id(&mut self) -> NatId {
        self.next_nat_id += 1;
        self.next_nat_id
    }

    pub fn add_tcp_nat(&mut self, vni: u32, leg1: Tuple, leg2: Tuple) -> Result<&mut TcpNat> {
        let id = self.alloc_nat_id();
        self.index_legs(Protocol::Tcp, id, leg1, leg2)?;
        let nat = TcpNat::new(id, vni, leg1, leg2);
        debug!("{} created", nat);
        Ok(self.tcp_nats.entry(id).or_insert(nat))
    }

    pub fn add_udp_nat(&mut self, vni: u32, leg1: Tuple, leg2: Tuple) -> Result<&mut UdpNat> {
        let id = self.alloc_nat_id();
        self.index_legs(Protocol::Udp, id, leg1, leg2)?;
        let nat = UdpNat::new(id, vni, leg1, leg2);
        debug!("{} created", nat);
        Ok(self.udp_nats.entry(id).or_insert(nat))
    }

    /// Finds the TCP NAT flow a packet from `remote` to `local` belongs to
    pub fn lookup_tcp_nat(&mut self, local: SocketAddr, remote: SocketAddr) -> Option<&mut TcpNat> {
        let id = *self
            .nat_index
            .get(&FlowKey::new(Protocol::Tcp, local, remote))?;
        self.tcp_nats.get_mut(&id)
    }

    pub fn lookup_udp_nat(&mut self, local: SocketAddr, remote: SocketAddr) -> Option<&mut UdpNat> {
        let id = *self
            .nat_index
            .get(&FlowKey::new(Protocol::Udp, local, remote))?;
        self.udp_nats.get_mut(&id)
    }

    pub fn tcp_nats(&self) -> impl Iterator<Item = &TcpNat> {
        self.tcp_nats.values()
    }

    pub fn udp_nats(&self) -> impl Iterator<Item = &UdpNat> {
        self.udp_nats.values()
    }

    /// Destroys a NAT flow and both of its legs. Returns false if it was already gone.
    pub fn remove_nat(&mut self, id: NatId, reactor: &mut dyn Reactor) -> bool {
        let (protocol, leg1, leg2) = if let Some(mut nat) = self.tcp_nats.remove(&id) {
            nat.cancel_timer(reactor);
            debug!("{} removed", nat);
            (Protocol::Tcp, nat.leg1, nat.leg2)
        } else if let Some(mut nat) = self.udp_nats.remove(&id) {
            nat.cancel_timer(reactor);
            debug!("{} removed", nat);
            (Protocol::Udp, nat.leg1, nat.leg2)
        } else {
            return false;
        };
        self.nat_index
            .remove(&FlowKey::new(protocol, leg1.local, leg1.remote));
        self.nat_index
            .remove(&FlowKey::new(protocol, leg2.local, leg2.remote));
        true
    }

    pub fn count_tcp_listen(&self) -> usize {
        self.tcp_listen.len()
    }

    pub fn count_tcp(&self) -> usize {
        self.tcp.len()
    }

    pub fn count_udp_listen(&self) -> usize {
        self.udp_listen.len()
    }

    pub fn count_udp(&self) -> usize {
        self.udp.len()
    }

    pub fn count_tcp_nat(&self) -> usize {
        self.tcp_nats.len()
    }

    pub fn count_udp_nat(&self) -> usize {
        self.udp_nats.len()
    }

    /// Drops every tracked flow, cancelling its timers and waking its adapters
    pub fn destroy(&mut self, reactor: &mut dyn Reactor) {
        for (_, mut entry) in self.tcp.drain() {
            entry.cancel_timers(reactor);
            entry.notify_readable(reactor);
            entry.notify_writable(reactor);
        }
        for (_, entry) in self.tcp_listen.drain() {
            entry.readiness.set_readable(reactor, true);
        }
        for (_, entry) in self.udp_listen.drain() {
            entry.readiness.set_readable(reactor, true);
        }
        for (_, mut nat) in self.tcp_nats.drain() {
            nat.cancel_timer(reactor);
        }
        for (_, mut nat) in self.udp_nats.drain() {
            nat.cancel_timer(reactor);
        }
        self.udp.clear();
        self.nat_index.clear();
        debug!("conntrack destroyed");
    }
}
