//! L2/L3/L4 processing of one virtual network
//!
//! Every function here runs inside a [`NetCtx`]: the network being processed,
//! the reactor and an outbox. Frames for the wire and packets crossing into
//! another network are queued in the outbox and resolved by the switch once
//! the current operation returns, so no stage ever needs two networks at once.

pub mod l2;
pub mod l3;
pub mod l4;

use std::collections::VecDeque;
use std::fmt;

use crate::conntrack::nat::NatTimeouts;
use crate::network::VirtualNetwork;
use crate::packet::PacketBuffer;
use crate::reactor::Reactor;

/// A frame received on a port of a virtual network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub vni: u32,
    pub port: u32,
    pub frame: Vec<u8>,
}

/// A frame leaving the switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub vni: u32,
    /// `None` floods the frame to every port of the network
    pub port: Option<u32>,
    /// Port a flooded frame must not be sent back to
    pub exclude: Option<u32>,
    pub frame: Vec<u8>,
}

impl fmt::Display for OutboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(p) => write!(f, "vni={} port={} len={}", self.vni, p, self.frame.len()),
            None => write!(f, "vni={} flood len={}", self.vni, self.frame.len()),
        }
    }
}

#[derive(Debug)]
pub enum Egress {
    Frame(OutboundFrame),
    /// Packet routed into another network, entering its L3 input
    Route { vni: u32, pkb: PacketBuffer },
}

pub type Outbox = VecDeque<Egress>;

pub struct NetCtx<'a> {
    pub net: &'a mut VirtualNetwork,
    pub reactor: &'a mut dyn Reactor,
    pub out: &'a mut Outbox,
    pub timeouts: &'a NatTimeouts,
}

impl NetCtx<'_> {
    pub fn vni(&self) -> u32 {
        self.net.vni
    }

    pub fn now_ms(&self) -> u64 {
        self.reactor.now_ms()
    }

    pub(crate) fn send_frame(&mut self, port: Option<u32>, exclude: Option<u32>, frame: Vec<u8>) {
        self.out.push_back(Egress::Frame(OutboundFrame {
            vni: self.net.vni,
            port,
            exclude,
            frame,
        }));
    }
}
