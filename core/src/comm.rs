//! Commands into a switch from other threads

use std::io;
use std::net::IpAddr;

use smoltcp::wire::EthernetAddress;

use crate::error::{Error, Result};
use crate::nat_rule::NatRule;
use crate::net::Cidr;
use crate::reactor::Reactor;
use crate::route::RouteRule;
use crate::stack::InboundFrame;
use crate::switch::Switch;

pub type SwitchCommandSender<R> = crossbeam_channel::Sender<SwitchCommand<R>>;

/// Closure executed on the thread owning the switch
pub type RunOnLoop<R> = Box<dyn FnOnce(&mut Switch<R>) + Send>;

/// A command that can be sent to the switch
///
/// Failures of operator commands are logged by the switch; use
/// [`SwitchCommand::RunOnLoop`] when the caller needs the result.
pub enum SwitchCommand<R: Reactor> {
    AddNetwork {
        vni: u32,
        v4: Cidr,
        v6: Option<Cidr>,
    },
    RemoveNetwork(u32),
    AddIp {
        vni: u32,
        ip: IpAddr,
        mac: EthernetAddress,
    },
    RemoveIp {
        vni: u32,
        ip: IpAddr,
    },
    AddRoute {
        vni: u32,
        rule: RouteRule,
    },
    RemoveRoute {
        vni: u32,
        alias: String,
    },
    AddNatRule {
        vni: u32,
        rule: NatRule,
    },
    RemoveNatRule {
        vni: u32,
        alias: String,
    },
    SetMacTableTimeout(u64),
    SetArpTableTimeout(u64),
    Input(InboundFrame),
    RunOnLoop(RunOnLoop<R>),
}

/// Thread-safe handle to a [`Switch`]
pub struct SwitchHandle<R: Reactor> {
    sender: SwitchCommandSender<R>,
}

impl<R: Reactor> Clone for SwitchHandle<R> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<R: Reactor> SwitchHandle<R> {
    pub(crate) fn new(sender: SwitchCommandSender<R>) -> Self {
        Self { sender }
    }

    /// Queues a command; it is applied by the next [`Switch::process_commands`]
    pub fn send(&self, cmd: SwitchCommand<R>) -> Result<()> {
        self.sender
            .send(cmd)
            .map_err(|_| Error::io(io::ErrorKind::BrokenPipe, "switch is gone"))
    }

    pub fn input(&self, frame: InboundFrame) -> Result<()> {
        self.send(SwitchCommand::Input(frame))
    }

    pub fn run_on_loop(&self, f: impl FnOnce(&mut Switch<R>) + Send + 'static) -> Result<()> {
        self.send(SwitchCommand::RunOnLoop(Box::new(f)))
    }
}
