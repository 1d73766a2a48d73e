//! The switch: every virtual network of one reactor thread

use std::collections::BTreeMap;
use std::net::IpAddr;

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
use log::*;
use smoltcp::wire::EthernetAddress;

use crate::comm::{SwitchCommand, SwitchCommandSender, SwitchHandle};
use crate::config::{IpConfig, NetworkConfig, RouteConfig, SwitchConfig};
use crate::conntrack::Tuple;
use crate::conntrack::nat::NatTimeouts;
use crate::error::{Error, Result};
use crate::nat_rule::NatRule;
use crate::net::Cidr;
use crate::network::VirtualNetwork;
use crate::reactor::{Reactor, TimerEvent, VirtualReactor};
use crate::route::{DEFAULT_RULE, DEFAULT_RULE_V6, RouteRule};
use crate::stack::{Egress, InboundFrame, NetCtx, OutboundFrame, Outbox, l2, l3, l4};

pub struct Switch<R: Reactor> {
    reactor: R,
    networks: BTreeMap<u32, VirtualNetwork>,
    sink: Sender<OutboundFrame>,
    out: Outbox,
    timeouts: NatTimeouts,
    mac_table_timeout_ms: u64,
    arp_table_timeout_ms: u64,
    table_sweep_interval_ms: u64,
    command_recv: Receiver<SwitchCommand<R>>,
    command_sender: SwitchCommandSender<R>,
}

impl<R: Reactor> Switch<R> {
    /// Creates an empty switch using the timeouts of `config`; its networks are ignored
    pub fn new(config: &SwitchConfig, mut reactor: R, sink: Sender<OutboundFrame>) -> Self {
        let (command_sender, command_recv) = crossbeam_channel::unbounded();
        if config.table_sweep_interval_ms > 0 {
            reactor.period(config.table_sweep_interval_ms, TimerEvent::TableSweep);
        }
        Self {
            reactor,
            networks: BTreeMap::new(),
            sink,
            out: Outbox::new(),
            timeouts: config.nat_timeouts(),
            mac_table_timeout_ms: config.mac_table_timeout_ms,
            arp_table_timeout_ms: config.arp_table_timeout_ms,
            table_sweep_interval_ms: config.table_sweep_interval_ms,
            command_recv,
            command_sender,
        }
    }

    /// Creates a switch and provisions every network of `config`, in order
    pub fn from_config(config: &SwitchConfig, reactor: R, sink: Sender<OutboundFrame>) -> anyhow::Result<Self> {
        let mut switch = Self::new(config, reactor, sink);
        for net in &config.networks {
            switch
                .apply_network(net)
                .with_context(|| format!("Cannot provision network {}", net.vni))?;
        }
        Ok(switch)
    }

    fn apply_network(&mut self, c: &NetworkConfig) -> Result<()> {
        let net = self.add_network(c.vni, c.v4, c.v6)?;
        for ip in &c.ips {
            net.add_ip(ip.ip, ip.mac)?;
        }
        for route in &c.routes {
            net.add_route(route.clone().into())?;
        }
        for rule in &c.nat {
            net.add_nat_rule(rule.clone())?;
        }
        Ok(())
    }

    /// Current provisioning as a configuration
    pub fn config(&self) -> SwitchConfig {
        let networks = self
            .networks
            .values()
            .map(|net| NetworkConfig {
                vni: net.vni,
                v4: net.v4_network,
                v6: net.v6_network,
                ips: net.ips.all_ips().map(|(ip, mac)| IpConfig { ip, mac }).collect(),
                routes: net
                    .routes
                    .rules()
                    .into_iter()
                    .filter(|r| r.alias != DEFAULT_RULE && r.alias != DEFAULT_RULE_V6)
                    .map(RouteConfig::from)
                    .collect(),
                nat: net.nat_rules.rules().to_vec(),
            })
            .collect();
        SwitchConfig {
            mac_table_timeout_ms: self.mac_table_timeout_ms,
            arp_table_timeout_ms: self.arp_table_timeout_ms,
            table_sweep_interval_ms: self.table_sweep_interval_ms,
            udp_timeout_ms: self.timeouts.udp_ms,
            tcp_timeouts: self.timeouts.tcp.clone(),
            networks,
        }
    }

    pub fn handle(&self) -> SwitchHandle<R> {
        SwitchHandle::new(self.command_sender.clone())
    }

    pub fn reactor(&self) -> &R {
        &self.reactor
    }

    pub fn reactor_mut(&mut self) -> &mut R {
        &mut self.reactor
    }

    pub fn network(&self, vni: u32) -> Option<&VirtualNetwork> {
        self.networks.get(&vni)
    }

    pub fn networks(&self) -> impl Iterator<Item = &VirtualNetwork> {
        self.networks.values()
    }

    fn network_mut(&mut self, vni: u32) -> Result<&mut VirtualNetwork> {
        self.networks
            .get_mut(&vni)
            .ok_or_else(|| Error::NotFound(format!("vni {}", vni)))
    }

    pub fn add_network(&mut self, vni: u32, v4: Cidr, v6: Option<Cidr>) -> Result<&mut VirtualNetwork> {
        if self.networks.contains_key(&vni) {
            return Err(Error::AlreadyExists(format!("vni {}", vni)));
        }
        let net = VirtualNetwork::new(
            vni,
            v4,
            v6,
            self.mac_table_timeout_ms,
            self.arp_table_timeout_ms,
        )?;
        info!("network {} added: {}{}", vni, v4, v6.map(|n| format!(" {}", n)).unwrap_or_default());
        Ok(self.networks.entry(vni).or_insert(net))
    }

    /// Removes a network, resetting its connections and dropping every tracked flow
    pub fn remove_network(&mut self, vni: u32) -> Result<()> {
        self.with_network(vni, |ctx| {
            l4::reset_all(ctx);
            ctx.net.conntrack.destroy(ctx.reactor);
        })?;
        self.networks.remove(&vni);
        info!("network {} removed", vni);
        Ok(())
    }

    pub fn add_ip(&mut self, vni: u32, ip: IpAddr, mac: EthernetAddress) -> Result<()> {
        self.network_mut(vni)?.add_ip(ip, mac)
    }

    pub fn remove_ip(&mut self, vni: u32, ip: IpAddr) -> Result<()> {
        self.network_mut(vni)?.remove_ip(ip).map(|_| ())
    }

    pub fn add_route(&mut self, vni: u32, rule: RouteRule) -> Result<()> {
        self.network_mut(vni)?.add_route(rule)
    }

    pub fn remove_route(&mut self, vni: u32, alias: &str) -> Result<()> {
        self.network_mut(vni)?.remove_route(alias).map(|_| ())
    }

    pub fn add_nat_rule(&mut self, vni: u32, rule: NatRule) -> Result<()> {
        self.network_mut(vni)?.add_nat_rule(rule)
    }

    pub fn remove_nat_rule(&mut self, vni: u32, alias: &str) -> Result<()> {
        self.network_mut(vni)?.remove_nat_rule(alias).map(|_| ())
    }

    /// Applies to every network; existing entries keep their expiry
    pub fn set_mac_table_timeout(&mut self, ms: u64) {
        self.mac_table_timeout_ms = ms;
        for net in self.networks.values_mut() {
            net.mac_table.set_timeout(ms);
        }
    }

    pub fn set_arp_table_timeout(&mut self, ms: u64) {
        self.arp_table_timeout_ms = ms;
        for net in self.networks.values_mut() {
            net.arp_table.set_timeout(ms);
        }
    }

    /// Runs `f` against the stack of network `vni`, then sends whatever it produced
    pub fn with_network<T>(&mut self, vni: u32, f: impl FnOnce(&mut NetCtx<'_>) -> T) -> Result<T> {
        let Some(net) = self.networks.get_mut(&vni) else {
            return Err(Error::NotFound(format!("vni {}", vni)));
        };
        let mut ctx = NetCtx {
            net,
            reactor: &mut self.reactor,
            out: &mut self.out,
            timeouts: &self.timeouts,
        };
        let ret = f(&mut ctx);
        self.flush();
        Ok(ret)
    }

    /// Processes one frame from the packet source; undecodable frames are dropped
    pub fn input(&mut self, frame: InboundFrame) {
        let InboundFrame { vni, port, frame } = frame;
        let res = self.with_network(vni, |ctx| l2::input(ctx, port, frame));
        match res {
            Err(_) => trace!("vni {}: unknown network, frame from port {} dropped", vni, port),
            Ok(Err(e)) => debug!("vni {}: frame from port {} dropped: {}", vni, port, e),
            Ok(Ok(())) => {}
        }
    }

    /// Dispatches a timer the reactor handed back
    pub fn fire(&mut self, event: TimerEvent) {
        let res = match event {
            TimerEvent::NatIdle { vni, id } => self.with_network(vni, |ctx| {
                if ctx.net.conntrack.remove_nat(id, ctx.reactor) {
                    debug!("vni {}: nat {} idle, removed", ctx.vni(), id);
                }
            }),
            TimerEvent::TcpRetransmit {
                vni,
                local,
                remote,
                begin_seq,
                count,
            } => self.with_network(vni, |ctx| {
                l4::on_retransmit_timer(ctx, Tuple::new(local, remote), begin_seq, count + 1)
            }),
            TimerEvent::TcpDelayedAck { vni, local, remote } => self.with_network(vni, |ctx| {
                l4::on_delayed_ack_timer(ctx, Tuple::new(local, remote))
            }),
            TimerEvent::TableSweep => {
                self.sweep();
                Ok(())
            }
        };
        if let Err(e) = res {
            trace!("timer {:?} for a removed network: {}", event, e);
        }
    }

    fn sweep(&mut self) {
        let now = self.reactor.now_ms();
        for net in self.networks.values_mut() {
            net.sweep(now, self.timeouts.udp_ms);
        }
    }

    /// Sends queued frames and delivers packets routed into other networks
    fn flush(&mut self) {
        while let Some(egress) = self.out.pop_front() {
            match egress {
                Egress::Frame(frame) => {
                    trace!("out: {}", frame);
                    if self.sink.send(frame).is_err() {
                        warn!("packet sink is disconnected, frame dropped");
                    }
                }
                Egress::Route { vni, pkb } => {
                    let Some(net) = self.networks.get_mut(&vni) else {
                        debug!("route into missing vni {}, {} dropped", vni, pkb);
                        continue;
                    };
                    let mut ctx = NetCtx {
                        net,
                        reactor: &mut self.reactor,
                        out: &mut self.out,
                        timeouts: &self.timeouts,
                    };
                    l3::input(&mut ctx, pkb);
                }
            }
        }
    }

    /// Applies every queued [`SwitchCommand`]. Returns how many were processed.
    pub fn process_commands(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(cmd) = self.command_recv.try_recv() {
            processed += 1;
            let res = match cmd {
                SwitchCommand::AddNetwork { vni, v4, v6 } => self.add_network(vni, v4, v6).map(|_| ()),
                SwitchCommand::RemoveNetwork(vni) => self.remove_network(vni),
                SwitchCommand::AddIp { vni, ip, mac } => self.add_ip(vni, ip, mac),
                SwitchCommand::RemoveIp { vni, ip } => self.remove_ip(vni, ip),
                SwitchCommand::AddRoute { vni, rule } => self.add_route(vni, rule),
                SwitchCommand::RemoveRoute { vni, alias } => self.remove_route(vni, &alias),
                SwitchCommand::AddNatRule { vni, rule } => self.add_nat_rule(vni, rule),
                SwitchCommand::RemoveNatRule { vni, alias } => self.remove_nat_rule(vni, &alias),
                SwitchCommand::SetMacTableTimeout(ms) => {
                    self.set_mac_table_timeout(ms);
                    Ok(())
                }
                SwitchCommand::SetArpTableTimeout(ms) => {
                    self.set_arp_table_timeout(ms);
                    Ok(())
                }
                SwitchCommand::Input(frame) => {
                    self.input(frame);
                    Ok(())
                }
                SwitchCommand::RunOnLoop(f) => {
                    f(self);
                    Ok(())
                }
            };
            if let Err(e) = res {
                warn!("switch command failed: {}", e);
            }
        }
        processed
    }
}

impl Switch<VirtualReactor> {
    /// Moves the virtual clock forward by `ms`, firing every timer that falls due
    pub fn advance(&mut self, ms: u64) {
        let until = self.reactor.now_ms() + ms;
        while let Some(event) = self.reactor.pop_due(until) {
            self.fire(event);
        }
        self.reactor.set_now(until);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ArpMessage, Frame, FramePayload, build_arp_frame};
    use std::net::Ipv4Addr;

    const SYN_MAC: EthernetAddress = EthernetAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    const CLIENT_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x05]);

    fn switch() -> (Switch<VirtualReactor>, Receiver<OutboundFrame>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut sw = Switch::new(&SwitchConfig::default(), VirtualReactor::new(), tx);
        sw.add_network(1, "10.0.0.0/24".parse().unwrap(), None).unwrap();
        sw.add_ip(1, "10.0.0.1".parse().unwrap(), SYN_MAC).unwrap();
        (sw, rx)
    }

    fn arp_request() -> Vec<u8> {
        build_arp_frame(&ArpMessage {
            request: true,
            sender_mac: CLIENT_MAC,
            sender_ip: Ipv4Addr::new(10, 0, 0, 5),
            target_mac: EthernetAddress([0; 6]),
            target_ip: Ipv4Addr::new(10, 0, 0, 1),
        })
    }

    #[test]
    fn test_network_management() {
        let (mut sw, _rx) = switch();
        assert!(matches!(
            sw.add_network(1, "10.1.0.0/24".parse().unwrap(), None),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            sw.add_network(2, "fd00::/64".parse().unwrap(), None),
            Err(Error::Validation(_))
        ));
        assert!(matches!(sw.remove_network(9), Err(Error::NotFound(_))));
        assert!(matches!(
            sw.add_ip(9, "10.0.0.2".parse().unwrap(), SYN_MAC),
            Err(Error::NotFound(_))
        ));
        sw.remove_network(1).unwrap();
        assert_eq!(sw.networks().count(), 0);
    }

    #[test]
    fn test_arp_through_switch() {
        let (mut sw, rx) = switch();
        sw.input(InboundFrame {
            vni: 1,
            port: 7,
            frame: arp_request(),
        });
        let out = rx.try_recv().unwrap();
        assert_eq!(out.port, Some(7));
        let frame = Frame::parse(&out.frame).unwrap();
        let FramePayload::Arp(reply) = frame.payload else {
            panic!("not arp");
        };
        assert!(!reply.request);
        assert_eq!(reply.sender_mac, SYN_MAC);

        // garbage and unknown networks are dropped silently
        sw.input(InboundFrame { vni: 1, port: 7, frame: vec![1, 2, 3] });
        sw.input(InboundFrame { vni: 5, port: 7, frame: arp_request() });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_commands_from_another_thread() {
        let (mut sw, rx) = switch();
        let handle = sw.handle();
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        std::thread::spawn(move || {
            handle
                .send(SwitchCommand::AddNetwork {
                    vni: 2,
                    v4: "10.2.0.0/24".parse().unwrap(),
                    v6: None,
                })
                .unwrap();
            handle
                .input(InboundFrame { vni: 1, port: 3, frame: arp_request() })
                .unwrap();
            handle
                .run_on_loop(move |sw| {
                    done_tx.send(sw.networks().count()).unwrap();
                })
                .unwrap();
        })
        .join()
        .unwrap();

        assert_eq!(sw.process_commands(), 3);
        assert_eq!(done_rx.try_recv().unwrap(), 2);
        assert!(rx.try_recv().is_ok());
        assert_eq!(sw.process_commands(), 0);
    }

    #[test]
    fn test_table_sweep_timer() {
        let (mut sw, _rx) = switch();
        sw.set_mac_table_timeout(1000);
        sw.input(InboundFrame { vni: 1, port: 3, frame: arp_request() });
        assert_eq!(sw.network(1).unwrap().mac_table.len(), 1);
        sw.advance(SwitchConfig::default().table_sweep_interval_ms);
        assert!(sw.network(1).unwrap().mac_table.is_empty());
        assert_eq!(sw.reactor().now_ms(), SwitchConfig::default().table_sweep_interval_ms);
    }

    #[test]
    fn test_config_snapshot() {
        let (sw, _rx) = switch();
        let c = sw.config();
        assert_eq!(c.networks.len(), 1);
        assert!(c.networks[0].routes.is_empty());
        assert_eq!(c.networks[0].ips[0].mac, SYN_MAC);

        let (tx, _rx) = crossbeam_channel::unbounded();
        let again = Switch::from_config(&c, VirtualReactor::new(), tx).unwrap();
        assert_eq!(again.config(), c);
    }
}
