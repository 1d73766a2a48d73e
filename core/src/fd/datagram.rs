//! UDP adapter bound to a synthetic address

use std::fmt;
use std::io;
use std::net::SocketAddr;

use log::*;

use super::{VirtualFd, already_bound, check_network, check_open, next_fd_id, not_bound};
use crate::conntrack::udp::Datagram;
use crate::error::{Error, Result};
use crate::reactor::Readiness;
use crate::stack::{NetCtx, l4};

pub struct VSwitchDatagramFd {
    vni: u32,
    readiness: Readiness,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    closed: bool,
}

impl VSwitchDatagramFd {
    pub fn new(vni: u32) -> Self {
        Self {
            vni,
            readiness: Readiness::new(next_fd_id()),
            local: None,
            peer: None,
            closed: false,
        }
    }

    pub fn bind(&mut self, ctx: &mut NetCtx<'_>, addr: SocketAddr) -> Result<()> {
        check_open(self.closed)?;
        check_network(self.vni, ctx)?;
        if addr.ip().is_unspecified() {
            return Err(Error::io(
                io::ErrorKind::InvalidInput,
                "cannot bind to the any-address, a synthetic ip is required",
            ));
        }
        if self.local.is_some() {
            return Err(already_bound());
        }
        ctx.net.conntrack.listen_udp(addr, self.readiness.clone())?;
        self.readiness.set_writable(ctx.reactor, true);
        self.local = Some(addr);
        Ok(())
    }

    /// Restricts receiving to `remote`, binding to a free ephemeral address first if needed
    pub fn connect(&mut self, ctx: &mut NetCtx<'_>, remote: SocketAddr) -> Result<()> {
        check_open(self.closed)?;
        check_network(self.vni, ctx)?;
        let local = match self.local {
            Some(local) => local,
            None => {
                let Some(local) = ctx.net.find_free_udp_port(remote.is_ipv4()) else {
                    return Err(Error::io(
                        io::ErrorKind::AddrNotAvailable,
                        format!("no local address to reach {} from", remote),
                    ));
                };
                self.bind(ctx, local)?;
                local
            }
        };
        let listen = ctx
            .net
            .conntrack
            .lookup_udp_listen_mut(local)
            .ok_or_else(|| Error::NotFound(format!("udp listen {}", local)))?;
        listen.peer = Some(remote);
        self.peer = Some(remote);
        debug!("udp {}: connected to {}", local, remote);
        Ok(())
    }

    /// Queues one datagram for `remote` and flushes the queue
    pub fn send(&mut self, ctx: &mut NetCtx<'_>, buf: &[u8], remote: SocketAddr) -> Result<usize> {
        check_open(self.closed)?;
        check_network(self.vni, ctx)?;
        let local = self.local.ok_or_else(not_bound)?;
        let listen = ctx
            .net
            .conntrack
            .lookup_udp_listen_mut(local)
            .ok_or_else(|| Error::NotFound(format!("udp listen {}", local)))?;
        listen.sending.push_back(Datagram {
            remote,
            data: buf.to_vec(),
        });
        l4::send_udp(ctx, local);
        Ok(buf.len())
    }

    /// Pops the oldest datagram into `buf`
    ///
    /// A datagram larger than `buf` is consumed and dropped, returning `None`
    /// just like an empty queue.
    pub fn receive(&mut self, ctx: &mut NetCtx<'_>, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        check_open(self.closed)?;
        check_network(self.vni, ctx)?;
        let local = self.local.ok_or_else(not_bound)?;
        let listen = ctx
            .net
            .conntrack
            .lookup_udp_listen_mut(local)
            .ok_or_else(|| Error::NotFound(format!("udp listen {}", local)))?;
        let d = listen.receiving.pop_front();
        let more = !listen.receiving.is_empty();
        self.readiness.set_readable(ctx.reactor, more);

        let Some(d) = d else {
            return Ok(None);
        };
        if d.data.len() > buf.len() {
            trace!(
                "udp {}: {} byte datagram from {} does not fit into {} bytes, dropped",
                local,
                d.data.len(),
                d.remote,
                buf.len()
            );
            return Ok(None);
        }
        buf[..d.data.len()].copy_from_slice(&d.data);
        Ok(Some((d.data.len(), d.remote)))
    }

    pub fn local_address(&self) -> Result<SocketAddr> {
        self.local.ok_or_else(not_bound)
    }

    pub fn connected_peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl VirtualFd for VSwitchDatagramFd {
    fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    fn vni(&self) -> u32 {
        self.vni
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self, ctx: &mut NetCtx<'_>) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.readiness.set_readable(ctx.reactor, false);
        self.readiness.set_writable(ctx.reactor, false);
        if let Some(local) = self.local {
            ctx.net.conntrack.remove_udp_listen(local);
        }
    }
}

impl fmt::Display for VSwitchDatagramFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.closed { "CLOSED" } else { "OPEN" };
        match (self.local, self.peer) {
            (Some(l), Some(p)) => write!(f, "VSwitchDatagramFd({}->{})[{}]", l, p, state),
            (Some(l), None) => write!(f, "VSwitchDatagramFd({})[{}]", l, state),
            _ => write!(f, "VSwitchDatagramFd(unbound)[{}]", state),
        }
    }
}
