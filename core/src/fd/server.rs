//! Listening adapter handing out established connections

use std::fmt;
use std::net::SocketAddr;

use log::*;

use super::{VSwitchSocketFd, VirtualFd, already_bound, check_network, check_open, next_fd_id, not_bound};
use crate::error::{Error, Result};
use crate::reactor::Readiness;
use crate::stack::{NetCtx, l4};

pub struct VSwitchServerSocketFd {
    vni: u32,
    readiness: Readiness,
    local: Option<SocketAddr>,
    closed: bool,
}

impl VSwitchServerSocketFd {
    pub fn new(vni: u32) -> Self {
        Self {
            vni,
            readiness: Readiness::new(next_fd_id()),
            local: None,
            closed: false,
        }
    }

    pub fn bind(&mut self, ctx: &mut NetCtx<'_>, addr: SocketAddr) -> Result<()> {
        check_open(self.closed)?;
        check_network(self.vni, ctx)?;
        if self.local.is_some() {
            return Err(already_bound());
        }
        ctx.net.conntrack.listen_tcp(addr, self.readiness.clone())?;
        self.local = Some(addr);
        Ok(())
    }

    /// Pops the oldest established connection, `None` when the backlog is empty
    pub fn accept(&mut self, ctx: &mut NetCtx<'_>) -> Result<Option<VSwitchSocketFd>> {
        check_open(self.closed)?;
        check_network(self.vni, ctx)?;
        let local = self.local.ok_or_else(not_bound)?;
        let Some(listen) = ctx.net.conntrack.lookup_tcp_listen_mut(local) else {
            return Err(Error::NotFound(format!("tcp listen {}", local)));
        };
        let key = listen.backlog.pop_front();
        if listen.backlog.is_empty() {
            listen.readiness.set_readable(ctx.reactor, false);
        }
        let Some(key) = key else {
            return Ok(None);
        };
        let Some(entry) = ctx.net.conntrack.lookup_tcp_mut(&key) else {
            warn!("tcp listen {}: backlog entry {} has no connection", local, key);
            return Ok(None);
        };

        let readiness = Readiness::new(next_fd_id());
        let readable = entry.recv.has_more_data_to_read() || entry.state().remote_closed();
        readiness.set_readable(ctx.reactor, readable);
        readiness.set_writable(ctx.reactor, true);
        entry.parent = None;
        entry.readiness = Some(readiness.clone());
        debug!("tcp listen {}: accepted {}", local, key);
        Ok(Some(VSwitchSocketFd::accepted(self.vni, key, readiness)))
    }

    pub fn local_address(&self) -> Result<SocketAddr> {
        self.local.ok_or_else(not_bound)
    }
}

impl VirtualFd for VSwitchServerSocketFd {
    fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    fn vni(&self) -> u32 {
        self.vni
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    /// Resets every connection not yet accepted and stops listening
    fn close(&mut self, ctx: &mut NetCtx<'_>) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.readiness.set_readable(ctx.reactor, false);
        let Some(local) = self.local else {
            return;
        };
        let Some(listen) = ctx.net.conntrack.remove_tcp_listen(local) else {
            return;
        };
        for key in listen.syn_backlog.into_iter().chain(listen.backlog) {
            l4::reset_connection(ctx, key);
        }
    }
}

impl fmt::Display for VSwitchServerSocketFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.closed { "CLOSED" } else { "OPEN" };
        match self.local {
            Some(local) => write!(f, "VSwitchServerSocketFd({})[{}]", local, state),
            None => write!(f, "VSwitchServerSocketFd(unbound)[{}]", state),
        }
    }
}
