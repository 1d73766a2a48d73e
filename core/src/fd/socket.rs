//! Stream adapter over a locally terminated TCP connection

use std::fmt;
use std::io;
use std::net::SocketAddr;

use log::*;

use super::{Read, VirtualFd, check_network, check_open, next_fd_id};
use crate::conntrack::Tuple;
use crate::conntrack::tcp::TcpState;
use crate::error::{Error, Result};
use crate::reactor::Readiness;
use crate::stack::{NetCtx, l4};

pub struct VSwitchSocketFd {
    vni: u32,
    readiness: Readiness,
    key: Option<Tuple>,
    connected: bool,
    /// shutdown_output() was called
    fin: bool,
    closed: bool,
}

impl VSwitchSocketFd {
    /// An unconnected client socket, see [`Self::connect`]
    pub fn new(vni: u32) -> Self {
        Self {
            vni,
            readiness: Readiness::new(next_fd_id()),
            key: None,
            connected: false,
            fin: false,
            closed: false,
        }
    }

    /// Wraps a connection popped from an accept backlog
    pub(crate) fn accepted(vni: u32, key: Tuple, readiness: Readiness) -> Self {
        Self {
            vni,
            readiness,
            key: Some(key),
            connected: true,
            fin: false,
            closed: false,
        }
    }

    fn key(&self) -> Result<Tuple> {
        self.key.ok_or_else(super::not_bound)
    }

    /// Starts an active open; completion is signalled by writability
    pub fn connect(&mut self, ctx: &mut NetCtx<'_>, remote: SocketAddr) -> Result<()> {
        check_open(self.closed)?;
        check_network(self.vni, ctx)?;
        if self.key.is_some() {
            return Err(Error::io(io::ErrorKind::AlreadyExists, "connect() already called"));
        }
        let key = l4::connect(ctx, remote, self.readiness.clone())?;
        debug!("fd {}: connecting {}", self.id(), key);
        self.key = Some(key);
        Ok(())
    }

    /// Whether the handshake started by [`Self::connect`] completed
    pub fn finish_connect(&mut self, ctx: &mut NetCtx<'_>) -> Result<bool> {
        check_open(self.closed)?;
        let key = self.key()?;
        match ctx.net.conntrack.lookup_tcp(&key).map(|e| e.state()) {
            None => Err(Error::io(
                io::ErrorKind::ConnectionRefused,
                format!("connection {} failed", key),
            )),
            Some(TcpState::SynSent) => Ok(false),
            Some(_) => {
                self.connected = true;
                Ok(true)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn local_address(&self) -> Result<SocketAddr> {
        Ok(self.key()?.local)
    }

    pub fn remote_address(&self) -> Result<SocketAddr> {
        Ok(self.key()?.remote)
    }

    /// Copies received data into `buf`
    ///
    /// Once the peer's FIN was received and everything was read, this reports
    /// [`Read::Eof`] on every call, also after the connection itself is gone.
    pub fn read(&mut self, ctx: &mut NetCtx<'_>, buf: &mut [u8]) -> Result<Read> {
        check_open(self.closed)?;
        check_network(self.vni, ctx)?;
        let key = self.key()?;
        if buf.is_empty() {
            return Ok(Read::Bytes(0));
        }
        let Some(entry) = ctx.net.conntrack.lookup_tcp_mut(&key) else {
            return Ok(Read::Eof);
        };
        let n = entry.api_read(buf);
        let remote_closed = entry.state().remote_closed();
        if n == 0 {
            if remote_closed {
                return Ok(Read::Eof);
            }
            self.readiness.set_readable(ctx.reactor, false);
            return Ok(Read::Bytes(0));
        }
        let more = entry.recv.has_more_data_to_read() || remote_closed;
        self.readiness.set_readable(ctx.reactor, more);
        entry.recv.reset_window();
        l4::tcp_ack(ctx, key);
        Ok(Read::Bytes(n))
    }

    /// Queues `buf` for sending, returning how much fit into the send queue
    pub fn write(&mut self, ctx: &mut NetCtx<'_>, buf: &[u8]) -> Result<usize> {
        check_open(self.closed)?;
        check_network(self.vni, ctx)?;
        let key = self.key()?;
        if self.fin {
            return Err(Error::io(io::ErrorKind::BrokenPipe, "output is shut down"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let Some(entry) = ctx.net.conntrack.lookup_tcp_mut(&key) else {
            return Err(Error::io(
                io::ErrorKind::ConnectionReset,
                format!("connection {} is gone", key),
            ));
        };
        let wrote = entry.api_write(buf);
        let space = entry.send.has_more_space();
        self.readiness.set_writable(ctx.reactor, space);
        if wrote > 0 {
            l4::start_transmission(ctx, key);
        }
        Ok(wrote)
    }

    /// Half-closes the connection; queued data is still delivered before the FIN
    pub fn shutdown_output(&mut self, ctx: &mut NetCtx<'_>) -> Result<()> {
        check_open(self.closed)?;
        check_network(self.vni, ctx)?;
        let key = self.key()?;
        if self.fin {
            return Err(Error::io(io::ErrorKind::BrokenPipe, "output is already shut down"));
        }
        let Some(entry) = ctx.net.conntrack.lookup_tcp_mut(&key) else {
            return Err(Error::io(
                io::ErrorKind::NotConnected,
                format!("connection {} is gone", key),
            ));
        };
        self.fin = true;
        let next = match entry.state() {
            TcpState::Established => TcpState::FinWait1,
            TcpState::CloseWait => TcpState::Closing,
            state => {
                error!("tcp {}: shutdown_output() in state {}", key, state);
                return Err(Error::io(
                    io::ErrorKind::NotConnected,
                    format!("cannot shut down output in state {}", state),
                ));
            }
        };
        entry.set_state(next, ctx.reactor);
        l4::start_transmission(ctx, key);
        Ok(())
    }
}

impl VirtualFd for VSwitchSocketFd {
    fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    fn vni(&self) -> u32 {
        self.vni
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    /// Resets the connection, or lets it drain first when data is still queued
    fn close(&mut self, ctx: &mut NetCtx<'_>) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.readiness.set_readable(ctx.reactor, false);
        self.readiness.set_writable(ctx.reactor, false);
        let Some(key) = self.key else {
            return;
        };
        let Some(entry) = ctx.net.conntrack.lookup_tcp_mut(&key) else {
            return;
        };
        entry.readiness = None;
        if entry.send.has_more_data() {
            debug!("fd {}: closed with data pending, draining {}", self.id(), key);
            entry.do_close();
            l4::start_transmission(ctx, key);
        } else {
            l4::reset_connection(ctx, key);
        }
    }
}

impl fmt::Display for VSwitchSocketFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.closed { "CLOSED" } else { "OPEN" };
        match self.key {
            Some(key) => write!(f, "VSwitchSocketFd({})[{}]", key, state),
            None => write!(f, "VSwitchSocketFd(unconnected)[{}]", state),
        }
    }
}
