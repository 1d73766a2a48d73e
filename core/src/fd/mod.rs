//! Socket-like adapters over flows terminated by the switch
//!
//! An adapter never owns its conntrack entry. It keeps the entry key and a
//! [`Readiness`] shared with the entry, and every operation runs inside the
//! [`NetCtx`] of the network it was created in, see
//! [`crate::switch::Switch::with_network`].

pub mod datagram;
pub mod server;
pub mod socket;

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::reactor::{FdId, Reactor, Readiness};
use crate::stack::NetCtx;

pub use datagram::VSwitchDatagramFd;
pub use server::VSwitchServerSocketFd;
pub use socket::VSwitchSocketFd;

static NEXT_FD_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_fd_id() -> FdId {
    NEXT_FD_ID.fetch_add(1, Ordering::Relaxed)
}

/// Outcome of a stream read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Read {
    /// Bytes copied into the buffer; 0 when nothing is pending
    Bytes(usize),
    /// The peer finished sending and everything was read
    Eof,
}

/// Common surface of the adapters, as seen by an event loop
pub trait VirtualFd {
    fn readiness(&self) -> &Readiness;

    /// VNI of the network the adapter operates in
    fn vni(&self) -> u32;

    fn is_closed(&self) -> bool;

    fn close(&mut self, ctx: &mut NetCtx<'_>);

    fn id(&self) -> FdId {
        self.readiness().fd()
    }

    fn is_readable(&self) -> bool {
        self.readiness().is_readable()
    }

    fn is_writable(&self) -> bool {
        self.readiness().is_writable()
    }

    /// The fd was added to the reactor; pending readiness is announced right away
    fn on_register(&self, reactor: &mut dyn Reactor) {
        self.readiness().attach(reactor);
    }

    fn on_remove(&self, reactor: &mut dyn Reactor) {
        self.readiness().detach(reactor);
    }
}

fn check_open(closed: bool) -> Result<()> {
    if closed {
        return Err(Error::io(io::ErrorKind::NotConnected, "fd is closed"));
    }
    Ok(())
}

fn check_network(vni: u32, ctx: &NetCtx<'_>) -> Result<()> {
    if ctx.vni() != vni {
        return Err(Error::Validation(format!(
            "fd belongs to vni {}, not {}",
            vni,
            ctx.vni()
        )));
    }
    Ok(())
}

fn not_bound() -> Error {
    Error::io(io::ErrorKind::NotConnected, "bind() not called")
}

fn already_bound() -> Error {
    Error::io(io::ErrorKind::InvalidInput, "already bound")
}
