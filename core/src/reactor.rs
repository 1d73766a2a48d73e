//! Event loop seam
//!
//! The switch never blocks and never spawns threads. Everything that has to
//! happen later is a [`TimerEvent`] handed to the reactor, which gives it back
//! through [`crate::switch::Switch::fire`] on the owning thread.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::rc::Rc;

use crate::conntrack::NatId;

/// Identifier of a virtual file descriptor registered with the reactor
pub type FdId = u64;

/// Identifier of a scheduled timer
pub type TimerId = u64;

/// Work the switch asked to be reminded of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// NAT entry idle timeout
    NatIdle { vni: u32, id: NatId },
    /// Retransmission timer of a locally terminated TCP connection
    TcpRetransmit {
        vni: u32,
        local: SocketAddr,
        remote: SocketAddr,
        begin_seq: u32,
        count: u32,
    },
    /// Delayed ACK of a locally terminated TCP connection
    TcpDelayedAck {
        vni: u32,
        local: SocketAddr,
        remote: SocketAddr,
    },
    /// Periodic MAC/ARP table expiry
    TableSweep,
}

pub trait Reactor {
    /// Monotonic milliseconds
    fn now_ms(&self) -> u64;

    fn register_readable(&mut self, fd: FdId);
    fn cancel_readable(&mut self, fd: FdId);
    fn register_writable(&mut self, fd: FdId);
    fn cancel_writable(&mut self, fd: FdId);

    /// Fires `event` once after `ms` milliseconds
    fn delay(&mut self, ms: u64, event: TimerEvent) -> TimerId;
    /// Fires `event` every `ms` milliseconds until cancelled
    fn period(&mut self, ms: u64, event: TimerEvent) -> TimerId;
    fn cancel_timer(&mut self, id: TimerId);
}

#[derive(Debug)]
struct ReadinessState {
    fd: FdId,
    readable: Cell<bool>,
    writable: Cell<bool>,
    registered: Cell<bool>,
}

/// Readable/writable flags of a virtual fd, mirrored into the reactor while registered
///
/// Shared between the socket adapter and the conntrack entry backing it, so the
/// stack can wake the adapter without holding a reference to it.
#[derive(Debug, Clone)]
pub struct Readiness(Rc<ReadinessState>);

impl Readiness {
    pub fn new(fd: FdId) -> Self {
        Self(Rc::new(ReadinessState {
            fd,
            readable: Cell::new(false),
            writable: Cell::new(false),
            registered: Cell::new(false),
        }))
    }

    pub fn fd(&self) -> FdId {
        self.0.fd
    }

    pub fn is_readable(&self) -> bool {
        self.0.readable.get()
    }

    pub fn is_writable(&self) -> bool {
        self.0.writable.get()
    }

    pub fn is_registered(&self) -> bool {
        self.0.registered.get()
    }

    pub fn set_readable(&self, reactor: &mut dyn Reactor, readable: bool) {
        if self.0.readable.replace(readable) == readable || !self.is_registered() {
            return;
        }
        if readable {
            reactor.register_readable(self.0.fd);
        } else {
            reactor.cancel_readable(self.0.fd);
        }
    }

    pub fn set_writable(&self, reactor: &mut dyn Reactor, writable: bool) {
        if self.0.writable.replace(writable) == writable || !self.is_registered() {
            return;
        }
        if writable {
            reactor.register_writable(self.0.fd);
        } else {
            reactor.cancel_writable(self.0.fd);
        }
    }

    /// Starts mirroring the current flags into the reactor
    pub fn attach(&self, reactor: &mut dyn Reactor) {
        self.0.registered.set(true);
        if self.is_readable() {
            reactor.register_readable(self.0.fd);
        }
        if self.is_writable() {
            reactor.register_writable(self.0.fd);
        }
    }

    pub fn detach(&self, reactor: &mut dyn Reactor) {
        self.0.registered.set(false);
        reactor.cancel_readable(self.0.fd);
        reactor.cancel_writable(self.0.fd);
    }
}

struct Scheduled {
    deadline: u64,
    period: Option<u64>,
}

/// Deterministic in-memory reactor driven by an explicit clock
#[derive(Default)]
pub struct VirtualReactor {
    now_ms: u64,
    next_timer: TimerId,
    queue: BTreeMap<(u64, TimerId), TimerEvent>,
    timers: HashMap<TimerId, Scheduled>,
    readable: BTreeSet<FdId>,
    writable: BTreeSet<FdId>,
}

impl VirtualReactor {
    pub fn new() -> Self {
        Self::default()
    }

    fn schedule(&mut self, ms: u64, period: Option<u64>, event: TimerEvent) -> TimerId {
        self.next_timer += 1;
        let id = self.next_timer;
        let deadline = self.now_ms + ms;
        self.queue.insert((deadline, id), event);
        self.timers.insert(id, Scheduled { deadline, period });
        id
    }

    /// Pops the earliest timer due at or before `until_ms`, moving the clock to its deadline
    pub fn pop_due(&mut self, until_ms: u64) -> Option<TimerEvent> {
        let (&(deadline, id), _) = self.queue.first_key_value()?;
        if deadline > until_ms {
            return None;
        }
        let event = self.queue.remove(&(deadline, id))?;
        self.now_ms = self.now_ms.max(deadline);

        let period = self.timers.get(&id).and_then(|s| s.period);
        match period {
            Some(p) => {
                let next = deadline + p.max(1);
                self.queue.insert((next, id), event);
                if let Some(s) = self.timers.get_mut(&id) {
                    s.deadline = next;
                }
            }
            None => {
                self.timers.remove(&id);
            }
        }
        Some(event)
    }

    /// Moves the clock forward without firing anything
    pub fn set_now(&mut self, now_ms: u64) {
        self.now_ms = self.now_ms.max(now_ms);
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.keys().next().map(|(d, _)| *d)
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn is_readable_registered(&self, fd: FdId) -> bool {
        self.readable.contains(&fd)
    }

    pub fn is_writable_registered(&self, fd: FdId) -> bool {
        self.writable.contains(&fd)
    }
}

impl Reactor for VirtualReactor {
    fn now_ms(&self) -> u64 {
        self.now_ms
    }

    fn register_readable(&mut self, fd: FdId) {
        self.readable.insert(fd);
    }

    fn cancel_readable(&mut self, fd: FdId) {
        self.readable.remove(&fd);
    }

    fn register_writable(&mut self, fd: FdId) {
        self.writable.insert(fd);
    }

    fn cancel_writable(&mut self, fd: FdId) {
        self.writable.remove(&fd);
    }

    fn delay(&mut self, ms: u64, event: TimerEvent) -> TimerId {
        self.schedule(ms, None, event)
    }

    fn period(&mut self, ms: u64, event: TimerEvent) -> TimerId {
        self.schedule(ms, Some(ms), event)
    }

    fn cancel_timer(&mut self, id: TimerId) {
        if let Some(s) = self.timers.remove(&id) {
            self.queue.remove(&(s.deadline, id));
        }
    }
}
