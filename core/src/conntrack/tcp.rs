//! Locally terminated TCP connections

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;

use log::*;
use rand::Rng;
use strum::{Display, EnumIter};

use super::Tuple;
use crate::reactor::{Readiness, Reactor, TimerId};

/// Send buffer capacity
pub const WMEM_MAX: usize = 212992;
/// Receive buffer capacity
pub const RMEM_MAX: usize = 212992;
/// MSS assumed when the peer does not announce one
pub const SND_DEFAULT_MSS: usize = 1360;
/// MSS announced to peers
pub const RCV_MSS: u16 = 1360;
pub const RTO_MIN_MS: u64 = 200;
pub const RTO_MAX_MS: u64 = 120_000;
pub const DELAYED_ACK_TIMEOUT_MS: u64 = 20;
/// The usable peer window is clamped to this many segments
pub const MAX_REMOTE_WINDOW_MSS_DUP: usize = 45;
pub const MAX_RETRANSMISSION_AFTER_CLOSING: u32 = 7;
/// Window scale shift announced to peers that support scaling
pub const RCV_WINDOW_SHIFT: u8 = 6;
pub const MAX_SYN_BACKLOG_SIZE: usize = 128;

const TCP_SEQ_INIT_MIN: u64 = (i32::MAX / 3) as u64;
const TCP_SEQ_RAND: u64 = (i32::MAX / 2) as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TcpState {
    Closed,
    SynSent,
    SynReceived,
    Established,
    #[strum(to_string = "FIN_WAIT_1")]
    FinWait1,
    #[strum(to_string = "FIN_WAIT_2")]
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// The peer will not send more data
    pub fn remote_closed(self) -> bool {
        matches!(
            self,
            Self::CloseWait | Self::Closing | Self::LastAck | Self::TimeWait | Self::Closed
        )
    }

    /// We will not send more data
    pub fn fin_sent(self) -> bool {
        matches!(
            self,
            Self::FinWait1
                | Self::FinWait2
                | Self::Closing
                | Self::LastAck
                | Self::TimeWait
                | Self::Closed
        )
    }
}

/// Maps a 32-bit wire sequence number to the 64-bit counter closest to `reference`
pub fn unwrap_seq(reference: u64, wire: u32) -> u64 {
    let delta = i64::from(wire.wrapping_sub(reference as u32) as i32);
    (reference as i64 + delta).max(0) as u64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub seq: u64,
    pub data: Vec<u8>,
}

impl Segment {
    pub fn end(&self) -> u64 {
        self.seq + self.data.len() as u64
    }
}

#[derive(Debug)]
pub struct SendingQueue {
    queue: VecDeque<Segment>,
    size: usize,
    /// Sequence number assigned to the next byte written
    latest_seq: u64,
    /// Oldest unacknowledged sequence number
    ack_seq: u64,
    /// End of the data handed to the wire so far
    fetch_seq: u64,
    window: usize,
    mss: usize,
    window_scale: usize,
    fin_acked: bool,
}

impl SendingQueue {
    fn new(seq: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            size: 0,
            latest_seq: seq,
            ack_seq: seq,
            fetch_seq: seq,
            window: 0,
            mss: SND_DEFAULT_MSS,
            window_scale: 1,
            fin_acked: false,
        }
    }

    /// Applies the parameters announced in the peer's SYN
    pub fn init(&mut self, window: u16, mss: usize, window_scale: usize) {
        self.mss = mss.max(1);
        self.window = (MAX_REMOTE_WINDOW_MSS_DUP * self.mss).min(usize::from(window));
        self.window_scale = window_scale.max(1);
    }

    /// Accounts for the sequence number consumed by a SYN
    pub fn inc_all_seq(&mut self) {
        self.latest_seq += 1;
        self.ack_seq += 1;
        self.fetch_seq += 1;
    }

    pub fn dec_all_seq(&mut self) {
        self.latest_seq -= 1;
        self.ack_seq -= 1;
        self.fetch_seq -= 1;
    }

    pub fn has_more_space(&self) -> bool {
        self.size < WMEM_MAX
    }

    pub fn has_more_data(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn latest_seq(&self) -> u64 {
        self.latest_seq
    }

    pub fn ack_seq(&self) -> u64 {
        self.ack_seq
    }

    pub fn fetch_seq(&self) -> u64 {
        self.fetch_seq
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    pub fn fin_acked(&self) -> bool {
        self.fin_acked
    }

    fn write(&mut self, mut buf: &[u8]) -> usize {
        let mut total = 0;
        while !buf.is_empty() {
            let len = buf.len().min(self.mss).min(WMEM_MAX - self.size);
            if len == 0 {
                break;
            }
            let (chunk, rest) = buf.split_at(len);
            self.queue.push_back(Segment {
                seq: self.latest_seq,
                data: chunk.to_vec(),
            });
            self.latest_seq += len as u64;
            self.size += len;
            total += len;
            buf = rest;
        }
        total
    }

    /// Segments within the peer window, starting at the oldest unacknowledged byte
    pub fn fetch(&mut self) -> Vec<Segment> {
        let mut ret = vec![];
        let mut offset = 0;
        while offset < self.window {
            let len = self.mss.min(self.window - offset);
            let begin = self.ack_seq + offset as u64;
            let data = self.copy_range(begin, begin + len as u64);
            if data.is_empty() {
                break;
            }
            offset += data.len();
            self.fetch_seq = self.fetch_seq.max(begin + data.len() as u64);
            ret.push(Segment { seq: begin, data });
        }
        ret
    }

    /// Segments within the peer window that were never handed to the wire
    pub fn fetch_unsent(&mut self) -> Vec<Segment> {
        let limit = self.ack_seq + self.window as u64;
        let mut ret = vec![];
        while self.fetch_seq < limit {
            let len = self.mss.min((limit - self.fetch_seq) as usize);
            let data = self.copy_range(self.fetch_seq, self.fetch_seq + len as u64);
            if data.is_empty() {
                break;
            }
            let seq = self.fetch_seq;
            self.fetch_seq += data.len() as u64;
            ret.push(Segment { seq, data });
        }
        ret
    }

    fn copy_range(&self, begin: u64, end: u64) -> Vec<u8> {
        let mut out = vec![];
        for s in &self.queue {
            if s.end() <= begin {
                continue;
            }
            if s.seq >= end {
                break;
            }
            let from = (begin.max(s.seq) - s.seq) as usize;
            let to = (end.min(s.end()) - s.seq) as usize;
            out.extend_from_slice(&s.data[from..to]);
        }
        out
    }

    /// Processes an acknowledgement. Returns true if buffer space was freed.
    fn ack(&mut self, seq: u64, window: u16, fin_sent: bool) -> bool {
        if self.fin_acked {
            return false;
        }
        self.window =
            (MAX_REMOTE_WINDOW_MSS_DUP * self.mss).min(usize::from(window) * self.window_scale);

        if fin_sent && seq == self.latest_seq + 1 {
            self.ack_seq = self.latest_seq + 1;
            self.fetch_seq = self.latest_seq + 1;
            self.fin_acked = true;
            let freed = !self.queue.is_empty();
            self.queue.clear();
            self.size = 0;
            return freed;
        }

        let seq = seq.min(self.latest_seq);
        if self.ack_seq < seq {
            self.ack_seq = seq;
        }
        self.fetch_seq = self.fetch_seq.max(self.ack_seq);

        let mut freed = false;
        while let Some(front) = self.queue.front() {
            if front.end() > self.ack_seq {
                break;
            }
            self.size -= front.data.len();
            self.queue.pop_front();
            freed = true;
        }
        freed
    }
}

#[derive(Debug)]
pub struct ReceivingQueue {
    queue: VecDeque<Segment>,
    size: usize,
    /// Next sequence number expected from the peer
    expecting_seq: u64,
    /// End of the data consumed by the application
    acked_seq: u64,
    window: usize,
    window_shift: u8,
}

impl ReceivingQueue {
    fn new(seq: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            size: 0,
            expecting_seq: seq,
            acked_seq: seq,
            window: RMEM_MAX,
            window_shift: 0,
        }
    }

    /// Used by active opens once the peer's SYN+ACK reveals its initial sequence number
    pub fn set_initial_seq(&mut self, seq: u64) {
        self.expecting_seq = seq;
        self.acked_seq = seq;
    }

    pub fn set_window_shift(&mut self, shift: u8) {
        self.window_shift = shift;
    }

    pub fn window_shift(&self) -> u8 {
        self.window_shift
    }

    /// Accounts for the sequence number consumed by a FIN
    pub fn inc_expecting_seq(&mut self) {
        self.expecting_seq += 1;
    }

    pub fn has_more_data_to_read(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn expecting_seq(&self) -> u64 {
        self.expecting_seq
    }

    pub fn acked_seq(&self) -> u64 {
        self.acked_seq
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Window value for outgoing headers, scaled down by the announced shift
    pub fn advertised_window(&self) -> u16 {
        (self.window >> self.window_shift).min(usize::from(u16::MAX)) as u16
    }

    /// Stores in-order data. Returns the number of new bytes accepted.
    ///
    /// Data beyond the expected sequence number is dropped, there is no
    /// out-of-order reassembly.
    fn store(&mut self, seq: u64, data: &[u8]) -> usize {
        if seq > self.expecting_seq || self.size >= RMEM_MAX {
            return 0;
        }
        let end = seq + data.len() as u64;
        if end <= self.expecting_seq {
            return 0;
        }
        let skip = (self.expecting_seq - seq) as usize;
        let take = (data.len() - skip).min(self.window);
        if take == 0 {
            return 0;
        }
        self.queue.push_back(Segment {
            seq: self.expecting_seq,
            data: data[skip..skip + take].to_vec(),
        });
        self.expecting_seq += take as u64;
        self.size += take;
        self.window -= take;
        take
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut len = 0;
        while len < buf.len() {
            let Some(front) = self.queue.front_mut() else {
                break;
            };
            let n = front.data.len().min(buf.len() - len);
            buf[len..len + n].copy_from_slice(&front.data[..n]);
            len += n;
            self.size -= n;
            if n == front.data.len() {
                self.acked_seq = front.end();
                self.queue.pop_front();
            } else {
                front.data.drain(..n);
                front.seq += n as u64;
                self.acked_seq = front.seq;
            }
        }
        len
    }

    pub fn reset_window(&mut self) {
        self.window = RMEM_MAX - self.size;
    }
}

/// A TCP connection terminated by the switch itself
pub struct TcpEntry {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    state: TcpState,
    need_closing: bool,
    pub send: SendingQueue,
    pub recv: ReceivingQueue,
    pub retransmission_timer: Option<TimerId>,
    pub delayed_ack_timer: Option<TimerId>,
    /// Address of the listener while the connection sits in its backlogs
    pub parent: Option<SocketAddr>,
    /// Readiness of the socket adapter owning this connection
    pub readiness: Option<Readiness>,
}

impl TcpEntry {
    /// Passive open; `syn_seq` is the sequence number of the peer's SYN
    pub fn new_passive(parent: SocketAddr, remote: SocketAddr, local: SocketAddr, syn_seq: u32) -> Self {
        let mut entry = Self::new(remote, local);
        entry.parent = Some(parent);
        entry.recv = ReceivingQueue::new(u64::from(syn_seq) + 1);
        entry
    }

    /// Active open; the receive sequence is set once the SYN+ACK arrives
    pub fn new_active(remote: SocketAddr, local: SocketAddr) -> Self {
        let mut entry = Self::new(remote, local);
        entry.state = TcpState::SynSent;
        entry
    }

    fn new(remote: SocketAddr, local: SocketAddr) -> Self {
        let iss = TCP_SEQ_INIT_MIN + rand::rng().random_range(0..TCP_SEQ_RAND);
        Self {
            local,
            remote,
            state: TcpState::Closed,
            need_closing: false,
            send: SendingQueue::new(iss),
            recv: ReceivingQueue::new(0),
            retransmission_timer: None,
            delayed_ack_timer: None,
            parent: None,
            readiness: None,
        }
    }

    pub fn tuple(&self) -> Tuple {
        Tuple::new(self.local, self.remote)
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    /// Changes state and wakes the owning adapter where the change is observable
    pub fn set_state(&mut self, state: TcpState, reactor: &mut dyn Reactor) {
        let old = self.state;
        if old == state {
            return;
        }
        debug!("tcp {}: {} -> {}", self, old, state);
        self.state = state;
        if !old.remote_closed() && state.remote_closed() {
            self.notify_readable(reactor);
        }
        if old == TcpState::SynSent && state == TcpState::Established {
            self.notify_writable(reactor);
        }
    }

    pub fn require_closing(&self) -> bool {
        self.need_closing
    }

    pub fn do_close(&mut self) {
        self.need_closing = true;
    }

    pub fn notify_readable(&self, reactor: &mut dyn Reactor) {
        if let Some(r) = &self.readiness {
            r.set_readable(reactor, true);
        }
    }

    pub fn notify_writable(&self, reactor: &mut dyn Reactor) {
        if let Some(r) = &self.readiness {
            r.set_writable(reactor, true);
        }
    }

    /// Queues application data for sending
    pub fn api_write(&mut self, buf: &[u8]) -> usize {
        if self.state.fin_sent() {
            error!("tcp {}: FIN is set but still writing data", self);
            return 0;
        }
        self.send.write(buf)
    }

    pub fn api_read(&mut self, buf: &mut [u8]) -> usize {
        self.recv.read(buf)
    }

    /// Stores data received from the peer
    pub fn store(&mut self, seq: u64, data: &[u8], reactor: &mut dyn Reactor) -> usize {
        if self.state.remote_closed() {
            error!("tcp {}: FIN received but is still storing data", self);
            return 0;
        }
        let n = self.recv.store(seq, data);
        if n > 0 {
            self.notify_readable(reactor);
        }
        n
    }

    /// Processes an acknowledgement from the peer
    pub fn ack(&mut self, seq: u64, window: u16, reactor: &mut dyn Reactor) {
        let fin_sent = self.state.fin_sent();
        if self.send.ack(seq, window, fin_sent) && !fin_sent {
            self.notify_writable(reactor);
        }
    }

    pub fn need_to_send_fin(&self) -> bool {
        self.state.fin_sent() && !self.send.fin_acked
    }

    pub fn cancel_timers(&mut self, reactor: &mut dyn Reactor) {
        if let Some(t) = self.retransmission_timer.take() {
            reactor.cancel_timer(t);
        }
        if let Some(t) = self.delayed_ack_timer.take() {
            reactor.cancel_timer(t);
        }
    }
}

impl fmt::Display for TcpEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.local, self.remote)
    }
}

/// A listening TCP address and its pending connections
pub struct TcpListenEntry {
    pub local: SocketAddr,
    /// Connections that have not completed the handshake
    pub syn_backlog: Vec<Tuple>,
    /// Established connections waiting for accept(), oldest first
    pub backlog: VecDeque<Tuple>,
    pub readiness: Readiness,
}

impl TcpListenEntry {
    pub fn new(local: SocketAddr, readiness: Readiness) -> Self {
        Self {
            local,
            syn_backlog: vec![],
            backlog: VecDeque::new(),
            readiness,
        }
    }
}
