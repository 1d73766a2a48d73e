use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::reactor::Readiness;

/// Datagrams kept per bound address before new ones are dropped
pub const MAX_DATAGRAM_QUEUE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub remote: SocketAddr,
    pub data: Vec<u8>,
}

/// A bound UDP address served by a datagram adapter
pub struct UdpListenEntry {
    pub local: SocketAddr,
    /// When set, only datagrams from this peer are accepted
    pub peer: Option<SocketAddr>,
    pub receiving: VecDeque<Datagram>,
    pub sending: VecDeque<Datagram>,
    pub readiness: Readiness,
}

impl UdpListenEntry {
    pub fn new(local: SocketAddr, readiness: Readiness) -> Self {
        Self {
            local,
            peer: None,
            receiving: VecDeque::new(),
            sending: VecDeque::new(),
            readiness,
        }
    }

    pub fn accepts(&self, remote: SocketAddr) -> bool {
        self.peer.is_none_or(|p| p == remote)
    }

    /// Queues a received datagram. Returns false when the queue is full.
    pub fn store(&mut self, remote: SocketAddr, data: Vec<u8>) -> bool {
        if self.receiving.len() >= MAX_DATAGRAM_QUEUE {
            return false;
        }
        self.receiving.push_back(Datagram { remote, data });
        true
    }
}

/// A UDP exchange observed on a bound address
#[derive(Debug, Clone)]
pub struct UdpEntry {
    pub remote: SocketAddr,
    pub local: SocketAddr,
    pub last_seen_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_filter_and_capacity() {
        let mut e = UdpListenEntry::new("10.0.0.1:53".parse().unwrap(), Readiness::new(1));
        let a: SocketAddr = "10.0.0.5:999".parse().unwrap();
        let b: SocketAddr = "10.0.0.6:999".parse().unwrap();
        assert!(e.accepts(a) && e.accepts(b));
        e.peer = Some(a);
        assert!(e.accepts(a));
        assert!(!e.accepts(b));

        for _ in 0..MAX_DATAGRAM_QUEUE {
            assert!(e.store(a, vec![0]));
        }
        assert!(!e.store(a, vec![0]));
        assert_eq!(e.receiving.len(), MAX_DATAGRAM_QUEUE);
    }
}
