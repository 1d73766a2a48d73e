//! MAC learning table and ARP cache

use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;

use smoltcp::wire::EthernetAddress;

/// Default MAC table entry lifetime
pub const MAC_TABLE_TIMEOUT_MS: u64 = 300 * 1000;
/// Default ARP/neighbour cache entry lifetime
pub const ARP_TABLE_TIMEOUT_MS: u64 = 4 * 3600 * 1000;

#[derive(Debug, Clone)]
struct AgingEntry<V> {
    value: V,
    /// `None` for entries that never expire
    expires_at: Option<u64>,
}

/// Key/value table whose entries expire a fixed time after they were last recorded
///
/// Expiry is evaluated lazily on lookup and in bulk by [`AgingTable::expire`].
#[derive(Debug, Clone)]
pub struct AgingTable<K, V> {
    entries: HashMap<K, AgingEntry<V>>,
    timeout_ms: u64,
}

impl<K: Eq + Hash + Copy, V: Copy + PartialEq> AgingTable<K, V> {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            entries: HashMap::new(),
            timeout_ms,
        }
    }

    pub fn lookup(&self, key: K, now_ms: u64) -> Option<V> {
        let entry = self.entries.get(&key)?;
        match entry.expires_at {
            Some(t) if t <= now_ms => None,
            _ => Some(entry.value),
        }
    }

    /// Records or refreshes an entry. Returns true if the value changed.
    pub fn record(&mut self, key: K, value: V, persistent: bool, now_ms: u64) -> bool {
        let expires_at = if persistent {
            None
        } else {
            Some(now_ms + self.timeout_ms)
        };
        match self.entries.get_mut(&key) {
            Some(e) => {
                let changed = e.value != value;
                e.value = value;
                // persistent entries stay persistent while the value is unchanged
                if e.expires_at.is_some() || changed {
                    e.expires_at = expires_at;
                }
                changed
            }
            None => {
                self.entries.insert(key, AgingEntry { value, expires_at });
                true
            }
        }
    }

    pub fn remove(&mut self, key: K) -> Option<V> {
        self.entries.remove(&key).map(|e| e.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Changes the lifetime of entries recorded from now on
    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout_ms = timeout_ms;
    }

    /// Drops expired entries, returning how many were removed
    pub fn expire(&mut self, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.expires_at.is_none_or(|t| t > now_ms));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live entries as (key, value, persistent)
    pub fn entries(&self, now_ms: u64) -> impl Iterator<Item = (K, V, bool)> + '_ {
        self.entries
            .iter()
            .filter(move |(_, e)| e.expires_at.is_none_or(|t| t > now_ms))
            .map(|(k, e)| (*k, e.value, e.expires_at.is_none()))
    }
}

/// MAC address to switch port
pub type MacTable = AgingTable<EthernetAddress, u32>;

/// IP address to MAC address
pub type ArpTable = AgingTable<IpAddr, EthernetAddress>;

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 1]);

    #[test]
    fn test_record_and_expire() {
        let mut t = MacTable::new(1000);
        assert!(t.record(MAC, 3, false, 0));
        assert_eq!(t.lookup(MAC, 999), Some(3));
        assert_eq!(t.lookup(MAC, 1000), None);
        assert_eq!(t.expire(1000), 1);
        assert!(t.is_empty());
    }

    #[test]
    fn test_refresh_extends_lifetime() {
        let mut t = MacTable::new(1000);
        t.record(MAC, 3, false, 0);
        assert!(!t.record(MAC, 3, false, 800));
        assert_eq!(t.lookup(MAC, 1500), Some(3));
        assert!(t.record(MAC, 4, false, 900));
        assert_eq!(t.lookup(MAC, 1500), Some(4));
    }

    #[test]
    fn test_persistent_entries_survive() {
        let mut t = ArpTable::new(10);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        t.record(ip, MAC, true, 0);
        t.record(ip, MAC, false, 5);
        assert_eq!(t.expire(1_000_000), 0);
        assert_eq!(t.lookup(ip, 1_000_000), Some(MAC));
        let all: Vec<_> = t.entries(1_000_000).collect();
        assert_eq!(all, vec![(ip, MAC, true)]);
    }

    #[test]
    fn test_set_timeout_and_clear() {
        let mut t = MacTable::new(1000);
        t.set_timeout(10);
        t.record(MAC, 1, false, 0);
        assert_eq!(t.lookup(MAC, 10), None);
        t.record(MAC, 1, false, 100);
        t.clear();
        assert_eq!(t.lookup(MAC, 101), None);
    }
}
