//! Hot counter store: the low-latency key/value side of the system.
//!
//! Every mutation runs as one atomic step under the key's entry lock, which
//! is what the admission path relies on at high contention. TTLs are lazy:
//! an expired entry is removed by whichever access observes it first.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

#[derive(Debug, Clone)]
enum Value {
    Int(i64),
    Str(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |t| Instant::now() < t)
    }
}

/// Outcome of the atomic check-then-decrement on a stock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deduct {
    /// Key absent; caller must warm it up first.
    Missing,
    /// Current value is below the requested quantity.
    Insufficient,
    /// Decremented; carries the new value.
    NewValue(i64),
}

/// Outcome of the atomic stock return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restore {
    Missing,
    /// Returning would push the counter over the configured upper bound.
    OverCap,
    NewValue(i64),
}

#[derive(Default)]
pub struct HotStore {
    map: DashMap<String, Entry>,
}

impl HotStore {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    fn expires(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|d| Instant::now() + d)
    }

    /// Check-then-decrement in one atomic step.
    pub fn deduct(&self, key: &str, quantity: i64) -> Deduct {
        match self.map.entry(key.to_string()) {
            MapEntry::Occupied(mut occ) => {
                if !occ.get().live() {
                    occ.remove();
                    return Deduct::Missing;
                }
                match &mut occ.get_mut().value {
                    Value::Int(v) => {
                        if *v < quantity {
                            Deduct::Insufficient
                        } else {
                            *v -= quantity;
                            Deduct::NewValue(*v)
                        }
                    }
                    _ => Deduct::Missing,
                }
            }
            MapEntry::Vacant(_) => Deduct::Missing,
        }
    }

    /// Symmetric increment with an upper-bound guard (`cap == 0` disables it).
    pub fn restore(&self, key: &str, quantity: i64, cap: i64) -> Restore {
        match self.map.entry(key.to_string()) {
            MapEntry::Occupied(mut occ) => {
                if !occ.get().live() {
                    occ.remove();
                    return Restore::Missing;
                }
                match &mut occ.get_mut().value {
                    Value::Int(v) => {
                        let next = *v + quantity;
                        if cap > 0 && next > cap {
                            Restore::OverCap
                        } else {
                            *v = next;
                            Restore::NewValue(next)
                        }
                    }
                    _ => Restore::Missing,
                }
            }
            MapEntry::Vacant(_) => Restore::Missing,
        }
    }

    /// SET-IF-ABSENT. Returns true when this call created the key.
    pub fn set_nx(&self, key: &str, value: i64, ttl: Option<Duration>) -> bool {
        match self.map.entry(key.to_string()) {
            MapEntry::Occupied(mut occ) => {
                if occ.get().live() {
                    return false;
                }
                occ.insert(Entry { value: Value::Int(value), expires_at: Self::expires(ttl) });
                true
            }
            MapEntry::Vacant(vac) => {
                vac.insert(Entry { value: Value::Int(value), expires_at: Self::expires(ttl) });
                true
            }
        }
    }

    pub fn set_int(&self, key: &str, value: i64, ttl: Option<Duration>) {
        self.map.insert(
            key.to_string(),
            Entry { value: Value::Int(value), expires_at: Self::expires(ttl) },
        );
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        let entry = self.map.get(key)?;
        if !entry.live() {
            drop(entry);
            self.map.remove(key);
            return None;
        }
        match entry.value {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn set_str(&self, key: &str, value: String, ttl: Option<Duration>) {
        self.map.insert(
            key.to_string(),
            Entry { value: Value::Str(value), expires_at: Self::expires(ttl) },
        );
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        let entry = self.map.get(key)?;
        if !entry.live() {
            drop(entry);
            self.map.remove(key);
            return None;
        }
        match &entry.value {
            Value::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn del(&self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    pub fn exists(&self, key: &str) -> bool {
        match self.map.get(key) {
            Some(entry) if entry.live() => true,
            Some(entry) => {
                drop(entry);
                self.map.remove(key);
                false
            }
            None => false,
        }
    }

    /// Set-add. Returns true on first insertion of the member. The TTL is
    /// applied only when the set is created.
    pub fn sadd(&self, key: &str, member: &str, ttl: Option<Duration>) -> bool {
        match self.map.entry(key.to_string()) {
            MapEntry::Occupied(mut occ) => {
                if !occ.get().live() {
                    let mut set = HashSet::new();
                    set.insert(member.to_string());
                    occ.insert(Entry { value: Value::Set(set), expires_at: Self::expires(ttl) });
                    return true;
                }
                match &mut occ.get_mut().value {
                    Value::Set(set) => set.insert(member.to_string()),
                    _ => false,
                }
            }
            MapEntry::Vacant(vac) => {
                let mut set = HashSet::new();
                set.insert(member.to_string());
                vac.insert(Entry { value: Value::Set(set), expires_at: Self::expires(ttl) });
                true
            }
        }
    }

    pub fn srem(&self, key: &str, member: &str) -> bool {
        match self.map.entry(key.to_string()) {
            MapEntry::Occupied(mut occ) => {
                if !occ.get().live() {
                    occ.remove();
                    return false;
                }
                match &mut occ.get_mut().value {
                    Value::Set(set) => set.remove(member),
                    _ => false,
                }
            }
            MapEntry::Vacant(_) => false,
        }
    }

    /// Atomically pop up to `n` members.
    pub fn spop_n(&self, key: &str, n: usize) -> Vec<String> {
        match self.map.entry(key.to_string()) {
            MapEntry::Occupied(mut occ) => {
                if !occ.get().live() {
                    occ.remove();
                    return Vec::new();
                }
                match &mut occ.get_mut().value {
                    Value::Set(set) => {
                        let popped: Vec<String> = set.iter().take(n).cloned().collect();
                        for member in &popped {
                            set.remove(member);
                        }
                        if set.is_empty() {
                            occ.remove();
                        }
                        popped
                    }
                    _ => Vec::new(),
                }
            }
            MapEntry::Vacant(_) => Vec::new(),
        }
    }

    pub fn scard(&self, key: &str) -> usize {
        match self.map.get(key) {
            Some(entry) if entry.live() => match &entry.value {
                Value::Set(set) => set.len(),
                _ => 0,
            },
            _ => 0,
        }
    }

    pub fn smembers(&self, key: &str) -> Vec<String> {
        match self.map.get(key) {
            Some(entry) if entry.live() => match &entry.value {
                Value::Set(set) => set.iter().cloned().collect(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deduct_walks_the_three_outcomes() {
        let store = HotStore::new();
        assert_eq!(store.deduct("stock:1", 1), Deduct::Missing);

        store.set_int("stock:1", 2, None);
        assert_eq!(store.deduct("stock:1", 1), Deduct::NewValue(1));
        assert_eq!(store.deduct("stock:1", 1), Deduct::NewValue(0));
        assert_eq!(store.deduct("stock:1", 1), Deduct::Insufficient);
    }

    #[test]
    fn restore_respects_the_cap() {
        let store = HotStore::new();
        store.set_int("stock:1", 10, None);
        assert_eq!(store.restore("stock:1", 5, 100), Restore::NewValue(15));
        assert_eq!(store.restore("stock:1", 100, 100), Restore::OverCap);
        // cap 0 disables the guard
        assert_eq!(store.restore("stock:1", 100, 0), Restore::NewValue(115));
    }

    #[test]
    fn set_nx_only_creates_once() {
        let store = HotStore::new();
        assert!(store.set_nx("lock", 1, None));
        assert!(!store.set_nx("lock", 1, None));
        store.del("lock");
        assert!(store.set_nx("lock", 1, None));
    }

    #[test]
    fn expired_keys_behave_as_absent() {
        let store = HotStore::new();
        store.set_int("k", 7, Some(Duration::from_millis(10)));
        assert_eq!(store.get_int("k"), Some(7));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.get_int("k"), None);
        assert!(store.set_nx("k", 1, None));
    }

    #[test]
    fn sadd_reports_first_insertion() {
        let store = HotStore::new();
        assert!(store.sadd("joined", "7", None));
        assert!(!store.sadd("joined", "7", None));
        assert!(store.sadd("joined", "8", None));
        assert_eq!(store.scard("joined"), 2);
        assert!(store.srem("joined", "7"));
        assert!(store.sadd("joined", "7", None));
    }

    #[test]
    fn spop_drains_and_removes_the_set() {
        let store = HotStore::new();
        for id in 0..5 {
            store.sadd("dirty", &id.to_string(), None);
        }
        let first = store.spop_n("dirty", 3);
        assert_eq!(first.len(), 3);
        let rest = store.spop_n("dirty", 10);
        assert_eq!(rest.len(), 2);
        assert!(!store.exists("dirty"));
    }
}
