//! Eviction policies for [`PromiseCache`](crate::PromiseCache).
//!
//! A policy observes the cache's inserts, accesses and removals, and picks the
//! victims when the cache runs over capacity. Each cache owns its policy
//! instance, so the recency clocks and frequency counters are never shared
//! between caches.
//!
//! Three policies are built in:
//! - [`Lru`] evicts the least recently accessed entries.
//! - [`Mru`] evicts the most recently accessed entries.
//! - [`Lfu`] evicts the least frequently accessed entries.
//!
//! Victims are chosen in a single pass over the tracked entries, keeping a small
//! sorted buffer of the best candidates seen so far. Eviction can run on every
//! insert, so a full sort would be wasted work.

use std::{collections::HashMap, fmt, str::FromStr};

use crate::{ConfigurationError, Key};

/// Decides which entries a full cache gives up.
///
/// Only [`evict`](EvictionPolicy::evict) is mandatory; the notification hooks
/// default to doing nothing.
pub trait EvictionPolicy<K>: Send {
    /// A key was stored, either new or overwriting an existing entry.
    fn on_insert(&mut self, _key: &K) {}

    /// A stored key was read.
    fn on_access(&mut self, _key: &K) {}

    /// A key left the cache, for whatever reason.
    fn on_remove(&mut self, _key: &K) {}

    /// Chooses up to `n` keys to remove. The cache removes them in the returned
    /// order and reports each one through [`on_remove`](EvictionPolicy::on_remove).
    fn evict(&mut self, n: usize) -> Vec<K>;
}

/// Selects the eviction policy of a cache.
///
/// Built-in policies can also be parsed from their names:
/// ```
/// # use orderly::Eviction;
/// #
/// let eviction: Eviction<u32> = "lfu".parse().unwrap();
/// assert!(matches!(eviction, Eviction::Lfu));
/// assert!("fifo".parse::<Eviction<u32>>().is_err());
/// ```
pub enum Eviction<K> {
    Lru,
    Mru,
    Lfu,
    Custom(Box<dyn EvictionPolicy<K>>),
}

impl<K: Key> Eviction<K> {
    pub(crate) fn into_policy(self) -> Box<dyn EvictionPolicy<K>> {
        match self {
            Eviction::Lru => Box::new(Lru::new()),
            Eviction::Mru => Box::new(Mru::new()),
            Eviction::Lfu => Box::new(Lfu::new()),
            Eviction::Custom(policy) => policy,
        }
    }
}

impl<K> FromStr for Eviction<K> {
    type Err = ConfigurationError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "lru" => Ok(Eviction::Lru),
            "mru" => Ok(Eviction::Mru),
            "lfu" => Ok(Eviction::Lfu),
            _ => Err(ConfigurationError::UnknownEviction(name.to_string())),
        }
    }
}

impl<K> fmt::Debug for Eviction<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eviction::Lru => f.write_str("Lru"),
            Eviction::Mru => f.write_str("Mru"),
            Eviction::Lfu => f.write_str("Lfu"),
            Eviction::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[derive(Clone, Copy)]
struct Stamp {
    rank: u64,
    // Insertion order, breaks ties between equal ranks.
    seq: u64,
}

#[derive(Clone, Copy)]
enum Pick {
    Lowest,
    Highest,
}

impl Pick {
    // `true` if `a` should be evicted before `b`. Older entries go first on ties.
    fn before(self, a: &Stamp, b: &Stamp) -> bool {
        match self {
            Pick::Lowest => (a.rank, a.seq) < (b.rank, b.seq),
            Pick::Highest => a.rank > b.rank || (a.rank == b.rank && a.seq < b.seq),
        }
    }
}

// Per-key ranks shared by the built-in policies.
struct Ranks<K> {
    stamps: HashMap<K, Stamp>,
    next_seq: u64,
}

impl<K: Key> Ranks<K> {
    fn new() -> Self {
        Self {
            stamps: HashMap::with_capacity(16),
            next_seq: 0,
        }
    }

    fn reset(&mut self, key: &K) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.stamps.insert(key.clone(), Stamp { rank: 0, seq });
    }

    fn get_mut(&mut self, key: &K) -> Option<&mut u64> {
        self.stamps.get_mut(key).map(|stamp| &mut stamp.rank)
    }

    fn remove(&mut self, key: &K) {
        self.stamps.remove(key);
    }

    fn rank(&self, key: &K) -> Option<u64> {
        self.stamps.get(key).map(|stamp| stamp.rank)
    }

    // Partial insertion sort: `victims` stays ordered from most to least
    // evictable and never grows past `n`, so its last element is the threshold
    // a candidate has to beat.
    fn select(&self, n: usize, pick: Pick) -> Vec<K> {
        if n == 0 {
            return Vec::new();
        }
        let mut victims: Vec<(&K, &Stamp)> = Vec::with_capacity(n.min(self.stamps.len()));
        for (key, stamp) in &self.stamps {
            if victims.len() == n {
                let (_, threshold) = victims[n - 1];
                if !pick.before(stamp, threshold) {
                    continue;
                }
                victims.pop();
            }
            let at = victims.partition_point(|(_, other)| pick.before(other, stamp));
            victims.insert(at, (key, stamp));
        }
        // Handed back starting at the threshold.
        victims.into_iter().rev().map(|(key, _)| key.clone()).collect()
    }
}

/// Least recently used eviction.
///
/// Every access stamps the entry with the next value of a policy-local clock;
/// fresh entries start at zero, so an entry that was never read goes first.
pub struct Lru<K> {
    ranks: Ranks<K>,
    clock: u64,
}

impl<K: Key> Lru<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ranks: Ranks::new(),
            clock: 0,
        }
    }

    /// The clock value of the last access to `key`, `0` if never accessed.
    #[must_use]
    pub fn stamp(&self, key: &K) -> Option<u64> {
        self.ranks.rank(key)
    }
}

impl<K: Key> Default for Lru<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> EvictionPolicy<K> for Lru<K> {
    fn on_insert(&mut self, key: &K) {
        self.ranks.reset(key);
    }

    fn on_access(&mut self, key: &K) {
        if let Some(rank) = self.ranks.get_mut(key) {
            self.clock += 1;
            *rank = self.clock;
        }
    }

    fn on_remove(&mut self, key: &K) {
        self.ranks.remove(key);
    }

    fn evict(&mut self, n: usize) -> Vec<K> {
        self.ranks.select(n, Pick::Lowest)
    }
}

/// Most recently used eviction.
///
/// Stamps entries exactly like [`Lru`] and evicts from the other end.
pub struct Mru<K> {
    ranks: Ranks<K>,
    clock: u64,
}

impl<K: Key> Mru<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ranks: Ranks::new(),
            clock: 0,
        }
    }

    /// The clock value of the last access to `key`, `0` if never accessed.
    #[must_use]
    pub fn stamp(&self, key: &K) -> Option<u64> {
        self.ranks.rank(key)
    }
}

impl<K: Key> Default for Mru<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> EvictionPolicy<K> for Mru<K> {
    fn on_insert(&mut self, key: &K) {
        self.ranks.reset(key);
    }

    fn on_access(&mut self, key: &K) {
        if let Some(rank) = self.ranks.get_mut(key) {
            self.clock += 1;
            *rank = self.clock;
        }
    }

    fn on_remove(&mut self, key: &K) {
        self.ranks.remove(key);
    }

    fn evict(&mut self, n: usize) -> Vec<K> {
        self.ranks.select(n, Pick::Highest)
    }
}

/// Least frequently used eviction.
///
/// Counts accesses per entry, starting from zero whenever the key is stored.
pub struct Lfu<K> {
    ranks: Ranks<K>,
}

impl<K: Key> Lfu<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ranks: Ranks::new(),
        }
    }

    /// How many times `key` was accessed since it was stored.
    #[must_use]
    pub fn frequency(&self, key: &K) -> Option<u64> {
        self.ranks.rank(key)
    }
}

impl<K: Key> Default for Lfu<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> EvictionPolicy<K> for Lfu<K> {
    fn on_insert(&mut self, key: &K) {
        self.ranks.reset(key);
    }

    fn on_access(&mut self, key: &K) {
        if let Some(rank) = self.ranks.get_mut(key) {
            *rank += 1;
        }
    }

    fn on_remove(&mut self, key: &K) {
        self.ranks.remove(key);
    }

    fn evict(&mut self, n: usize) -> Vec<K> {
        self.ranks.select(n, Pick::Lowest)
    }
}
