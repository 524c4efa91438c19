//! Counter storage for (client, window) pairs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use super::key::ClientKey;
use super::window::WindowIndex;

/// Identifies one counter: a client within one window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The client the counter belongs to
    pub client: ClientKey,
    /// The window the counter covers
    pub window: WindowIndex,
}

/// Result of an eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries older than this window were targeted
    pub cutoff: WindowIndex,
    /// Number of counters removed
    pub evicted: usize,
    /// Whether evictable counters are left because the budget ran out
    pub pending: bool,
}

/// Process-local map from `(ClientKey, WindowIndex)` to a request count.
///
/// Counters are atomics behind DashMap shard locks, so increments for the
/// same pair never lose updates. Alongside the map, an eviction index records
/// which clients were first seen in which window; sweeps walk that index from
/// the oldest window and never scan live entries.
///
/// Lock order: the eviction index lock is never taken while a shard guard is
/// held, and shard locks are only taken after the index lock is released.
pub struct CounterStore {
    counters: DashMap<CounterKey, AtomicU64>,
    /// Clients created per window, oldest window first
    generations: Mutex<BTreeMap<WindowIndex, Vec<ClientKey>>>,
}

impl CounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            generations: Mutex::new(BTreeMap::new()),
        }
    }

    /// Increment the counter for `client` in `window`, creating it if absent.
    ///
    /// Returns the count after the increment.
    pub fn increment(&self, client: &ClientKey, window: WindowIndex) -> u64 {
        let key = CounterKey {
            client: client.clone(),
            window,
        };

        // Fast path: shared shard lock for an existing counter.
        if let Some(counter) = self.counters.get(&key) {
            return counter.fetch_add(1, Ordering::SeqCst) + 1;
        }

        let (count, created) = match self.counters.entry(key) {
            Entry::Occupied(entry) => (entry.get().fetch_add(1, Ordering::SeqCst) + 1, false),
            Entry::Vacant(entry) => {
                entry.insert(AtomicU64::new(1));
                (1, true)
            }
        };

        if created {
            trace!(key = %client, window = %window, "Creating new admission counter");
            self.generations
                .lock()
                .entry(window)
                .or_default()
                .push(client.clone());
        }

        count
    }

    /// Current count for a pair, if the counter exists.
    pub fn get(&self, client: &ClientKey, window: WindowIndex) -> Option<u64> {
        let key = CounterKey {
            client: client.clone(),
            window,
        };
        self.counters.get(&key).map(|c| c.load(Ordering::SeqCst))
    }

    /// Number of live counters.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Remove every counter.
    pub fn clear(&self) {
        self.generations.lock().clear();
        self.counters.clear();
    }

    /// Evict up to `budget` counters whose window is older than `cutoff`,
    /// waiting for any concurrent sweep to finish.
    pub fn evict_before(&self, cutoff: WindowIndex, budget: usize) -> SweepReport {
        let (expired, pending) = {
            let mut generations = self.generations.lock();
            drain_expired(&mut generations, cutoff, budget)
        };
        self.remove_all(cutoff, expired, pending)
    }

    /// Like [`evict_before`](Self::evict_before), but gives up immediately
    /// when another sweep holds the eviction index.
    ///
    /// Returns `None` if nothing was attempted.
    pub fn try_evict_before(&self, cutoff: WindowIndex, budget: usize) -> Option<SweepReport> {
        let (expired, pending) = {
            let mut generations = self.generations.try_lock()?;
            let oldest = generations.keys().next().copied()?;
            if oldest >= cutoff {
                return None;
            }
            drain_expired(&mut generations, cutoff, budget)
        };
        Some(self.remove_all(cutoff, expired, pending))
    }

    fn remove_all(&self, cutoff: WindowIndex, expired: Vec<CounterKey>, pending: bool) -> SweepReport {
        let mut evicted = 0;
        for key in &expired {
            if self.counters.remove(key).is_some() {
                evicted += 1;
            }
        }

        SweepReport {
            cutoff,
            evicted,
            pending,
        }
    }
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Take at most `budget` keys older than `cutoff` out of the index.
///
/// Returns the keys and whether older keys remain.
fn drain_expired(
    generations: &mut BTreeMap<WindowIndex, Vec<ClientKey>>,
    cutoff: WindowIndex,
    budget: usize,
) -> (Vec<CounterKey>, bool) {
    let mut expired = Vec::new();

    while expired.len() < budget {
        let Some(mut oldest) = generations.first_entry() else {
            break;
        };
        let window = *oldest.key();
        if window >= cutoff {
            break;
        }

        let clients = oldest.get_mut();
        let take = (budget - expired.len()).min(clients.len());
        let split = clients.len() - take;
        expired.extend(
            clients
                .drain(split..)
                .map(|client| CounterKey { client, window }),
        );

        if clients.is_empty() {
            oldest.remove();
        }
    }

    let pending = generations
        .keys()
        .next()
        .is_some_and(|window| *window < cutoff);

    (expired, pending)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ClientKey {
        ClientKey::from(name)
    }

    #[test]
    fn test_increment_creates_and_counts() {
        let store = CounterStore::new();

        assert_eq!(store.increment(&key("a"), WindowIndex(1)), 1);
        assert_eq!(store.increment(&key("a"), WindowIndex(1)), 2);
        assert_eq!(store.increment(&key("a"), WindowIndex(1)), 3);

        assert_eq!(store.get(&key("a"), WindowIndex(1)), Some(3));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_pairs_are_independent() {
        let store = CounterStore::new();

        store.increment(&key("a"), WindowIndex(1));
        store.increment(&key("a"), WindowIndex(2));
        store.increment(&key("b"), WindowIndex(1));

        assert_eq!(store.get(&key("a"), WindowIndex(1)), Some(1));
        assert_eq!(store.get(&key("a"), WindowIndex(2)), Some(1));
        assert_eq!(store.get(&key("b"), WindowIndex(1)), Some(1));
        assert_eq!(store.get(&key("b"), WindowIndex(2)), None);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_evict_before_keeps_cutoff_window() {
        let store = CounterStore::new();
        for window in 0..5 {
            store.increment(&key("a"), WindowIndex(window));
        }

        let report = store.evict_before(WindowIndex(3), usize::MAX);

        assert_eq!(report.evicted, 3);
        assert!(!report.pending);
        assert_eq!(store.len(), 2);
        assert!(store.get(&key("a"), WindowIndex(2)).is_none());
        assert_eq!(store.get(&key("a"), WindowIndex(3)), Some(1));
    }

    #[test]
    fn test_evicted_pair_starts_fresh() {
        let store = CounterStore::new();
        store.increment(&key("a"), WindowIndex(2));
        store.increment(&key("a"), WindowIndex(2));
        store.evict_before(WindowIndex(8), usize::MAX);

        // A late writer for an evicted window gets a new counter, and the
        // next sweep past that window removes it again.
        assert_eq!(store.increment(&key("a"), WindowIndex(2)), 1);
        assert_eq!(store.evict_before(WindowIndex(8), usize::MAX).evicted, 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_evict_respects_budget() {
        let store = CounterStore::new();
        for client in ["a", "b", "c", "d", "e"] {
            store.increment(&key(client), WindowIndex(1));
        }
        store.increment(&key("a"), WindowIndex(9));

        let first = store.evict_before(WindowIndex(5), 2);
        assert_eq!(first.evicted, 2);
        assert!(first.pending);
        assert_eq!(store.len(), 4);

        let second = store.evict_before(WindowIndex(5), 10);
        assert_eq!(second.evicted, 3);
        assert!(!second.pending);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_try_evict_skips_when_nothing_expired() {
        let store = CounterStore::new();
        store.increment(&key("a"), WindowIndex(7));

        assert!(store.try_evict_before(WindowIndex(7), 16).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_try_evict_skips_when_index_locked() {
        let store = CounterStore::new();
        store.increment(&key("a"), WindowIndex(1));

        let guard = store.generations.lock();
        assert!(store.try_evict_before(WindowIndex(5), 16).is_none());
        drop(guard);

        let report = store.try_evict_before(WindowIndex(5), 16).unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_clear() {
        let store = CounterStore::new();
        store.increment(&key("a"), WindowIndex(1));
        store.increment(&key("b"), WindowIndex(1));

        store.clear();

        assert_eq!(store.len(), 0);
        assert_eq!(store.evict_before(WindowIndex(10), usize::MAX).evicted, 0);
    }
}
