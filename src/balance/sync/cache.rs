//! Last-synced balance cache.
//!
//! The cache remembers the balance most recently pulled from or pushed to the remote store for
//! each identity. It is advisory only: reconciliation never reads it. Its sole consumer is the
//! shutdown drain, which flushes every entry without an extra remote round trip.

use dashmap::DashMap;

/// Concurrent identity -> balance map.
///
/// Writes for different identities land on different shards and do not block each other; reads
/// and writes of one identity are linearizable.
#[derive(Debug, Default)]
pub struct BalanceCache {
    entries: DashMap<String, f64>,
}

impl BalanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the entry for `identity`.
    pub fn put(&self, identity: &str, balance: f64) {
        self.entries.insert(identity.to_string(), balance);
    }

    pub fn get(&self, identity: &str) -> Option<f64> {
        self.entries.get(identity).map(|balance| *balance)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every entry present when the drain starts.
    ///
    /// The iterator is lazy: each entry is removed as it is yielded, so an entry overwritten
    /// before its turn is yielded with its newest value. Entries added after the drain started
    /// are not visited.
    pub fn drain(&self) -> Drain<'_> {
        let identities: Vec<String> = self
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        Drain {
            cache: self,
            identities: identities.into_iter(),
        }
    }
}

/// One-shot iterator returned by [`BalanceCache::drain`].
pub struct Drain<'a> {
    cache: &'a BalanceCache,
    identities: std::vec::IntoIter<String>,
}

impl Iterator for Drain<'_> {
    type Item = (String, f64);

    fn next(&mut self) -> Option<Self::Item> {
        for identity in self.identities.by_ref() {
            // Skip entries removed by someone else since the snapshot.
            if let Some(entry) = self.cache.entries.remove(&identity) {
                return Some(entry);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.identities.len()))
    }
}
