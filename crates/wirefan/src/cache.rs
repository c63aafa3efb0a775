use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::time::{Duration, Instant};

use crate::types::DeviceAddress;

/// Device lists go stale after this long; the relay re-validates device
/// lists on send failure, so staleness here is acceptable.
pub const DEVICE_CACHE_TTL: Duration = Duration::from_secs(300);
pub const GROUP_METADATA_TTL: Duration = Duration::from_secs(300);

/// An explicit map with stored insertion timestamps, swept lazily on read.
/// The pipeline's single serializing context makes locking unnecessary.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: HashMap<K, (Instant, V)>,
}

impl<K: Eq + Hash + Clone, V> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        if let Some((inserted, _)) = self.entries.get(key) {
            if inserted.elapsed() > self.ttl {
                self.entries.remove(key);
                return None;
            }
        }
        self.entries.get(key).map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.entries.insert(key, (Instant::now(), value));
    }

    pub fn invalidate(&mut self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type DeviceCache = TtlCache<String, Vec<DeviceAddress>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMetadata {
    pub participants: Vec<String>,
    pub version: u64,
}

pub type GroupMetadataCache = TtlCache<String, GroupMetadata>;

/// Conversation ids seen in the most recent initial-bootstrap history
/// payload. Diffed once against a later recent-messages payload to emit
/// "conversation no longer recent" notifications, then narrowed.
#[derive(Debug, Default)]
pub struct HistoryReconciliationSet {
    tracked: HashSet<String>,
}

impl HistoryReconciliationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, ids: impl IntoIterator<Item = String>) {
        self.tracked = ids.into_iter().collect();
    }

    /// Returns previously-tracked conversations absent from `current` and
    /// narrows the set to the intersection.
    pub fn reconcile(&mut self, current: &HashSet<String>) -> Vec<String> {
        let mut dropped: Vec<String> = self
            .tracked
            .iter()
            .filter(|id| !current.contains(*id))
            .cloned()
            .collect();
        dropped.sort();
        self.tracked.retain(|id| current.contains(id));
        dropped
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tracked.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }
}
