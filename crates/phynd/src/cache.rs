use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::snapshot::Snapshot;

/// Cached state of one device.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub snapshot: Arc<Snapshot>,
    /// The latest poll of this device failed; `snapshot` is older than one
    /// interval.
    pub stale: bool,
    /// Consecutive failed polls since the last successful one.
    pub missed_polls: u32,
}

/// Latest snapshot per device.
///
/// Readers load the whole map without locking and always see complete
/// snapshots. Writers go through `rcu`, so concurrent poll and command
/// updates never lose each other's writes.
pub struct EntityStateCache {
    entries: ArcSwap<BTreeMap<String, CacheEntry>>,
}

impl EntityStateCache {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::new(Arc::default()),
        }
    }

    /// Current snapshot of `device_id`, or `None` if it was never polled.
    pub fn get(&self, device_id: &str) -> Option<Arc<Snapshot>> {
        self.entries
            .load()
            .get(device_id)
            .map(|e| e.snapshot.clone())
    }

    pub fn entry(&self, device_id: &str) -> Option<CacheEntry> {
        self.entries.load().get(device_id).cloned()
    }

    /// Every cached entry, as of one instant.
    pub fn entries(&self) -> Arc<BTreeMap<String, CacheEntry>> {
        self.entries.load_full()
    }

    /// Replace the snapshot of `device_id` and clear its staleness.
    pub fn put(&self, device_id: &str, snapshot: impl Into<Arc<Snapshot>>) {
        let snapshot = snapshot.into();
        self.entries.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.insert(
                device_id.to_string(),
                CacheEntry {
                    snapshot: snapshot.clone(),
                    stale: false,
                    missed_polls: 0,
                },
            );
            next
        });
    }

    /// Flag the entry as stale without touching its snapshot. Returns false
    /// when there is nothing cached for the device.
    pub fn mark_stale(&self, device_id: &str) -> bool {
        let mut found = false;
        self.entries.rcu(|current| {
            found = false;
            let mut next = BTreeMap::clone(current);
            if let Some(entry) = next.get_mut(device_id) {
                entry.stale = true;
                found = true;
            }
            next
        });
        found
    }

    /// Count a failed poll. Returns the number of consecutive misses, or
    /// `None` when there is nothing cached for the device.
    pub fn record_miss(&self, device_id: &str) -> Option<u32> {
        let mut missed = None;
        self.entries.rcu(|current| {
            missed = None;
            let mut next = BTreeMap::clone(current);
            if let Some(entry) = next.get_mut(device_id) {
                entry.missed_polls = entry.missed_polls.saturating_add(1);
                missed = Some(entry.missed_polls);
            }
            next
        });
        missed
    }

    /// Replace the snapshot of an already cached device with `f(current)`.
    ///
    /// Staleness is left as it is. `f` may run more than once under
    /// contention and must be pure. Returns false when nothing is cached.
    pub fn update<F>(&self, device_id: &str, f: F) -> bool
    where
        F: Fn(&Snapshot) -> Snapshot,
    {
        let mut found = false;
        self.entries.rcu(|current| {
            found = false;
            let mut next = BTreeMap::clone(current);
            if let Some(entry) = next.get_mut(device_id) {
                entry.snapshot = Arc::new(f(&entry.snapshot));
                found = true;
            }
            next
        });
        found
    }

    /// Drop every device not in `keep`. Returns the removed ids.
    pub fn retain(&self, keep: &BTreeSet<String>) -> Vec<String> {
        let mut removed = Vec::new();
        self.entries.rcu(|current| {
            removed.clear();
            let mut next = BTreeMap::clone(current);
            next.retain(|id, _| {
                let kept = keep.contains(id);
                if !kept {
                    removed.push(id.clone());
                }
                kept
            });
            next
        });
        removed
    }
}

impl Default for EntityStateCache {
    fn default() -> Self {
        Self::new()
    }
}
