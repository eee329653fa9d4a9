//! Read-through snapshot cache keyed by representative.
//!
//! Entries expire after a short TTL, but expiry is only a backstop:
//! every write path calls `invalidate` for the representative it touched.
//! A per-key generation counter stops a load that started before an
//! invalidation from re-inserting its now-stale result.

use crate::{error::LedgerResult, snapshot::FinancialSnapshot, store::LedgerStore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Slot {
    generation: u64,
    cached: Option<(Instant, FinancialSnapshot)>,
}

pub struct SnapshotCache {
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl SnapshotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// A fresh cached snapshot, if there is one.
    pub fn get(&self, representative_id: &str) -> Option<FinancialSnapshot> {
        let slots = self.slots.lock();
        let (at, snapshot) = slots.get(representative_id)?.cached.as_ref()?;
        (at.elapsed() < self.ttl).then(|| snapshot.clone())
    }

    /// Return the cached snapshot or compute and cache a new one.
    pub fn get_or_load(
        &self,
        store: &LedgerStore,
        representative_id: &str,
    ) -> LedgerResult<FinancialSnapshot> {
        if let Some(hit) = self.get(representative_id) {
            return Ok(hit);
        }
        let generation = self.generation(representative_id);
        let snapshot = FinancialSnapshot::load(store, representative_id)?;
        self.insert_if_current(representative_id, generation, snapshot.clone());
        Ok(snapshot)
    }

    pub fn invalidate(&self, representative_id: &str) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(representative_id.to_string()).or_insert(Slot {
            generation: 0,
            cached: None,
        });
        slot.generation += 1;
        slot.cached = None;
        log::debug!("snapshot cache invalidated for {representative_id}");
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| matches!(&s.cached, Some((at, _)) if at.elapsed() < self.ttl))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn generation(&self, representative_id: &str) -> u64 {
        self.slots
            .lock()
            .get(representative_id)
            .map_or(0, |s| s.generation)
    }

    fn insert_if_current(&self, representative_id: &str, generation: u64, snapshot: FinancialSnapshot) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(representative_id.to_string()).or_insert(Slot {
            generation: 0,
            cached: None,
        });
        if slot.generation == generation {
            slot.cached = Some((Instant::now(), snapshot));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LedgerTotalsRow;

    fn snap(id: &str, debt: i64) -> FinancialSnapshot {
        let mut s = FinancialSnapshot::from_totals(id, &LedgerTotalsRow::default());
        s.standard_debt = debt;
        s
    }

    #[test]
    fn invalidate_drops_entry() {
        let cache = SnapshotCache::new(Duration::from_secs(30));
        cache.insert_if_current("r1", 0, snap("r1", 10));
        assert_eq!(cache.get("r1").map(|s| s.standard_debt), Some(10));
        cache.invalidate("r1");
        assert!(cache.get("r1").is_none());
    }

    #[test]
    fn load_racing_an_invalidation_is_not_cached() {
        let cache = SnapshotCache::new(Duration::from_secs(30));
        let generation = cache.generation("r1");
        // A write lands while the load is in flight.
        cache.invalidate("r1");
        cache.insert_if_current("r1", generation, snap("r1", 10));
        assert!(cache.get("r1").is_none(), "stale load must not be cached");
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = SnapshotCache::new(Duration::ZERO);
        cache.insert_if_current("r1", 0, snap("r1", 10));
        assert!(cache.get("r1").is_none());
        assert!(cache.is_empty());
    }
}
