//! Per-representative write serialization.
//!
//! Every read-then-write sequence for one representative runs inside
//! `with_lock`. Different representatives never contend.
//!
//! The registry belongs to one engine. An engine owns a single SQLite
//! connection and is not `Sync`, so inside one process the registry is
//! only contended by the sweep workers, which share their engine's
//! registry. Separate engines and processes are serialized by the store
//! instead: every write runs in an IMMEDIATE transaction.
//!
//! An entry lives only while some caller holds or waits on it; the last
//! one out removes it, so the map does not grow with every representative
//! ever touched.

use crate::error::{LedgerError, LedgerResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct RepresentativeLocks {
    timeout: Duration,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RepresentativeLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` while holding the representative's lock. If another writer
    /// holds it past the timeout, fails with `ConcurrencyConflict`.
    pub fn with_lock<T>(
        &self,
        representative_id: &str,
        f: impl FnOnce() -> LedgerResult<T>,
    ) -> LedgerResult<T> {
        let lock = self.lock_for(representative_id);
        let result = match lock.try_lock_for(self.timeout) {
            Some(_guard) => f(),
            None => Err(LedgerError::ConcurrencyConflict {
                representative_id: representative_id.to_string(),
            }),
        };
        self.release(representative_id, lock);
        result
    }

    /// Number of representatives with a live entry.
    pub fn tracked(&self) -> usize {
        self.locks.lock().len()
    }

    fn lock_for(&self, representative_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(representative_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn release(&self, representative_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock();
        // Clones are only handed out under the map lock, so a count of two
        // (the map and us) means nobody else holds or waits on it.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(representative_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn held_lock_times_out_as_conflict() {
        let locks = Arc::new(RepresentativeLocks::new(Duration::from_millis(20)));
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                locks
                    .with_lock("r1", || {
                        held_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(())
                    })
                    .unwrap();
            })
        };

        held_rx.recv().unwrap();
        let err = locks.with_lock("r1", || Ok(())).unwrap_err();
        assert!(matches!(err, LedgerError::ConcurrencyConflict { .. }));

        // Other representatives are unaffected.
        assert!(locks.with_lock("r2", || Ok(())).is_ok());

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(locks.with_lock("r1", || Ok(())).is_ok());
        assert_eq!(locks.tracked(), 0);
    }

    #[test]
    fn idle_entries_are_dropped() {
        let locks = RepresentativeLocks::new(Duration::from_millis(20));
        for i in 0..100 {
            locks.with_lock(&format!("r{i}"), || Ok(())).unwrap();
        }
        assert_eq!(locks.tracked(), 0);

        let inside = locks.with_lock("busy", || Ok(locks.tracked())).unwrap();
        assert_eq!(inside, 1, "held entry stays registered");
        assert_eq!(locks.tracked(), 0);
    }
}
