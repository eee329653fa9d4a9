//! System sweep: batch reconciliation across representatives.
//!
//! Best-effort: a failing representative is logged, counted and skipped;
//! the sweep carries on. File-backed stores are swept by a bounded pool
//! of worker threads, each with its own connection, pulling ids from a
//! shared queue. In-memory stores have a single connection and are swept
//! sequentially.

use crate::{
    cache::SnapshotCache,
    error::LedgerResult,
    event::LedgerEvent,
    locks::RepresentativeLocks,
    reconciliation::{reconcile_serialized, ReconcileResult},
    store::LedgerStore,
    types::RepresentativeId,
};
use crossbeam::channel;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepFilter {
    All,
    ActiveOnly,
    Representatives(Vec<RepresentativeId>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepFailure {
    pub representative_id: RepresentativeId,
    pub cause: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub total_reconciled: usize,
    /// Representatives whose integrity score strictly increased.
    pub total_fixed: usize,
    pub total_failed: usize,
    /// Mean score gain over the fixed representatives only.
    pub average_integrity_score_improvement: f64,
    pub execution_time_ms: u64,
    pub failures: Vec<SweepFailure>,
}

type Outcome = (RepresentativeId, LedgerResult<ReconcileResult>);

pub struct SweepCoordinator<'a> {
    store: &'a LedgerStore,
    locks: &'a RepresentativeLocks,
    cache: &'a SnapshotCache,
    workers: usize,
}

impl<'a> SweepCoordinator<'a> {
    pub fn new(
        store: &'a LedgerStore,
        locks: &'a RepresentativeLocks,
        cache: &'a SnapshotCache,
        workers: usize,
    ) -> Self {
        Self {
            store,
            locks,
            cache,
            workers: workers.max(1),
        }
    }

    pub fn run(&self, filter: &SweepFilter) -> LedgerResult<SweepSummary> {
        let started = Instant::now();
        let targets = self.targets(filter)?;

        let mut outcomes = if self.store.is_shared() && self.workers > 1 && targets.len() > 1 {
            self.run_pool(&targets)?
        } else {
            self.run_sequential(&targets)
        };
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));

        let summary = summarize(outcomes, started.elapsed().as_millis() as u64);

        self.store.record(&LedgerEvent::SweepCompleted {
            total_reconciled: summary.total_reconciled,
            total_fixed: summary.total_fixed,
            total_failed: summary.total_failed,
        })?;

        log::info!(
            "sweep: {} reconciled, {} fixed, {} failed in {}ms",
            summary.total_reconciled,
            summary.total_fixed,
            summary.total_failed,
            summary.execution_time_ms
        );

        Ok(summary)
    }

    fn targets(&self, filter: &SweepFilter) -> LedgerResult<Vec<RepresentativeId>> {
        match filter {
            SweepFilter::All => self.store.list_representative_ids(false),
            SweepFilter::ActiveOnly => self.store.list_representative_ids(true),
            SweepFilter::Representatives(ids) => {
                let mut seen = HashSet::new();
                Ok(ids
                    .iter()
                    .filter(|id| seen.insert(id.as_str()))
                    .cloned()
                    .collect())
            }
        }
    }

    fn run_sequential(&self, targets: &[RepresentativeId]) -> Vec<Outcome> {
        targets
            .iter()
            .map(|id| {
                let result = reconcile_serialized(self.store, self.locks, self.cache, id);
                (id.clone(), result)
            })
            .collect()
    }

    fn run_pool(&self, targets: &[RepresentativeId]) -> LedgerResult<Vec<Outcome>> {
        let worker_count = self.workers.min(targets.len());
        // Connections are opened up front so a store that cannot be reached
        // fails the sweep instead of every item.
        let connections = (0..worker_count)
            .map(|_| self.store.reopen())
            .collect::<LedgerResult<Vec<_>>>()?;

        let (job_tx, job_rx) = channel::unbounded::<RepresentativeId>();
        for id in targets {
            if job_tx.send(id.clone()).is_err() {
                break;
            }
        }
        drop(job_tx);

        let (out_tx, out_rx) = channel::unbounded::<Outcome>();
        let locks = self.locks;
        let cache = self.cache;

        std::thread::scope(|s| {
            for conn in connections {
                let job_rx = job_rx.clone();
                let out_tx = out_tx.clone();
                s.spawn(move || {
                    for id in job_rx.iter() {
                        let result = reconcile_serialized(&conn, locks, cache, &id);
                        if out_tx.send((id, result)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(out_tx);

        Ok(out_rx.iter().collect())
    }
}

fn summarize(outcomes: Vec<Outcome>, execution_time_ms: u64) -> SweepSummary {
    let mut total_reconciled = 0;
    let mut improvements = Vec::new();
    let mut failures = Vec::new();

    for (id, outcome) in outcomes {
        match outcome {
            Ok(result) => {
                total_reconciled += 1;
                let gain = result.integrity_improvement();
                if gain > 0 {
                    improvements.push(gain);
                }
            }
            Err(e) => {
                log::warn!("sweep: representative {id} failed: {e}");
                failures.push(SweepFailure {
                    representative_id: id,
                    cause: e.to_string(),
                });
            }
        }
    }

    let average_integrity_score_improvement = if improvements.is_empty() {
        0.0
    } else {
        improvements.iter().sum::<i64>() as f64 / improvements.len() as f64
    };

    SweepSummary {
        total_reconciled,
        total_fixed: improvements.len(),
        total_failed: failures.len(),
        average_integrity_score_improvement,
        execution_time_ms,
        failures,
    }
}
