//! Problem detector: read-only classification of active representatives.

use crate::{
    cache::SnapshotCache,
    error::LedgerResult,
    snapshot::FinancialSnapshot,
    store::LedgerStore,
    types::RepresentativeId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemEntry {
    pub representative_id: RepresentativeId,
    pub code: String,
    pub name: String,
    pub snapshot: FinancialSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemReport {
    pub excess_payment_reps: Vec<ProblemEntry>,
    pub reconciliation_needed: Vec<ProblemEntry>,
    pub low_integrity_reps: Vec<ProblemEntry>,
    /// Distinct representatives across the three buckets.
    pub total_problematic_count: usize,
    pub representatives_checked: usize,
}

pub struct ProblemDetector<'a> {
    store: &'a LedgerStore,
    cache: &'a SnapshotCache,
    low_integrity_threshold: i64,
}

impl<'a> ProblemDetector<'a> {
    pub fn new(store: &'a LedgerStore, cache: &'a SnapshotCache, low_integrity_threshold: i64) -> Self {
        Self {
            store,
            cache,
            low_integrity_threshold,
        }
    }

    /// Bucket every active representative. Never writes.
    pub fn detect(&self) -> LedgerResult<ProblemReport> {
        let mut report = ProblemReport::default();
        let mut problematic = BTreeSet::new();

        for rep in self.store.list_representatives()? {
            if !rep.active {
                continue;
            }
            report.representatives_checked += 1;

            let snapshot = self.cache.get_or_load(self.store, &rep.representative_id)?;
            let entry = ProblemEntry {
                representative_id: rep.representative_id.clone(),
                code: rep.code,
                name: rep.name,
                snapshot,
            };

            let excess = entry.snapshot.has_excess_payments;
            let needs = entry.snapshot.needs_reconciliation;
            let low = entry.snapshot.integrity_score < self.low_integrity_threshold;

            if excess || needs || low {
                problematic.insert(rep.representative_id);
            }
            if excess {
                report.excess_payment_reps.push(entry.clone());
            }
            if needs {
                report.reconciliation_needed.push(entry.clone());
            }
            if low {
                report.low_integrity_reps.push(entry);
            }
        }

        report.total_problematic_count = problematic.len();
        log::debug!(
            "problems: {} of {} representatives flagged",
            report.total_problematic_count,
            report.representatives_checked
        );
        Ok(report)
    }
}
