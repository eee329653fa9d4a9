//! Reconciliation: rebuilds a representative's cached aggregate from source rows.
//!
//! Design:
//!   - Repair first: trim over-coverage, re-derive invoice statuses and
//!     payment flags from the allocation ledger
//!   - Snapshot = pure function of invoices, payments and allocations
//!   - Cached total_debt / total_sales / credit = full overwrite from the
//!     snapshot, never an increment
//!   - The whole read-repair-write sequence runs in one IMMEDIATE transaction
//!     under the representative's lock
//!
//! Running it twice with no mutation in between yields zero deltas.

use crate::{
    cache::SnapshotCache,
    error::LedgerResult,
    event::LedgerEvent,
    locks::RepresentativeLocks,
    snapshot::FinancialSnapshot,
    store::LedgerStore,
    types::{InvoiceStatus, RepresentativeId},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateChanges {
    pub previous_debt: i64,
    pub new_debt: i64,
    pub previous_credit: i64,
    pub new_credit: i64,
    pub previous_total_sales: i64,
    pub new_total_sales: i64,
}

impl AggregateChanges {
    pub fn is_unchanged(&self) -> bool {
        self.previous_debt == self.new_debt
            && self.previous_credit == self.new_credit
            && self.previous_total_sales == self.new_total_sales
    }
}

/// What the repair step had to correct.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub statuses_changed: usize,
    pub released_amount: i64,
    pub payments_updated: usize,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.statuses_changed == 0 && self.released_amount == 0 && self.payments_updated == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResult {
    pub success: bool,
    pub representative_id: RepresentativeId,
    pub snapshot: FinancialSnapshot,
    pub changes: AggregateChanges,
    /// Integrity score of the ledger as found, before repair.
    pub previous_integrity_score: i64,
    pub repairs: RepairReport,
}

impl ReconcileResult {
    pub fn integrity_improvement(&self) -> i64 {
        self.snapshot.integrity_score - self.previous_integrity_score
    }
}

pub struct Reconciler<'a> {
    store: &'a LedgerStore,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a LedgerStore) -> Self {
        Self { store }
    }

    /// Repair, recompute and overwrite the cached aggregate for one representative.
    /// The caller holds the representative's lock.
    pub fn reconcile(&self, representative_id: &str) -> LedgerResult<ReconcileResult> {
        let tx = self.store.begin_write()?;
        let result = self.reconcile_in_tx(representative_id)?;
        tx.commit()?;
        Ok(result)
    }

    /// Same as `reconcile`, inside a write transaction the caller already
    /// holds. Nothing is visible until that transaction commits.
    pub fn reconcile_in_tx(&self, representative_id: &str) -> LedgerResult<ReconcileResult> {
        let rep = self.store.get_representative(representative_id)?;
        let before = FinancialSnapshot::load(self.store, representative_id)?;
        let repairs = self.repair_in_tx(representative_id)?;
        let snapshot = FinancialSnapshot::load(self.store, representative_id)?;

        let reconciled_at = chrono::Utc::now().to_rfc3339();
        self.store.write_cached_aggregate(
            representative_id,
            snapshot.standard_debt,
            snapshot.standard_total_sales,
            snapshot.standard_credit,
            &reconciled_at,
        )?;

        let changes = AggregateChanges {
            previous_debt: rep.total_debt,
            new_debt: snapshot.standard_debt,
            previous_credit: rep.credit,
            new_credit: snapshot.standard_credit,
            previous_total_sales: rep.total_sales,
            new_total_sales: snapshot.standard_total_sales,
        };

        self.store.record(&LedgerEvent::Reconciled {
            representative_id: representative_id.to_string(),
            previous_debt: changes.previous_debt,
            new_debt: changes.new_debt,
            previous_credit: changes.previous_credit,
            new_credit: changes.new_credit,
            integrity_score: snapshot.integrity_score,
        })?;

        log::debug!(
            "reconciled {representative_id}: debt {} -> {}, credit {} -> {}, score {}",
            changes.previous_debt,
            changes.new_debt,
            changes.previous_credit,
            changes.new_credit,
            snapshot.integrity_score
        );

        Ok(ReconcileResult {
            success: true,
            representative_id: representative_id.to_string(),
            previous_integrity_score: before.integrity_score,
            snapshot,
            changes,
            repairs,
        })
    }

    /// Bring invoice statuses and payment flags back in line with the
    /// allocation ledger. Expects an open write transaction.
    pub fn repair_in_tx(&self, representative_id: &str) -> LedgerResult<RepairReport> {
        let mut report = RepairReport::default();

        for inv in self.store.list_invoices_with_coverage(representative_id)? {
            let mut covered = inv.covered;

            // Over-coverage: release the newest allocations first.
            if covered > inv.amount {
                let mut excess = covered - inv.amount;
                for alloc in self.store.list_allocations_for_invoice(&inv.invoice_id)? {
                    if excess <= 0 {
                        break;
                    }
                    let take = excess.min(alloc.amount);
                    self.store
                        .shrink_allocation(alloc.allocation_id, alloc.amount - take)?;
                    excess -= take;
                    report.released_amount += take;
                    self.store.record(&LedgerEvent::AllocationReleased {
                        representative_id: representative_id.to_string(),
                        invoice_id: inv.invoice_id.clone(),
                        amount: take,
                    })?;
                }
                covered = inv.amount;
            }

            let derived = InvoiceStatus::derive(inv.amount, covered, inv.status);
            if derived != inv.status {
                self.store.update_invoice_status(&inv.invoice_id, derived)?;
                self.store.record(&LedgerEvent::InvoiceStatusRepaired {
                    representative_id: representative_id.to_string(),
                    invoice_id: inv.invoice_id.clone(),
                    from: inv.status,
                    to: derived,
                })?;
                report.statuses_changed += 1;
            }
        }

        for payment in self.store.list_payments(representative_id)? {
            let allocations = self.store.list_allocations_for_payment(&payment.payment_id)?;
            let allocated = !allocations.is_empty();
            let invoice_id = allocations.first().map(|a| a.invoice_id.clone());
            if payment.allocated != allocated || payment.invoice_id != invoice_id {
                self.store
                    .set_payment_allocation(&payment.payment_id, allocated, invoice_id.as_deref())?;
                report.payments_updated += 1;
            }
        }

        if !report.is_clean() {
            log::debug!("repaired {representative_id}: {report:?}");
        }
        Ok(report)
    }
}

/// Reconcile under the representative's lock and invalidate its cached
/// snapshot. A conflict (lock timeout or busy store) is retried once;
/// a second conflict is returned to the caller as transient.
pub fn reconcile_serialized(
    store: &LedgerStore,
    locks: &RepresentativeLocks,
    cache: &SnapshotCache,
    representative_id: &str,
) -> LedgerResult<ReconcileResult> {
    let attempt = || {
        let result = locks
            .with_lock(representative_id, || Reconciler::new(store).reconcile(representative_id))
            .map_err(|e| e.into_conflict(representative_id));
        if result.is_ok() {
            cache.invalidate(representative_id);
        }
        result
    };

    match attempt() {
        Err(e) if e.is_transient() => {
            log::warn!("reconcile {representative_id} conflicted ({e}), retrying once");
            attempt()
        }
        other => other,
    }
}

/// Run a mutation and the reconcile it triggers in one IMMEDIATE
/// transaction, committed once. The caller holds the lock. If either step
/// fails the transaction rolls back and neither the write nor the cached
/// aggregate changes.
pub(crate) fn write_and_reconcile<T>(
    store: &LedgerStore,
    cache: &SnapshotCache,
    representative_id: &str,
    mutation: impl FnOnce() -> LedgerResult<T>,
) -> LedgerResult<(T, ReconcileResult)> {
    cache.invalidate(representative_id);
    let tx = store.begin_write()?;
    let output = mutation()?;
    let result = Reconciler::new(store).reconcile_in_tx(representative_id)?;
    tx.commit()?;
    cache.invalidate(representative_id);
    Ok((output, result))
}
