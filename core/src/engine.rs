//! The ledger engine, the single entry point for the CRUD layer and tools.
//!
//! RULES:
//!   - Every write for a representative runs under that representative's lock.
//!   - Every write and the reconcile it triggers share one IMMEDIATE
//!     transaction, so the cached aggregate is refreshed synchronously on
//!     every mutation and a failed reconcile leaves no write behind.
//!   - Reads go through the snapshot cache; nothing reads the cached
//!     aggregate columns to answer "current debt".
//!   - Failures propagate. The only fallback is the opt-in degraded read.

use crate::{
    allocation::{AllocationResult, FifoAllocator},
    cache::SnapshotCache,
    config::EngineConfig,
    error::{LedgerError, LedgerResult},
    event::{EventLogEntry, LedgerEvent},
    locks::RepresentativeLocks,
    problems::{ProblemDetector, ProblemReport},
    reconciliation::{reconcile_serialized, write_and_reconcile, ReconcileResult, Reconciler},
    snapshot::FinancialSnapshot,
    store::{InvoiceRow, LedgerStore, PaymentRow, RepresentativeRow},
    sweep::{SweepCoordinator, SweepFilter, SweepSummary},
    types::{Amount, InvoiceId, InvoiceStatus, PaymentId, RepresentativeId},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A new invoice as handed over by the CRUD layer.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub invoice_id: Option<InvoiceId>,
    pub representative_id: RepresentativeId,
    pub amount: i64,
    pub issue_date: NaiveDate,
}

impl NewInvoice {
    pub fn new(representative_id: &str, amount: i64, issue_date: NaiveDate) -> Self {
        Self {
            invoice_id: None,
            representative_id: representative_id.to_string(),
            amount,
            issue_date,
        }
    }

    pub fn with_id(mut self, invoice_id: &str) -> Self {
        self.invoice_id = Some(invoice_id.to_string());
        self
    }
}

/// A new payment. With `invoice_id` set the payment is applied to that
/// invoice only; otherwise, when `allocate` is set, it goes through FIFO.
/// Targeting an invoice while clearing `allocate` is rejected.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub payment_id: Option<PaymentId>,
    pub representative_id: RepresentativeId,
    pub amount: i64,
    pub payment_date: NaiveDate,
    pub invoice_id: Option<InvoiceId>,
    pub allocate: bool,
}

impl NewPayment {
    pub fn new(representative_id: &str, amount: i64, payment_date: NaiveDate) -> Self {
        Self {
            payment_id: None,
            representative_id: representative_id.to_string(),
            amount,
            payment_date,
            invoice_id: None,
            allocate: true,
        }
    }

    pub fn with_id(mut self, payment_id: &str) -> Self {
        self.payment_id = Some(payment_id.to_string());
        self
    }

    pub fn for_invoice(mut self, invoice_id: &str) -> Self {
        self.invoice_id = Some(invoice_id.to_string());
        self
    }

    /// Record the payment as credit without running the allocator.
    pub fn unallocated(mut self) -> Self {
        self.allocate = false;
        self
    }
}

/// A snapshot read that may have been served from the cached aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRead {
    pub snapshot: FinancialSnapshot,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConsistency {
    pub representatives_checked: usize,
    /// Sum of per-representative `standardDebt`.
    pub sum_representative_debt: i64,
    /// The same figure computed as one store-wide aggregate.
    pub global_debt: i64,
    pub discrepancy: i64,
    /// Sum of the cached `total_debt` column, for drift reporting.
    pub cached_debt_total: i64,
}

impl GlobalConsistency {
    pub fn is_consistent(&self) -> bool {
        self.discrepancy == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverdueReport {
    pub invoices_marked: Vec<InvoiceId>,
    pub representatives_reconciled: usize,
}

pub struct LedgerEngine {
    pub store: LedgerStore,
    config: EngineConfig,
    locks: RepresentativeLocks,
    cache: SnapshotCache,
}

impl LedgerEngine {
    pub fn new(mut store: LedgerStore, config: EngineConfig) -> LedgerResult<Self> {
        store.set_busy_timeout(config.store_busy_timeout())?;
        Ok(Self {
            locks: RepresentativeLocks::new(config.lock_timeout()),
            cache: SnapshotCache::new(config.cache_ttl()),
            store,
            config,
        })
    }

    /// Open (or create) a database file and apply migrations.
    pub fn open(path: &str, config: EngineConfig) -> LedgerResult<Self> {
        let store = LedgerStore::open(path)?;
        store.migrate()?;
        Self::new(store, config)
    }

    /// Fresh migrated in-memory engine (used in tests).
    pub fn in_memory(config: EngineConfig) -> LedgerResult<Self> {
        let store = LedgerStore::in_memory()?;
        store.migrate()?;
        Self::new(store, config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Onboarding ─────────────────────────────────────────────

    pub fn create_representative(&self, code: &str, name: &str) -> LedgerResult<RepresentativeId> {
        let id = uuid::Uuid::new_v4().to_string();
        self.create_representative_with_id(&id, code, name)?;
        Ok(id)
    }

    pub fn create_representative_with_id(&self, id: &str, code: &str, name: &str) -> LedgerResult<()> {
        if id.trim().is_empty() || code.trim().is_empty() {
            return Err(LedgerError::validation("representative id and code are required"));
        }
        self.store.insert_representative(&RepresentativeRow {
            representative_id: id.to_string(),
            code: code.to_string(),
            name: name.to_string(),
            active: true,
            total_debt: 0,
            total_sales: 0,
            credit: 0,
            reconciled_at: None,
        })?;
        log::debug!("representative {id} ({code}) created");
        Ok(())
    }

    pub fn set_representative_active(&self, id: &str, active: bool) -> LedgerResult<()> {
        self.store.set_representative_active(id, active)
    }

    pub fn representative(&self, id: &str) -> LedgerResult<RepresentativeRow> {
        self.store.get_representative(id)
    }

    // ── Invoice triggers ───────────────────────────────────────

    pub fn create_invoice(&self, new: NewInvoice) -> LedgerResult<InvoiceId> {
        let amount = Amount::new(new.amount)?;
        let rep_id = new.representative_id;
        self.store.get_representative(&rep_id)?;
        let invoice_id = new
            .invoice_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        self.write(&rep_id, || {
            self.store.insert_invoice(&InvoiceRow {
                invoice_id: invoice_id.clone(),
                representative_id: rep_id.clone(),
                amount: amount.get(),
                issue_date: new.issue_date,
                status: InvoiceStatus::Unpaid,
            })
        })?;

        Ok(invoice_id)
    }

    /// Change an invoice amount, then repair coverage and re-run every
    /// payment with an unplaced remainder through the allocator.
    pub fn update_invoice_amount(&self, invoice_id: &str, amount: i64) -> LedgerResult<ReconcileResult> {
        let amount = Amount::new(amount)?;
        let rep_id = self.store.get_invoice(invoice_id)?.representative_id;

        let ((), result) = self.write(&rep_id, || {
            self.store.update_invoice_amount(invoice_id, amount.get())?;
            Reconciler::new(&self.store).repair_in_tx(&rep_id)?;
            FifoAllocator::new(&self.store).reallocate_in_tx(&rep_id)?;
            Ok(())
        })?;
        Ok(result)
    }

    pub fn delete_invoice(&self, invoice_id: &str) -> LedgerResult<ReconcileResult> {
        let rep_id = self.store.get_invoice(invoice_id)?.representative_id;

        let ((), result) = self.write(&rep_id, || self.store.delete_invoice(invoice_id))?;
        Ok(result)
    }

    pub fn invoices(&self, representative_id: &str) -> LedgerResult<Vec<InvoiceRow>> {
        self.store.list_invoices(representative_id)
    }

    // ── Payment triggers ───────────────────────────────────────

    /// Record a payment and, depending on the request, allocate it.
    pub fn record_payment(&self, new: NewPayment) -> LedgerResult<AllocationResult> {
        let amount = Amount::new(new.amount)?;
        if new.invoice_id.is_some() && !new.allocate {
            return Err(LedgerError::validation(
                "a payment aimed at an invoice cannot also be left unallocated",
            ));
        }

        let rep_id = new.representative_id.clone();
        self.store.get_representative(&rep_id)?;
        let payment_id = new
            .payment_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let (result, _) = self.write(&rep_id, || {
            self.store.insert_payment(&PaymentRow {
                payment_id: payment_id.clone(),
                representative_id: rep_id.clone(),
                amount: amount.get(),
                payment_date: new.payment_date,
                allocated: false,
                invoice_id: None,
            })?;

            let allocator = FifoAllocator::new(&self.store);
            match (&new.invoice_id, new.allocate) {
                (Some(target), _) => allocator.allocate_to_invoice_in_tx(&payment_id, target),
                (None, true) => allocator.allocate_payment_in_tx(&payment_id),
                (None, false) => Ok(AllocationResult {
                    representative_id: rep_id.clone(),
                    payment_id: payment_id.clone(),
                    actions: Vec::new(),
                    applied: 0,
                    remaining_unallocated: amount.get(),
                }),
            }
        })?;
        Ok(result)
    }

    /// Delete a payment. Invoices it funded revert on the reconcile that follows.
    pub fn delete_payment(&self, payment_id: &str) -> LedgerResult<ReconcileResult> {
        let rep_id = self.store.get_payment(payment_id)?.representative_id;

        let ((), result) = self.write(&rep_id, || self.store.delete_payment(payment_id))?;
        Ok(result)
    }

    pub fn payments(&self, representative_id: &str) -> LedgerResult<Vec<PaymentRow>> {
        self.store.list_payments(representative_id)
    }

    // ── Allocation ─────────────────────────────────────────────

    /// Record a new payment of `amount` dated today and allocate it FIFO.
    pub fn allocate(&self, representative_id: &str, amount: i64) -> LedgerResult<AllocationResult> {
        self.allocate_on(representative_id, amount, chrono::Utc::now().date_naive())
    }

    pub fn allocate_on(
        &self,
        representative_id: &str,
        amount: i64,
        payment_date: NaiveDate,
    ) -> LedgerResult<AllocationResult> {
        self.record_payment(NewPayment::new(representative_id, amount, payment_date))
    }

    /// Run an existing payment's unplaced remainder through the allocator.
    pub fn allocate_payment(&self, payment_id: &str) -> LedgerResult<AllocationResult> {
        let rep_id = self.store.get_payment(payment_id)?.representative_id;

        let (result, _) = self.write(&rep_id, || {
            FifoAllocator::new(&self.store).allocate_payment_in_tx(payment_id)
        })?;
        Ok(result)
    }

    pub fn reallocate(&self, representative_id: &str) -> LedgerResult<Vec<AllocationResult>> {
        self.store.get_representative(representative_id)?;

        let (results, _) = self.write(representative_id, || {
            FifoAllocator::new(&self.store).reallocate_in_tx(representative_id)
        })?;
        Ok(results)
    }

    // ── Snapshot / reconcile ───────────────────────────────────

    pub fn snapshot(&self, representative_id: &str) -> LedgerResult<FinancialSnapshot> {
        self.cache.get_or_load(&self.store, representative_id)
    }

    /// Fresh snapshot, or (only with `degraded_mode` enabled) one rebuilt
    /// from the cached aggregate and marked stale. Unknown representatives
    /// are never masked.
    pub fn snapshot_or_last_known(&self, representative_id: &str) -> LedgerResult<SnapshotRead> {
        match self.snapshot(representative_id) {
            Ok(snapshot) => Ok(SnapshotRead { snapshot, stale: false }),
            Err(e @ LedgerError::NotFound { .. }) => Err(e),
            Err(e) if self.config.degraded_mode => match self.store.find_representative(representative_id) {
                Ok(Some(rep)) => {
                    log::warn!(
                        "degraded read for {representative_id}: serving cached aggregate ({e})"
                    );
                    Ok(SnapshotRead {
                        snapshot: FinancialSnapshot::from_cached_aggregate(&rep),
                        stale: true,
                    })
                }
                _ => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    pub fn reconcile(&self, representative_id: &str) -> LedgerResult<ReconcileResult> {
        reconcile_serialized(&self.store, &self.locks, &self.cache, representative_id)
    }

    // ── Batch ──────────────────────────────────────────────────

    pub fn sweep(&self, filter: &SweepFilter) -> LedgerResult<SweepSummary> {
        SweepCoordinator::new(&self.store, &self.locks, &self.cache, self.config.sweep_workers)
            .run(filter)
    }

    pub fn problematic(&self) -> LedgerResult<ProblemReport> {
        ProblemDetector::new(&self.store, &self.cache, self.config.low_integrity_threshold).detect()
    }

    /// Compare the sum of per-representative debt with the store-wide
    /// aggregate. Read-only; a non-zero discrepancy means a sweep is due.
    pub fn verify_global_consistency(&self) -> LedgerResult<GlobalConsistency> {
        let ids = self.store.list_representative_ids(false)?;
        let mut sum_representative_debt = 0;
        for id in &ids {
            sum_representative_debt += FinancialSnapshot::load(&self.store, id)?.standard_debt;
        }
        let global_debt = self.store.global_outstanding()?;
        let result = GlobalConsistency {
            representatives_checked: ids.len(),
            sum_representative_debt,
            global_debt,
            discrepancy: sum_representative_debt - global_debt,
            cached_debt_total: self.store.sum_cached_debt()?,
        };
        if !result.is_consistent() {
            log::warn!(
                "global debt discrepancy {}: representatives {} vs aggregate {}",
                result.discrepancy,
                result.sum_representative_debt,
                result.global_debt
            );
        }
        Ok(result)
    }

    /// Ageing pass: unpaid invoices issued more than `overdue_after_days`
    /// before `as_of` become overdue; their representatives are reconciled.
    pub fn mark_overdue(&self, as_of: NaiveDate) -> LedgerResult<OverdueReport> {
        let days = self.config.overdue_after_days;
        let cutoff = chrono::Duration::try_days(days)
            .filter(|_| days >= 0)
            .and_then(|window| as_of.checked_sub_signed(window))
            .ok_or_else(|| {
                LedgerError::validation(format!(
                    "overdue window of {days} days cannot be applied to {as_of}"
                ))
            })?;
        let mut by_rep: BTreeMap<RepresentativeId, Vec<InvoiceId>> = BTreeMap::new();
        for inv in self.store.list_unpaid_issued_before(cutoff)? {
            by_rep.entry(inv.representative_id).or_default().push(inv.invoice_id);
        }

        let mut report = OverdueReport::default();
        for (rep_id, invoice_ids) in by_rep {
            let (marked, _) = self.write(&rep_id, || {
                let mut marked = Vec::new();
                for invoice_id in invoice_ids {
                    // Re-read under the lock: a payment may have landed since the scan.
                    let inv = self.store.get_invoice(&invoice_id)?;
                    if inv.status != InvoiceStatus::Unpaid {
                        continue;
                    }
                    self.store.update_invoice_status(&invoice_id, InvoiceStatus::Overdue)?;
                    self.store.record(&LedgerEvent::InvoiceOverdue {
                        representative_id: rep_id.clone(),
                        invoice_id: invoice_id.clone(),
                    })?;
                    marked.push(invoice_id);
                }
                Ok(marked)
            })?;
            report.invoices_marked.extend(marked);
            report.representatives_reconciled += 1;
        }

        log::info!(
            "overdue pass as of {as_of}: {} invoices across {} representatives",
            report.invoices_marked.len(),
            report.representatives_reconciled
        );
        Ok(report)
    }

    pub fn events_for(&self, representative_id: &str) -> LedgerResult<Vec<EventLogEntry>> {
        self.store.events_for_representative(representative_id)
    }

    /// Run a mutation and its reconcile under the representative's lock, in
    /// one transaction. A store that stays busy past its timeout surfaces as
    /// a conflict, same as a lock timeout.
    fn write<T>(
        &self,
        representative_id: &str,
        mutation: impl FnOnce() -> LedgerResult<T>,
    ) -> LedgerResult<(T, ReconcileResult)> {
        self.locks
            .with_lock(representative_id, || {
                write_and_reconcile(&self.store, &self.cache, representative_id, mutation)
            })
            .map_err(|e| e.into_conflict(representative_id))
    }
}
