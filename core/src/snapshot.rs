//! Financial snapshot: the authoritative per-representative figures.
//!
//! A snapshot is derived entirely from invoice, payment and allocation
//! rows. It is never persisted as its own entity; the representative's
//! cached aggregate is a projection of it written by reconciliation.

use crate::{
    error::LedgerResult,
    store::{LedgerStore, LedgerTotalsRow, RepresentativeRow},
    types::RepresentativeId,
};
use serde::{Deserialize, Serialize};

pub const INTEGRITY_MAX: i64 = 100;
const EXCESS_PAYMENT_PENALTY: i64 = 50;
const RECONCILIATION_PENALTY: i64 = 25;
const UNALLOCATED_SHARE_PENALTY: i64 = 15;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialSnapshot {
    pub representative_id: RepresentativeId,
    pub invoice_count: i64,
    pub payment_count: i64,
    pub total_invoice_amount: i64,
    pub unpaid_invoice_amount: i64,
    pub paid_invoice_amount: i64,
    pub total_payment_amount: i64,
    pub allocated_payment_amount: i64,
    pub unallocated_payment_amount: i64,
    pub standard_debt: i64,
    pub standard_credit: i64,
    pub standard_total_sales: i64,
    pub integrity_score: i64,
    pub has_excess_payments: bool,
    pub needs_reconciliation: bool,
}

impl FinancialSnapshot {
    /// Read one representative's totals from the store and derive the snapshot.
    /// Fails with `NotFound` for an unknown representative.
    pub fn load(store: &LedgerStore, representative_id: &str) -> LedgerResult<Self> {
        store.get_representative(representative_id)?;
        let totals = store.ledger_totals(representative_id)?;
        Ok(Self::from_totals(representative_id, &totals))
    }

    /// Pure derivation from the raw sums.
    pub fn from_totals(representative_id: &str, t: &LedgerTotalsRow) -> Self {
        // Open invoices count in full; paid invoices count for what the
        // allocator actually placed on them.
        let unpaid = t.open_invoice_amount.saturating_add(t.paid_covered_amount);
        let allocated = t.allocated_payment_amount;
        let unallocated = t.total_payment_amount - allocated;

        let has_excess_payments = t.total_payment_amount > t.total_invoice_amount;
        let needs_reconciliation = has_excess_payments || unpaid < allocated;

        Self {
            representative_id: representative_id.to_string(),
            invoice_count: t.invoice_count,
            payment_count: t.payment_count,
            total_invoice_amount: t.total_invoice_amount,
            unpaid_invoice_amount: unpaid,
            paid_invoice_amount: t.paid_invoice_amount,
            total_payment_amount: t.total_payment_amount,
            allocated_payment_amount: allocated,
            unallocated_payment_amount: unallocated,
            standard_debt: (unpaid - allocated).max(0),
            standard_credit: unallocated,
            standard_total_sales: t.total_invoice_amount,
            integrity_score: integrity_score(
                has_excess_payments,
                needs_reconciliation,
                unallocated,
                t.total_invoice_amount,
            ),
            has_excess_payments,
            needs_reconciliation,
        }
    }

    /// Rebuild an approximate snapshot from the representative's cached
    /// aggregate. Only used by the explicit degraded read path; always
    /// flagged as needing reconciliation.
    pub fn from_cached_aggregate(rep: &RepresentativeRow) -> Self {
        let has_excess_payments = false;
        let needs_reconciliation = true;
        Self {
            representative_id: rep.representative_id.clone(),
            invoice_count: 0,
            payment_count: 0,
            total_invoice_amount: rep.total_sales,
            unpaid_invoice_amount: rep.total_debt,
            paid_invoice_amount: 0,
            total_payment_amount: rep.credit,
            allocated_payment_amount: 0,
            unallocated_payment_amount: rep.credit,
            standard_debt: rep.total_debt,
            standard_credit: rep.credit,
            standard_total_sales: rep.total_sales,
            integrity_score: integrity_score(
                has_excess_payments,
                needs_reconciliation,
                rep.credit,
                rep.total_sales,
            ),
            has_excess_payments,
            needs_reconciliation,
        }
    }
}

/// 100, minus 50 for excess payments, 25 when reconciliation is needed and
/// 15 when more than half the invoiced value sits unallocated. Floor 0.
pub fn integrity_score(
    has_excess_payments: bool,
    needs_reconciliation: bool,
    unallocated: i64,
    total_invoice: i64,
) -> i64 {
    let mut score = INTEGRITY_MAX;
    if has_excess_payments {
        score -= EXCESS_PAYMENT_PENALTY;
    }
    if needs_reconciliation {
        score -= RECONCILIATION_PENALTY;
    }
    // unallocated > 0.5 * total, widened so the doubling cannot overflow
    if i128::from(unallocated) * 2 > i128::from(total_invoice) {
        score -= UNALLOCATED_SHARE_PENALTY;
    }
    score.max(0)
}
