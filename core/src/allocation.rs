//! FIFO payment allocator.
//!
//! Distributes a payment across a representative's outstanding invoices,
//! oldest issue date first (ties by invoice id), and records each placement
//! in the allocation ledger. Whatever cannot be placed stays unallocated
//! and counts as credit; it is never pushed onto a paid invoice.
//!
//! Callers hold the representative's lock and an open write transaction;
//! the allocator never commits on its own.

use crate::{
    error::{LedgerError, LedgerResult},
    event::LedgerEvent,
    store::{CoveredInvoiceRow, LedgerStore, PaymentRow},
    types::{InvoiceId, InvoiceStatus, PaymentId, RepresentativeId},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationAction {
    pub invoice_id: InvoiceId,
    pub amount_applied: i64,
    pub new_status: InvoiceStatus,
}

/// Output of the pure planning step.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllocationPlan {
    pub actions: Vec<AllocationAction>,
    pub remaining: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    pub representative_id: RepresentativeId,
    pub payment_id: PaymentId,
    pub actions: Vec<AllocationAction>,
    pub applied: i64,
    /// Part of the payment that is still unplaced after this run.
    pub remaining_unallocated: i64,
}

/// Plan the placement of `amount` over `invoices`.
///
/// Paid invoices and invoices with nothing left to cover are skipped.
/// The input order does not matter; invoices are visited by
/// (issue date, invoice id).
pub fn plan_fifo(invoices: &[CoveredInvoiceRow], amount: i64) -> AllocationPlan {
    let mut ordered: Vec<&CoveredInvoiceRow> =
        invoices.iter().filter(|inv| inv.status.is_open()).collect();
    ordered.sort_by(|a, b| {
        a.issue_date
            .cmp(&b.issue_date)
            .then_with(|| a.invoice_id.cmp(&b.invoice_id))
    });

    let mut remaining = amount.max(0);
    let mut actions = Vec::new();

    for inv in ordered {
        if remaining <= 0 {
            break;
        }
        let remainder = inv.amount - inv.covered;
        if remainder <= 0 {
            continue;
        }
        let applied = remaining.min(remainder);
        let new_status = if inv.covered + applied >= inv.amount {
            InvoiceStatus::Paid
        } else {
            InvoiceStatus::Partial
        };
        actions.push(AllocationAction {
            invoice_id: inv.invoice_id.clone(),
            amount_applied: applied,
            new_status,
        });
        remaining -= applied;
    }

    AllocationPlan { actions, remaining }
}

pub struct FifoAllocator<'a> {
    store: &'a LedgerStore,
}

impl<'a> FifoAllocator<'a> {
    pub fn new(store: &'a LedgerStore) -> Self {
        Self { store }
    }

    /// Run a stored payment's unplaced remainder through the allocator.
    pub fn allocate_payment_in_tx(&self, payment_id: &str) -> LedgerResult<AllocationResult> {
        let payment = self.store.get_payment(payment_id)?;
        let unplaced = self.unplaced(&payment)?;
        if unplaced <= 0 {
            return Ok(self.empty_result(&payment));
        }

        let invoices = self.store.list_open_invoices_fifo(&payment.representative_id)?;
        let plan = plan_fifo(&invoices, unplaced);
        self.apply(&payment, plan)
    }

    /// Place a payment on one chosen invoice. Anything beyond that
    /// invoice's remainder stays unallocated.
    pub fn allocate_to_invoice_in_tx(
        &self,
        payment_id: &str,
        invoice_id: &str,
    ) -> LedgerResult<AllocationResult> {
        let payment = self.store.get_payment(payment_id)?;
        let invoice = self.store.get_invoice(invoice_id)?;
        if invoice.representative_id != payment.representative_id {
            return Err(LedgerError::validation(format!(
                "invoice '{invoice_id}' belongs to '{}', payment '{payment_id}' to '{}'",
                invoice.representative_id, payment.representative_id
            )));
        }

        let unplaced = self.unplaced(&payment)?;
        if unplaced <= 0 {
            return Ok(self.empty_result(&payment));
        }
        let targets: Vec<CoveredInvoiceRow> = self
            .store
            .list_open_invoices_fifo(&payment.representative_id)?
            .into_iter()
            .filter(|inv| inv.invoice_id == invoice_id)
            .collect();
        let plan = plan_fifo(&targets, unplaced);
        self.apply(&payment, plan)
    }

    /// Re-run every payment that still has an unplaced remainder, oldest
    /// payment first. Used after invoice amounts change.
    pub fn reallocate_in_tx(&self, representative_id: &str) -> LedgerResult<Vec<AllocationResult>> {
        self.store.get_representative(representative_id)?;
        let mut results = Vec::new();
        for payment in self.store.list_payments(representative_id)? {
            if self.unplaced(&payment)? <= 0 {
                continue;
            }
            let result = self.allocate_payment_in_tx(&payment.payment_id)?;
            if !result.actions.is_empty() {
                results.push(result);
            }
        }
        Ok(results)
    }

    fn unplaced(&self, payment: &PaymentRow) -> LedgerResult<i64> {
        let placed = self.store.sum_allocated_from_payment(&payment.payment_id)?;
        Ok(payment.amount - placed)
    }

    fn apply(&self, payment: &PaymentRow, plan: AllocationPlan) -> LedgerResult<AllocationResult> {
        for action in &plan.actions {
            self.store
                .insert_allocation(&payment.payment_id, &action.invoice_id, action.amount_applied)?;
            self.store
                .update_invoice_status(&action.invoice_id, action.new_status)?;
        }

        let applied: i64 = plan.actions.iter().map(|a| a.amount_applied).sum();
        if !plan.actions.is_empty() {
            // "allocated" means the payment went through the allocator and
            // placed something, not that it was fully consumed.
            let first_invoice = match &payment.invoice_id {
                Some(existing) => Some(existing.clone()),
                None => plan.actions.first().map(|a| a.invoice_id.clone()),
            };
            self.store
                .set_payment_allocation(&payment.payment_id, true, first_invoice.as_deref())?;
        }

        let event = LedgerEvent::PaymentAllocated {
            representative_id: payment.representative_id.clone(),
            payment_id: payment.payment_id.clone(),
            applied,
            remaining: plan.remaining,
            invoices: plan.actions.len(),
        };
        self.store.record(&event)?;

        log::debug!(
            "payment {} allocated {applied} over {} invoices, {} unplaced",
            payment.payment_id,
            plan.actions.len(),
            plan.remaining
        );

        Ok(AllocationResult {
            representative_id: payment.representative_id.clone(),
            payment_id: payment.payment_id.clone(),
            actions: plan.actions,
            applied,
            remaining_unallocated: plan.remaining,
        })
    }

    fn empty_result(&self, payment: &PaymentRow) -> AllocationResult {
        AllocationResult {
            representative_id: payment.representative_id.clone(),
            payment_id: payment.payment_id.clone(),
            actions: Vec::new(),
            applied: 0,
            remaining_unallocated: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn inv(id: &str, day: u32, amount: i64, covered: i64, status: InvoiceStatus) -> CoveredInvoiceRow {
        CoveredInvoiceRow {
            invoice_id: id.into(),
            amount,
            issue_date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            status,
            covered,
        }
    }

    #[test]
    fn oldest_invoice_is_cleared_first() {
        let invoices = vec![
            inv("c", 3, 300, 0, InvoiceStatus::Unpaid),
            inv("a", 1, 100, 0, InvoiceStatus::Unpaid),
            inv("b", 2, 200, 0, InvoiceStatus::Unpaid),
        ];
        let plan = plan_fifo(&invoices, 250);
        assert_eq!(
            plan.actions,
            vec![
                AllocationAction { invoice_id: "a".into(), amount_applied: 100, new_status: InvoiceStatus::Paid },
                AllocationAction { invoice_id: "b".into(), amount_applied: 150, new_status: InvoiceStatus::Partial },
            ]
        );
        assert_eq!(plan.remaining, 0);
    }

    #[test]
    fn equal_dates_break_ties_by_id() {
        let invoices = vec![
            inv("inv-2", 5, 50, 0, InvoiceStatus::Unpaid),
            inv("inv-1", 5, 50, 0, InvoiceStatus::Unpaid),
        ];
        let plan = plan_fifo(&invoices, 50);
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].invoice_id, "inv-1");
    }

    #[test]
    fn existing_coverage_reduces_remainder() {
        let invoices = vec![inv("a", 1, 100, 60, InvoiceStatus::Partial)];
        let plan = plan_fifo(&invoices, 100);
        assert_eq!(plan.actions[0].amount_applied, 40);
        assert_eq!(plan.actions[0].new_status, InvoiceStatus::Paid);
        assert_eq!(plan.remaining, 60);
    }

    #[test]
    fn paid_and_exhausted_invoices_are_skipped() {
        let invoices = vec![
            inv("a", 1, 100, 100, InvoiceStatus::Paid),
            inv("b", 2, 100, 100, InvoiceStatus::Partial),
            inv("c", 3, 0, 0, InvoiceStatus::Unpaid),
            inv("d", 4, 80, 0, InvoiceStatus::Overdue),
        ];
        let plan = plan_fifo(&invoices, 30);
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].invoice_id, "d");
        assert_eq!(plan.actions[0].new_status, InvoiceStatus::Partial);
    }

    #[test]
    fn surplus_stays_unallocated() {
        let invoices = vec![inv("a", 1, 100, 0, InvoiceStatus::Unpaid)];
        let plan = plan_fifo(&invoices, 150);
        assert_eq!(plan.actions[0].amount_applied, 100);
        assert_eq!(plan.remaining, 50);
    }
}
