//! Engine events and the append-only event log.
//!
//! Every state change the engine makes is recorded as one event.
//! Variants are added over time, never removed or reordered.

use crate::types::{InvoiceStatus, RepresentativeId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    // ── Reconciliation ─────────────────────────────
    Reconciled {
        representative_id: RepresentativeId,
        previous_debt: i64,
        new_debt: i64,
        previous_credit: i64,
        new_credit: i64,
        integrity_score: i64,
    },
    InvoiceStatusRepaired {
        representative_id: RepresentativeId,
        invoice_id: String,
        from: InvoiceStatus,
        to: InvoiceStatus,
    },
    AllocationReleased {
        representative_id: RepresentativeId,
        invoice_id: String,
        amount: i64,
    },

    // ── Allocation ─────────────────────────────────
    PaymentAllocated {
        representative_id: RepresentativeId,
        payment_id: String,
        applied: i64,
        remaining: i64,
        invoices: usize,
    },

    // ── Ageing ─────────────────────────────────────
    InvoiceOverdue {
        representative_id: RepresentativeId,
        invoice_id: String,
    },

    // ── Batch ──────────────────────────────────────
    SweepCompleted {
        total_reconciled: usize,
        total_fixed: usize,
        total_failed: usize,
    },
}

impl LedgerEvent {
    /// Stable name for the event_type column.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Reconciled { .. }            => "reconciled",
            Self::InvoiceStatusRepaired { .. } => "invoice_status_repaired",
            Self::AllocationReleased { .. }    => "allocation_released",
            Self::PaymentAllocated { .. }      => "payment_allocated",
            Self::InvoiceOverdue { .. }        => "invoice_overdue",
            Self::SweepCompleted { .. }        => "sweep_completed",
        }
    }

    pub fn representative_id(&self) -> Option<&str> {
        match self {
            Self::Reconciled { representative_id, .. }
            | Self::InvoiceStatusRepaired { representative_id, .. }
            | Self::AllocationReleased { representative_id, .. }
            | Self::PaymentAllocated { representative_id, .. }
            | Self::InvoiceOverdue { representative_id, .. } => Some(representative_id),
            Self::SweepCompleted { .. } => None,
        }
    }

    /// Serialize into a log row stamped with the current time.
    pub fn to_entry(&self) -> serde_json::Result<EventLogEntry> {
        Ok(EventLogEntry {
            id: None,
            representative_id: self.representative_id().map(str::to_string),
            event_type: self.type_name().to_string(),
            payload: serde_json::to_string(self)?,
            created_at: chrono::Utc::now().to_rfc3339(),
        })
    }
}

/// A persisted event log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: Option<i64>,
    pub representative_id: Option<RepresentativeId>,
    pub event_type: String,
    pub payload: String,
    pub created_at: String,
}

impl EventLogEntry {
    pub fn decode(&self) -> serde_json::Result<LedgerEvent> {
        serde_json::from_str(&self.payload)
    }
}
