//! SQLite persistence layer for the ledger.
//!
//! RULE: Only the store talks to the database.
//! Engine components call store methods; they never execute SQL directly.

use crate::{
    error::{LedgerError, LedgerResult},
    event::{EventLogEntry, LedgerEvent},
    types::{InvoiceStatus, RepresentativeId},
};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::time::Duration;

mod aggregate;
mod invoice;
mod payment;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

pub struct LedgerStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
    busy_timeout: Duration,
}

impl LedgerStore {
    pub fn open(path: &str) -> LedgerResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> LedgerResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: None,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    /// For file-based databases, this opens the same file.
    pub fn reopen(&self) -> LedgerResult<Self> {
        let mut store = match &self.path {
            Some(p) => Self::open(p)?,
            None => Self::in_memory()?,
        };
        store.set_busy_timeout(self.busy_timeout)?;
        Ok(store)
    }

    /// How long a statement waits on another connection's lock before
    /// failing with `SQLITE_BUSY`. This is the store access timeout.
    pub fn set_busy_timeout(&mut self, timeout: Duration) -> LedgerResult<()> {
        self.conn.busy_timeout(timeout)?;
        self.busy_timeout = timeout;
        Ok(())
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Whether other connections can see this database.
    pub fn is_shared(&self) -> bool {
        self.path.is_some()
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> LedgerResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_ledger.sql"))?;
        Ok(())
    }

    /// Start an IMMEDIATE transaction: the write lock is taken up front so
    /// a read-then-write sequence cannot be interleaved by another connection.
    /// Dropping the guard without `commit()` rolls back.
    pub fn begin_write(&self) -> LedgerResult<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    // ── Representative ─────────────────────────────────────────

    pub fn insert_representative(&self, rep: &RepresentativeRow) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO representative
             (representative_id, code, name, active, total_debt, total_sales, credit, reconciled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                rep.representative_id,
                rep.code,
                rep.name,
                rep.active,
                rep.total_debt,
                rep.total_sales,
                rep.credit,
                rep.reconciled_at,
            ],
        )?;
        Ok(())
    }

    pub fn find_representative(&self, id: &str) -> LedgerResult<Option<RepresentativeRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT representative_id, code, name, active,
                        total_debt, total_sales, credit, reconciled_at
                 FROM representative WHERE representative_id = ?1",
                params![id],
                Self::map_representative_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_representative(&self, id: &str) -> LedgerResult<RepresentativeRow> {
        self.find_representative(id)?
            .ok_or_else(|| LedgerError::not_found("representative", id))
    }

    /// All representative ids in stable order.
    pub fn list_representative_ids(&self, active_only: bool) -> LedgerResult<Vec<RepresentativeId>> {
        let mut stmt = self.conn.prepare(
            "SELECT representative_id FROM representative
             WHERE (?1 = 0 OR active = 1)
             ORDER BY representative_id ASC",
        )?;
        let ids = stmt
            .query_map(params![active_only], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    pub fn list_representatives(&self) -> LedgerResult<Vec<RepresentativeRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT representative_id, code, name, active,
                    total_debt, total_sales, credit, reconciled_at
             FROM representative ORDER BY representative_id ASC",
        )?;
        let rows = stmt
            .query_map([], Self::map_representative_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_representative_active(&self, id: &str, active: bool) -> LedgerResult<()> {
        let changed = self.conn.execute(
            "UPDATE representative SET active = ?1 WHERE representative_id = ?2",
            params![active, id],
        )?;
        if changed == 0 {
            return Err(LedgerError::not_found("representative", id));
        }
        Ok(())
    }

    /// Overwrite the cached aggregate. The only writer is reconciliation.
    pub fn write_cached_aggregate(
        &self,
        id: &str,
        total_debt: i64,
        total_sales: i64,
        credit: i64,
        reconciled_at: &str,
    ) -> LedgerResult<()> {
        let changed = self.conn.execute(
            "UPDATE representative
             SET total_debt = ?1, total_sales = ?2, credit = ?3, reconciled_at = ?4
             WHERE representative_id = ?5",
            params![total_debt, total_sales, credit, reconciled_at, id],
        )?;
        if changed == 0 {
            return Err(LedgerError::not_found("representative", id));
        }
        Ok(())
    }

    fn map_representative_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RepresentativeRow> {
        Ok(RepresentativeRow {
            representative_id: row.get(0)?,
            code: row.get(1)?,
            name: row.get(2)?,
            active: row.get(3)?,
            total_debt: row.get(4)?,
            total_sales: row.get(5)?,
            credit: row.get(6)?,
            reconciled_at: row.get(7)?,
        })
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (representative_id, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.representative_id,
                entry.event_type,
                entry.payload,
                entry.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn record(&self, event: &LedgerEvent) -> LedgerResult<()> {
        self.append_event(&event.to_entry()?)
    }

    pub fn events_for_representative(&self, id: &str) -> LedgerResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, representative_id, event_type, payload, created_at
             FROM event_log WHERE representative_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![id], Self::map_event_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn events_of_type(&self, event_type: &str) -> LedgerResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, representative_id, event_type, payload, created_at
             FROM event_log WHERE event_type = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![event_type], Self::map_event_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn map_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventLogEntry> {
        Ok(EventLogEntry {
            id: Some(row.get(0)?),
            representative_id: row.get(1)?,
            event_type: row.get(2)?,
            payload: row.get(3)?,
            created_at: row.get(4)?,
        })
    }
}

/// Dates are stored as ISO text; anything else in the column is corrupt data.
pub(crate) fn read_date(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn read_status(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<InvoiceStatus> {
    let raw: String = row.get(idx)?;
    InvoiceStatus::parse(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

// ── Row types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepresentativeRow {
    pub representative_id: RepresentativeId,
    pub code: String,
    pub name: String,
    pub active: bool,
    pub total_debt: i64,
    pub total_sales: i64,
    pub credit: i64,
    pub reconciled_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceRow {
    pub invoice_id: String,
    pub representative_id: RepresentativeId,
    pub amount: i64,
    pub issue_date: NaiveDate,
    pub status: InvoiceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRow {
    pub payment_id: String,
    pub representative_id: RepresentativeId,
    pub amount: i64,
    pub payment_date: NaiveDate,
    pub allocated: bool,
    pub invoice_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRow {
    pub allocation_id: i64,
    pub payment_id: String,
    pub invoice_id: String,
    pub amount: i64,
}

/// An invoice together with what has already been allocated to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoveredInvoiceRow {
    pub invoice_id: String,
    pub amount: i64,
    pub issue_date: NaiveDate,
    pub status: InvoiceStatus,
    pub covered: i64,
}

/// Every sum the snapshot calculator needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerTotalsRow {
    pub invoice_count: i64,
    pub payment_count: i64,
    pub total_invoice_amount: i64,
    pub open_invoice_amount: i64,
    pub paid_invoice_amount: i64,
    /// Allocation-covered part of paid invoices, capped at each invoice amount.
    pub paid_covered_amount: i64,
    pub total_payment_amount: i64,
    pub allocated_payment_amount: i64,
}
