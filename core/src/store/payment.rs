use super::{format_date, read_date, AllocationRow, LedgerStore, PaymentRow};
use crate::error::{LedgerError, LedgerResult};
use rusqlite::{params, OptionalExtension};

impl LedgerStore {
    pub fn insert_payment(&self, p: &PaymentRow) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO payment
             (payment_id, representative_id, amount, payment_date, allocated, invoice_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                p.payment_id,
                p.representative_id,
                p.amount,
                format_date(p.payment_date),
                p.allocated,
                p.invoice_id,
            ],
        )?;
        Ok(())
    }

    pub fn find_payment(&self, payment_id: &str) -> LedgerResult<Option<PaymentRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT payment_id, representative_id, amount, payment_date, allocated, invoice_id
                 FROM payment WHERE payment_id = ?1",
                params![payment_id],
                Self::map_payment_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_payment(&self, payment_id: &str) -> LedgerResult<PaymentRow> {
        self.find_payment(payment_id)?
            .ok_or_else(|| LedgerError::not_found("payment", payment_id))
    }

    /// Payments of a representative, oldest first.
    pub fn list_payments(&self, representative_id: &str) -> LedgerResult<Vec<PaymentRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT payment_id, representative_id, amount, payment_date, allocated, invoice_id
             FROM payment WHERE representative_id = ?1
             ORDER BY payment_date ASC, payment_id ASC",
        )?;
        let rows = stmt
            .query_map(params![representative_id], Self::map_payment_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete a payment. Its allocation rows cascade away.
    pub fn delete_payment(&self, payment_id: &str) -> LedgerResult<()> {
        let changed = self.conn.execute(
            "DELETE FROM payment WHERE payment_id = ?1",
            params![payment_id],
        )?;
        if changed == 0 {
            return Err(LedgerError::not_found("payment", payment_id));
        }
        Ok(())
    }

    pub fn set_payment_allocation(
        &self,
        payment_id: &str,
        allocated: bool,
        invoice_id: Option<&str>,
    ) -> LedgerResult<()> {
        let changed = self.conn.execute(
            "UPDATE payment SET allocated = ?1, invoice_id = ?2 WHERE payment_id = ?3",
            params![allocated, invoice_id, payment_id],
        )?;
        if changed == 0 {
            return Err(LedgerError::not_found("payment", payment_id));
        }
        Ok(())
    }

    // ── Allocation ledger ──────────────────────────────────────

    pub fn insert_allocation(&self, payment_id: &str, invoice_id: &str, amount: i64) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO allocation (payment_id, invoice_id, amount) VALUES (?1, ?2, ?3)",
            params![payment_id, invoice_id, amount],
        )?;
        Ok(())
    }

    /// Sum already placed from one payment across all invoices.
    pub fn sum_allocated_from_payment(&self, payment_id: &str) -> LedgerResult<i64> {
        let total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM allocation WHERE payment_id = ?1",
            params![payment_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Allocations on one invoice, newest first.
    pub fn list_allocations_for_invoice(&self, invoice_id: &str) -> LedgerResult<Vec<AllocationRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT allocation_id, payment_id, invoice_id, amount
             FROM allocation WHERE invoice_id = ?1
             ORDER BY allocation_id DESC",
        )?;
        let rows = stmt
            .query_map(params![invoice_id], Self::map_allocation_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Allocations made from one payment, in the order they were applied.
    pub fn list_allocations_for_payment(&self, payment_id: &str) -> LedgerResult<Vec<AllocationRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT allocation_id, payment_id, invoice_id, amount
             FROM allocation WHERE payment_id = ?1
             ORDER BY allocation_id ASC",
        )?;
        let rows = stmt
            .query_map(params![payment_id], Self::map_allocation_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Shrink an allocation to `amount`, removing it when it reaches zero.
    pub fn shrink_allocation(&self, allocation_id: i64, amount: i64) -> LedgerResult<()> {
        if amount <= 0 {
            self.conn.execute(
                "DELETE FROM allocation WHERE allocation_id = ?1",
                params![allocation_id],
            )?;
        } else {
            self.conn.execute(
                "UPDATE allocation SET amount = ?1 WHERE allocation_id = ?2",
                params![amount, allocation_id],
            )?;
        }
        Ok(())
    }

    fn map_payment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaymentRow> {
        Ok(PaymentRow {
            payment_id: row.get(0)?,
            representative_id: row.get(1)?,
            amount: row.get(2)?,
            payment_date: read_date(row, 3)?,
            allocated: row.get(4)?,
            invoice_id: row.get(5)?,
        })
    }

    fn map_allocation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AllocationRow> {
        Ok(AllocationRow {
            allocation_id: row.get(0)?,
            payment_id: row.get(1)?,
            invoice_id: row.get(2)?,
            amount: row.get(3)?,
        })
    }
}
