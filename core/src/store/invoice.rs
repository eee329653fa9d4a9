use super::{format_date, read_date, read_status, CoveredInvoiceRow, InvoiceRow, LedgerStore};
use crate::{
    error::{LedgerError, LedgerResult},
    types::InvoiceStatus,
};
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};

impl LedgerStore {
    pub fn insert_invoice(&self, inv: &InvoiceRow) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO invoice (invoice_id, representative_id, amount, issue_date, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                inv.invoice_id,
                inv.representative_id,
                inv.amount,
                format_date(inv.issue_date),
                inv.status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn find_invoice(&self, invoice_id: &str) -> LedgerResult<Option<InvoiceRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT invoice_id, representative_id, amount, issue_date, status
                 FROM invoice WHERE invoice_id = ?1",
                params![invoice_id],
                Self::map_invoice_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_invoice(&self, invoice_id: &str) -> LedgerResult<InvoiceRow> {
        self.find_invoice(invoice_id)?
            .ok_or_else(|| LedgerError::not_found("invoice", invoice_id))
    }

    pub fn list_invoices(&self, representative_id: &str) -> LedgerResult<Vec<InvoiceRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT invoice_id, representative_id, amount, issue_date, status
             FROM invoice WHERE representative_id = ?1
             ORDER BY issue_date ASC, invoice_id ASC",
        )?;
        let rows = stmt
            .query_map(params![representative_id], Self::map_invoice_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Unpaid, partial and overdue invoices with their current coverage,
    /// oldest issue date first, ties broken by invoice id.
    pub fn list_open_invoices_fifo(
        &self,
        representative_id: &str,
    ) -> LedgerResult<Vec<CoveredInvoiceRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.invoice_id, i.amount, i.issue_date, i.status,
                    COALESCE((SELECT SUM(a.amount) FROM allocation a
                              WHERE a.invoice_id = i.invoice_id), 0)
             FROM invoice i
             WHERE i.representative_id = ?1
               AND i.status IN ('unpaid', 'partial', 'overdue')
             ORDER BY i.issue_date ASC, i.invoice_id ASC",
        )?;
        let rows = stmt
            .query_map(params![representative_id], Self::map_covered_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every invoice of a representative with its coverage, in FIFO order.
    pub fn list_invoices_with_coverage(
        &self,
        representative_id: &str,
    ) -> LedgerResult<Vec<CoveredInvoiceRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.invoice_id, i.amount, i.issue_date, i.status,
                    COALESCE((SELECT SUM(a.amount) FROM allocation a
                              WHERE a.invoice_id = i.invoice_id), 0)
             FROM invoice i
             WHERE i.representative_id = ?1
             ORDER BY i.issue_date ASC, i.invoice_id ASC",
        )?;
        let rows = stmt
            .query_map(params![representative_id], Self::map_covered_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// `unpaid` invoices issued strictly before `cutoff`.
    pub fn list_unpaid_issued_before(&self, cutoff: NaiveDate) -> LedgerResult<Vec<InvoiceRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT invoice_id, representative_id, amount, issue_date, status
             FROM invoice WHERE status = 'unpaid' AND issue_date < ?1
             ORDER BY representative_id ASC, issue_date ASC, invoice_id ASC",
        )?;
        let rows = stmt
            .query_map(params![format_date(cutoff)], Self::map_invoice_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_invoice_status(&self, invoice_id: &str, status: InvoiceStatus) -> LedgerResult<()> {
        let changed = self.conn.execute(
            "UPDATE invoice SET status = ?1 WHERE invoice_id = ?2",
            params![status.as_str(), invoice_id],
        )?;
        if changed == 0 {
            return Err(LedgerError::not_found("invoice", invoice_id));
        }
        Ok(())
    }

    pub fn update_invoice_amount(&self, invoice_id: &str, amount: i64) -> LedgerResult<()> {
        let changed = self.conn.execute(
            "UPDATE invoice SET amount = ?1 WHERE invoice_id = ?2",
            params![amount, invoice_id],
        )?;
        if changed == 0 {
            return Err(LedgerError::not_found("invoice", invoice_id));
        }
        Ok(())
    }

    /// Delete an invoice. Its allocations cascade away and any payment that
    /// pointed at it loses the reference.
    pub fn delete_invoice(&self, invoice_id: &str) -> LedgerResult<()> {
        let changed = self.conn.execute(
            "DELETE FROM invoice WHERE invoice_id = ?1",
            params![invoice_id],
        )?;
        if changed == 0 {
            return Err(LedgerError::not_found("invoice", invoice_id));
        }
        Ok(())
    }

    fn map_invoice_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InvoiceRow> {
        Ok(InvoiceRow {
            invoice_id: row.get(0)?,
            representative_id: row.get(1)?,
            amount: row.get(2)?,
            issue_date: read_date(row, 3)?,
            status: read_status(row, 4)?,
        })
    }

    fn map_covered_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CoveredInvoiceRow> {
        Ok(CoveredInvoiceRow {
            invoice_id: row.get(0)?,
            amount: row.get(1)?,
            issue_date: read_date(row, 2)?,
            status: read_status(row, 3)?,
            covered: row.get(4)?,
        })
    }
}
