use super::{LedgerStore, LedgerTotalsRow};
use crate::error::LedgerResult;
use rusqlite::params;

impl LedgerStore {
    /// Sum every invoice and payment figure for one representative.
    pub fn ledger_totals(&self, representative_id: &str) -> LedgerResult<LedgerTotalsRow> {
        let (invoice_count, total_invoice, open_invoice, paid_invoice, paid_covered): (
            i64,
            i64,
            i64,
            i64,
            i64,
        ) = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(i.amount), 0),
                    COALESCE(SUM(CASE WHEN i.status <> 'paid' THEN i.amount ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN i.status = 'paid' THEN i.amount ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN i.status = 'paid'
                                      THEN MIN(i.amount, COALESCE(c.covered, 0))
                                      ELSE 0 END), 0)
             FROM invoice i
             LEFT JOIN (SELECT invoice_id, SUM(amount) AS covered
                        FROM allocation GROUP BY invoice_id) c
                    ON c.invoice_id = i.invoice_id
             WHERE i.representative_id = ?1",
            params![representative_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;

        let (payment_count, total_payment): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(amount), 0)
             FROM payment WHERE representative_id = ?1",
            params![representative_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let allocated: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(a.amount), 0)
             FROM allocation a
             JOIN payment p ON p.payment_id = a.payment_id
             WHERE p.representative_id = ?1",
            params![representative_id],
            |row| row.get(0),
        )?;

        Ok(LedgerTotalsRow {
            invoice_count,
            payment_count,
            total_invoice_amount: total_invoice,
            open_invoice_amount: open_invoice,
            paid_invoice_amount: paid_invoice,
            paid_covered_amount: paid_covered,
            total_payment_amount: total_payment,
            allocated_payment_amount: allocated,
        })
    }

    /// System-wide outstanding amount computed as one aggregate over the
    /// whole store, independent of any per-representative calculation:
    /// unpaid invoice value minus allocated payments, floored at zero.
    pub fn global_outstanding(&self) -> LedgerResult<i64> {
        let raw: i64 = self.conn.query_row(
            "SELECT
                (SELECT COALESCE(SUM(CASE WHEN i.status <> 'paid' THEN i.amount
                                          ELSE MIN(i.amount, COALESCE(c.covered, 0)) END), 0)
                 FROM invoice i
                 LEFT JOIN (SELECT invoice_id, SUM(amount) AS covered
                            FROM allocation GROUP BY invoice_id) c
                        ON c.invoice_id = i.invoice_id)
              - (SELECT COALESCE(SUM(amount), 0) FROM allocation)",
            [],
            |row| row.get(0),
        )?;
        Ok(raw.max(0))
    }

    /// Sum of the cached `total_debt` column across representatives.
    pub fn sum_cached_debt(&self) -> LedgerResult<i64> {
        let total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(total_debt), 0) FROM representative",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }
}
