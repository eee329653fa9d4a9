//! Shared primitive types used across the engine.

use crate::error::{LedgerError, LedgerResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A stable, unique identifier for a representative.
pub type RepresentativeId = String;

pub type InvoiceId = String;

pub type PaymentId = String;

/// A non-negative amount in the smallest currency unit, at most `Amount::MAX`.
///
/// The only way to build one is through `new` or `parse`, so every
/// amount that reaches the store has already been validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Largest accepted amount. Leaves room for ledger sums and the
    /// integrity ratio to stay inside `i64`.
    pub const MAX: i64 = 1_000_000_000_000_000;

    pub fn new(value: i64) -> LedgerResult<Self> {
        if value < 0 {
            return Err(LedgerError::validation(format!(
                "amount must be non-negative, got {value}"
            )));
        }
        if value > Self::MAX {
            return Err(LedgerError::validation(format!(
                "amount {value} exceeds the maximum of {}",
                Self::MAX
            )));
        }
        Ok(Self(value))
    }

    /// Parse a decimal string with precision 0 (`"1500"`, `"+1500"`).
    /// Fractions, signs other than `+`, separators and blanks are rejected.
    pub fn parse(raw: &str) -> LedgerResult<Self> {
        let trimmed = raw.trim();
        let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LedgerError::validation(format!(
                "amount '{raw}' is not a non-negative whole number"
            )));
        }
        let value: i64 = digits
            .parse()
            .map_err(|_| LedgerError::validation(format!("amount '{raw}' is out of range")))?;
        Self::new(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for Amount {
    type Error = LedgerError;

    fn try_from(value: i64) -> LedgerResult<Self> {
        Self::new(value)
    }
}

impl From<Amount> for i64 {
    fn from(a: Amount) -> i64 {
        a.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parse an ISO `YYYY-MM-DD` date, rejecting anything else.
pub fn parse_date(raw: &str) -> LedgerResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| LedgerError::validation(format!("malformed date '{raw}': {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Unpaid,
    Partial,
    Paid,
    Overdue,
}

impl InvoiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unpaid  => "unpaid",
            Self::Partial => "partial",
            Self::Paid    => "paid",
            Self::Overdue => "overdue",
        }
    }

    pub fn parse(raw: &str) -> LedgerResult<Self> {
        match raw {
            "unpaid"  => Ok(Self::Unpaid),
            "partial" => Ok(Self::Partial),
            "paid"    => Ok(Self::Paid),
            "overdue" => Ok(Self::Overdue),
            other => Err(LedgerError::validation(format!("unknown invoice status '{other}'"))),
        }
    }

    /// Still carries an outstanding remainder (unpaid, partial or overdue).
    pub fn is_open(self) -> bool {
        !matches!(self, Self::Paid)
    }

    /// The status implied by an invoice amount and the sum allocated to it.
    /// `overdue` survives only while nothing has been allocated.
    pub fn derive(amount: i64, covered: i64, current: InvoiceStatus) -> Self {
        if covered >= amount {
            Self::Paid
        } else if covered > 0 {
            Self::Partial
        } else if current == Self::Overdue {
            Self::Overdue
        } else {
            Self::Unpaid
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_rejects_negative_values() {
        assert!(matches!(Amount::new(-5), Err(LedgerError::Validation(_))));
        assert_eq!(Amount::new(0).unwrap(), Amount::ZERO);
    }

    #[test]
    fn amount_is_bounded_above() {
        assert_eq!(Amount::new(Amount::MAX).unwrap().get(), Amount::MAX);
        assert!(matches!(Amount::new(Amount::MAX + 1), Err(LedgerError::Validation(_))));
        assert!(matches!(Amount::new(i64::MAX / 2 + 1), Err(LedgerError::Validation(_))));
        assert!(matches!(
            Amount::parse("1000000000000001"),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn amount_parse_accepts_whole_numbers_only() {
        assert_eq!(Amount::parse("1500").unwrap().get(), 1500);
        assert_eq!(Amount::parse(" +42 ").unwrap().get(), 42);
        for bad in ["-5", "12.5", "1,000", "", "abc", "99999999999999999999"] {
            assert!(
                matches!(Amount::parse(bad), Err(LedgerError::Validation(_))),
                "'{bad}' should be rejected"
            );
        }
    }

    #[test]
    fn amount_deserialize_validates() {
        let ok: Amount = serde_json::from_str("250").unwrap();
        assert_eq!(ok.get(), 250);
        assert!(serde_json::from_str::<Amount>("-1").is_err());
    }

    #[test]
    fn malformed_dates_are_validation_errors() {
        assert!(parse_date("2024-02-29").is_ok());
        assert!(matches!(parse_date("2023-02-29"), Err(LedgerError::Validation(_))));
        assert!(matches!(parse_date("29/02/2024"), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn status_derivation_follows_coverage() {
        use InvoiceStatus::*;
        assert_eq!(InvoiceStatus::derive(100, 0, Unpaid), Unpaid);
        assert_eq!(InvoiceStatus::derive(100, 0, Paid), Unpaid);
        assert_eq!(InvoiceStatus::derive(100, 0, Overdue), Overdue);
        assert_eq!(InvoiceStatus::derive(100, 40, Overdue), Partial);
        assert_eq!(InvoiceStatus::derive(100, 100, Partial), Paid);
        assert_eq!(InvoiceStatus::derive(0, 0, Unpaid), Paid);
    }
}
