//! Financial reconciliation and payment allocation engine for a
//! representative / invoice / payment back office.
//!
//! Invoice, payment and allocation rows are the source of truth. The
//! per-representative debt, credit and sales figures are derived from them
//! (`snapshot`), written back as a cached aggregate (`reconciliation`), and
//! checked in bulk (`sweep`, `problems`). `engine::LedgerEngine` is the
//! entry point.

pub mod allocation;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod locks;
pub mod problems;
pub mod reconciliation;
pub mod snapshot;
pub mod store;
pub mod sweep;
pub mod types;

pub use engine::{LedgerEngine, NewInvoice, NewPayment};
pub use error::{LedgerError, LedgerResult};
