//! Problem detector tests.
//!
//! 1. Buckets: excess payments, reconciliation needed, low integrity
//! 2. A representative in several buckets is counted once
//! 3. Inactive representatives are not inspected
//! 4. Detection never writes

use chrono::NaiveDate;
use ledgerdesk_core::{
    config::EngineConfig, problems::ProblemEntry, types::InvoiceStatus, LedgerEngine, NewInvoice,
    NewPayment,
};

fn build() -> LedgerEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    LedgerEngine::in_memory(EngineConfig::default_test()).expect("in-memory engine")
}

fn day(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, m, d).unwrap()
}

/// Bucket members by code. Representatives are listed by id (a uuid), so sort.
fn codes(entries: &[ProblemEntry]) -> Vec<&str> {
    let mut codes: Vec<&str> = entries.iter().map(|e| e.code.as_str()).collect();
    codes.sort_unstable();
    codes
}

fn seed_overpaid(engine: &LedgerEngine, code: &str) -> String {
    let rep = engine.create_representative(code, "Overpaid").unwrap();
    engine.create_invoice(NewInvoice::new(&rep, 100, day(1, 1))).unwrap();
    engine.allocate_on(&rep, 150, day(1, 2)).unwrap();
    rep
}

#[test]
fn classifies_each_bucket() {
    let engine = build();

    let clean = engine.create_representative("A-clean", "Clean").unwrap();
    engine.create_invoice(NewInvoice::new(&clean, 100, day(1, 1))).unwrap();
    engine.allocate_on(&clean, 60, day(1, 2)).unwrap();

    seed_overpaid(&engine, "B-over");

    // Drifted without excess: needs reconciliation, score 75.
    let drifted = engine.create_representative("C-drift", "Drift").unwrap();
    let a = engine.create_invoice(NewInvoice::new(&drifted, 100, day(1, 1))).unwrap();
    let b = engine.create_invoice(NewInvoice::new(&drifted, 100, day(1, 2))).unwrap();
    engine
        .record_payment(NewPayment::new(&drifted, 150, day(1, 3)).with_id("c-pay").unallocated())
        .unwrap();
    engine.store.insert_allocation("c-pay", &b, 150).unwrap();
    engine.store.update_invoice_status(&a, InvoiceStatus::Paid).unwrap();

    let report = engine.problematic().unwrap();
    assert_eq!(report.representatives_checked, 3);
    assert_eq!(codes(&report.excess_payment_reps), vec!["B-over"]);
    assert_eq!(codes(&report.reconciliation_needed), vec!["B-over", "C-drift"]);
    assert_eq!(codes(&report.low_integrity_reps), vec!["B-over"]);
    assert_eq!(report.total_problematic_count, 2, "B-over appears in three buckets but counts once");

    let over = &report.excess_payment_reps[0];
    assert_eq!(over.snapshot.integrity_score, 25);
    assert_eq!(over.snapshot.standard_credit, 50);
}

#[test]
fn inactive_representatives_are_skipped() {
    let engine = build();
    let idle = seed_overpaid(&engine, "D-idle");
    engine.set_representative_active(&idle, false).unwrap();

    let report = engine.problematic().unwrap();
    assert_eq!(report.representatives_checked, 0);
    assert_eq!(report.total_problematic_count, 0);
    assert!(report.excess_payment_reps.is_empty());
}

#[test]
fn low_integrity_threshold_is_configurable() {
    let config = EngineConfig { low_integrity_threshold: 90, ..EngineConfig::default_test() };
    let engine = LedgerEngine::in_memory(config).unwrap();
    let rep = engine.create_representative("E-credit", "Credit").unwrap();
    engine.create_invoice(NewInvoice::new(&rep, 100, day(1, 1))).unwrap();
    engine
        .record_payment(NewPayment::new(&rep, 60, day(1, 2)).unallocated())
        .unwrap();

    let report = engine.problematic().unwrap();
    assert_eq!(codes(&report.low_integrity_reps), vec!["E-credit"], "85 is below 90");
    assert!(report.reconciliation_needed.is_empty());
    assert_eq!(report.total_problematic_count, 1);
}

#[test]
fn detection_does_not_write() {
    let engine = build();
    let rep = seed_overpaid(&engine, "F-over");
    let events_before = engine.events_for(&rep).unwrap().len();
    let row_before = engine.representative(&rep).unwrap();

    engine.problematic().unwrap();
    engine.problematic().unwrap();

    assert_eq!(engine.events_for(&rep).unwrap().len(), events_before);
    assert_eq!(engine.representative(&rep).unwrap(), row_before);
}
