//! Concurrent writers on one file-backed ledger.
//!
//! Each thread owns its own engine (and connection). Serialization across
//! connections comes from IMMEDIATE write transactions; no payment may be
//! placed twice and no invoice may end up over-covered.

use chrono::NaiveDate;
use ledgerdesk_core::{
    config::EngineConfig, types::InvoiceStatus, LedgerEngine, LedgerError, NewInvoice,
};
use std::path::Path;
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn day(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, m, d).unwrap()
}

fn open(path: &Path, config: EngineConfig) -> LedgerEngine {
    LedgerEngine::open(path.to_str().unwrap(), config).expect("file-backed engine")
}

#[test]
fn concurrent_allocations_never_double_place() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");

    let main = open(&path, EngineConfig::default_test());
    let rep = main.create_representative("R-900", "Busy").unwrap();
    for d in 1..=10 {
        main.create_invoice(NewInvoice::new(&rep, 100, day(1, d))).unwrap();
    }

    const THREADS: usize = 4;
    const PAYMENTS_PER_THREAD: usize = 5;
    let barrier = Arc::new(Barrier::new(THREADS + 1));

    // Engines are opened up front; the schema is already migrated.
    let workers: Vec<_> = (0..THREADS)
        .map(|_| open(&path, EngineConfig::default_test()))
        .collect();

    let handles: Vec<_> = workers
        .into_iter()
        .map(|engine| {
            let rep = rep.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..PAYMENTS_PER_THREAD {
                    engine.allocate_on(&rep, 40, day(2, 1)).expect("allocation");
                }
            })
        })
        .collect();

    // Reconcile alongside the writers.
    barrier.wait();
    for _ in 0..5 {
        main.reconcile(&rep).expect("reconcile");
    }
    for h in handles {
        h.join().expect("writer thread panicked");
    }

    let result = main.reconcile(&rep).unwrap();
    assert!(result.repairs.is_clean(), "writers left drift behind: {:?}", result.repairs);

    let s = result.snapshot;
    assert_eq!(s.total_payment_amount, 800);
    assert_eq!(s.allocated_payment_amount, 800, "every payment fully placed exactly once");
    assert_eq!(s.standard_credit, 0);
    assert_eq!(s.standard_debt, 200);

    let invoices = main.invoices(&rep).unwrap();
    let paid = invoices.iter().filter(|i| i.status == InvoiceStatus::Paid).count();
    let unpaid = invoices.iter().filter(|i| i.status == InvoiceStatus::Unpaid).count();
    assert_eq!((paid, unpaid), (8, 2), "FIFO fills the oldest eight invoices");

    for inv in main.store.list_invoices_with_coverage(&rep).unwrap() {
        assert!(inv.covered <= inv.amount, "invoice {} over-covered", inv.invoice_id);
    }
}

#[test]
fn busy_store_surfaces_as_conflict() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");

    let config = EngineConfig {
        store_busy_timeout_ms: 50,
        ..EngineConfig::default_test()
    };
    let engine = open(&path, config);
    let rep = engine.create_representative("R-901", "Blocked").unwrap();

    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder_path = path.clone();
    let holder = thread::spawn(move || {
        let other = open(&holder_path, EngineConfig::default_test());
        let tx = other.store.begin_write().unwrap();
        held_tx.send(()).unwrap();
        let _ = release_rx.recv();
        drop(tx);
    });
    held_rx.recv().unwrap();

    let err = engine
        .create_invoice(NewInvoice::new(&rep, 10, day(1, 1)))
        .unwrap_err();
    assert!(
        matches!(err, LedgerError::ConcurrencyConflict { ref representative_id } if *representative_id == rep),
        "got {err:?}"
    );
    assert!(err.is_transient());

    release_tx.send(()).unwrap();
    holder.join().unwrap();

    // Once the other writer is gone the same call goes through.
    engine.create_invoice(NewInvoice::new(&rep, 10, day(1, 1))).unwrap();
    assert_eq!(engine.snapshot(&rep).unwrap().standard_debt, 10);
}

#[test]
fn reconcile_retries_once_then_reports_conflict() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");

    let busy_timeout_ms = 150;
    let config = EngineConfig {
        store_busy_timeout_ms: busy_timeout_ms,
        ..EngineConfig::default_test()
    };
    let engine = open(&path, config);
    let rep = engine.create_representative("R-902", "Contended").unwrap();
    engine.create_invoice(NewInvoice::new(&rep, 30, day(1, 1))).unwrap();

    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder_path = path.clone();
    let holder = thread::spawn(move || {
        let other = open(&holder_path, EngineConfig::default_test());
        let tx = other.store.begin_write().unwrap();
        held_tx.send(()).unwrap();
        let _ = release_rx.recv();
        drop(tx);
    });
    held_rx.recv().unwrap();

    let started = Instant::now();
    let err = engine.reconcile(&rep).unwrap_err();
    let waited = started.elapsed();
    assert!(
        matches!(err, LedgerError::ConcurrencyConflict { ref representative_id } if *representative_id == rep),
        "got {err:?}"
    );
    assert!(err.is_transient());
    // Each attempt waits out the busy timeout; two attempts were made.
    assert!(
        waited >= Duration::from_millis(busy_timeout_ms * 5 / 3),
        "gave up after {waited:?}, expected a retry"
    );

    release_tx.send(()).unwrap();
    holder.join().unwrap();

    let result = engine.reconcile(&rep).unwrap();
    assert!(result.success);
    assert_eq!(result.snapshot.standard_debt, 30);
}
