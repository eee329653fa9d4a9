//! recon-runner: headless command-line runner for the ledger engine.
//!
//! Usage:
//!   recon-runner --db ledger.db init
//!   recon-runner --db ledger.db add-invoice <rep> 1500 2024-03-01
//!   recon-runner --db ledger.db sweep --active-only
//!   recon-runner --db ledger.db serve        (JSON lines on stdin/stdout)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ledgerdesk_core::{
    config::EngineConfig,
    sweep::{SweepFilter, SweepSummary},
    types::{parse_date, Amount},
    LedgerEngine, LedgerResult, NewInvoice, NewPayment,
};
use serde::Serialize;
use std::io::{self, BufRead, Write};

#[derive(Parser)]
#[command(name = "recon-runner", about = "Reconcile representative ledgers")]
struct Cli {
    /// SQLite database file
    #[arg(long, default_value = "ledger.db")]
    db: String,

    /// Engine configuration (JSON)
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the schema.
    Init,
    AddRep {
        code: String,
        name: String,
    },
    AddInvoice {
        representative: String,
        amount: String,
        issue_date: String,
    },
    AddPayment {
        representative: String,
        amount: String,
        payment_date: String,
        /// Apply to this invoice instead of FIFO
        #[arg(long)]
        invoice: Option<String>,
        /// Record as credit without allocating
        #[arg(long, conflicts_with = "invoice")]
        no_allocate: bool,
    },
    DeletePayment {
        payment: String,
    },
    Snapshot {
        representative: String,
    },
    Reconcile {
        representative: String,
    },
    Allocate {
        representative: String,
        amount: String,
    },
    Sweep {
        #[arg(long)]
        active_only: bool,
        /// Restrict to these representatives
        #[arg(long = "rep")]
        reps: Vec<String>,
    },
    Problems,
    Verify,
    MarkOverdue {
        as_of: String,
    },
    /// Read JSON requests from stdin, one per line.
    Serve,
}

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Request {
    Snapshot { representative_id: String },
    Reconcile { representative_id: String },
    Allocate { representative_id: String, amount: AmountField },
    Sweep { filter: Option<SweepFilter> },
    Problematic,
    Verify,
    Quit,
}

/// An amount on the wire: a JSON integer or a precision-0 decimal string.
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum AmountField {
    Units(i64),
    Text(String),
}

impl AmountField {
    fn resolve(self) -> LedgerResult<Amount> {
        match self {
            Self::Units(value) => Amount::new(value),
            Self::Text(raw) => Amount::parse(&raw),
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let engine = LedgerEngine::open(&cli.db, config)
        .with_context(|| format!("opening {}", cli.db))?;

    match cli.command {
        Command::Init => println!("schema ready in {}", cli.db),
        Command::AddRep { code, name } => {
            let id = engine.create_representative(&code, &name)?;
            print_json(&serde_json::json!({ "representativeId": id }))?;
        }
        Command::AddInvoice { representative, amount, issue_date } => {
            let amount = Amount::parse(&amount)?;
            let date = parse_date(&issue_date)?;
            let id = engine.create_invoice(NewInvoice::new(&representative, amount.get(), date))?;
            print_json(&engine.snapshot(&representative)?)?;
            log::info!("invoice {id} created");
        }
        Command::AddPayment { representative, amount, payment_date, invoice, no_allocate } => {
            let amount = Amount::parse(&amount)?;
            let date = parse_date(&payment_date)?;
            let mut payment = NewPayment::new(&representative, amount.get(), date);
            if let Some(invoice_id) = &invoice {
                payment = payment.for_invoice(invoice_id);
            }
            if no_allocate {
                payment = payment.unallocated();
            }
            print_json(&engine.record_payment(payment)?)?;
        }
        Command::DeletePayment { payment } => print_json(&engine.delete_payment(&payment)?)?,
        Command::Snapshot { representative } => print_json(&engine.snapshot(&representative)?)?,
        Command::Reconcile { representative } => print_json(&engine.reconcile(&representative)?)?,
        Command::Allocate { representative, amount } => {
            let amount = Amount::parse(&amount)?;
            print_json(&engine.allocate(&representative, amount.get())?)?;
        }
        Command::Sweep { active_only, reps } => {
            let filter = if !reps.is_empty() {
                SweepFilter::Representatives(reps)
            } else if active_only {
                SweepFilter::ActiveOnly
            } else {
                SweepFilter::All
            };
            let summary = engine.sweep(&filter)?;
            print_sweep_summary(&summary);
        }
        Command::Problems => print_json(&engine.problematic()?)?,
        Command::Verify => print_json(&engine.verify_global_consistency()?)?,
        Command::MarkOverdue { as_of } => {
            print_json(&engine.mark_overdue(parse_date(&as_of)?)?)?;
        }
        Command::Serve => run_request_loop(&engine, io::stdin().lock(), &mut io::stdout())?,
    }

    Ok(())
}

fn run_request_loop(
    engine: &LedgerEngine,
    mut input: impl BufRead,
    output: &mut impl Write,
) -> Result<()> {
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = input.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&buffer) {
            Ok(r) => r,
            Err(e) => {
                writeln!(output, "{}", serde_json::json!({ "error": e.to_string() }))?;
                output.flush()?;
                continue;
            }
        };
        if matches!(request, Request::Quit) {
            break;
        }

        writeln!(output, "{}", response_line(handle(engine, request)))?;
        output.flush()?;
    }
    Ok(())
}

fn handle(engine: &LedgerEngine, request: Request) -> LedgerResult<serde_json::Value> {
    match request {
        Request::Snapshot { representative_id } => to_value(engine.snapshot(&representative_id)?),
        Request::Reconcile { representative_id } => to_value(engine.reconcile(&representative_id)?),
        Request::Allocate { representative_id, amount } => {
            let amount = amount.resolve()?;
            to_value(engine.allocate(&representative_id, amount.get())?)
        }
        Request::Sweep { filter } => to_value(engine.sweep(&filter.unwrap_or(SweepFilter::All))?),
        Request::Problematic => to_value(engine.problematic()?),
        Request::Verify => to_value(engine.verify_global_consistency()?),
        Request::Quit => Ok(serde_json::Value::Null),
    }
}

fn response_line(response: LedgerResult<serde_json::Value>) -> serde_json::Value {
    match response {
        Ok(value) => serde_json::json!({ "ok": value }),
        Err(e) => serde_json::json!({
            "error": e.to_string(),
            "transient": e.is_transient(),
        }),
    }
}

fn to_value<T: Serialize>(v: T) -> LedgerResult<serde_json::Value> {
    Ok(serde_json::to_value(v)?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_sweep_summary(summary: &SweepSummary) {
    println!("=== SWEEP SUMMARY ===");
    println!("  reconciled:       {}", summary.total_reconciled);
    println!("  fixed:            {}", summary.total_fixed);
    println!("  failed:           {}", summary.total_failed);
    println!("  avg improvement:  {:.1}", summary.average_integrity_score_improvement);
    println!("  elapsed:          {}ms", summary.execution_time_ms);
    for f in &summary.failures {
        println!("  ! {}: {}", f.representative_id, f.cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerdesk_core::config::EngineConfig;
    use std::collections::HashMap;

    fn build() -> LedgerEngine {
        let _ = env_logger::builder().is_test(true).try_init();
        LedgerEngine::in_memory(EngineConfig::default_test()).expect("in-memory engine")
    }

    fn serve(engine: &LedgerEngine, requests: &[serde_json::Value]) -> Vec<serde_json::Value> {
        let input: String = requests.iter().map(|r| format!("{r}\n")).collect();
        let mut output = Vec::new();
        run_request_loop(engine, input.as_bytes(), &mut output).unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn allocate_accepts_decimal_strings_and_integers() {
        let engine = build();
        let rep = engine.create_representative("R-1", "Runner").unwrap();
        let issued = parse_date("2024-01-01").unwrap();
        engine.create_invoice(NewInvoice::new(&rep, 2_000, issued)).unwrap();

        let lines = serve(
            &engine,
            &[
                serde_json::json!({ "type": "allocate", "representative_id": rep, "amount": "1500" }),
                serde_json::json!({ "type": "allocate", "representative_id": rep, "amount": 300 }),
                serde_json::json!({ "type": "allocate", "representative_id": rep, "amount": "12.5" }),
                serde_json::json!({ "type": "quit" }),
                serde_json::json!({ "type": "verify" }),
            ],
        );

        assert_eq!(lines.len(), 3, "nothing is answered after quit");
        assert_eq!(lines[0]["ok"]["applied"], 1500);
        assert_eq!(lines[1]["ok"]["applied"], 300);
        assert!(lines[2].get("ok").is_none());
        assert!(lines[2]["error"].as_str().unwrap().contains("Validation"), "{}", lines[2]);
        assert_eq!(lines[2]["transient"], false);
        assert_eq!(engine.snapshot(&rep).unwrap().standard_debt, 200);
    }

    #[test]
    fn serialization_failure_is_reported_as_error() {
        // JSON objects need string keys.
        let unserializable: HashMap<(i32, i32), i32> = HashMap::from([((1, 2), 3)]);
        let line = response_line(to_value(unserializable));
        assert!(line.get("ok").is_none(), "{line}");
        assert!(line["error"].as_str().unwrap().contains("Serialization"), "{line}");
        assert_eq!(line["transient"], false);
    }
}
