//! dedup-runner: headless driver for the transaction duplicate detector.
//!
//! Usage:
//!   dedup-runner --config dedup.json            # JSON-lines on stdin/stdout
//!   dedup-runner --config dedup.json --demo     # scripted walkthrough
//!   dedup-runner --timeout-ms 500               # per-call deadline

use anyhow::Result;
use std::env;
use std::io::{self, BufRead, Write};
use std::time::Duration;
use txn_dedup_core::{
    Detector, DetectorConfig, OpContext, TransactionRecord, TransactionRequest, TransactionStatus,
};

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    Check {
        request: TransactionRequest,
    },
    Record {
        record: TransactionRecord,
    },
    UpdateStatus {
        transaction_id: String,
        status: TransactionStatus,
    },
    Quit,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let demo = args.iter().any(|a| a == "--demo");
    let timeout_ms = parse_arg(&args, "--timeout-ms", 0u64);
    let config = match string_arg(&args, "--config") {
        Some(path) => DetectorConfig::load(path)?,
        None => DetectorConfig::default(),
    };

    let detector = Detector::new(config)?;
    log::info!("dedup-runner: using {} store", detector.store().name());

    let result = if demo {
        run_demo(&detector)
    } else {
        run_ipc_loop(&detector, timeout_ms)
    };

    detector.close()?;
    result
}

fn context(timeout_ms: u64) -> OpContext {
    if timeout_ms == 0 {
        OpContext::background()
    } else {
        OpContext::with_timeout(Duration::from_millis(timeout_ms))
    }
}

fn run_ipc_loop(detector: &Detector, timeout_ms: u64) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        if handle.read_line(&mut buffer)? == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let cmd: IpcCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                write_error(&mut stdout, &e)?;
                continue;
            }
        };

        let ctx = context(timeout_ms);
        let reply = match cmd {
            IpcCommand::Quit => break,
            IpcCommand::Check { request } => detector
                .check_duplicate(&ctx, &request)
                .map(|r| serde_json::to_value(r)),
            IpcCommand::Record { record } => detector
                .record_transaction(&ctx, record)
                .map(|r| serde_json::to_value(r)),
            IpcCommand::UpdateStatus { transaction_id, status } => detector
                .update_transaction_status(&ctx, &transaction_id, status)
                .map(|()| Ok(serde_json::json!({ "updated": transaction_id, "status": status }))),
        };

        match reply {
            Ok(value) => writeln!(stdout, "{}", value?)?,
            Err(e) => write_error(&mut stdout, &e)?,
        }
        stdout.flush()?;
    }
    Ok(())
}

fn write_error(out: &mut impl Write, e: &dyn std::fmt::Display) -> Result<()> {
    writeln!(out, "{}", serde_json::json!({ "error": e.to_string() }))?;
    out.flush()?;
    Ok(())
}

/// Record one payment, then re-submit it a few ways and print each verdict.
fn run_demo(detector: &Detector) -> Result<()> {
    let ctx = OpContext::background();
    let request = TransactionRequest {
        from_account:  "ACC-1001".into(),
        to_account:    "ACC-2002".into(),
        amount:        250.00,
        currency:      "USD".into(),
        business_type: "transfer".into(),
        channel:       "mobile".into(),
        user_ip:       "10.0.0.7".into(),
        device_id:     "device-a".into(),
        ..Default::default()
    };

    println!("=== DEDUP DEMO ===");
    println!("  store:       {}", detector.store().name());
    println!("  fingerprint: {}", detector.fingerprint(&request));
    println!();

    print_check("first submission", &detector.check_duplicate(&ctx, &request)?);

    let pending = detector.record_transaction(
        &ctx,
        TransactionRecord::from_request(&request, TransactionStatus::Pending),
    )?;
    print_check("resubmitted while pending", &detector.check_duplicate(&ctx, &request)?);

    detector.update_transaction_status(&ctx, &pending.transaction_id, TransactionStatus::Success)?;
    print_check("resubmitted after success", &detector.check_duplicate(&ctx, &request)?);

    let other_device = TransactionRequest {
        user_ip:   "10.0.0.99".into(),
        device_id: "device-b".into(),
        ..request.clone()
    };
    print_check("same payment, other device", &detector.check_duplicate(&ctx, &other_device)?);

    let cents_off = TransactionRequest { amount: 250.004, ..request };
    print_check("amount differs below a cent", &detector.check_duplicate(&ctx, &cents_off)?);
    Ok(())
}

fn print_check(label: &str, result: &txn_dedup_core::DuplicateCheckResult) {
    println!(
        "  {label:<28} dup={:<5} similar={} risk={:<6} action={:<5} rule={}",
        result.is_duplicate,
        result.similar_transactions.len(),
        result.risk_level,
        result.suggested_action,
        result.matched_rule.as_deref().unwrap_or("-"),
    );
    if !result.message.is_empty() {
        println!("  {:<28} {}", "", result.message);
    }
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn string_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}
