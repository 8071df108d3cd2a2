use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::{json, Value};
use ulid::Ulid;

fn temp_path(name: &str, extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "autoledger-cli-test-{}-{}.{}",
        name,
        Ulid::new(),
        extension
    ))
}

fn autoledger(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_autoledger"));
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }
    command.env("RUST_LOG", "warn");

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run autoledger {args:?}: {err}"),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn write_fixture(name: &str, value: &Value) -> PathBuf {
    let path = temp_path(name, "json");
    if let Err(err) = fs::write(&path, value.to_string()) {
        panic!("failed to write fixture {}: {err}", path.display());
    }
    path
}

#[test]
fn help_lists_every_command() {
    let output = match Command::new(env!("CARGO_BIN_EXE_autoledger"))
        .arg("--help")
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "migrate", "event", "run", "score", "match", "review", "pattern", "period", "entry", "task",
    ] {
        assert!(stdout.contains(required), "missing `{required}` in help");
    }
}

#[test]
fn submitted_events_are_processed_by_a_single_run() {
    let db = temp_path("run-once", "sqlite3");

    let migrate = autoledger(&db, &["migrate"]);
    assert!(migrate.status.success());
    assert_eq!(stdout_json(&migrate)["schema_version"], json!(1));

    let submit = autoledger(
        &db,
        &[
            "event",
            "submit",
            "--tenant",
            "acme",
            "--kind",
            "invoice-received",
            "--payload-json",
            r#"{"file":"scan-001.pdf"}"#,
        ],
    );
    assert!(submit.status.success());
    let event = stdout_json(&submit);
    assert_eq!(event["kind"], json!("invoice_received"));
    assert_eq!(event["status"], json!("unprocessed"));

    let run = autoledger(&db, &["run", "--once"]);
    assert!(run.status.success());
    assert_eq!(stdout_json(&run)["events"], json!(1));

    let processed = autoledger(&db, &["event", "list", "--status", "processed"]);
    assert!(processed.status.success());
    let events = stdout_json(&processed);
    assert_eq!(events.as_array().map(Vec::len), Some(1));

    let tasks = stdout_json(&autoledger(&db, &["task", "list", "--tenant", "acme"]));
    assert_eq!(tasks[0]["task_kind"], json!("parse_invoice"));
    assert_eq!(tasks[0]["status"], json!("pending"));
    let Some(task_id) = tasks[0]["id"].as_str() else {
        panic!("task id missing from {tasks}");
    };

    let finish = autoledger(
        &db,
        &["task", "finish", "--task-id", task_id, "--status", "completed"],
    );
    assert!(finish.status.success());
    assert_eq!(stdout_json(&finish)["status"], json!("completed"));

    let again = autoledger(
        &db,
        &["task", "finish", "--task-id", task_id, "--status", "aborted"],
    );
    assert!(!again.status.success());
}

#[test]
fn invalid_payload_is_rejected_on_submit() {
    let db = temp_path("bad-payload", "sqlite3");
    let output = autoledger(
        &db,
        &[
            "event",
            "submit",
            "--tenant",
            "acme",
            "--kind",
            "period-closing",
            "--payload-json",
            "[1, 2, 3]",
        ],
    );
    assert!(!output.status.success());
}

#[test]
fn score_routes_a_familiar_balanced_invoice_to_auto_post() {
    let fixture = write_fixture(
        "score",
        &json!({
            "document": {
                "source_reference": "inv-1250",
                "counterparty": "vendor-x",
                "accounting_date": "2026-03-15",
                "total_amount": "1250.00",
                "vat_amount": "250.00",
                "description": "Office supplies"
            },
            "suggestion": {
                "lines": [
                    {"account": "6300", "debit": "1000.00", "tax_code": "1"},
                    {"account": "2740", "debit": "250.00"},
                    {"account": "2400", "credit": "1250.00"}
                ]
            },
            "history": {
                "postings_last_12_months": 21,
                "recent_account_sets": [["6300", "2740", "2400"]]
            }
        }),
    );
    let db = temp_path("score", "sqlite3");
    let output = autoledger(&db, &["score", "--input", &fixture.display().to_string()]);
    assert!(output.status.success());

    let report = stdout_json(&output);
    assert_eq!(report["score"]["score"], json!(85));
    assert_eq!(report["route"]["route"], json!("auto_post"));
    assert_eq!(report["balance_error"], Value::Null);
}

#[test]
fn match_reports_every_strategy() {
    let fixture = write_fixture(
        "match",
        &json!({
            "transaction": {
                "id": "bank-001",
                "date": "2026-03-20",
                "amount": "-5250.00",
                "description": "Payment KID 12345678901"
            },
            "candidates": [{
                "id": "voucher-1",
                "number": "17",
                "date": "2026-03-01",
                "amount": "5250.00",
                "reference": "12345678901"
            }]
        }),
    );
    let db = temp_path("match", "sqlite3");
    let output = autoledger(&db, &["match", "--input", &fixture.display().to_string()]);
    assert!(output.status.success());

    let report = stdout_json(&output);
    assert_eq!(report["results"].as_array().map(Vec::len), Some(4));
    assert_eq!(report["best"]["category"], json!("exact_id"));
    assert_eq!(report["best"]["confidence"], json!(100));
    assert_eq!(report["best"]["matched_voucher_id"], json!("voucher-1"));
}

#[test]
fn period_lock_and_unknown_reversal() {
    let db = temp_path("period", "sqlite3");
    let lock = autoledger(
        &db,
        &["period", "lock", "--tenant", "acme", "--period", "2026-01"],
    );
    assert!(lock.status.success());
    assert_eq!(stdout_json(&lock)["period"], json!("2026-01"));

    let bad_period = autoledger(
        &db,
        &["period", "lock", "--tenant", "acme", "--period", "2026-13"],
    );
    assert!(!bad_period.status.success());

    let reverse = autoledger(
        &db,
        &[
            "entry",
            "reverse",
            "--tenant",
            "acme",
            "--entry-id",
            &Ulid::new().to_string(),
            "--date",
            "2026-02-01",
        ],
    );
    assert!(!reverse.status.success());
    assert!(String::from_utf8_lossy(&reverse.stderr).contains("not found"));
}
