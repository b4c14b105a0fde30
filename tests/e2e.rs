use std::io::Write;
use std::process::Command;

use tempfile::NamedTempFile;

fn run(args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_txs-ledger"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run binary");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn valid_requests() {
    let (stdout, stderr, success) = run(&["tests/fixtures/valid.csv"]);

    assert!(success);
    assert!(stderr.is_empty(), "unexpected stderr: {stderr}");

    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines,
        vec![
            "account,balance,entries",
            "alice,699.5000,2",
            "bob,225.0000,1",
        ]
    );
}

#[test]
fn errors_warn_but_do_not_block() {
    let (stdout, stderr, success) = run(&["tests/fixtures/with_errors.csv"]);

    assert!(success);
    assert!(stderr.contains("unrecognized request type"));
    assert!(stderr.contains("missing amount"));
    assert!(stderr.contains("unknown account"));

    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, vec!["account,balance,entries", "alice,800.0000,1"]);
}

#[test]
fn config_file_is_honoured() {
    let dir = tempfile::tempdir().unwrap();
    let outbox = dir.path().join("outbox.json");
    let mut config = NamedTempFile::new().unwrap();
    writeln!(config, "partitions: 1").unwrap();
    writeln!(config, "sweep_interval_ms: 20").unwrap();
    writeln!(config, "outbox_path: {}", outbox.display()).unwrap();

    let (stdout, stderr, success) = run(&[
        "tests/fixtures/valid.csv",
        config.path().to_str().unwrap(),
    ]);

    assert!(success);
    assert!(stderr.is_empty(), "unexpected stderr: {stderr}");
    assert!(stdout.contains("alice,699.5000,2"));
}

#[test]
fn missing_input_fails() {
    let (stdout, stderr, success) = run(&["tests/fixtures/does_not_exist.csv"]);

    assert!(!success);
    assert!(stdout.is_empty());
    assert!(stderr.contains("failed to open"));
}

#[test]
fn malformed_config_fails() {
    let mut config = NamedTempFile::new().unwrap();
    writeln!(config, "partitions: [not, a, number]").unwrap();

    let (_, stderr, success) = run(&[
        "tests/fixtures/valid.csv",
        config.path().to_str().unwrap(),
    ]);

    assert!(!success);
    assert!(!stderr.is_empty());
}
