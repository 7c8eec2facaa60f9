//! Integration tests for the `hjs` CLI binary.

use std::io::Write;
use std::process::Command;

fn hjs_bin() -> &'static str {
    env!("CARGO_BIN_EXE_hjs")
}

fn script(body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".js").tempfile().expect("temp script");
    file.write_all(body.as_bytes()).expect("write script");
    file
}

#[test]
fn validate_rejects_forbidden_input_with_exit_two() {
    let file = script("const fs = require('fs');");
    let out = Command::new(hjs_bin())
        .args(["validate", "--json"])
        .arg(file.path())
        .output()
        .expect("failed to run hjs");
    assert_eq!(out.status.code(), Some(2));
    let json: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("stdout is not valid JSON");
    assert_eq!(json["valid"], false);
    assert!(json["errors"]
        .as_array()
        .is_some_and(|errors| errors.iter().any(|e| e == "Node.js require() is not allowed")));
}

#[test]
fn scan_reports_patterns_without_executing() {
    let file = script(r#"fetch("https://evil.example/x");"#);
    let out = Command::new(hjs_bin())
        .args(["scan", "--json"])
        .arg(file.path())
        .output()
        .expect("failed to run hjs");
    assert!(out.status.success(), "exit code: {}", out.status);
    let json: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("stdout is not valid JSON");
    assert_eq!(json["patterns"][0]["signature"], "network.fetch");
    assert_eq!(json["behaviors"].as_array().map(Vec::len), Some(1));
}

#[test]
fn status_lists_effective_limits() {
    let out = Command::new(hjs_bin())
        .args(["status", "--json", "--timeout-ms", "1234"])
        .output()
        .expect("failed to run hjs");
    assert!(out.status.success(), "exit code: {}", out.status);
    let json: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("stdout is not valid JSON");
    assert_eq!(json["limits"]["timeoutMs"], 1234);
    assert_eq!(json["limits"]["memoryLimitEnforced"], false);
    assert!(json["signatures"].as_u64().is_some_and(|n| n > 0));
}

#[test]
fn status_reports_backend_choice() {
    let out = Command::new(hjs_bin())
        .args(["status", "--json"])
        .output()
        .expect("failed to run hjs");
    let json: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("stdout is not valid JSON");
    assert_eq!(json["backend"], "auto");
    assert!(json["effectiveBackend"].is_string());

    let out = Command::new(hjs_bin())
        .args(["status", "--json", "--backend", "in-process"])
        .output()
        .expect("failed to run hjs");
    let json: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("stdout is not valid JSON");
    assert_eq!(json["effectiveBackend"], "in-process");
}

#[test]
fn profile_without_config_is_an_error() {
    let out = Command::new(hjs_bin())
        .args(["status", "--profile", "strict"])
        .output()
        .expect("failed to run hjs");
    assert!(!out.status.success());
}

#[cfg(feature = "js-sandbox")]
#[test]
fn analyze_batch_keeps_input_order() {
    let network = script(r#"fetch("https://evil.example/x");"#);
    let benign = script("var total = 1 + 2;");
    let out = Command::new(hjs_bin())
        .args(["analyze", "--json"])
        .arg(network.path())
        .arg(benign.path())
        .output()
        .expect("failed to run hjs");
    assert!(out.status.success(), "exit code: {}", out.status);
    let json: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("stdout is not valid JSON");
    let entries = json.as_array().expect("batch output is an array");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["result"]["riskScore"], 35);
    assert_eq!(entries[1]["result"]["riskScore"], 0);
}
