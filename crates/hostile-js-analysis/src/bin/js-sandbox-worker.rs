use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hostile_js_analysis::capabilities::{lock, CapabilityLedger, SharedLedger};
use hostile_js_analysis::dynamic::{execute_with_ledger, WorkerFrame, WorkerRequest, SUBPROCESS};
use tracing_subscriber::EnvFilter;

const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(20);

fn usage() -> String {
    [
        "Usage:",
        "  js-sandbox-worker < request.json",
        "  js-sandbox-worker --help",
        "",
        "Reads one JSON request {\"source\": ..., \"options\": {...}} from stdin.",
        "Writes line-delimited JSON frames to stdout: snapshots of the records",
        "collected so far while the script runs, then one final report.",
    ]
    .join("\n")
}

fn main() {
    if let Err(error) = run() {
        eprintln!("{error}");
        std::process::exit(1);
    }
}

fn write_frame(frame: &WorkerFrame) -> Result<(), String> {
    let line = serde_json::to_string(frame).map_err(|err| format!("encode frame: {err}"))?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{line}")
        .and_then(|_| stdout.flush())
        .map_err(|err| format!("failed to write frame: {err}"))
}

/// Streams a snapshot whenever the ledger changed, until `done` is set.
fn stream_snapshots(ledger: SharedLedger, done: Arc<AtomicBool>) {
    let mut seen = 0;
    while !done.load(Ordering::Acquire) {
        std::thread::sleep(SNAPSHOT_INTERVAL);
        let report = {
            let ledger = lock(&ledger);
            if ledger.revision() == seen || ledger.is_finished() {
                continue;
            }
            seen = ledger.revision();
            ledger.snapshot()
        };
        if write_frame(&WorkerFrame::Snapshot { report }).is_err() {
            return;
        }
    }
}

fn run() -> Result<(), String> {
    if let Some(arg) = std::env::args().nth(1) {
        if arg == "--help" || arg == "-h" {
            println!("{}", usage());
            return Ok(());
        }
        return Err(format!("unknown argument: {arg}\n\n{}", usage()));
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).try_init();

    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .map_err(|err| format!("failed to read request: {err}"))?;
    let request: WorkerRequest =
        serde_json::from_str(&input).map_err(|err| format!("invalid request: {err}"))?;

    let ledger = CapabilityLedger::shared(SUBPROCESS, &request.options);
    let done = Arc::new(AtomicBool::new(false));
    let reporter = {
        let ledger = Arc::clone(&ledger);
        let done = Arc::clone(&done);
        std::thread::spawn(move || stream_snapshots(ledger, done))
    };

    let report = execute_with_ledger(&request.source, &request.options, &ledger);
    done.store(true, Ordering::Release);
    let _ = reporter.join();
    write_frame(&WorkerFrame::Final { report })
}
