//! Execution backends for the capability-substituted sandbox.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::capabilities::{lock, CapabilityLedger};
use crate::types::{ExecutionReport, LogEntry, SandboxOptions};

#[cfg(feature = "js-sandbox")]
mod scope;

pub const IN_PROCESS: &str = "in-process";
pub const SUBPROCESS: &str = "subprocess";
pub const WORKER_BINARY: &str = "js-sandbox-worker";

/// Runs one script to completion, timeout or failure. Never panics and never
/// returns an error: every failure is folded into the report.
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute(&self, source: &str, options: &SandboxOptions) -> ExecutionReport;
}

/// Payload a worker process reads from stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub source: String,
    #[serde(default)]
    pub options: SandboxOptions,
}

/// One line of worker output. A worker writes any number of snapshots while
/// the script runs and exactly one final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum WorkerFrame {
    Snapshot { report: ExecutionReport },
    Final { report: ExecutionReport },
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn sandbox worker {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sandbox worker protocol error: {0}")]
    Protocol(String),
    #[error("sandbox worker exited with {0}")]
    WorkerExited(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn sandbox_available() -> bool {
    cfg!(feature = "js-sandbox")
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Runs the script on a dedicated thread and waits for it up to the timeout.
///
/// The engine checks the deadline between instruction slices and closes its
/// own report, so the thread normally ends within the grace period. If it
/// does not, the records collected so far are taken from the shared ledger
/// and the thread is left detached.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessBackend;

impl ExecutionBackend for InProcessBackend {
    fn name(&self) -> &'static str {
        IN_PROCESS
    }

    fn execute(&self, source: &str, options: &SandboxOptions) -> ExecutionReport {
        let started = Instant::now();
        let ledger = CapabilityLedger::shared(IN_PROCESS, options);
        let (tx, rx) = mpsc::channel();
        let owned_source = source.to_string();
        let owned_options = options.clone();
        let engine_ledger = Arc::clone(&ledger);
        let spawned = std::thread::Builder::new()
            .name("js-sandbox".into())
            .stack_size(8 * 1024 * 1024)
            .spawn(move || {
                let report = execute_with_ledger(&owned_source, &owned_options, &engine_ledger);
                let _ = tx.send(report);
            });
        if let Err(err) = spawned {
            return ExecutionReport::faulted(
                IN_PROCESS,
                format!("failed to start sandbox thread: {err}"),
                elapsed_ms(started),
            );
        }

        let first = match rx.recv_timeout(Duration::from_millis(options.timeout_ms)) {
            Err(RecvTimeoutError::Timeout) => {
                debug!(timeout_ms = options.timeout_ms, "waiting for sandbox thread to stop");
                rx.recv_timeout(Duration::from_millis(options.grace_ms))
            }
            other => other,
        };
        match first {
            Ok(report) => report,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_ms = options.timeout_ms,
                    grace_ms = options.grace_ms,
                    "in-process sandbox did not stop within its grace period"
                );
                let ledger = lock(&ledger);
                if ledger.is_finished() {
                    return ledger.snapshot();
                }
                let mut report =
                    ledger.snapshot().into_timed_out(options.timeout_ms, elapsed_ms(started));
                report
                    .logs
                    .push(LogEntry::warning("Sandbox thread was detached after the grace period"));
                report
            }
            Err(RecvTimeoutError::Disconnected) => lock(&ledger)
                .snapshot()
                .into_faulted("sandbox thread terminated without a report", elapsed_ms(started)),
        }
    }
}

/// Owns a spawned worker and kills and reaps it on every way out of
/// [`SubprocessBackend::run`].
struct Reaped(Child);

impl Reaped {
    fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.0.wait()
    }
}

impl Drop for Reaped {
    fn drop(&mut self) {
        if matches!(self.0.try_wait(), Ok(None)) {
            let _ = self.0.kill();
        }
        let _ = self.0.wait();
    }
}

/// Runs the script in a `js-sandbox-worker` child process that is killed at
/// the deadline plus grace period.
#[derive(Debug, Clone)]
pub struct SubprocessBackend {
    worker: PathBuf,
}

impl SubprocessBackend {
    pub fn new(worker: impl Into<PathBuf>) -> Self {
        Self { worker: worker.into() }
    }

    /// Looks next to the current executable, then in the cargo target dirs.
    pub fn discover() -> Option<Self> {
        let mut candidates = Vec::new();
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                candidates.push(dir.join(WORKER_BINARY));
                if let Some(parent) = dir.parent() {
                    candidates.push(parent.join(WORKER_BINARY));
                }
            }
        }
        candidates.push(PathBuf::from("./target/debug").join(WORKER_BINARY));
        candidates.push(PathBuf::from("./target/release").join(WORKER_BINARY));
        candidates.into_iter().find(|path| path.is_file()).map(|path| {
            debug!(path = %path.display(), "found sandbox worker");
            Self::new(path)
        })
    }

    pub fn worker(&self) -> &Path {
        &self.worker
    }

    fn run(&self, source: &str, options: &SandboxOptions) -> Result<ExecutionReport, SandboxError> {
        let started = Instant::now();
        let child = Command::new(&self.worker)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| SandboxError::Spawn { path: self.worker.clone(), source })?;
        let mut worker = Reaped(child);

        let request = WorkerRequest { source: source.to_string(), options: options.clone() };
        let payload =
            serde_json::to_vec(&request).map_err(|err| SandboxError::Protocol(err.to_string()))?;
        {
            let mut stdin = worker
                .0
                .stdin
                .take()
                .ok_or_else(|| SandboxError::Protocol("worker stdin unavailable".into()))?;
            stdin.write_all(&payload)?;
        }

        let stdout = worker
            .0
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Protocol("worker stdout unavailable".into()))?;
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let deadline =
            started + Duration::from_millis(options.timeout_ms.saturating_add(options.grace_ms));
        let mut partial: Option<ExecutionReport> = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(line) => {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let frame: WorkerFrame = serde_json::from_str(&line)
                        .map_err(|err| SandboxError::Protocol(err.to_string()))?;
                    match frame {
                        WorkerFrame::Snapshot { report } => partial = Some(report),
                        WorkerFrame::Final { mut report } => {
                            worker.wait()?;
                            report.backend = SUBPROCESS.to_string();
                            return Ok(report);
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let status = worker.wait()?;
                    let Some(report) = partial else {
                        return Err(SandboxError::WorkerExited(status.to_string()));
                    };
                    let mut report = report.into_faulted(
                        format!("sandbox worker exited with {status} before its final report"),
                        elapsed_ms(started),
                    );
                    report.backend = SUBPROCESS.to_string();
                    return Ok(report);
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(timeout_ms = options.timeout_ms, "killing sandbox worker at deadline");
                    drop(worker);
                    let elapsed = elapsed_ms(started);
                    let mut report = match partial {
                        Some(report) => report.into_timed_out(options.timeout_ms, elapsed),
                        None => ExecutionReport::timed_out(SUBPROCESS, options.timeout_ms, elapsed),
                    };
                    report.backend = SUBPROCESS.to_string();
                    report.logs.push(LogEntry::warning("Sandbox worker process was killed"));
                    return Ok(report);
                }
            }
        }
    }
}

impl ExecutionBackend for SubprocessBackend {
    fn name(&self) -> &'static str {
        SUBPROCESS
    }

    fn execute(&self, source: &str, options: &SandboxOptions) -> ExecutionReport {
        let started = Instant::now();
        match self.run(source, options) {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "sandbox worker failed");
                ExecutionReport::faulted(SUBPROCESS, err.to_string(), elapsed_ms(started))
            }
        }
    }
}

/// Executes the script on the calling thread against a fresh instrumented scope.
pub fn execute_inline(source: &str, options: &SandboxOptions, backend: &str) -> ExecutionReport {
    let ledger = CapabilityLedger::shared(backend, options);
    execute_with_ledger(source, options, &ledger)
}

#[cfg(feature = "js-sandbox")]
pub use sandbox_impl::execute_with_ledger;

#[cfg(feature = "js-sandbox")]
mod sandbox_impl {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::pin;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::task::{self, Poll, Wake, Waker};

    use boa_engine::job::{GenericJob, Job, JobExecutor, PromiseJob};
    use boa_engine::script::Script;
    use boa_engine::vm::RuntimeLimits;
    use boa_engine::{Context, JsNativeError, JsResult, JsValue, Source};
    use tracing::debug;

    use super::scope;
    use crate::capabilities::{lock, rejection_message, SharedLedger, DEADLINE_MESSAGE};
    use crate::types::{
        Behavior, BehaviorKind, BehaviorSource, ExecutionOutcome, ExecutionReport, LogEntry,
        SandboxOptions, Severity,
    };

    /// Instruction cost the engine may spend between two deadline checks.
    const SLICE_BUDGET: u32 = 10_000;

    /// Executes the script on the calling thread, recording into `ledger`.
    /// Whoever else holds the ledger can read the records while this runs.
    pub fn execute_with_ledger(
        source: &str,
        options: &SandboxOptions,
        ledger: &SharedLedger,
    ) -> ExecutionReport {
        {
            let mut l = lock(ledger);
            let backend = l.backend().to_string();
            l.log(LogEntry::info(format!("Starting sandbox execution ({backend})")));
            l.log(LogEntry::info(format!(
                "Memory ceiling of {}MB is advisory and not enforced",
                options.memory_limit_mb
            )));
            if options.network_access {
                l.log(LogEntry::warning(
                    "Network access was requested but remains blocked in the sandbox",
                ));
            }
        }

        let jobs = Rc::new(DeadlineJobs::new(ledger));
        let mut context = match Context::builder().job_executor(jobs).build() {
            Ok(context) => context,
            Err(err) => return fault(ledger, format!("failed to build sandbox context: {err}")),
        };
        let mut limits = RuntimeLimits::default();
        limits.set_loop_iteration_limit(options.loop_iteration_limit);
        limits.set_recursion_limit(options.recursion_limit);
        limits.set_stack_size_limit(512 * 1024);
        context.set_runtime_limits(limits);
        if let Err(err) = scope::install(&mut context, ledger) {
            return fault(ledger, format!("failed to install sandbox scope: {err}"));
        }

        let evaluated = evaluate(&mut context, source, ledger);
        let drained = if lock(ledger).deadline_hit() { Ok(()) } else { context.run_jobs() };
        let outcome = match evaluated.and_then(|_| drained) {
            Ok(()) => ExecutionOutcome::Completed,
            Err(err) => classify(ledger, err.to_string(), format!("{err:?}"), options),
        };
        drop(context);

        let mut l = lock(ledger);
        let elapsed = l.deadline().elapsed_ms();
        l.log(LogEntry::info(format!("Sandbox execution completed in {elapsed}ms")));
        let report = l.finish(outcome);
        debug!(
            behaviors = report.behaviors.len(),
            elapsed_ms = report.execution_time_ms,
            "sandbox run finished"
        );
        report
    }

    fn fault(ledger: &SharedLedger, message: String) -> ExecutionReport {
        let mut l = lock(ledger);
        let report = l.snapshot().into_faulted(message, l.deadline().elapsed_ms());
        l.finish(report.outcome.clone());
        report
    }

    struct NoopWake;

    impl Wake for NoopWake {
        fn wake(self: Arc<Self>) {}
    }

    /// Runs the script in slices of [`SLICE_BUDGET`] and abandons it at the
    /// first slice boundary past the deadline. Nested loops and long straight
    /// runs are cut off here even when no stand-in is ever called.
    fn evaluate(context: &mut Context, source: &str, ledger: &SharedLedger) -> JsResult<()> {
        let script = Script::parse(Source::from_bytes(source.as_bytes()), None, context)?;
        let waker = Waker::from(Arc::new(NoopWake));
        let mut cx = task::Context::from_waker(&waker);
        let mut run = pin!(script.evaluate_async_with_budget(context, SLICE_BUDGET));
        loop {
            match run.as_mut().poll(&mut cx) {
                Poll::Ready(result) => return result.map(|_: JsValue| ()),
                Poll::Pending => {
                    if lock(ledger).check_deadline() {
                        return Err(JsNativeError::error().with_message(DEADLINE_MESSAGE).into());
                    }
                }
            }
        }
    }

    /// Promise job queue that stops draining once the deadline has passed.
    /// Timer callbacks never run, so timeout jobs are dropped.
    struct DeadlineJobs {
        ledger: SharedLedger,
        promise_jobs: RefCell<VecDeque<PromiseJob>>,
        generic_jobs: RefCell<VecDeque<GenericJob>>,
    }

    impl DeadlineJobs {
        fn new(ledger: &SharedLedger) -> Self {
            Self {
                ledger: Arc::clone(ledger),
                promise_jobs: RefCell::default(),
                generic_jobs: RefCell::default(),
            }
        }
    }

    impl JobExecutor for DeadlineJobs {
        fn enqueue_job(self: Rc<Self>, job: Job, _context: &mut Context) {
            match job {
                Job::PromiseJob(job) => self.promise_jobs.borrow_mut().push_back(job),
                Job::GenericJob(job) => self.generic_jobs.borrow_mut().push_back(job),
                _ => {}
            }
        }

        fn run_jobs(self: Rc<Self>, context: &mut Context) -> JsResult<()> {
            loop {
                if lock(&self.ledger).check_deadline() {
                    self.promise_jobs.borrow_mut().clear();
                    self.generic_jobs.borrow_mut().clear();
                    return Err(JsNativeError::error().with_message(DEADLINE_MESSAGE).into());
                }
                let promise_job = self.promise_jobs.borrow_mut().pop_front();
                if let Some(job) = promise_job {
                    job.call(context)?;
                    continue;
                }
                let generic_job = self.generic_jobs.borrow_mut().pop_front();
                match generic_job {
                    Some(job) => {
                        job.call(context)?;
                    }
                    None => return Ok(()),
                }
            }
        }
    }

    fn classify(
        ledger: &SharedLedger,
        message: String,
        debug_text: String,
        options: &SandboxOptions,
    ) -> ExecutionOutcome {
        let mut l = lock(ledger);
        if l.check_deadline() {
            let elapsed = l.deadline().elapsed_ms();
            l.log(LogEntry::error(format!(
                "Script execution exceeded the {}ms timeout",
                options.timeout_ms
            )));
            l.push_behavior(
                Behavior::new(
                    BehaviorKind::ExecutionError,
                    Severity::Medium,
                    BehaviorSource::Dynamic,
                    "Script execution timed out",
                )
                .with_detail("timeoutMs", options.timeout_ms)
                .with_detail("elapsedMs", elapsed),
            );
            return ExecutionOutcome::TimedOut { timeout_ms: options.timeout_ms };
        }
        if let Some(primitive) = l.last_rejection() {
            if message.contains(&rejection_message(primitive)) {
                l.log(LogEntry::warning(format!("Execution stopped: {message}")));
                return ExecutionOutcome::CapabilityRejected { primitive: primitive.to_string() };
            }
        }
        l.log(LogEntry::error(format!("Code execution error: {message}")));
        let description = if debug_text.contains("RuntimeLimit") {
            "Execution aborted by runtime limit"
        } else {
            "Code execution resulted in runtime error"
        };
        l.push_behavior(
            Behavior::new(
                BehaviorKind::ExecutionError,
                Severity::Medium,
                BehaviorSource::Dynamic,
                description,
            )
            .with_detail("error", message.clone())
            .with_detail("type", error_type(&message)),
        );
        ExecutionOutcome::ScriptError { message }
    }

    /// `TypeError: x is not a function` -> `TypeError`.
    fn error_type(message: &str) -> String {
        message
            .split_once(':')
            .map(|(head, _)| head.trim())
            .filter(|head| head.ends_with("Error") || *head == "RuntimeLimit")
            .unwrap_or("Error")
            .to_string()
    }

    #[cfg(test)]
    mod tests {
        use super::error_type;

        #[test]
        fn error_type_reads_prefix() {
            assert_eq!(error_type("TypeError: x is not a function"), "TypeError");
            assert_eq!(error_type("boom"), "Error");
            assert_eq!(error_type("uncaught: value"), "Error");
        }
    }
}

#[cfg(not(feature = "js-sandbox"))]
pub fn execute_with_ledger(
    _source: &str,
    _options: &SandboxOptions,
    ledger: &crate::capabilities::SharedLedger,
) -> ExecutionReport {
    use crate::types::ExecutionOutcome;

    let mut l = lock(ledger);
    l.log(LogEntry::warning("Sandbox unavailable: built without the js-sandbox feature"));
    l.finish(ExecutionOutcome::Unavailable { reason: "sandbox_unavailable".into() })
}
