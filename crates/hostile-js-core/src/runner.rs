//! The analysis pipeline: validate, run both detectors side by side, merge
//! their behaviors and score the result.

use std::any::Any;
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, warn, Level};
use uuid::Uuid;

use hostile_js_analysis::dynamic::{IN_PROCESS, SUBPROCESS};
use hostile_js_analysis::{
    scan_with, ExecutionBackend, InProcessBackend, ScanOptions, SignatureSpec, SignatureTable,
    StaticReport, SubprocessBackend,
};

use crate::config::ConfigError;
use crate::error::AnalysisError;
use crate::model::{
    AnalysisRequest, AnalysisResult, DynamicSummary, ExecutionOutcome, ExecutionReport, LogEntry,
    SandboxOptions, Severity, StaticSummary,
};
use crate::score::{score_with, RiskLevel, ScoringConfig};
use crate::security_log::{SecurityDomain, SecurityEvent};
use crate::validate::{validate, ValidationLimits, ValidationReport, MSG_REQUIRED};

/// Upper bound on a per-request timeout override.
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Which execution backend runs the script. `Auto` uses a worker process
/// when its binary can be found, since only a process can be killed outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Auto,
    InProcess,
    Subprocess,
}

impl BackendKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Some(BackendKind::Auto),
            IN_PROCESS | "inprocess" | "thread" => Some(BackendKind::InProcess),
            SUBPROCESS | "process" | "worker" => Some(BackendKind::Subprocess),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Auto => "auto",
            BackendKind::InProcess => IN_PROCESS,
            BackendKind::Subprocess => SUBPROCESS,
        }
    }
}

/// Everything an [`Analyzer`] needs, after config and CLI overrides.
#[derive(Debug, Clone, Default)]
pub struct AnalyzerSettings {
    pub validation: ValidationLimits,
    pub sandbox: SandboxOptions,
    pub backend: BackendKind,
    pub worker_path: Option<PathBuf>,
    pub scoring: ScoringConfig,
    pub scan: ScanOptions,
    pub extra_signatures: Vec<SignatureSpec>,
}

pub struct Analyzer {
    settings: AnalyzerSettings,
    table: SignatureTable,
    backend: Box<dyn ExecutionBackend>,
}

impl Analyzer {
    pub fn new(settings: AnalyzerSettings) -> Result<Self, ConfigError> {
        let backend = resolve_backend(&settings)?;
        Self::with_backend(settings, backend)
    }

    pub fn with_backend(
        settings: AnalyzerSettings,
        backend: Box<dyn ExecutionBackend>,
    ) -> Result<Self, ConfigError> {
        let table = if settings.extra_signatures.is_empty() {
            SignatureTable::builtin().clone()
        } else {
            SignatureTable::with_extra(&settings.extra_signatures)?
        };
        debug!(signatures = table.len(), backend = backend.name(), "Analyzer ready");
        Ok(Self { settings, table, backend })
    }

    pub fn settings(&self) -> &AnalyzerSettings {
        &self.settings
    }

    pub fn signatures(&self) -> &SignatureTable {
        &self.table
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn validate(&self, code: Option<&str>) -> ValidationReport {
        validate(code, &self.settings.validation)
    }

    /// Static detector only. Nothing is executed.
    pub fn scan(&self, code: &str) -> StaticReport {
        scan_with(code, &self.table, &self.settings.scan)
    }

    pub fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, AnalysisError> {
        let started = Instant::now();
        let id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("analysis", id = %id, backend = self.backend.name());
        let _guard = span.enter();

        let validation = self.validate(request.code.as_deref());
        if !validation.valid {
            info!(errors = validation.errors.len(), "Input rejected before analysis");
            return Err(AnalysisError::Validation(validation.errors));
        }
        let Some(code) = request.code.as_deref() else {
            return Err(AnalysisError::Validation(vec![MSG_REQUIRED.to_string()]));
        };

        let mut options = self.settings.sandbox.clone();
        request.config.apply(&mut options);
        let mut pipeline_logs = Vec::new();
        if options.timeout_ms == 0 || options.timeout_ms > MAX_REQUEST_TIMEOUT_MS {
            let clamped = options.timeout_ms.clamp(1, MAX_REQUEST_TIMEOUT_MS);
            pipeline_logs.push(LogEntry::warning(format!(
                "Requested timeout {}ms is out of range; using {clamped}ms",
                options.timeout_ms
            )));
            options.timeout_ms = clamped;
        }
        info!(bytes = code.len(), timeout_ms = options.timeout_ms, "Starting analysis");

        let (static_report, dynamic_report) = self.run_detectors(code, &options, &id)?;

        let mut behaviors = static_report.behaviors;
        behaviors.extend(dynamic_report.behaviors.iter().cloned());
        let mut logs = pipeline_logs;
        logs.extend(static_report.logs);
        logs.extend(dynamic_report.logs.iter().cloned());

        self.report_outcome(&dynamic_report, &id);

        let risk_score = score_with(&behaviors, &self.settings.scoring);
        let risk_level = RiskLevel::from_score(risk_score);
        if risk_level >= RiskLevel::High {
            let message = format!("Script scored {risk_score} ({})", risk_level.as_str());
            SecurityEvent::new(
                Level::WARN,
                SecurityDomain::Scoring,
                Severity::High,
                "high_risk_script",
                &message,
            )
            .analysis(&id)
            .emit();
        }
        let execution_time = started.elapsed().as_millis() as u64;
        info!(
            risk_score,
            behaviors = behaviors.len(),
            execution_time_ms = execution_time,
            "Analysis complete"
        );

        Ok(AnalysisResult {
            id,
            code: code.to_string(),
            backend: dynamic_report.backend.clone(),
            behaviors,
            risk_score,
            risk_level,
            execution_time,
            logs,
            stats: validation.stats,
            static_report: StaticSummary {
                patterns: static_report.patterns,
                complexity: static_report.complexity,
                obfuscation: static_report.obfuscation,
            },
            dynamic_report: DynamicSummary::from(&dynamic_report),
            created_at: Utc::now(),
        })
    }

    /// Runs the scanner and the sandbox on scoped threads. A panic in either
    /// is folded into its own report; the other detector's output is kept.
    fn run_detectors(
        &self,
        code: &str,
        options: &SandboxOptions,
        id: &str,
    ) -> Result<(StaticReport, ExecutionReport), AnalysisError> {
        let started = Instant::now();
        std::thread::scope(|s| -> Result<(StaticReport, ExecutionReport), AnalysisError> {
            let static_handle = std::thread::Builder::new()
                .name("static-scan".into())
                .spawn_scoped(s, || self.scan(code))
                .map_err(|err| AnalysisError::Analysis(format!("failed to start scanner: {err}")))?;
            let dynamic_handle = std::thread::Builder::new()
                .name("sandbox-driver".into())
                .spawn_scoped(s, || self.backend.execute(code, options))
                .map_err(|err| {
                    AnalysisError::Execution(format!("failed to start sandbox: {err}"))
                })?;

            let static_report = static_handle.join().unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                error!(error = %message, "Static scanner panicked");
                SecurityEvent::new(
                    Level::ERROR,
                    SecurityDomain::StaticScan,
                    Severity::Medium,
                    "detector_fault",
                    &message,
                )
                .analysis(id)
                .emit();
                StaticReport {
                    logs: vec![LogEntry::error(format!("Static analysis failed: {message}"))],
                    ..StaticReport::default()
                }
            });
            let dynamic_report = dynamic_handle.join().unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                error!(error = %message, "Sandbox driver panicked");
                ExecutionReport::faulted(
                    self.backend.name(),
                    message,
                    started.elapsed().as_millis() as u64,
                )
            });
            Ok((static_report, dynamic_report))
        })
    }

    fn report_outcome(&self, report: &ExecutionReport, id: &str) {
        let backend = report.backend.as_str();
        for primitive in &report.capability_rejections {
            let message = format!("Script attempted {primitive}");
            SecurityEvent::new(
                Level::WARN,
                SecurityDomain::Sandbox,
                Severity::Critical,
                "capability_rejected",
                &message,
            )
            .analysis(id)
            .backend(backend)
            .emit();
        }
        match &report.outcome {
            ExecutionOutcome::TimedOut { timeout_ms } => {
                let message = format!("Script exceeded the {timeout_ms}ms timeout");
                SecurityEvent::new(
                    Level::WARN,
                    SecurityDomain::Sandbox,
                    Severity::Medium,
                    "execution_timeout",
                    &message,
                )
                .analysis(id)
                .backend(backend)
                .emit();
            }
            ExecutionOutcome::Faulted { message } => {
                SecurityEvent::new(
                    Level::ERROR,
                    SecurityDomain::Sandbox,
                    Severity::Medium,
                    "detector_fault",
                    message,
                )
                .analysis(id)
                .backend(backend)
                .emit();
            }
            ExecutionOutcome::Unavailable { reason } => {
                warn!(reason = %reason, "Dynamic analysis unavailable; static findings only");
            }
            ExecutionOutcome::Completed
            | ExecutionOutcome::ScriptError { .. }
            | ExecutionOutcome::CapabilityRejected { .. } => {}
        }
    }
}

/// Builds the backend `settings` ask for. An explicit `Subprocess` without a
/// worker binary is an error; `Auto` falls back to the in-process engine.
pub fn resolve_backend(settings: &AnalyzerSettings) -> Result<Box<dyn ExecutionBackend>, ConfigError> {
    let worker = |require_file: bool| {
        settings
            .worker_path
            .as_ref()
            .filter(|path| !require_file || path.is_file())
            .map(SubprocessBackend::new)
            .or_else(SubprocessBackend::discover)
    };
    match settings.backend {
        BackendKind::InProcess => Ok(Box::new(InProcessBackend)),
        BackendKind::Subprocess => Ok(Box::new(worker(false).ok_or(ConfigError::WorkerNotFound)?)),
        BackendKind::Auto => match worker(true) {
            Some(backend) => {
                debug!(worker = %backend.worker().display(), "Using sandbox worker process");
                Ok(Box::new(backend))
            }
            None => {
                warn!(
                    "Sandbox worker binary not found; falling back to the in-process backend, \
                     which cannot be killed if the engine stops checking its deadline"
                );
                Ok(Box::new(InProcessBackend))
            }
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
