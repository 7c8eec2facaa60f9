use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorKind {
    NetworkRequest,
    DataExfiltration,
    DynamicEvaluation,
    Obfuscation,
    CryptoMining,
    DomManipulation,
    CookieAccess,
    LocalStorage,
    TimingAttack,
    Fingerprinting,
    ExecutionError,
}

impl BehaviorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BehaviorKind::NetworkRequest => "network_request",
            BehaviorKind::DataExfiltration => "data_exfiltration",
            BehaviorKind::DynamicEvaluation => "dynamic_evaluation",
            BehaviorKind::Obfuscation => "obfuscation",
            BehaviorKind::CryptoMining => "crypto_mining",
            BehaviorKind::DomManipulation => "dom_manipulation",
            BehaviorKind::CookieAccess => "cookie_access",
            BehaviorKind::LocalStorage => "local_storage",
            BehaviorKind::TimingAttack => "timing_attack",
            BehaviorKind::Fingerprinting => "fingerprinting",
            BehaviorKind::ExecutionError => "execution_error",
        }
    }
}

/// Which detector produced a behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BehaviorSource {
    Static,
    Dynamic,
}

pub type Details = BTreeMap<String, Value>;

/// One detected suspicious operation. Built with [`Behavior::new`] and the
/// `with_*` helpers, then pushed onto an append-only list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Behavior {
    #[serde(rename = "type")]
    pub kind: BehaviorKind,
    pub severity: Severity,
    pub source: BehaviorSource,
    pub description: String,
    #[serde(default)]
    pub details: Details,
    pub timestamp: DateTime<Utc>,
}

impl Behavior {
    pub fn new(
        kind: BehaviorKind,
        severity: Severity,
        source: BehaviorSource,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            source,
            description: description.into(),
            details: Details::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_details(mut self, details: Details) -> Self {
        self.details.extend(details);
        self
    }

    /// Compares everything except the timestamp.
    pub fn same_finding(&self, other: &Behavior) -> bool {
        self.kind == other.kind
            && self.severity == other.severity
            && self.source == other.source
            && self.description == other.description
            && self.details == other.details
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self { level, message: message.into(), timestamp: Utc::now() }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkCall {
    pub api: String,
    pub url: String,
    pub method: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomModification {
    pub api: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageAccess {
    pub area: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleEntry {
    pub level: String,
    pub args: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerCall {
    pub api: String,
    pub delay_ms: f64,
    pub string_callback: bool,
    pub timestamp: DateTime<Utc>,
}

/// How a single sandbox run ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed,
    ScriptError { message: String },
    CapabilityRejected { primitive: String },
    TimedOut { timeout_ms: u64 },
    Faulted { message: String },
    Unavailable { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub backend: String,
    pub outcome: ExecutionOutcome,
    pub behaviors: Vec<Behavior>,
    pub network_calls: Vec<NetworkCall>,
    pub dom_modifications: Vec<DomModification>,
    pub storage_access: Vec<StorageAccess>,
    pub console_output: Vec<ConsoleEntry>,
    pub timers: Vec<TimerCall>,
    pub capability_rejections: Vec<String>,
    pub logs: Vec<LogEntry>,
    pub execution_time_ms: u64,
}

impl ExecutionReport {
    pub fn empty(backend: &str, outcome: ExecutionOutcome) -> Self {
        Self {
            backend: backend.to_string(),
            outcome,
            behaviors: Vec::new(),
            network_calls: Vec::new(),
            dom_modifications: Vec::new(),
            storage_access: Vec::new(),
            console_output: Vec::new(),
            timers: Vec::new(),
            capability_rejections: Vec::new(),
            logs: Vec::new(),
            execution_time_ms: 0,
        }
    }

    /// Report for a run that was abandoned at the deadline before recording anything.
    pub fn timed_out(backend: &str, timeout_ms: u64, elapsed_ms: u64) -> Self {
        Self::empty(backend, ExecutionOutcome::Completed).into_timed_out(timeout_ms, elapsed_ms)
    }

    /// Closes a partial report taken from a run that was abandoned at the
    /// deadline. Everything recorded so far is kept.
    pub fn into_timed_out(mut self, timeout_ms: u64, elapsed_ms: u64) -> Self {
        self.outcome = ExecutionOutcome::TimedOut { timeout_ms };
        self.execution_time_ms = elapsed_ms;
        self.logs.push(LogEntry::error(format!(
            "Script execution exceeded the {timeout_ms}ms timeout and was abandoned"
        )));
        self.behaviors.push(
            Behavior::new(
                BehaviorKind::ExecutionError,
                Severity::Medium,
                BehaviorSource::Dynamic,
                "Script execution timed out",
            )
            .with_detail("timeoutMs", timeout_ms)
            .with_detail("elapsedMs", elapsed_ms),
        );
        self
    }

    /// Report for a sandbox-internal fault; the script's own errors never land here.
    pub fn faulted(backend: &str, message: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::empty(backend, ExecutionOutcome::Completed).into_faulted(message, elapsed_ms)
    }

    /// Closes a partial report whose run ended in a sandbox fault.
    pub fn into_faulted(mut self, message: impl Into<String>, elapsed_ms: u64) -> Self {
        let message = message.into();
        self.outcome = ExecutionOutcome::Faulted { message: message.clone() };
        self.execution_time_ms = elapsed_ms;
        self.logs.push(LogEntry::error(format!("Sandbox execution failed: {message}")));
        self.behaviors.push(
            Behavior::new(
                BehaviorKind::ExecutionError,
                Severity::Medium,
                BehaviorSource::Dynamic,
                "Sandbox execution failed",
            )
            .with_detail("error", message),
        );
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxOptions {
    pub timeout_ms: u64,
    /// Advisory only; nothing in the shared execution scope enforces it.
    pub memory_limit_mb: u64,
    /// Accepted for compatibility. Outbound calls are always stubbed.
    pub network_access: bool,
    pub grace_ms: u64,
    pub loop_iteration_limit: u64,
    pub recursion_limit: usize,
    pub max_preview: usize,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            memory_limit_mb: 50,
            network_access: false,
            grace_ms: 250,
            loop_iteration_limit: 1_000_000,
            recursion_limit: 256,
            max_preview: 100,
        }
    }
}
