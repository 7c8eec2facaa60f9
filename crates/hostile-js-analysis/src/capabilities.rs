//! Engine-agnostic capability ledger.
//!
//! Every stand-in installed in the sandbox scope translates its arguments into
//! an [`Intercept`], hands it to [`CapabilityLedger::intercept`] and converts
//! the returned [`Inert`] value back into an engine value. The ledger owns the
//! collectors and decides severities; the engine binding owns nothing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use chrono::Utc;
use tracing::{debug, warn};

use crate::timeout::TimeoutChecker;
use crate::types::{
    Behavior, BehaviorKind, BehaviorSource, ConsoleEntry, DomModification, ExecutionOutcome,
    ExecutionReport, LogEntry, NetworkCall, SandboxOptions, Severity, StorageAccess, TimerCall,
};

/// atob() tolerates missing padding.
const FORGIVING: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

pub const DEADLINE_MESSAGE: &str = "Script execution deadline exceeded";

pub fn rejection_message(primitive: &str) -> String {
    format!("{primitive} is not allowed in sandbox")
}

/// A call a script made against a sensitive primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum Intercept {
    Network { api: &'static str, url: String, method: String },
    NetworkSend { api: &'static str },
    CookieRead,
    CookieWrite { value: String },
    StorageRead { area: &'static str, key: String },
    StorageWrite { area: &'static str, key: String, value: String },
    StorageRemove { area: &'static str, key: String },
    StorageClear { area: &'static str },
    DomWrite { api: &'static str, target: String, content: String },
    DomCreate { tag: String },
    DomAppend { api: &'static str, target: String },
    Timer { api: &'static str, delay_ms: f64, string_callback: bool },
    TimerClear { api: &'static str },
    Clock,
    Decode { data: String },
    Encode { data: String },
    DynamicCode { primitive: &'static str, code: String },
    Console { level: &'static str, args: Vec<String> },
}

/// The value handed back to the script.
#[derive(Debug, Clone, PartialEq)]
pub enum Inert {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    /// A resolved 403 response for fetch().
    BlockedResponse,
    Node { tag: String },
    TimerId(u32),
    /// Capability refused; the call must throw with this message.
    Rejected { message: String },
    /// Script-visible error that is not a capability rejection.
    Error { message: String },
}

/// Ledger handle shared by the engine thread and the backend supervising it.
pub type SharedLedger = Arc<Mutex<CapabilityLedger>>;

/// Locks a shared ledger. A panic inside a stand-in leaves the records valid.
pub fn lock(ledger: &SharedLedger) -> MutexGuard<'_, CapabilityLedger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct CapabilityLedger {
    report: ExecutionReport,
    cookies: Vec<(String, String)>,
    next_timer: u32,
    deadline: TimeoutChecker,
    max_preview: usize,
    deadline_hit: bool,
    last_rejection: Option<&'static str>,
    revision: u64,
    finished: bool,
}

impl CapabilityLedger {
    pub fn new(backend: &str, options: &SandboxOptions) -> Self {
        Self {
            report: ExecutionReport::empty(backend, ExecutionOutcome::Completed),
            cookies: Vec::new(),
            next_timer: 1,
            deadline: TimeoutChecker::from_millis(options.timeout_ms),
            max_preview: options.max_preview,
            deadline_hit: false,
            last_rejection: None,
            revision: 0,
            finished: false,
        }
    }

    pub fn shared(backend: &str, options: &SandboxOptions) -> SharedLedger {
        Arc::new(Mutex::new(Self::new(backend, options)))
    }

    pub fn backend(&self) -> &str {
        &self.report.backend
    }

    pub fn deadline(&self) -> &TimeoutChecker {
        &self.deadline
    }

    pub fn deadline_hit(&self) -> bool {
        self.deadline_hit
    }

    /// Marks the deadline as hit once it has passed. Polled by the engine
    /// between instruction slices.
    pub fn check_deadline(&mut self) -> bool {
        if self.deadline.expired() {
            self.deadline_hit = true;
        }
        self.deadline_hit
    }

    /// Bumped on every recorded change; lets a reporter skip unchanged snapshots.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// True once the engine has closed the run with [`CapabilityLedger::finish`].
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Primitive named by the most recent capability rejection, if any.
    pub fn last_rejection(&self) -> Option<&'static str> {
        self.last_rejection
    }

    pub fn behaviors(&self) -> &[Behavior] {
        &self.report.behaviors
    }

    pub fn log(&mut self, entry: LogEntry) {
        self.revision += 1;
        self.report.logs.push(entry);
    }

    pub fn push_behavior(&mut self, behavior: Behavior) {
        self.revision += 1;
        self.report.behaviors.push(behavior);
    }

    /// Everything recorded so far, stamped with the time elapsed.
    pub fn snapshot(&self) -> ExecutionReport {
        let mut report = self.report.clone();
        if !self.finished {
            report.execution_time_ms = self.deadline.elapsed_ms();
        }
        report
    }

    pub fn finish(&mut self, outcome: ExecutionOutcome) -> ExecutionReport {
        self.report.outcome = outcome;
        self.report.execution_time_ms = self.deadline.elapsed_ms();
        self.finished = true;
        self.revision += 1;
        self.report.clone()
    }

    pub fn intercept(&mut self, call: Intercept) -> Inert {
        if self.deadline.expired() {
            self.deadline_hit = true;
            return Inert::Error { message: DEADLINE_MESSAGE.to_string() };
        }
        self.revision += 1;
        debug!(call = ?call, "sandbox intercept");
        match call {
            Intercept::Network { api, url, method } => self.network(api, url, method),
            Intercept::NetworkSend { api } => {
                self.log(LogEntry::warning(format!("{api} send blocked in sandbox")));
                Inert::Undefined
            }
            Intercept::CookieRead => {
                self.dynamic(BehaviorKind::CookieAccess, Severity::Medium, "Accessed document.cookie")
                    .with("action", "read");
                Inert::Text(self.cookie_string())
            }
            Intercept::CookieWrite { value } => self.cookie_write(value),
            Intercept::StorageRead { area, key } => {
                self.storage(area, "get", Some(key.clone()), None);
                self.dynamic(BehaviorKind::LocalStorage, Severity::Low, format!("Accessed {area}"))
                    .with("action", "read")
                    .with("key", key);
                Inert::Null
            }
            Intercept::StorageWrite { area, key, value } => {
                let preview = self.preview(&value);
                self.storage(area, "set", Some(key.clone()), Some(value));
                self.dynamic(BehaviorKind::LocalStorage, Severity::Medium, format!("Modified {area}"))
                    .with("action", "write")
                    .with("key", key)
                    .with("value", preview);
                Inert::Undefined
            }
            Intercept::StorageRemove { area, key } => {
                self.storage(area, "remove", Some(key.clone()), None);
                self.dynamic(
                    BehaviorKind::LocalStorage,
                    Severity::Medium,
                    format!("Removed an entry from {area}"),
                )
                .with("action", "remove")
                .with("key", key);
                Inert::Undefined
            }
            Intercept::StorageClear { area } => {
                self.storage(area, "clear", None, None);
                self.dynamic(BehaviorKind::LocalStorage, Severity::Medium, format!("Cleared {area}"))
                    .with("action", "clear");
                Inert::Undefined
            }
            Intercept::DomWrite { api, target, content } => {
                let preview = self.preview(&content);
                self.report.dom_modifications.push(DomModification {
                    api: api.to_string(),
                    target,
                    content: Some(preview.clone()),
                    timestamp: Utc::now(),
                });
                self.dynamic(BehaviorKind::DomManipulation, Severity::Medium, format!("Used {api}"))
                    .with("content", preview);
                Inert::Undefined
            }
            Intercept::DomCreate { tag } => {
                self.report.dom_modifications.push(DomModification {
                    api: "document.createElement".to_string(),
                    target: tag.clone(),
                    content: None,
                    timestamp: Utc::now(),
                });
                self.dynamic(
                    BehaviorKind::DomManipulation,
                    Severity::Low,
                    format!("Created <{tag}> element"),
                )
                .with("tagName", tag.clone());
                Inert::Node { tag }
            }
            Intercept::DomAppend { api, target } => {
                self.report.dom_modifications.push(DomModification {
                    api: api.to_string(),
                    target: target.clone(),
                    content: None,
                    timestamp: Utc::now(),
                });
                self.dynamic(
                    BehaviorKind::DomManipulation,
                    Severity::Low,
                    format!("Inserted node into {target}"),
                )
                .with("api", api);
                Inert::Undefined
            }
            Intercept::Timer { api, delay_ms, string_callback } => {
                self.timer(api, delay_ms, string_callback)
            }
            Intercept::TimerClear { .. } => Inert::Undefined,
            Intercept::Clock => {
                self.dynamic(
                    BehaviorKind::TimingAttack,
                    Severity::Low,
                    "Used performance.now() for high-resolution timing",
                )
                .with("method", "performance.now");
                Inert::Number(self.deadline.elapsed().as_secs_f64() * 1000.0)
            }
            Intercept::Decode { data } => self.decode(data),
            Intercept::Encode { data } => self.encode(data),
            Intercept::DynamicCode { primitive, code } => self.reject(primitive, code),
            Intercept::Console { level, args } => {
                if level == "error" {
                    let message = self.preview(&args.join(" "));
                    self.dynamic(
                        BehaviorKind::DynamicEvaluation,
                        Severity::Low,
                        "Code logged error to console",
                    )
                    .with("message", message);
                }
                self.report.console_output.push(ConsoleEntry {
                    level: level.to_string(),
                    args,
                    timestamp: Utc::now(),
                });
                Inert::Undefined
            }
        }
    }

    fn network(&mut self, api: &'static str, url: String, method: String) -> Inert {
        self.report.network_calls.push(NetworkCall {
            api: api.to_string(),
            url: url.clone(),
            method: method.clone(),
            timestamp: Utc::now(),
        });
        self.dynamic(
            BehaviorKind::NetworkRequest,
            Severity::High,
            format!("Attempted network request using {api}"),
        )
        .with("url", url)
        .with("method", method);
        match api {
            "fetch()" => Inert::BlockedResponse,
            "navigator.sendBeacon()" => Inert::Bool(false),
            _ => Inert::Undefined,
        }
    }

    fn cookie_write(&mut self, value: String) -> Inert {
        let pair = value.split(';').next().unwrap_or_default();
        let (name, cookie) = match pair.split_once('=') {
            Some((name, cookie)) => (name.trim().to_string(), cookie.trim().to_string()),
            None => (String::new(), pair.trim().to_string()),
        };
        match self.cookies.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = cookie,
            None => self.cookies.push((name.clone(), cookie)),
        }
        let preview = self.preview(&value);
        self.storage("cookie", "set", Some(name), Some(value));
        self.dynamic(BehaviorKind::CookieAccess, Severity::High, "Modified document.cookie")
            .with("action", "write")
            .with("value", preview);
        Inert::Undefined
    }

    fn cookie_string(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| {
                if name.is_empty() {
                    value.clone()
                } else {
                    format!("{name}={value}")
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn timer(&mut self, api: &'static str, delay_ms: f64, string_callback: bool) -> Inert {
        self.report.timers.push(TimerCall {
            api: api.to_string(),
            delay_ms,
            string_callback,
            timestamp: Utc::now(),
        });
        if string_callback {
            self.dynamic(
                BehaviorKind::DynamicEvaluation,
                Severity::High,
                format!("Used {api} with string code"),
            )
            .with("delay", delay_ms);
        }
        if api == "setTimeout" && delay_ms < 10.0 {
            self.dynamic(
                BehaviorKind::TimingAttack,
                Severity::Medium,
                "Used setTimeout with very short delay (potential timing attack)",
            )
            .with("delay", delay_ms);
        }
        if api == "setInterval" && delay_ms < 100.0 {
            self.dynamic(
                BehaviorKind::CryptoMining,
                Severity::Medium,
                "Used setInterval with short delay (potential crypto mining)",
            )
            .with("delay", delay_ms);
        }
        let id = self.next_timer;
        self.next_timer = self.next_timer.saturating_add(1);
        Inert::TimerId(id)
    }

    fn decode(&mut self, data: String) -> Inert {
        let preview = self.preview(&data);
        self.dynamic(BehaviorKind::Obfuscation, Severity::Medium, "Used atob() for base64 decoding")
            .with("data", preview);
        let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        match FORGIVING.decode(compact.as_bytes()) {
            Ok(bytes) => Inert::Text(bytes.into_iter().map(char::from).collect()),
            Err(err) => Inert::Error { message: format!("atob: invalid base64 input ({err})") },
        }
    }

    fn encode(&mut self, data: String) -> Inert {
        let preview = self.preview(&data);
        self.dynamic(BehaviorKind::Obfuscation, Severity::Low, "Used btoa() for base64 encoding")
            .with("data", preview);
        let mut bytes = Vec::with_capacity(data.len());
        for ch in data.chars() {
            match u8::try_from(u32::from(ch)) {
                Ok(byte) => bytes.push(byte),
                Err(_) => {
                    return Inert::Error {
                        message: "btoa: string contains characters outside Latin-1".to_string(),
                    }
                }
            }
        }
        Inert::Text(STANDARD.encode(bytes))
    }

    fn reject(&mut self, primitive: &'static str, code: String) -> Inert {
        let message = rejection_message(primitive);
        let preview = self.preview(&code);
        self.dynamic(
            BehaviorKind::DynamicEvaluation,
            Severity::Critical,
            format!("Attempted dynamic code execution via {primitive}"),
        )
        .with("primitive", primitive)
        .with("code", preview);
        self.report.capability_rejections.push(primitive.to_string());
        self.log(LogEntry::warning(format!("Blocked {primitive}")));
        warn!(primitive, "capability rejected");
        self.last_rejection = Some(primitive);
        Inert::Rejected { message }
    }

    fn storage(&mut self, area: &str, action: &str, key: Option<String>, value: Option<String>) {
        let value = value.map(|v| self.preview(&v));
        self.report.storage_access.push(StorageAccess {
            area: area.to_string(),
            action: action.to_string(),
            key,
            value,
            timestamp: Utc::now(),
        });
    }

    fn dynamic(
        &mut self,
        kind: BehaviorKind,
        severity: Severity,
        description: impl Into<String>,
    ) -> BehaviorSlot<'_> {
        self.report
            .behaviors
            .push(Behavior::new(kind, severity, BehaviorSource::Dynamic, description));
        BehaviorSlot { ledger: self }
    }

    fn preview(&self, text: &str) -> String {
        text.chars().take(self.max_preview).collect()
    }
}

/// Handle to the behavior just recorded, for attaching details.
struct BehaviorSlot<'a> {
    ledger: &'a mut CapabilityLedger,
}

impl BehaviorSlot<'_> {
    fn with(self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if let Some(last) = self.ledger.report.behaviors.last_mut() {
            last.details.insert(key.to_string(), value.into());
        }
        self
    }
}
