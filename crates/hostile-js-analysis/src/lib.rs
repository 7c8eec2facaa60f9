pub mod capabilities;
pub mod dynamic;
pub mod signatures;
pub mod static_analysis;
pub mod timeout;
pub mod types;

pub use capabilities::{CapabilityLedger, Inert, Intercept, SharedLedger};
pub use dynamic::{
    execute_inline, execute_with_ledger, sandbox_available, ExecutionBackend, InProcessBackend,
    SandboxError, SubprocessBackend, WorkerFrame, WorkerRequest,
};
pub use signatures::{SignatureError, SignatureSpec, SignatureTable};
pub use static_analysis::{scan, scan_with, ScanOptions, StaticReport};
pub use types::{
    Behavior, BehaviorKind, BehaviorSource, ExecutionOutcome, ExecutionReport, LogEntry, LogLevel,
    SandboxOptions, Severity,
};
