use std::fmt;

use hostile_js_analysis::Severity;
use tracing::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityDomain {
    Validation,
    StaticScan,
    Sandbox,
    Scoring,
    Config,
}

impl SecurityDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityDomain::Validation => "input.validation",
            SecurityDomain::StaticScan => "detector.static",
            SecurityDomain::Sandbox => "detector.sandbox",
            SecurityDomain::Scoring => "risk.scoring",
            SecurityDomain::Config => "runtime.config",
        }
    }
}

impl fmt::Display for SecurityDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured security-relevant event, emitted through `tracing` with
/// `security = true` so subscribers can route it separately.
#[derive(Debug, Clone, Copy)]
pub struct SecurityEvent<'a> {
    pub level: Level,
    pub domain: SecurityDomain,
    pub severity: Severity,
    pub kind: &'a str,
    pub analysis_id: Option<&'a str>,
    pub backend: Option<&'a str>,
    pub message: &'a str,
}

impl<'a> SecurityEvent<'a> {
    pub fn new(
        level: Level,
        domain: SecurityDomain,
        severity: Severity,
        kind: &'a str,
        message: &'a str,
    ) -> Self {
        Self { level, domain, severity, kind, analysis_id: None, backend: None, message }
    }

    pub fn analysis(mut self, id: &'a str) -> Self {
        self.analysis_id = Some(id);
        self
    }

    pub fn backend(mut self, backend: &'a str) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn emit(self) {
        macro_rules! emit_at {
            ($level:expr) => {
                tracing::event!(
                    $level,
                    security = true,
                    domain = %self.domain,
                    severity = self.severity.as_str(),
                    kind = self.kind,
                    analysis_id = self.analysis_id,
                    backend = self.backend,
                    "{message}",
                    message = self.message
                )
            };
        }
        match self.level {
            Level::TRACE => emit_at!(Level::TRACE),
            Level::DEBUG => emit_at!(Level::DEBUG),
            Level::INFO => emit_at!(Level::INFO),
            Level::WARN => emit_at!(Level::WARN),
            Level::ERROR => emit_at!(Level::ERROR),
        }
    }
}
