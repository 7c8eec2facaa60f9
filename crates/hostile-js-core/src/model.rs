use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use hostile_js_analysis::static_analysis::{ComplexityReport, ObfuscationReport, PatternMatch};
pub use hostile_js_analysis::types::{
    ConsoleEntry, DomModification, NetworkCall, StorageAccess, TimerCall,
};
pub use hostile_js_analysis::{
    Behavior, BehaviorKind, BehaviorSource, ExecutionOutcome, ExecutionReport, LogEntry, LogLevel,
    SandboxOptions, Severity,
};

use crate::error::AnalysisError;
use crate::score::RiskLevel;
use crate::validate::{ValidationStats, MSG_NOT_TEXT};

/// Per-request execution overrides. Unset fields fall back to the analyzer
/// settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_access: Option<bool>,
}

impl ExecutionConfig {
    pub fn apply(&self, options: &mut SandboxOptions) {
        if let Some(timeout_ms) = self.timeout_ms {
            options.timeout_ms = timeout_ms;
        }
        if let Some(memory) = self.memory_limit_mb {
            options.memory_limit_mb = memory;
        }
        if let Some(network) = self.network_access {
            options.network_access = network;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub config: ExecutionConfig,
}

impl AnalysisRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: Some(code.into()), config: ExecutionConfig::default() }
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    /// Reads a loosely-typed JSON body. A `code` field that is present but
    /// not a string is a validation failure rather than a decode error.
    pub fn from_json(body: &Value) -> Result<Self, AnalysisError> {
        let code = match body.get("code") {
            None | Some(Value::Null) => None,
            Some(Value::String(code)) => Some(code.clone()),
            Some(_) => return Err(AnalysisError::Validation(vec![MSG_NOT_TEXT.to_string()])),
        };
        let config = match body.get("config") {
            None | Some(Value::Null) => ExecutionConfig::default(),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|err| AnalysisError::Validation(vec![format!("Invalid config: {err}")]))?,
        };
        Ok(Self { code, config })
    }
}

/// Static detector output carried on the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticSummary {
    pub patterns: Vec<PatternMatch>,
    pub complexity: ComplexityReport,
    pub obfuscation: ObfuscationReport,
}

/// Raw sandbox invocation records carried on the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSummary {
    pub network_calls: Vec<NetworkCall>,
    pub dom_modifications: Vec<DomModification>,
    pub storage_access: Vec<StorageAccess>,
    pub console_output: Vec<ConsoleEntry>,
    pub timers: Vec<TimerCall>,
    pub capability_rejections: Vec<String>,
    pub outcome: ExecutionOutcome,
}

impl From<&ExecutionReport> for DynamicSummary {
    fn from(report: &ExecutionReport) -> Self {
        Self {
            network_calls: report.network_calls.clone(),
            dom_modifications: report.dom_modifications.clone(),
            storage_access: report.storage_access.clone(),
            console_output: report.console_output.clone(),
            timers: report.timers.clone(),
            capability_rejections: report.capability_rejections.clone(),
            outcome: report.outcome.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub id: String,
    pub code: String,
    pub backend: String,
    pub behaviors: Vec<Behavior>,
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    /// Wall-clock milliseconds for the whole analysis.
    pub execution_time: u64,
    pub logs: Vec<LogEntry>,
    pub stats: ValidationStats,
    pub static_report: StaticSummary,
    pub dynamic_report: DynamicSummary,
    pub created_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn count_by_severity(&self, severity: Severity) -> usize {
        self.behaviors.iter().filter(|b| b.severity == severity).count()
    }

    pub fn behaviors_from(&self, source: BehaviorSource) -> impl Iterator<Item = &Behavior> {
        self.behaviors.iter().filter(move |b| b.source == source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_request_distinguishes_missing_and_non_text_code() {
        let missing = AnalysisRequest::from_json(&json!({})).map(|r| r.code);
        assert!(matches!(missing, Ok(None)));

        let numeric = AnalysisRequest::from_json(&json!({ "code": 42 }));
        match numeric {
            Err(AnalysisError::Validation(errors)) => assert_eq!(errors, vec![MSG_NOT_TEXT]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn request_config_overrides_only_what_is_set() {
        let request = AnalysisRequest::from_json(&json!({
            "code": "1",
            "config": { "timeoutMs": 250 }
        }));
        let mut options = SandboxOptions::default();
        if let Ok(request) = request {
            request.config.apply(&mut options);
        }
        assert_eq!(options.timeout_ms, 250);
        assert_eq!(options.memory_limit_mb, 50);
        assert!(!options.network_access);
    }
}
