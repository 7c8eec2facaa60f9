use std::collections::HashMap;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn, Level};

use hostile_js_analysis::{SignatureError, SignatureSpec};

use crate::model::Severity;
use crate::runner::{AnalyzerSettings, BackendKind};
use crate::security_log::{SecurityDomain, SecurityEvent};

const MAX_CONFIG_BYTES: u64 = 1024 * 1024;
const MAX_TIMEOUT_MS: u64 = 60_000;
const MAX_MEMORY_LIMIT_MB: u64 = 4_096;
const MAX_GRACE_MS: u64 = 10_000;
const MAX_RECURSION_LIMIT: usize = 10_000;
const MAX_INPUT_LENGTH: usize = 10_000_000;
const MAX_NESTING: usize = 1_000;
const MAX_FUNCTIONS: usize = 100_000;
const MAX_LINE_LENGTH: usize = 1_000_000;
const MAX_PIVOT: f64 = 1_000.0;
const MAX_INDICATOR_CAP: u32 = 100;
const MAX_ENTROPY_BITS: f64 = 32.0;
const MAX_ENTROPY_POINTS: u32 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown profile: {0}")]
    UnknownProfile(String),
    #[error("invalid signature table: {0}")]
    Signatures(#[from] SignatureError),
    #[error("sandbox worker binary not found; set [sandbox] worker_path")]
    WorkerNotFound,
}

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub profiles: Option<HashMap<String, Profile>>,
    pub validation: Option<ValidationConfig>,
    pub sandbox: Option<SandboxConfig>,
    pub scoring: Option<ScoringSection>,
    pub obfuscation: Option<ObfuscationConfig>,
    pub logging: Option<LoggingConfig>,
    pub signatures: Option<Vec<SignatureSpec>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Profile {
    pub validation: Option<ValidationConfig>,
    pub sandbox: Option<SandboxConfig>,
    pub scoring: Option<ScoringSection>,
    pub obfuscation: Option<ObfuscationConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    pub max_length: Option<usize>,
    pub max_nesting: Option<usize>,
    pub max_functions: Option<usize>,
    pub max_line_length: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    pub timeout_ms: Option<u64>,
    pub memory_limit_mb: Option<u64>,
    pub network_access: Option<bool>,
    pub backend: Option<String>,
    pub grace_ms: Option<u64>,
    pub loop_iteration_limit: Option<u64>,
    pub recursion_limit: Option<usize>,
    pub worker_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScoringSection {
    pub diminishing_pivot: Option<f64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObfuscationConfig {
    pub indicator_cap: Option<u32>,
    pub entropy_threshold: Option<f64>,
    pub entropy_points: Option<u32>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if let Ok(meta) = fs::metadata(path) {
            if meta.len() > MAX_CONFIG_BYTES {
                return Err(anyhow::anyhow!(
                    "config {} exceeds {} bytes",
                    path.display(),
                    MAX_CONFIG_BYTES
                ));
            }
        }
        let data = fs::read_to_string(path)?;
        let cfg = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => toml::from_str::<Config>(&data)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str::<Config>(&data)?,
            _ => toml::from_str::<Config>(&data)
                .or_else(|_| serde_yaml::from_str::<Config>(&data))?,
        };
        Ok(cfg)
    }

    pub fn log_level(&self) -> Option<&str> {
        self.logging.as_ref().and_then(|l| l.level.as_deref())
    }

    /// Layers the top-level sections, then the named profile, onto `settings`.
    pub fn apply(
        &self,
        settings: &mut AnalyzerSettings,
        profile: Option<&str>,
    ) -> Result<(), ConfigError> {
        apply_sections(
            self.validation.as_ref(),
            self.sandbox.as_ref(),
            self.scoring.as_ref(),
            self.obfuscation.as_ref(),
            settings,
        );
        if let Some(extra) = &self.signatures {
            info!(count = extra.len(), "Config adds signatures");
            settings.extra_signatures.extend(extra.iter().cloned());
        }
        if let Some(name) = profile {
            let profile_cfg = self
                .profiles
                .as_ref()
                .and_then(|profiles| profiles.get(name))
                .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))?;
            info!(profile = name, "Applying config profile");
            apply_sections(
                profile_cfg.validation.as_ref(),
                profile_cfg.sandbox.as_ref(),
                profile_cfg.scoring.as_ref(),
                profile_cfg.obfuscation.as_ref(),
                settings,
            );
        }
        Ok(())
    }
}

fn apply_sections(
    validation: Option<&ValidationConfig>,
    sandbox: Option<&SandboxConfig>,
    scoring: Option<&ScoringSection>,
    obfuscation: Option<&ObfuscationConfig>,
    settings: &mut AnalyzerSettings,
) {
    if let Some(cfg) = validation {
        apply_validation(cfg, settings);
    }
    if let Some(cfg) = sandbox {
        apply_sandbox(cfg, settings);
    }
    if let Some(cfg) = scoring {
        if let Some(pivot) = cfg.diminishing_pivot {
            if !pivot.is_finite() || pivot <= 0.0 || pivot > MAX_PIVOT {
                reject("invalid_diminishing_pivot", "Invalid diminishing_pivot in config", pivot);
            } else {
                info!(value = pivot, "Config override diminishing_pivot");
                settings.scoring.diminishing_pivot = pivot;
            }
        }
    }
    if let Some(cfg) = obfuscation {
        apply_obfuscation(cfg, settings);
    }
}

fn apply_validation(cfg: &ValidationConfig, settings: &mut AnalyzerSettings) {
    let limits = &mut settings.validation;
    if let Some(v) = cfg.max_length {
        if v == 0 || v > MAX_INPUT_LENGTH {
            reject("invalid_max_length", "Invalid max_length in config", v);
        } else {
            info!(value = v, "Config override max_length");
            limits.max_length = v;
        }
    }
    if let Some(v) = cfg.max_nesting {
        if v == 0 || v > MAX_NESTING {
            reject("invalid_max_nesting", "Invalid max_nesting in config", v);
        } else {
            limits.max_nesting = v;
        }
    }
    if let Some(v) = cfg.max_functions {
        if v == 0 || v > MAX_FUNCTIONS {
            reject("invalid_max_functions", "Invalid max_functions in config", v);
        } else {
            limits.max_functions = v;
        }
    }
    if let Some(v) = cfg.max_line_length {
        if v == 0 || v > MAX_LINE_LENGTH {
            reject("invalid_max_line_length", "Invalid max_line_length in config", v);
        } else {
            limits.max_line_length = v;
        }
    }
}

fn apply_sandbox(cfg: &SandboxConfig, settings: &mut AnalyzerSettings) {
    if let Some(v) = cfg.timeout_ms {
        if v == 0 || v > MAX_TIMEOUT_MS {
            reject("invalid_timeout_ms", "Invalid sandbox timeout_ms in config", v);
        } else {
            info!(value = v, "Config override timeout_ms");
            settings.sandbox.timeout_ms = v;
        }
    }
    if let Some(v) = cfg.memory_limit_mb {
        if v == 0 || v > MAX_MEMORY_LIMIT_MB {
            reject("invalid_memory_limit_mb", "Invalid sandbox memory_limit_mb in config", v);
        } else {
            settings.sandbox.memory_limit_mb = v;
        }
    }
    if let Some(v) = cfg.network_access {
        if v {
            warn!("network_access has no effect; outbound calls are always stubbed");
        }
        settings.sandbox.network_access = v;
    }
    if let Some(name) = cfg.backend.as_deref() {
        match BackendKind::parse(name) {
            Some(kind) => {
                info!(backend = name, "Config override sandbox backend");
                settings.backend = kind;
            }
            None => reject("invalid_backend", "Unknown sandbox backend in config", name),
        }
    }
    if let Some(v) = cfg.grace_ms {
        if v > MAX_GRACE_MS {
            reject("invalid_grace_ms", "Invalid sandbox grace_ms in config", v);
        } else {
            settings.sandbox.grace_ms = v;
        }
    }
    if let Some(v) = cfg.loop_iteration_limit {
        if v == 0 {
            reject("invalid_loop_iteration_limit", "Invalid loop_iteration_limit in config", v);
        } else {
            settings.sandbox.loop_iteration_limit = v;
        }
    }
    if let Some(v) = cfg.recursion_limit {
        if v == 0 || v > MAX_RECURSION_LIMIT {
            reject("invalid_recursion_limit", "Invalid recursion_limit in config", v);
        } else {
            settings.sandbox.recursion_limit = v;
        }
    }
    if let Some(path) = &cfg.worker_path {
        settings.worker_path = Some(path.clone());
    }
}

fn apply_obfuscation(cfg: &ObfuscationConfig, settings: &mut AnalyzerSettings) {
    let scan = &mut settings.scan;
    if let Some(v) = cfg.indicator_cap {
        if v == 0 || v > MAX_INDICATOR_CAP {
            reject("invalid_indicator_cap", "Invalid obfuscation indicator_cap in config", v);
        } else {
            scan.indicator_cap = v;
        }
    }
    if let Some(v) = cfg.entropy_threshold {
        if !v.is_finite() || v <= 0.0 || v > MAX_ENTROPY_BITS {
            reject("invalid_entropy_threshold", "Invalid entropy_threshold in config", v);
        } else {
            scan.entropy_threshold = v;
        }
    }
    if let Some(v) = cfg.entropy_points {
        if v > MAX_ENTROPY_POINTS {
            reject("invalid_entropy_points", "Invalid entropy_points in config", v);
        } else {
            scan.entropy_points = v;
        }
    }
}

fn reject(kind: &str, message: &str, value: impl Display) {
    SecurityEvent::new(Level::WARN, SecurityDomain::Config, Severity::Low, kind, message).emit();
    warn!(value = %value, "{message}");
}
