pub mod config;
pub mod error;
pub mod model;
pub mod runner;
pub mod score;
pub mod security_log;
pub mod validate;

pub use config::{Config, ConfigError};
pub use error::{AnalysisError, ErrorKind, ErrorResponse};
pub use model::{AnalysisRequest, AnalysisResult, ExecutionConfig};
pub use runner::{resolve_backend, Analyzer, AnalyzerSettings, BackendKind};
pub use score::{score, score_with, RiskLevel, ScoringConfig};
pub use validate::{validate, validate_bytes, ValidationLimits, ValidationReport};
