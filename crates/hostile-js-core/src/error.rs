use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Input was rejected before any detector ran.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    /// The sandbox itself failed. The script's own errors never land here.
    #[error("sandbox execution failed: {0}")]
    Execution(String),
    /// A detector other than the sandbox failed.
    #[error("security analysis failed: {0}")]
    Analysis(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Validation,
    Execution,
    Analysis,
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::Validation(_) => ErrorKind::Validation,
            AnalysisError::Execution(_) => ErrorKind::Execution,
            AnalysisError::Analysis(_) => ErrorKind::Analysis,
        }
    }

    pub fn details(&self) -> Vec<String> {
        match self {
            AnalysisError::Validation(errors) => errors.clone(),
            AnalysisError::Execution(detail) | AnalysisError::Analysis(detail) => {
                vec![detail.clone()]
            }
        }
    }
}

/// Wire shape of a failed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub error: String,
    pub details: Vec<String>,
}

impl From<&AnalysisError> for ErrorResponse {
    fn from(err: &AnalysisError) -> Self {
        let error = match err.kind() {
            ErrorKind::Validation => "Invalid input",
            ErrorKind::Execution => "Code execution failed",
            ErrorKind::Analysis => "Security analysis failed",
        };
        Self { kind: err.kind(), error: error.to_string(), details: err.details() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_response_lists_every_error() {
        let err = AnalysisError::Validation(vec!["Code is required".into()]);
        let response = ErrorResponse::from(&err);
        assert_eq!(response.kind, ErrorKind::Validation);
        assert_eq!(response.details, vec!["Code is required".to_string()]);
        let json = serde_json::to_value(&response).unwrap_or_default();
        assert_eq!(json["kind"], "validation");
    }
}
