use crate::policy::Violation;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AnalystError>;

#[derive(Error, Debug)]
pub enum AnalystError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Question text is required")]
    MissingQuestion,

    #[error("File id is required")]
    MissingFile,

    #[error("Invalid file id: {0}")]
    InvalidFileId(String),

    #[error("Code validation failed: {}", render_violations(.0))]
    ValidationRejected(Vec<Violation>),

    #[error("Execution host unavailable: {0}")]
    HostUnavailable(String),

    #[error("Model call failed: {0}")]
    ModelCall(#[from] ModelError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl AnalystError {
    /// Short message safe to show to the person asking the question.
    ///
    /// Model-call failures collapse to a generic text; the detail is only
    /// logged.
    pub fn user_message(&self) -> String {
        match self {
            AnalystError::Configuration(_) => {
                "The analysis service is not configured correctly".to_string()
            }
            AnalystError::MissingQuestion => "Message is required".to_string(),
            AnalystError::MissingFile => {
                "File ID is required. Please upload a CSV file first.".to_string()
            }
            AnalystError::InvalidFileId(_) => "The file id is not valid".to_string(),
            AnalystError::ValidationRejected(violations) => format!(
                "The generated code was rejected by the safety policy:\n{}",
                render_violations(violations)
            ),
            AnalystError::HostUnavailable(_) => {
                "The analysis environment is not available. Please ensure Docker is running and the container is started.".to_string()
            }
            AnalystError::ModelCall(_) | AnalystError::IoError(_) | AnalystError::JsonError(_) => {
                "Analysis failed. Please try again.".to_string()
            }
        }
    }

    /// HTTP-equivalent status for front ends that speak HTTP.
    pub fn status_code(&self) -> u16 {
        match self {
            AnalystError::MissingQuestion
            | AnalystError::MissingFile
            | AnalystError::InvalidFileId(_) => 400,
            AnalystError::ValidationRejected(_) => 422,
            AnalystError::HostUnavailable(_) => 503,
            AnalystError::Configuration(_)
            | AnalystError::ModelCall(_)
            | AnalystError::IoError(_)
            | AnalystError::JsonError(_) => 500,
        }
    }

    /// Stable machine-readable kind, used by the worker protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalystError::Configuration(_) => "configuration",
            AnalystError::MissingQuestion => "missing_question",
            AnalystError::MissingFile => "missing_file",
            AnalystError::InvalidFileId(_) => "invalid_file_id",
            AnalystError::ValidationRejected(_) => "validation_rejected",
            AnalystError::HostUnavailable(_) => "host_unavailable",
            AnalystError::ModelCall(_) => "model_call",
            AnalystError::IoError(_) | AnalystError::JsonError(_) => "internal",
        }
    }
}

/// Failures of the model-call collaborator.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model credential is missing")]
    MissingCredential,

    #[error("Model credential was rejected (status {0})")]
    Unauthorized(u16),

    #[error("Model service unreachable: {0}")]
    Unreachable(String),

    #[error("Model service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed model response: {0}")]
    MalformedResponse(String),
}

pub(crate) fn render_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("- [{}] {}", v.pattern_id, v.description))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_errors_do_not_leak_detail() {
        let err = AnalystError::from(ModelError::Unreachable(
            "dns error: api.internal.example".to_string(),
        ));
        assert_eq!(err.status_code(), 500);
        assert!(!err.user_message().contains("api.internal.example"));
        assert_eq!(err.kind(), "model_call");
    }

    #[test]
    fn test_rejection_lists_every_violation() {
        let err = AnalystError::ValidationRejected(vec![
            Violation::new("os-import", "imports the operating-system module"),
            Violation::new("pickle", "uses an arbitrary-deserialisation module"),
        ]);
        let msg = err.user_message();
        assert!(msg.contains("[os-import]"));
        assert!(msg.contains("[pickle]"));
        assert_eq!(err.status_code(), 422);
    }

    #[test]
    fn test_host_unavailable_maps_to_503() {
        let err = AnalystError::HostUnavailable("container not running".to_string());
        assert_eq!(err.status_code(), 503);
        assert_eq!(err.kind(), "host_unavailable");
    }
}
