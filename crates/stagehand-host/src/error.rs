use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Every failure the orchestrator surfaces. Payloads are plain strings so the
/// error can be cloned to every waiter of a failed kernel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("kernel type '{0}' does not exist")]
    UnknownKernel(String),
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),
    #[error("backend unavailable: {0}")]
    Backend(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("invalid kernel transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("kernel is not ready")]
    KernelNotReady,
    #[error("kernel is dead")]
    KernelDead,
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("session queue is closed")]
    QueueClosed,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    ResourceNotFound,
    BackendUnavailable,
    Unsupported,
    InvalidState,
    Storage,
    Internal,
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Validation(_) | OrchestratorError::UnknownKernel(_) => {
                ErrorKind::Validation
            }
            OrchestratorError::ResourceNotFound(_) => ErrorKind::ResourceNotFound,
            OrchestratorError::ResourceExhausted(_)
            | OrchestratorError::Backend(_)
            | OrchestratorError::Runtime(_) => ErrorKind::BackendUnavailable,
            OrchestratorError::Unsupported(_) => ErrorKind::Unsupported,
            OrchestratorError::InvalidTransition { .. }
            | OrchestratorError::KernelNotReady
            | OrchestratorError::KernelDead
            | OrchestratorError::QueueClosed => ErrorKind::InvalidState,
            OrchestratorError::Store(_) => ErrorKind::Storage,
            OrchestratorError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Short machine-readable code used on the control socket.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation => "validation",
            ErrorKind::ResourceNotFound => "not_found",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Storage => "storage",
            ErrorKind::Internal => "internal",
        }
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(err: reqwest::Error) -> Self {
        OrchestratorError::Backend(err.to_string())
    }
}

/// Serializable error object carried by session events and history entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub id: Uuid,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap `err` under a human readable context line.
    pub fn wrap(context: impl Into<String>, err: &OrchestratorError) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: err.kind(),
            message: context.into(),
            cause: Some(err.to_string()),
        }
    }
}

impl From<&OrchestratorError> for ErrorReport {
    fn from(err: &OrchestratorError) -> Self {
        ErrorReport::new(err.kind(), err.to_string())
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_failure_families() {
        assert_eq!(
            OrchestratorError::UnknownKernel("Cobol".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            OrchestratorError::ResourceExhausted("ports".into()).kind(),
            ErrorKind::BackendUnavailable
        );
        assert_eq!(OrchestratorError::QueueClosed.code(), "invalid_state");
    }

    #[test]
    fn wrapped_report_keeps_cause() {
        let err = OrchestratorError::Store("disk full".into());
        let report = ErrorReport::wrap("Error on creating a history entry", &err);
        assert_eq!(report.kind, ErrorKind::Storage);
        assert_eq!(report.message, "Error on creating a history entry");
        assert_eq!(report.cause.as_deref(), Some("store error: disk full"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "storage");
    }
}
