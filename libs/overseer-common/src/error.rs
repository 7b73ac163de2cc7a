/// Fault taxonomy shared by the worker and its tooling.
///
/// Every failure that ends a task is one of two kinds:
/// - **ClientFault** (4xx): the envelope or the files it points at are wrong.
/// - **ServerFault** (5xx): the worker or its environment failed.
///
/// Neither kind is retried by the worker. Both are logged, and both still
/// lead to cleanup and exactly one acknowledgment.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const CLIENT_FAULT_STATUS: u16 = 400;
pub const SERVER_FAULT_STATUS: u16 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    ClientFault,
    ServerFault,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::ClientFault => write!(f, "client_fault"),
            FaultKind::ServerFault => write!(f, "server_fault"),
        }
    }
}

/// A classified task failure carrying an HTTP-shaped status.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("client fault ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("server fault ({status}): {message}")]
    Server { status: u16, message: String },
}

impl TaskError {
    pub fn client(message: impl Into<String>) -> Self {
        TaskError::Client {
            status: CLIENT_FAULT_STATUS,
            message: message.into(),
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        TaskError::Server {
            status: SERVER_FAULT_STATUS,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FaultKind {
        match self {
            TaskError::Client { .. } => FaultKind::ClientFault,
            TaskError::Server { .. } => FaultKind::ServerFault,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            TaskError::Client { status, .. } | TaskError::Server { status, .. } => *status,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            TaskError::Client { message, .. } | TaskError::Server { message, .. } => message,
        }
    }
}

// Filesystem failures inside the worker are never the caller's fault.
impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        TaskError::server(format!("I/O failure: {}", err))
    }
}

/// Correlated description of a failed task, handed to the fault reporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: FaultKind,
    pub status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overseer_assessment_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl ErrorRecord {
    pub fn new(error: &TaskError, correlation: &Correlation) -> Self {
        Self {
            kind: error.kind(),
            status: error.status(),
            message: error.message().to_string(),
            task_id: correlation.task_id,
            overseer_assessment_id: correlation.overseer_assessment_id,
            timestamp: correlation.timestamp.clone(),
        }
    }
}

/// Identifiers recovered from a message body, even one that failed validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correlation {
    pub task_id: Option<u64>,
    pub overseer_assessment_id: Option<u64>,
    pub timestamp: Option<String>,
}

impl Correlation {
    /// Best-effort extraction; never fails.
    pub fn from_body(body: &[u8]) -> Self {
        let value: serde_json::Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(_) => return Self::default(),
        };
        Self {
            task_id: value.get("task_id").and_then(|v| v.as_u64()),
            overseer_assessment_id: value.get("overseer_assessment_id").and_then(|v| v.as_u64()),
            timestamp: value
                .get("timestamp")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_fault_defaults_to_400() {
        let err = TaskError::client("missing task_id");
        assert_eq!(err.kind(), FaultKind::ClientFault);
        assert_eq!(err.status(), 400);
        assert_eq!(err.message(), "missing task_id");
    }

    #[test]
    fn test_io_errors_are_server_faults() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: TaskError = io.into();
        assert_eq!(err.kind(), FaultKind::ServerFault);
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn test_correlation_survives_invalid_fields() {
        let body = br#"{"task_id": "12", "overseer_assessment_id": 7, "timestamp": "t0"}"#;
        let correlation = Correlation::from_body(body);
        assert_eq!(correlation.task_id, None);
        assert_eq!(correlation.overseer_assessment_id, Some(7));
        assert_eq!(correlation.timestamp.as_deref(), Some("t0"));
    }

    #[test]
    fn test_correlation_of_garbage_is_empty() {
        assert_eq!(Correlation::from_body(b"not json"), Correlation::default());
    }

    #[test]
    fn test_error_record_serialization() {
        let err = TaskError::server("run.sh missing");
        let record = ErrorRecord::new(
            &err,
            &Correlation {
                task_id: Some(3),
                overseer_assessment_id: None,
                timestamp: None,
            },
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "server_fault");
        assert_eq!(json["status"], 500);
        assert_eq!(json["task_id"], 3);
        assert!(json.get("timestamp").is_none());
    }
}
