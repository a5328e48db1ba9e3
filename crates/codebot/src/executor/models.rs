//! Request and result types for the execution service.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::registry::UserId;
use crate::history::ConversationHistory;

/// Default per-request deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// One user turn to run through the agent.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRequest {
    pub user: UserId,
    pub message: String,
    pub history: ConversationHistory,
    pub working_directory: PathBuf,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl ExecutionRequest {
    pub fn new(user: UserId, message: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            user,
            message: message.into(),
            history: ConversationHistory::default(),
            working_directory: working_directory.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_history(mut self, history: ConversationHistory) -> Self {
        self.history = history;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Outcome category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Timeout,
    Cancelled,
    Error,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::Timeout => write!(f, "timeout"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
            ExecutionStatus::Error => write!(f, "error"),
        }
    }
}

/// What came back from one execution.
///
/// `output` is set for [`ExecutionStatus::Success`] only, `error` for every
/// other status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock time from spawn to outcome.
    pub elapsed_ms: u64,
    /// The deadline that was exceeded, for [`ExecutionStatus::Timeout`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>, elapsed: Duration) -> Self {
        Self::build(ExecutionStatus::Success, Some(output.into()), None, elapsed)
    }

    pub fn timeout(timeout: Duration, elapsed: Duration) -> Self {
        Self {
            timeout_secs: Some(timeout.as_secs()),
            ..Self::build(
                ExecutionStatus::Timeout,
                None,
                Some(format!("agent timed out after {} seconds", timeout.as_secs())),
                elapsed,
            )
        }
    }

    pub fn cancelled(elapsed: Duration) -> Self {
        Self::build(
            ExecutionStatus::Cancelled,
            None,
            Some("execution cancelled".to_string()),
            elapsed,
        )
    }

    pub fn error(message: impl Into<String>, elapsed: Duration) -> Self {
        Self::build(ExecutionStatus::Error, None, Some(message.into()), elapsed)
    }

    fn build(
        status: ExecutionStatus,
        output: Option<String>,
        error: Option<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            status,
            output,
            error,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            timeout_secs: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}
