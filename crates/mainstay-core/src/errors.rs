//! Error taxonomy for workflow and task execution
//!
//! Pause and cancellation are *control signals* modeled as error variants so
//! they can travel through the same `Result` plumbing as real failures; the
//! workflow runtime is the single place that tells them apart.

use serde_json::{json, Value};

/// Scope of a timeout: the whole workflow or a single task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutScope {
    Workflow,
    Task,
}

impl std::fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Workflow => write!(f, "workflow"),
            Self::Task => write!(f, "task"),
        }
    }
}

/// Errors surfaced by the execution core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    /// A task exhausted its retry budget.
    #[error("task gave up after {attempts} attempts (delay {delay_secs}s, backoff {backoff}): {cause}")]
    RetryExhausted {
        attempts: u32,
        delay_secs: u64,
        backoff: f64,
        cause: String,
        /// Structured payload of the final underlying failure.
        cause_value: Option<Value>,
    },

    /// Wall-clock bound exceeded.
    #[error("{scope} {name} ({id}) timed out ({timeout_secs}s)")]
    Timeout {
        scope: TimeoutScope,
        name: String,
        id: String,
        timeout_secs: u64,
    },

    /// Control signal: the workflow asked to pause and wait for operator input.
    #[error("execution paused: {label}")]
    PauseRequested { label: String },

    /// Control signal: cooperative cancellation was observed.
    #[error("cancellation requested")]
    CancellationRequested,

    /// A task failed with a user-raised error.
    #[error("task failed: {message}")]
    TaskFailed {
        message: String,
        value: Option<Value>,
    },

    /// Workflow not found in the catalog or registry.
    #[error("workflow '{name}' not found")]
    WorkflowNotFound { name: String },

    /// Workflow already exists (unique name+version violated).
    #[error("workflow '{name}' already exists")]
    WorkflowAlreadyExists { name: String },

    /// Execution context not found in the store.
    #[error("execution context '{execution_id}' not found")]
    ContextNotFound { execution_id: String },

    /// Task not found in a graph or registry.
    #[error("task '{name}' not found")]
    TaskNotFound { name: String },

    /// A requested secret is missing from the secret store.
    #[error("secret '{name}' not found")]
    SecretMissing { name: String },

    /// Worker not found or session token mismatch.
    #[error("worker '{name}' not found")]
    WorkerNotFound { name: String },

    /// Schedule not found.
    #[error("schedule '{id}' not found")]
    ScheduleNotFound { id: String },

    /// Invalid schedule definition (bad cron expression, unknown timezone).
    #[error("invalid schedule: {message}")]
    InvalidSchedule { message: String },

    /// A lifecycle transition was requested from a state that forbids it.
    #[error("invalid transition: cannot apply {event} while {from}")]
    InvalidTransition { from: String, event: String },

    /// Database / connection-level failure. Retryable from the worker loop.
    #[error("database error ({kind}): {message}")]
    Database { kind: String, message: String },

    /// Serialization failure when encoding or decoding payloads.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ExecutionError {
    pub fn task(message: impl Into<String>) -> Self {
        Self::TaskFailed {
            message: message.into(),
            value: None,
        }
    }

    pub fn database(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Pause and cancellation steer the runtime; they are never failures.
    pub fn is_control_signal(&self) -> bool {
        matches!(
            self,
            Self::PauseRequested { .. } | Self::CancellationRequested
        )
    }

    pub fn is_pause(&self) -> bool {
        matches!(self, Self::PauseRequested { .. })
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::CancellationRequested)
    }

    /// Whether the worker loop should treat this as transient infrastructure
    /// trouble and retry instead of failing the execution.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Database { .. })
    }

    /// Structured representation stored as the value of a terminal
    /// `WORKFLOW_FAILED` or `TASK_FAILED` event.
    pub fn to_value(&self) -> Value {
        match self {
            Self::RetryExhausted {
                attempts,
                delay_secs,
                backoff,
                cause,
                cause_value,
            } => json!({
                "error": "retry_exhausted",
                "attempts": attempts,
                "delay": delay_secs,
                "backoff": backoff,
                "cause": cause,
                "cause_value": cause_value,
            }),
            Self::Timeout {
                scope,
                name,
                id,
                timeout_secs,
            } => json!({
                "error": "timeout",
                "scope": scope,
                "name": name,
                "id": id,
                "timeout": timeout_secs,
            }),
            Self::TaskFailed { message, value } => json!({
                "error": "task_failed",
                "message": message,
                "value": value,
            }),
            other => json!({
                "error": "execution_error",
                "message": other.to_string(),
            }),
        }
    }
}

impl From<serde_json::Error> for ExecutionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_signals() {
        assert!(ExecutionError::PauseRequested {
            label: "approval".into()
        }
        .is_control_signal());
        assert!(ExecutionError::CancellationRequested.is_control_signal());
        assert!(!ExecutionError::task("boom").is_control_signal());
    }

    #[test]
    fn test_timeout_display() {
        let err = ExecutionError::Timeout {
            scope: TimeoutScope::Task,
            name: "fetch".into(),
            id: "fetch_abc".into(),
            timeout_secs: 5,
        };
        assert_eq!(err.to_string(), "task fetch (fetch_abc) timed out (5s)");
    }

    #[test]
    fn test_error_value_roundtrip() {
        let err = ExecutionError::RetryExhausted {
            attempts: 3,
            delay_secs: 1,
            backoff: 2.0,
            cause: "connection refused".into(),
            cause_value: None,
        };
        let value = err.to_value();
        assert_eq!(value["error"], "retry_exhausted");
        assert_eq!(value["attempts"], 3);
    }

    #[test]
    fn test_infrastructure_classification() {
        assert!(ExecutionError::database("postgresql", "pool exhausted").is_infrastructure());
        assert!(!ExecutionError::task("user error").is_infrastructure());
    }
}
