//! Execution events and states
//!
//! Events form the append-only log for an execution. They are immutable once
//! written; the execution context is reconstructed by replaying them in
//! order. The event `id` is the replay key: task events derive it from the
//! call identity hash, workflow events use a random identifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Types of events recorded in an execution log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionEventType {
    WorkflowScheduled,
    WorkflowClaimed,
    WorkflowStarted,
    WorkflowResumed,
    WorkflowPaused,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelling,
    WorkflowCancelled,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskRetryStarted,
    TaskRetryCompleted,
    TaskFallbackStarted,
    TaskFallbackCompleted,
    TaskRollbackStarted,
    TaskRollbackCompleted,
    TaskResumed,
}

impl ExecutionEventType {
    /// Terminal workflow events forbid any further appends.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted | Self::WorkflowFailed | Self::WorkflowCancelled
        )
    }

    /// Events that advance the workflow lifecycle (as opposed to task-level
    /// or dispatch bookkeeping events).
    pub fn is_progress(&self) -> bool {
        matches!(
            self,
            Self::WorkflowStarted
                | Self::WorkflowResumed
                | Self::WorkflowPaused
                | Self::WorkflowCompleted
                | Self::WorkflowFailed
                | Self::WorkflowCancelled
        )
    }

    pub fn is_task_event(&self) -> bool {
        matches!(
            self,
            Self::TaskStarted
                | Self::TaskCompleted
                | Self::TaskFailed
                | Self::TaskRetryStarted
                | Self::TaskRetryCompleted
                | Self::TaskFallbackStarted
                | Self::TaskFallbackCompleted
                | Self::TaskRollbackStarted
                | Self::TaskRollbackCompleted
                | Self::TaskResumed
        )
    }
}

impl std::fmt::Display for ExecutionEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", s.as_str().unwrap_or("UNKNOWN"))
    }
}

/// State of an execution, derived from its lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Created,
    Scheduled,
    Claimed,
    Running,
    Paused,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States in which an execution is bound to a worker.
    pub fn is_bound(&self) -> bool {
        matches!(
            self,
            Self::Scheduled | Self::Claimed | Self::Running | Self::Paused | Self::Cancelling
        )
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Scheduled => write!(f, "SCHEDULED"),
            Self::Claimed => write!(f, "CLAIMED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Cancelling => write!(f, "CANCELLING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// An immutable record in an execution's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ExecutionEvent {
    /// Replay key. Stable across runs for task events, random for workflow
    /// lifecycle events.
    pub id: String,

    /// Identifier of the emitter (task instance id or worker name).
    pub source_id: String,

    /// Event type.
    #[serde(rename = "type")]
    pub event_type: ExecutionEventType,

    /// Human label: task name, workflow name, worker name or pause label.
    pub name: String,

    /// Arbitrary payload: input, output, error, pause label, resume payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// UTC timestamp of emission.
    pub time: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn new(
        id: impl Into<String>,
        source_id: impl Into<String>,
        event_type: ExecutionEventType,
        name: impl Into<String>,
        value: Option<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            event_type,
            name: name.into(),
            value,
            time: Utc::now(),
        }
    }

    /// Event for a workflow lifecycle transition; the id is random since
    /// lifecycle events are never replay targets.
    pub fn lifecycle(
        source_id: impl Into<String>,
        event_type: ExecutionEventType,
        name: impl Into<String>,
        value: Option<Value>,
    ) -> Self {
        Self::new(random_event_id(), source_id, event_type, name, value)
    }

    /// Dedup key used when merging checkpointed events into stored ones.
    pub fn dedup_key(&self) -> (String, ExecutionEventType) {
        (self.id.clone(), self.event_type)
    }
}

/// Random identifier for workflow-level events.
pub fn random_event_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Stable call identity: hash over the task name, positional args and sorted
/// keyword args. Identical invocations map to the same id across runs and
/// processes, which is what makes replay short-circuiting work.
pub fn call_identity(task_name: &str, args: &[Value], kwargs: &[(String, Value)]) -> String {
    let mut sorted: Vec<&(String, Value)> = kwargs.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    hasher.update(task_name.as_bytes());
    for arg in args {
        hasher.update(b"\x1f");
        hasher.update(arg.to_string().as_bytes());
    }
    for (key, value) in sorted {
        hasher.update(b"\x1e");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.to_string().as_bytes());
    }

    let digest = hasher.finalize();
    format!("{}_{}", task_name, &hex::encode(digest)[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization_roundtrip() {
        let event = ExecutionEvent::new(
            "say_hello_abc123",
            "worker-1",
            ExecutionEventType::TaskCompleted,
            "say_hello",
            Some(json!("Hello, Joe")),
        );

        let encoded = serde_json::to_string(&event).unwrap();
        assert!(encoded.contains("\"type\":\"TASK_COMPLETED\""));

        let parsed: ExecutionEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_terminal_classification() {
        assert!(ExecutionEventType::WorkflowCompleted.is_terminal());
        assert!(ExecutionEventType::WorkflowFailed.is_terminal());
        assert!(ExecutionEventType::WorkflowCancelled.is_terminal());
        assert!(!ExecutionEventType::WorkflowPaused.is_terminal());
        assert!(!ExecutionEventType::TaskCompleted.is_terminal());
    }

    #[test]
    fn test_call_identity_is_stable() {
        let a = call_identity("fetch", &[json!("Joe"), json!(2)], &[]);
        let b = call_identity("fetch", &[json!("Joe"), json!(2)], &[]);
        assert_eq!(a, b);
        assert!(a.starts_with("fetch_"));
    }

    #[test]
    fn test_call_identity_varies_with_args() {
        let a = call_identity("fetch", &[json!("Joe")], &[]);
        let b = call_identity("fetch", &[json!("Jane")], &[]);
        assert_ne!(a, b);

        let c = call_identity("other", &[json!("Joe")], &[]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_call_identity_kwargs_order_independent() {
        let a = call_identity(
            "fetch",
            &[],
            &[("b".into(), json!(2)), ("a".into(), json!(1))],
        );
        let b = call_identity(
            "fetch",
            &[],
            &[("a".into(), json!(1)), ("b".into(), json!(2))],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_state_display_matches_wire_format() {
        assert_eq!(ExecutionState::Cancelling.to_string(), "CANCELLING");
        let encoded = serde_json::to_value(ExecutionState::Cancelling).unwrap();
        assert_eq!(encoded, json!("CANCELLING"));
    }
}
