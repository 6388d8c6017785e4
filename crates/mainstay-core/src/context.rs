//! Execution context
//!
//! In-memory projection of one execution's event log. Every mutation is the
//! append of exactly one event: the typed helpers validate that the current
//! state permits the transition, append the event, and update the cached
//! state. All boolean readers derive from event presence and order only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::ExecutionError;
use crate::event::{ExecutionEvent, ExecutionEventType, ExecutionState};
use crate::resources::ResourceRequest;

/// Projection of a single execution.
///
/// The context exclusively owns its event vector; the store holds durable
/// copies and a checkpoint is the handoff. The cancellation token is
/// process-local and never serialized.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub workflow_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default)]
    pub events: Vec<ExecutionEvent>,
    pub state: ExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_payload: Option<Value>,
    #[serde(skip, default)]
    cancel: CancellationToken,
}

impl ExecutionContext {
    /// New execution in `CREATED` state, immediately eligible for dispatch.
    pub fn new(workflow_name: impl Into<String>, input: Option<Value>) -> Self {
        let workflow_name = workflow_name.into();
        Self {
            execution_id: Uuid::now_v7(),
            workflow_id: workflow_name.clone(),
            workflow_name,
            input,
            events: Vec::new(),
            state: ExecutionState::Created,
            current_worker: None,
            requests: None,
            resume_payload: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_requests(mut self, requests: ResourceRequest) -> Self {
        self.requests = Some(requests);
        self
    }

    pub fn with_execution_id(mut self, execution_id: Uuid) -> Self {
        self.execution_id = execution_id;
        self
    }

    /// Reassemble a context from stored rows. The cancellation token starts
    /// fresh; signals are process-local.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        execution_id: Uuid,
        workflow_id: String,
        workflow_name: String,
        input: Option<Value>,
        events: Vec<ExecutionEvent>,
        state: ExecutionState,
        current_worker: Option<String>,
        requests: Option<ResourceRequest>,
        resume_payload: Option<Value>,
    ) -> Self {
        Self {
            execution_id,
            workflow_id,
            workflow_name,
            input,
            events,
            state,
            current_worker,
            requests,
            resume_payload,
            cancel: CancellationToken::new(),
        }
    }

    // =========================================================================
    // Derived readers
    // =========================================================================

    /// Last workflow-progress event, ignoring dispatch bookkeeping
    /// (`WORKFLOW_SCHEDULED`/`WORKFLOW_CLAIMED`) and task events.
    fn last_progress_event(&self) -> Option<&ExecutionEvent> {
        self.events
            .iter()
            .rev()
            .find(|e| e.event_type.is_progress())
    }

    pub fn has_finished(&self) -> bool {
        self.events
            .last()
            .map(|e| e.event_type.is_terminal())
            .unwrap_or(false)
    }

    pub fn has_succeeded(&self) -> bool {
        self.has_finished()
            && self
                .events
                .iter()
                .any(|e| e.event_type == ExecutionEventType::WorkflowCompleted)
    }

    pub fn has_failed(&self) -> bool {
        self.has_finished()
            && self
                .events
                .iter()
                .any(|e| e.event_type == ExecutionEventType::WorkflowFailed)
    }

    pub fn has_cancelled(&self) -> bool {
        self.has_finished()
            && self
                .events
                .iter()
                .any(|e| e.event_type == ExecutionEventType::WorkflowCancelled)
    }

    /// Paused iff the most recent progress event is `WORKFLOW_PAUSED`.
    /// Dispatch events appended while re-queueing a resumed execution do not
    /// clear the paused status; only resuming or finishing does.
    pub fn is_paused(&self) -> bool {
        self.last_progress_event()
            .map(|e| e.event_type == ExecutionEventType::WorkflowPaused)
            .unwrap_or(false)
    }

    pub fn is_cancelling(&self) -> bool {
        self.state == ExecutionState::Cancelling
    }

    pub fn has_started(&self) -> bool {
        self.events
            .iter()
            .any(|e| e.event_type == ExecutionEventType::WorkflowStarted)
    }

    pub fn has_resumed(&self) -> bool {
        self.events
            .iter()
            .any(|e| e.event_type == ExecutionEventType::WorkflowResumed)
    }

    pub fn is_scheduled(&self) -> bool {
        self.state == ExecutionState::Scheduled
            && self
                .events
                .iter()
                .any(|e| e.event_type == ExecutionEventType::WorkflowScheduled)
    }

    /// Output of the first terminal `WORKFLOW_COMPLETED`/`WORKFLOW_FAILED`
    /// event, if any.
    pub fn output(&self) -> Option<&Value> {
        self.events
            .iter()
            .find(|e| {
                matches!(
                    e.event_type,
                    ExecutionEventType::WorkflowCompleted | ExecutionEventType::WorkflowFailed
                )
            })
            .and_then(|e| e.value.as_ref())
    }

    /// Label of the pause point the execution is currently waiting on.
    pub fn paused_label(&self) -> Option<&str> {
        self.last_progress_event()
            .filter(|e| e.event_type == ExecutionEventType::WorkflowPaused)
            .and_then(|e| e.value.as_ref())
            .and_then(|v| v.as_str())
    }

    /// Recorded output for a task call identity, used for replay
    /// short-circuiting.
    pub fn find_task_output(&self, event_id: &str) -> Option<&ExecutionEvent> {
        self.events
            .iter()
            .find(|e| e.event_type == ExecutionEventType::TaskCompleted && e.id == event_id)
    }

    pub fn has_event(&self, event_id: &str, event_type: ExecutionEventType) -> bool {
        self.events
            .iter()
            .any(|e| e.event_type == event_type && e.id == event_id)
    }

    /// A `WORKFLOW_PAUSED` event recorded for the given label.
    pub fn has_pause_point(&self, label: &str) -> bool {
        self.events.iter().any(|e| {
            e.event_type == ExecutionEventType::WorkflowPaused
                && e.value.as_ref().and_then(|v| v.as_str()) == Some(label)
        })
    }

    // =========================================================================
    // Lifecycle transitions
    // =========================================================================

    fn ensure(&self, allowed: &[ExecutionState], event: &str) -> Result<(), ExecutionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ExecutionError::InvalidTransition {
                from: self.state.to_string(),
                event: event.to_string(),
            })
        }
    }

    fn append(&mut self, event: ExecutionEvent) -> Result<(), ExecutionError> {
        if self.has_finished() {
            return Err(ExecutionError::InvalidTransition {
                from: self.state.to_string(),
                event: event.event_type.to_string(),
            });
        }
        self.events.push(event);
        Ok(())
    }

    /// Bind the execution to a worker for dispatch.
    pub fn schedule(&mut self, worker: &str) -> Result<(), ExecutionError> {
        self.ensure(
            &[
                ExecutionState::Created,
                ExecutionState::Scheduled,
                ExecutionState::Paused,
            ],
            "WORKFLOW_SCHEDULED",
        )?;
        self.append(ExecutionEvent::lifecycle(
            worker,
            ExecutionEventType::WorkflowScheduled,
            worker,
            None,
        ))?;
        self.state = ExecutionState::Scheduled;
        self.current_worker = Some(worker.to_string());
        Ok(())
    }

    /// Exclusive handoff to the bound worker.
    pub fn claim(&mut self, worker: &str) -> Result<(), ExecutionError> {
        self.ensure(&[ExecutionState::Scheduled], "WORKFLOW_CLAIMED")?;
        if self.current_worker.as_deref() != Some(worker) {
            return Err(ExecutionError::ContextNotFound {
                execution_id: self.execution_id.to_string(),
            });
        }
        self.append(ExecutionEvent::lifecycle(
            worker,
            ExecutionEventType::WorkflowClaimed,
            worker,
            None,
        ))?;
        self.state = ExecutionState::Claimed;
        Ok(())
    }

    pub fn start(&mut self, source_id: &str) -> Result<(), ExecutionError> {
        self.ensure(
            &[ExecutionState::Created, ExecutionState::Claimed],
            "WORKFLOW_STARTED",
        )?;
        self.append(ExecutionEvent::lifecycle(
            source_id,
            ExecutionEventType::WorkflowStarted,
            self.workflow_name.clone(),
            self.input.clone(),
        ))?;
        self.state = ExecutionState::Running;
        Ok(())
    }

    pub fn resume(&mut self, source_id: &str) -> Result<(), ExecutionError> {
        self.ensure(
            &[
                ExecutionState::Paused,
                ExecutionState::Claimed,
                ExecutionState::Scheduled,
            ],
            "WORKFLOW_RESUMED",
        )?;
        self.append(ExecutionEvent::lifecycle(
            source_id,
            ExecutionEventType::WorkflowResumed,
            self.workflow_name.clone(),
            self.resume_payload.clone(),
        ))?;
        self.state = ExecutionState::Running;
        Ok(())
    }

    pub fn pause(&mut self, source_id: &str, label: &str) -> Result<(), ExecutionError> {
        self.ensure(&[ExecutionState::Running], "WORKFLOW_PAUSED")?;
        self.append(ExecutionEvent::lifecycle(
            source_id,
            ExecutionEventType::WorkflowPaused,
            self.workflow_name.clone(),
            Some(Value::String(label.to_string())),
        ))?;
        self.state = ExecutionState::Paused;
        Ok(())
    }

    pub fn complete(&mut self, source_id: &str, output: Option<Value>) -> Result<(), ExecutionError> {
        self.ensure(&[ExecutionState::Running], "WORKFLOW_COMPLETED")?;
        self.append(ExecutionEvent::lifecycle(
            source_id,
            ExecutionEventType::WorkflowCompleted,
            self.workflow_name.clone(),
            output,
        ))?;
        self.state = ExecutionState::Completed;
        self.current_worker = None;
        Ok(())
    }

    pub fn fail(&mut self, source_id: &str, error: Value) -> Result<(), ExecutionError> {
        self.ensure(
            &[ExecutionState::Running, ExecutionState::Cancelling],
            "WORKFLOW_FAILED",
        )?;
        self.append(ExecutionEvent::lifecycle(
            source_id,
            ExecutionEventType::WorkflowFailed,
            self.workflow_name.clone(),
            Some(error),
        ))?;
        self.state = ExecutionState::Failed;
        self.current_worker = None;
        Ok(())
    }

    /// Record cancellation intent. Valid from any pre-terminal state.
    pub fn begin_cancel(&mut self, source_id: &str) -> Result<(), ExecutionError> {
        self.ensure(
            &[
                ExecutionState::Created,
                ExecutionState::Scheduled,
                ExecutionState::Claimed,
                ExecutionState::Running,
                ExecutionState::Paused,
                ExecutionState::Cancelling,
            ],
            "WORKFLOW_CANCELLING",
        )?;
        self.append(ExecutionEvent::lifecycle(
            source_id,
            ExecutionEventType::WorkflowCancelling,
            self.workflow_name.clone(),
            None,
        ))?;
        self.state = ExecutionState::Cancelling;
        Ok(())
    }

    pub fn cancel(&mut self, source_id: &str, reason: &str) -> Result<(), ExecutionError> {
        self.ensure(
            &[
                ExecutionState::Created,
                ExecutionState::Scheduled,
                ExecutionState::Claimed,
                ExecutionState::Running,
                ExecutionState::Paused,
                ExecutionState::Cancelling,
            ],
            "WORKFLOW_CANCELLED",
        )?;
        self.append(ExecutionEvent::lifecycle(
            source_id,
            ExecutionEventType::WorkflowCancelled,
            self.workflow_name.clone(),
            Some(Value::String(reason.to_string())),
        ))?;
        self.state = ExecutionState::Cancelled;
        self.current_worker = None;
        Ok(())
    }

    /// Append a task-level event. Task events are valid while the workflow
    /// procedure runs, including during the cancellation window.
    pub fn append_task_event(&mut self, event: ExecutionEvent) -> Result<(), ExecutionError> {
        debug_assert!(event.event_type.is_task_event());
        self.append(event)
    }

    // =========================================================================
    // Cancellation signal
    // =========================================================================

    /// In-memory cancellation signal, observed at suspension points.
    pub fn cancel_signal(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Share another execution's cancellation signal (sub-workflows observe
    /// their parent's cancellation).
    pub(crate) fn share_cancel_with(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub fn set_cancellation(&self) {
        self.cancel.cancel();
    }

    pub fn check_cancellation(&self) -> Result<(), ExecutionError> {
        if self.cancel.is_cancelled() {
            Err(ExecutionError::CancellationRequested)
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Snapshots and merging
    // =========================================================================

    /// Context without its event log, for list endpoints and SSE payloads.
    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            execution_id: self.execution_id,
            workflow_id: self.workflow_id.clone(),
            workflow_name: self.workflow_name.clone(),
            state: self.state,
            current_worker: self.current_worker.clone(),
            input: self.input.clone(),
            output: self.output().cloned(),
            event_count: self.events.len(),
            started_at: self.events.first().map(|e| e.time),
            updated_at: self.events.last().map(|e| e.time),
        }
    }

    /// Events not yet present in `known`, compared by `(id, type)`.
    pub fn events_not_in<'a>(
        &'a self,
        known: &[(String, ExecutionEventType)],
    ) -> Vec<&'a ExecutionEvent> {
        self.events
            .iter()
            .filter(|e| !known.iter().any(|(id, ty)| id == &e.id && *ty == e.event_type))
            .collect()
    }
}

/// Compact, log-free view of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub workflow_name: String,
    pub state: ExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub event_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn running_ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new("greeter", Some(json!("Joe")));
        ctx.start("test").unwrap();
        ctx
    }

    #[test]
    fn test_new_context_is_created() {
        let ctx = ExecutionContext::new("greeter", None);
        assert_eq!(ctx.state, ExecutionState::Created);
        assert!(ctx.events.is_empty());
        assert!(!ctx.has_started());
        assert!(!ctx.has_finished());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut ctx = ExecutionContext::new("greeter", Some(json!("Joe")));
        ctx.schedule("worker-1").unwrap();
        assert_eq!(ctx.state, ExecutionState::Scheduled);
        assert_eq!(ctx.current_worker.as_deref(), Some("worker-1"));

        ctx.claim("worker-1").unwrap();
        assert_eq!(ctx.state, ExecutionState::Claimed);

        ctx.start("greeter_x").unwrap();
        assert_eq!(ctx.state, ExecutionState::Running);

        ctx.complete("greeter_x", Some(json!("Hello, Joe"))).unwrap();
        assert_eq!(ctx.state, ExecutionState::Completed);
        assert!(ctx.has_succeeded());
        assert_eq!(ctx.output(), Some(&json!("Hello, Joe")));
        assert!(ctx.current_worker.is_none());
    }

    #[test]
    fn test_claim_by_wrong_worker_fails() {
        let mut ctx = ExecutionContext::new("greeter", None);
        ctx.schedule("worker-1").unwrap();
        let err = ctx.claim("worker-2").unwrap_err();
        assert!(matches!(err, ExecutionError::ContextNotFound { .. }));
    }

    #[test]
    fn test_terminal_forbids_further_events() {
        let mut ctx = running_ctx();
        ctx.complete("src", None).unwrap();

        assert!(ctx.pause("src", "later").is_err());
        assert!(ctx.fail("src", json!("nope")).is_err());
        assert!(ctx
            .append_task_event(ExecutionEvent::new(
                "t_1",
                "src",
                ExecutionEventType::TaskStarted,
                "t",
                None,
            ))
            .is_err());
    }

    #[test]
    fn test_exactly_one_terminal_event_and_it_is_last() {
        let mut ctx = running_ctx();
        ctx.complete("src", Some(json!(42))).unwrap();

        let terminal: Vec<_> = ctx
            .events
            .iter()
            .filter(|e| e.event_type.is_terminal())
            .collect();
        assert_eq!(terminal.len(), 1);
        assert!(ctx.events.last().unwrap().event_type.is_terminal());
    }

    #[test]
    fn test_pause_resume_cycle() {
        let mut ctx = running_ctx();
        ctx.pause("src", "waiting_for_user_input").unwrap();

        assert!(ctx.is_paused());
        assert_eq!(ctx.paused_label(), Some("waiting_for_user_input"));
        assert_eq!(
            ctx.events.last().unwrap().event_type,
            ExecutionEventType::WorkflowPaused
        );

        ctx.resume_payload = Some(json!({"multiplier": 5}));
        ctx.resume("src").unwrap();
        assert!(!ctx.is_paused());
        assert!(ctx.has_resumed());
        assert_eq!(ctx.state, ExecutionState::Running);
        assert_eq!(
            ctx.events.last().unwrap().value,
            Some(json!({"multiplier": 5}))
        );
    }

    #[test]
    fn test_paused_survives_redispatch_bookkeeping() {
        let mut ctx = running_ctx();
        ctx.pause("src", "gate").unwrap();

        // Re-dispatch to a worker for resumption: schedule + claim must not
        // clear the paused status, only WORKFLOW_RESUMED does.
        ctx.schedule("worker-2").unwrap();
        ctx.claim("worker-2").unwrap();
        assert!(ctx.is_paused());

        ctx.resume("src").unwrap();
        assert!(!ctx.is_paused());
    }

    #[test]
    fn test_cancellation_path() {
        let mut ctx = running_ctx();
        ctx.begin_cancel("control-plane").unwrap();
        assert!(ctx.is_cancelling());
        assert!(!ctx.has_finished());

        ctx.cancel("worker-1", "operation cancelled").unwrap();
        assert!(ctx.has_cancelled());
        assert_eq!(ctx.state, ExecutionState::Cancelled);

        let cancelling_pos = ctx
            .events
            .iter()
            .position(|e| e.event_type == ExecutionEventType::WorkflowCancelling)
            .unwrap();
        let cancelled_pos = ctx
            .events
            .iter()
            .position(|e| e.event_type == ExecutionEventType::WorkflowCancelled)
            .unwrap();
        assert!(cancelling_pos < cancelled_pos);
    }

    #[test]
    fn test_cancel_signal_roundtrip() {
        let ctx = ExecutionContext::new("greeter", None);
        assert!(ctx.check_cancellation().is_ok());
        ctx.set_cancellation();
        assert!(matches!(
            ctx.check_cancellation(),
            Err(ExecutionError::CancellationRequested)
        ));
    }

    #[test]
    fn test_start_from_scheduled_is_invalid() {
        let mut ctx = ExecutionContext::new("greeter", None);
        ctx.schedule("worker-1").unwrap();
        let err = ctx.start("src").unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidTransition { .. }));
    }

    #[test]
    fn test_event_times_are_monotone() {
        let mut ctx = running_ctx();
        ctx.pause("src", "a").unwrap();
        ctx.resume("src").unwrap();
        ctx.complete("src", None).unwrap();

        for pair in ctx.events.windows(2) {
            assert!(pair[0].time <= pair[1].time);
        }
    }

    #[test]
    fn test_serde_roundtrip_preserves_events() {
        let mut ctx = running_ctx();
        ctx.complete("src", Some(json!([1, 2, 3]))).unwrap();

        let encoded = serde_json::to_string(&ctx).unwrap();
        let decoded: ExecutionContext = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.execution_id, ctx.execution_id);
        assert_eq!(decoded.state, ctx.state);
        assert_eq!(decoded.events, ctx.events);
        assert_eq!(decoded.output(), ctx.output());
    }

    #[test]
    fn test_events_not_in_filters_by_id_and_type() {
        let mut ctx = running_ctx();
        ctx.complete("src", None).unwrap();

        let known: Vec<_> = ctx.events[..1].iter().map(|e| e.dedup_key()).collect();
        let fresh = ctx.events_not_in(&known);
        assert_eq!(fresh.len(), ctx.events.len() - 1);
    }

    #[test]
    fn test_summary_excludes_events() {
        let mut ctx = running_ctx();
        ctx.complete("src", Some(json!("done"))).unwrap();

        let summary = ctx.summary();
        assert_eq!(summary.state, ExecutionState::Completed);
        assert_eq!(summary.output, Some(json!("done")));
        assert_eq!(summary.event_count, 2);
    }
}
