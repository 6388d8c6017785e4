//! Runtime handle shared by the workflow and task runtimes
//!
//! `WorkflowCtx` is the handle user procedures receive and pass explicitly to
//! every task call. It owns the live [`ExecutionContext`] behind a lock,
//! snapshots it for every checkpoint (the store never shares the live event
//! vector), and carries the ambient pieces the runtimes need: clock, secret
//! resolution, per-execution cache and the cancellation signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::{system_clock, Clock};
use crate::context::ExecutionContext;
use crate::errors::ExecutionError;
use crate::event::ExecutionEvent;
use crate::secrets::{InMemorySecretStore, SecretStore};
use crate::task::TaskCache;

/// Callback invoked with a context snapshot after every appended event.
pub type CheckpointFn =
    Arc<dyn Fn(ExecutionContext) -> BoxFuture<'static, Result<(), ExecutionError>> + Send + Sync>;

/// Checkpoint that drops the snapshot. Used by tests and dry runs.
pub fn noop_checkpoint() -> CheckpointFn {
    Arc::new(|_ctx| Box::pin(async { Ok(()) }))
}

/// Ambient services injected into an execution.
#[derive(Clone)]
pub struct ExecutionEnv {
    pub clock: Arc<dyn Clock>,
    pub secrets: Arc<dyn SecretStore>,
}

impl ExecutionEnv {
    pub fn new() -> Self {
        Self {
            clock: system_clock(),
            secrets: Arc::new(InMemorySecretStore::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }
}

impl Default for ExecutionEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running execution, cheap to clone.
#[derive(Clone)]
pub struct WorkflowCtx {
    ctx: Arc<Mutex<ExecutionContext>>,
    checkpoint: CheckpointFn,
    env: ExecutionEnv,
    cache: Arc<TaskCache>,
    cancel: CancellationToken,
    execution_id: Uuid,
    workflow_name: String,
}

impl WorkflowCtx {
    pub fn new(ctx: ExecutionContext, checkpoint: CheckpointFn, env: ExecutionEnv) -> Self {
        let cancel = ctx.cancel_signal();
        let execution_id = ctx.execution_id;
        let workflow_name = ctx.workflow_name.clone();
        Self {
            ctx: Arc::new(Mutex::new(ctx)),
            checkpoint,
            env,
            cache: Arc::new(TaskCache::new()),
            cancel,
            execution_id,
            workflow_name,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub async fn input(&self) -> Option<Value> {
        self.ctx.lock().await.input.clone()
    }

    /// Typed view of the workflow input.
    pub async fn input_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, ExecutionError> {
        let input = self.input().await.unwrap_or(Value::Null);
        serde_json::from_value(input).map_err(ExecutionError::from)
    }

    pub async fn resume_payload(&self) -> Option<Value> {
        self.ctx.lock().await.resume_payload.clone()
    }

    /// Owned snapshot of the current context.
    pub async fn snapshot(&self) -> ExecutionContext {
        self.ctx.lock().await.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.env.clock.clone()
    }

    pub fn cache(&self) -> &TaskCache {
        &self.cache
    }

    pub fn signal(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Observe the cancellation signal; suspension points call this.
    pub fn check_cancellation(&self) -> Result<(), ExecutionError> {
        if self.cancel.is_cancelled() {
            Err(ExecutionError::CancellationRequested)
        } else {
            Ok(())
        }
    }

    /// Cancellation-aware sleep through the injected clock.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ExecutionError> {
        let clock = self.env.clock.clone();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ExecutionError::CancellationRequested),
            _ = clock.sleep(duration) => Ok(()),
        }
    }

    pub async fn resolve_secrets(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, String>, ExecutionError> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }
        self.env.secrets.get(names).await
    }

    /// Run a closure against the live context under the lock.
    pub(crate) async fn with_ctx<R>(
        &self,
        f: impl FnOnce(&mut ExecutionContext) -> R,
    ) -> R {
        let mut guard = self.ctx.lock().await;
        f(&mut guard)
    }

    /// Apply a mutation (one or more event appends), then checkpoint the
    /// resulting snapshot. The snapshot is taken under the lock so the
    /// checkpointed copy is causally consistent with the append.
    pub(crate) async fn mutate_and_checkpoint(
        &self,
        f: impl FnOnce(&mut ExecutionContext) -> Result<(), ExecutionError>,
    ) -> Result<(), ExecutionError> {
        let snapshot = {
            let mut guard = self.ctx.lock().await;
            f(&mut guard)?;
            guard.clone()
        };
        (self.checkpoint)(snapshot).await
    }

    /// Fresh context for a sub-workflow, sharing this execution's
    /// cancellation signal.
    pub(crate) fn child_context(
        &self,
        workflow_name: String,
        input: Option<Value>,
    ) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(workflow_name, input);
        ctx.share_cancel_with(self.cancel.clone());
        ctx
    }

    /// Handle for a sub-workflow context, reusing this execution's
    /// checkpoint sink and ambient services.
    pub(crate) fn child_handle(&self, ctx: ExecutionContext) -> WorkflowCtx {
        WorkflowCtx::new(ctx, self.checkpoint.clone(), self.env.clone())
    }

    /// Append one task event and checkpoint.
    pub(crate) async fn record_task_event(
        &self,
        event: ExecutionEvent,
    ) -> Result<(), ExecutionError> {
        self.mutate_and_checkpoint(|ctx| ctx.append_task_event(event))
            .await
    }

    /// Fail an execution whose procedure cannot be started at all (e.g. it
    /// is not registered on the executing worker). Emits WORKFLOW_STARTED
    /// then WORKFLOW_FAILED so the log stays well-formed.
    pub async fn fail_unstartable(
        &self,
        source_id: &str,
        error: Value,
    ) -> Result<(), ExecutionError> {
        self.mutate_and_checkpoint(|ctx| {
            ctx.start(source_id)?;
            ctx.fail(source_id, error)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ExecutionEventType;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;

    #[tokio::test]
    async fn test_checkpoint_receives_snapshots() {
        let seen: Arc<SyncMutex<Vec<usize>>> = Arc::new(SyncMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let checkpoint: CheckpointFn = Arc::new(move |ctx| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                seen.lock().push(ctx.events.len());
                Ok(())
            })
        });

        let ctx = ExecutionContext::new("wf", Some(json!(1)));
        let wctx = WorkflowCtx::new(ctx, checkpoint, ExecutionEnv::new());

        wctx.mutate_and_checkpoint(|c| c.start("src")).await.unwrap();
        wctx.record_task_event(ExecutionEvent::new(
            "t_1",
            "src",
            ExecutionEventType::TaskStarted,
            "t",
            None,
        ))
        .await
        .unwrap();

        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_sleep_is_cancellable() {
        let ctx = ExecutionContext::new("wf", None);
        ctx.set_cancellation();
        let wctx = WorkflowCtx::new(ctx, noop_checkpoint(), ExecutionEnv::new());

        let result = wctx.sleep(Duration::from_secs(3600)).await;
        assert!(matches!(result, Err(ExecutionError::CancellationRequested)));
    }

    #[tokio::test]
    async fn test_input_typed_view() {
        let ctx = ExecutionContext::new("wf", Some(json!({"count": 3})));
        let wctx = WorkflowCtx::new(ctx, noop_checkpoint(), ExecutionEnv::new());

        #[derive(serde::Deserialize)]
        struct Input {
            count: u32,
        }
        let input: Input = wctx.input_as().await.unwrap();
        assert_eq!(input.count, 3);
    }
}
