//! Workflow runtime
//!
//! A workflow is a named async procedure over a [`WorkflowCtx`]. The runtime
//! emits the workflow lifecycle events, translates the pause/cancel control
//! signals into state, and checkpoints after every transition. Re-running a
//! finished execution is a no-op; re-running an unfinished one replays it.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::errors::ExecutionError;
use crate::event::{call_identity, ExecutionEvent, ExecutionEventType};
use crate::runtime::{CheckpointFn, ExecutionEnv, WorkflowCtx};
use crate::store::ContextStore;

pub type WorkflowFn = Arc<
    dyn Fn(WorkflowCtx) -> BoxFuture<'static, Result<Value, ExecutionError>> + Send + Sync,
>;

/// Wrap an async closure into a [`WorkflowFn`].
pub fn workflow_fn<F, Fut>(f: F) -> WorkflowFn
where
    F: Fn(WorkflowCtx) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, ExecutionError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Options for [`Workflow::run`]: one entry point covers both fresh starts
/// and resumption of an existing execution.
#[derive(Default)]
pub struct RunOptions {
    pub input: Option<Value>,
    pub execution_id: Option<Uuid>,
    pub resume_payload: Option<Value>,
}

impl RunOptions {
    pub fn with_input(input: Value) -> Self {
        Self {
            input: Some(input),
            ..Default::default()
        }
    }

    pub fn resume(execution_id: Uuid, resume_payload: Option<Value>) -> Self {
        Self {
            execution_id: Some(execution_id),
            resume_payload,
            ..Default::default()
        }
    }
}

/// A named, durable workflow procedure.
#[derive(Clone)]
pub struct Workflow {
    name: String,
    func: WorkflowFn,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow").field("name", &self.name).finish()
    }
}

impl Workflow {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowCtx) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ExecutionError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: workflow_fn(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drive one execution to its next stopping point (terminal or paused)
    /// and return the final context snapshot.
    #[instrument(skip(self, wctx), fields(workflow = %self.name, execution_id = %wctx.execution_id()))]
    pub async fn execute(&self, wctx: WorkflowCtx) -> Result<ExecutionContext, ExecutionError> {
        let source_id = format!("{}_{}", self.name, wctx.execution_id());

        // Idempotent re-entry on finished executions.
        if wctx.with_ctx(|c| c.has_finished()).await {
            debug!("execution already finished, returning as-is");
            return Ok(wctx.snapshot().await);
        }

        let resuming = wctx.with_ctx(|c| c.is_paused()).await;
        let started = wctx.with_ctx(|c| c.has_started()).await;
        if resuming {
            wctx.mutate_and_checkpoint(|c| c.resume(&source_id)).await?;
            info!("execution resumed");
        } else if !started {
            wctx.mutate_and_checkpoint(|c| c.start(&source_id)).await?;
            info!("execution started");
        } else {
            debug!("re-entering in-flight execution for replay");
        }

        let result = (self.func)(wctx.clone()).await;

        match result {
            Ok(output) => {
                wctx.mutate_and_checkpoint(|c| c.complete(&source_id, Some(output)))
                    .await?;
                info!("execution completed");
            }
            Err(ExecutionError::PauseRequested { label }) => {
                wctx.mutate_and_checkpoint(|c| c.pause(&source_id, &label))
                    .await?;
                info!(label = %label, "execution paused");
            }
            Err(ExecutionError::CancellationRequested) => {
                wctx.mutate_and_checkpoint(|c| {
                    if !c.is_cancelling() {
                        c.begin_cancel(&source_id)?;
                    }
                    c.cancel(&source_id, "operation cancelled")
                })
                .await?;
                info!("execution cancelled");
            }
            Err(err) => {
                wctx.mutate_and_checkpoint(|c| c.fail(&source_id, err.to_value()))
                    .await?;
                warn!(error = %err, "execution failed");
            }
        }

        Ok(wctx.snapshot().await)
    }

    /// Run against a context store: loads or creates the context, wires the
    /// store in as the checkpoint sink, executes, and returns the final
    /// context. `execution_id` selects an existing execution (idempotent on
    /// finished ones); `resume_payload` is delivered to the pending pause
    /// point.
    pub async fn run(
        &self,
        store: Arc<dyn ContextStore>,
        env: ExecutionEnv,
        opts: RunOptions,
    ) -> Result<ExecutionContext, ExecutionError> {
        let ctx = match opts.execution_id {
            Some(execution_id) => {
                let mut ctx = store.get(execution_id).await?;
                if opts.resume_payload.is_some() {
                    ctx.resume_payload = opts.resume_payload;
                }
                ctx
            }
            None => {
                let ctx = ExecutionContext::new(self.name.clone(), opts.input);
                store.save(&ctx).await?
            }
        };

        let checkpoint = store_checkpoint(store.clone());
        let wctx = WorkflowCtx::new(ctx, checkpoint, env);
        self.execute(wctx).await
    }

    /// Invoke this workflow as a sub-workflow of `parent`. The child runs in
    /// its own independently checkpointed context; in the parent it is
    /// recorded as a single task-like span keyed like any other task call.
    pub async fn call(
        &self,
        parent: &WorkflowCtx,
        input: Option<Value>,
    ) -> Result<Value, ExecutionError> {
        parent.check_cancellation()?;

        let span_name = format!("subflow_{}", self.name);
        let args = vec![input.clone().unwrap_or(Value::Null)];
        let event_id = call_identity(&span_name, &args, &[]);

        let recorded = parent
            .with_ctx(|c| c.find_task_output(&event_id).map(|e| e.value.clone()))
            .await;
        if let Some(value) = recorded {
            parent
                .record_task_event(ExecutionEvent::new(
                    &event_id,
                    &event_id,
                    ExecutionEventType::TaskResumed,
                    &span_name,
                    None,
                ))
                .await?;
            return Ok(value.unwrap_or(Value::Null));
        }

        parent
            .record_task_event(ExecutionEvent::new(
                &event_id,
                &event_id,
                ExecutionEventType::TaskStarted,
                &span_name,
                Some(Value::Array(args)),
            ))
            .await?;

        let child_ctx = parent.child_context(self.name.clone(), input);
        let child_wctx = parent.child_handle(child_ctx);
        let finished = self.execute(child_wctx).await?;

        if finished.has_succeeded() {
            let output = finished.output().cloned().unwrap_or(Value::Null);
            parent
                .record_task_event(ExecutionEvent::new(
                    &event_id,
                    &event_id,
                    ExecutionEventType::TaskCompleted,
                    &span_name,
                    Some(output.clone()),
                ))
                .await?;
            Ok(output)
        } else if finished.has_cancelled() {
            Err(ExecutionError::CancellationRequested)
        } else {
            let error = finished.output().cloned();
            let err = ExecutionError::TaskFailed {
                message: format!("sub-workflow '{}' failed", self.name),
                value: error.clone(),
            };
            parent
                .record_task_event(ExecutionEvent::new(
                    &event_id,
                    &event_id,
                    ExecutionEventType::TaskFailed,
                    &span_name,
                    Some(err.to_value()),
                ))
                .await?;
            Err(err)
        }
    }
}

/// Checkpoint function that saves snapshots through a context store.
pub fn store_checkpoint(store: Arc<dyn ContextStore>) -> CheckpointFn {
    Arc::new(move |ctx| {
        let store = store.clone();
        Box::pin(async move {
            store.save(&ctx).await?;
            Ok(())
        })
    })
}
