//! Task runtime
//!
//! A task is a named, invocable unit whose successful result is recorded
//! once per unique argument hash. The runtime wraps the user function with
//! replay short-circuiting, caching, secret injection, timeout enforcement,
//! retries with exponential backoff, fallback and compensation, and
//! checkpoints the context after every event it appends.

mod cache;
mod retry;

pub use cache::{CacheMode, TaskCache};
pub use retry::{RetryPolicy, MAX_RETRY_DELAY};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::clock::Clock;
use crate::errors::{ExecutionError, TimeoutScope};
use crate::event::{call_identity, ExecutionEvent, ExecutionEventType};
use crate::output_storage::{OutputStorage, DEFAULT_INLINE_THRESHOLD};
use crate::runtime::WorkflowCtx;

/// User-level task failure carrying an optional structured payload.
#[derive(Debug, Clone)]
pub struct TaskError {
    pub message: String,
    pub value: Option<Value>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            value: None,
        }
    }

    pub fn with_value(message: impl Into<String>, value: Value) -> Self {
        Self {
            message: message.into(),
            value: Some(value),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<TaskError> for ExecutionError {
    fn from(err: TaskError) -> Self {
        ExecutionError::TaskFailed {
            message: err.message,
            value: err.value,
        }
    }
}

/// What a task function receives per invocation.
pub struct TaskInput {
    pub args: Vec<Value>,
    /// Secrets resolved from the task's `secret_requests`.
    pub secrets: HashMap<String, String>,
    /// Injected clock; time-dependent tasks must use it.
    pub clock: Arc<dyn Clock>,
    /// Cancellation signal; long-running tasks should select against it.
    pub signal: CancellationToken,
}

impl TaskInput {
    /// Deserialize the positional argument at `index`.
    pub fn arg<T: serde::de::DeserializeOwned>(&self, index: usize) -> Result<T, TaskError> {
        let value = self
            .args
            .get(index)
            .cloned()
            .ok_or_else(|| TaskError::new(format!("missing argument {index}")))?;
        serde_json::from_value(value)
            .map_err(|e| TaskError::new(format!("argument {index}: {e}")))
    }

    /// Deserialize the argument at `index`, or `None` when absent or null.
    pub fn opt_arg<T: serde::de::DeserializeOwned>(
        &self,
        index: usize,
    ) -> Result<Option<T>, TaskError> {
        match self.args.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| TaskError::new(format!("argument {index}: {e}"))),
        }
    }

    pub fn secret(&self, name: &str) -> Result<&str, TaskError> {
        self.secrets
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| TaskError::new(format!("secret '{name}' was not requested")))
    }
}

pub type TaskResult = Result<Value, TaskError>;
pub type TaskFuture = BoxFuture<'static, TaskResult>;
pub type TaskFn = Arc<dyn Fn(TaskInput) -> TaskFuture + Send + Sync>;

/// Wrap an async closure into a [`TaskFn`].
pub fn task_fn<F, Fut>(f: F) -> TaskFn
where
    F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = TaskResult> + Send + 'static,
{
    Arc::new(move |input| Box::pin(f(input)))
}

/// Declared execution options of a task.
#[derive(Clone)]
pub struct TaskOptions {
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    pub secret_requests: Vec<String>,
    pub cache: CacheMode,
    /// Serialized size above which outputs are offloaded to the configured
    /// output store.
    pub inline_threshold: usize,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout: None,
            secret_requests: Vec::new(),
            cache: CacheMode::Off,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
        }
    }
}

/// A named, memoized unit of work.
pub struct Task {
    name: String,
    options: TaskOptions,
    run: TaskFn,
    fallback: Option<TaskFn>,
    rollback: Option<TaskFn>,
    output_storage: Option<Arc<dyn OutputStorage>>,
}

impl Task {
    /// Task with default options.
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = TaskResult> + Send + 'static,
    {
        Self::builder(name, f).build()
    }

    pub fn builder<F, Fut>(name: impl Into<String>, f: F) -> TaskBuilder
    where
        F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = TaskResult> + Send + 'static,
    {
        TaskBuilder {
            name: name.into(),
            options: TaskOptions::default(),
            run: task_fn(f),
            fallback: None,
            rollback: None,
            output_storage: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    /// Per-call name: `${N}` placeholders in the declared name are replaced
    /// with the corresponding positional argument, so calls like
    /// `process_${0}` get distinct identities per file name.
    fn effective_name(&self, args: &[Value]) -> String {
        if !self.name.contains("${") {
            return self.name.clone();
        }
        let mut name = self.name.clone();
        for (index, arg) in args.iter().enumerate() {
            let placeholder = format!("${{{index}}}");
            if name.contains(&placeholder) {
                let rendered = match arg {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                name = name.replace(&placeholder, &rendered);
            }
        }
        name
    }

    /// Invoke the task within an execution.
    pub async fn call(&self, ctx: &WorkflowCtx, args: Vec<Value>) -> Result<Value, ExecutionError> {
        self.call_inner(ctx, args, &[]).await
    }

    /// Apply the task to each item; outputs preserve item order and each
    /// element carries its position in its call identity so replay matches
    /// per element. A surfaced element failure (after that element's own
    /// retries and fallback) fails the whole map and cancels its siblings.
    pub async fn map(
        &self,
        ctx: &WorkflowCtx,
        items: Vec<Value>,
    ) -> Result<Vec<Value>, ExecutionError> {
        let calls = items.into_iter().enumerate().map(|(index, item)| {
            let kwargs = vec![("map_index".to_string(), json!(index))];
            async move { self.call_inner(ctx, vec![item], &kwargs).await }
        });
        futures::future::try_join_all(calls).await
    }

    async fn call_inner(
        &self,
        ctx: &WorkflowCtx,
        args: Vec<Value>,
        identity_kwargs: &[(String, Value)],
    ) -> Result<Value, ExecutionError> {
        ctx.check_cancellation()?;

        let task_name = self.effective_name(&args);
        let event_id = call_identity(&task_name, &args, identity_kwargs);

        // Replay short-circuit: a recorded completion wins outright.
        let recorded = ctx
            .with_ctx(|c| c.find_task_output(&event_id).map(|e| e.value.clone()))
            .await;
        if let Some(value) = recorded {
            ctx.record_task_event(ExecutionEvent::new(
                &event_id,
                &event_id,
                ExecutionEventType::TaskResumed,
                &task_name,
                None,
            ))
            .await?;
            return Ok(value.unwrap_or(Value::Null));
        }

        // Crash recovery may find TASK_STARTED already present; the store
        // dedupes by (id, type) so only append when it is new locally.
        let already_started = ctx
            .with_ctx(|c| c.has_event(&event_id, ExecutionEventType::TaskStarted))
            .await;
        if !already_started {
            ctx.record_task_event(ExecutionEvent::new(
                &event_id,
                &event_id,
                ExecutionEventType::TaskStarted,
                &task_name,
                Some(Value::Array(args.clone())),
            ))
            .await?;
        }

        if let Some(cached) = ctx.cache().get(self.options.cache, &event_id) {
            return self
                .finish(ctx, &event_id, &task_name, cached, false)
                .await;
        }

        let secrets = match ctx.resolve_secrets(&self.options.secret_requests).await {
            Ok(secrets) => secrets,
            Err(err) => {
                ctx.record_task_event(ExecutionEvent::new(
                    &event_id,
                    &event_id,
                    ExecutionEventType::TaskFailed,
                    &task_name,
                    Some(err.to_value()),
                ))
                .await?;
                return Err(err);
            }
        };

        let mut outcome = self
            .attempt(ctx, &self.run, &args, &secrets, &task_name, &event_id)
            .await;

        if let Err(err) = &outcome {
            if err.is_control_signal() {
                return outcome;
            }

            self.record_failure(ctx, &event_id, &task_name, err).await?;

            // Retries
            if self.options.retry.enabled() {
                let policy = &self.options.retry;
                for attempt in 1..=policy.max_attempts {
                    let delay = policy.delay_for_attempt(attempt);
                    ctx.sleep(delay).await?;

                    let detail = json!({
                        "attempt": attempt,
                        "max_attempts": policy.max_attempts,
                        "delay": delay.as_secs_f64(),
                        "backoff": policy.backoff,
                    });
                    ctx.record_task_event(ExecutionEvent::new(
                        &event_id,
                        &event_id,
                        ExecutionEventType::TaskRetryStarted,
                        &task_name,
                        Some(detail.clone()),
                    ))
                    .await?;

                    // Every retry cycle closes with a TASK_RETRY_COMPLETED
                    // carrying its outcome; intermediate failures also get
                    // their own TASK_FAILED.
                    match self
                        .attempt(ctx, &self.run, &args, &secrets, &task_name, &event_id)
                        .await
                    {
                        Ok(value) => {
                            let mut closed = detail;
                            closed["succeeded"] = json!(true);
                            ctx.record_task_event(ExecutionEvent::new(
                                &event_id,
                                &event_id,
                                ExecutionEventType::TaskRetryCompleted,
                                &task_name,
                                Some(closed),
                            ))
                            .await?;
                            outcome = Ok(value);
                            break;
                        }
                        Err(err) if err.is_control_signal() => return Err(err),
                        Err(err) => {
                            self.record_failure(ctx, &event_id, &task_name, &err).await?;
                            let mut closed = detail;
                            closed["succeeded"] = json!(false);
                            ctx.record_task_event(ExecutionEvent::new(
                                &event_id,
                                &event_id,
                                ExecutionEventType::TaskRetryCompleted,
                                &task_name,
                                Some(closed),
                            ))
                            .await?;
                            if attempt == policy.max_attempts {
                                outcome = Err(ExecutionError::RetryExhausted {
                                    attempts: policy.max_attempts,
                                    delay_secs: policy.delay.as_secs(),
                                    backoff: policy.backoff,
                                    cause: err.to_string(),
                                    cause_value: Some(err.to_value()),
                                });
                            } else {
                                outcome = Err(err);
                            }
                        }
                    }
                }
            }

            // Fallback takes over once the retry budget is spent.
            if outcome.is_err() {
                if let Some(fallback) = &self.fallback {
                    ctx.record_task_event(ExecutionEvent::new(
                        &event_id,
                        &event_id,
                        ExecutionEventType::TaskFallbackStarted,
                        &task_name,
                        None,
                    ))
                    .await?;

                    match self
                        .attempt(ctx, fallback, &args, &secrets, &task_name, &event_id)
                        .await
                    {
                        Ok(value) => {
                            ctx.record_task_event(ExecutionEvent::new(
                                &event_id,
                                &event_id,
                                ExecutionEventType::TaskFallbackCompleted,
                                &task_name,
                                Some(value.clone()),
                            ))
                            .await?;
                            outcome = Ok(value);
                        }
                        Err(err) if err.is_control_signal() => return Err(err),
                        Err(err) => {
                            self.record_failure(ctx, &event_id, &task_name, &err).await?;
                            outcome = Err(err);
                        }
                    }
                }
            }

            // Compensation on surfaced failure. Best effort only; its own
            // failure never masks the original error.
            if let Err(original) = &outcome {
                if let Some(rollback) = &self.rollback {
                    ctx.record_task_event(ExecutionEvent::new(
                        &event_id,
                        &event_id,
                        ExecutionEventType::TaskRollbackStarted,
                        &task_name,
                        None,
                    ))
                    .await?;

                    if let Err(rollback_err) = self
                        .attempt(ctx, rollback, &args, &secrets, &task_name, &event_id)
                        .await
                    {
                        if rollback_err.is_control_signal() {
                            return Err(rollback_err);
                        }
                        warn!(
                            task = %task_name,
                            error = %rollback_err,
                            original = %original,
                            "rollback failed"
                        );
                    }

                    ctx.record_task_event(ExecutionEvent::new(
                        &event_id,
                        &event_id,
                        ExecutionEventType::TaskRollbackCompleted,
                        &task_name,
                        None,
                    ))
                    .await?;
                }
            }
        }

        match outcome {
            Ok(value) => self.finish(ctx, &event_id, &task_name, value, true).await,
            Err(err) => Err(err),
        }
    }

    /// One invocation of a task function, guarded by the cancellation signal
    /// and the declared timeout.
    async fn attempt(
        &self,
        ctx: &WorkflowCtx,
        f: &TaskFn,
        args: &[Value],
        secrets: &HashMap<String, String>,
        task_name: &str,
        event_id: &str,
    ) -> Result<Value, ExecutionError> {
        let input = TaskInput {
            args: args.to_vec(),
            secrets: secrets.clone(),
            clock: ctx.clock(),
            signal: ctx.signal(),
        };
        let signal = ctx.signal();
        let fut = (f)(input);

        let guarded = async {
            tokio::select! {
                biased;
                _ = signal.cancelled() => Err(ExecutionError::CancellationRequested),
                result = fut => result.map_err(ExecutionError::from),
            }
        };

        match self.options.timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(result) => result,
                Err(_) => Err(ExecutionError::Timeout {
                    scope: TimeoutScope::Task,
                    name: task_name.to_string(),
                    id: event_id.to_string(),
                    timeout_secs: limit.as_secs(),
                }),
            },
            None => guarded.await,
        }
    }

    async fn record_failure(
        &self,
        ctx: &WorkflowCtx,
        event_id: &str,
        task_name: &str,
        err: &ExecutionError,
    ) -> Result<(), ExecutionError> {
        ctx.record_task_event(ExecutionEvent::new(
            event_id,
            event_id,
            ExecutionEventType::TaskFailed,
            task_name,
            Some(err.to_value()),
        ))
        .await
    }

    /// Record the completion, offloading oversized outputs when an output
    /// store is configured, and populate the cache.
    async fn finish(
        &self,
        ctx: &WorkflowCtx,
        event_id: &str,
        task_name: &str,
        value: Value,
        cacheable: bool,
    ) -> Result<Value, ExecutionError> {
        let recorded = match &self.output_storage {
            Some(storage) => {
                let serialized_len = value.to_string().len();
                if serialized_len > self.options.inline_threshold {
                    storage.store(event_id, &value).await?
                } else {
                    value
                }
            }
            None => value,
        };

        ctx.record_task_event(ExecutionEvent::new(
            event_id,
            event_id,
            ExecutionEventType::TaskCompleted,
            task_name,
            Some(recorded.clone()),
        ))
        .await?;

        if cacheable {
            ctx.cache().put(self.options.cache, event_id, &recorded);
        }
        Ok(recorded)
    }
}

/// Builder for [`Task`].
pub struct TaskBuilder {
    name: String,
    options: TaskOptions,
    run: TaskFn,
    fallback: Option<TaskFn>,
    rollback: Option<TaskFn>,
    output_storage: Option<Arc<dyn OutputStorage>>,
}

impl TaskBuilder {
    pub fn retry_max_attempts(mut self, attempts: u32) -> Self {
        self.options.retry.max_attempts = attempts;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.options.retry.delay = delay;
        self
    }

    pub fn retry_backoff(mut self, backoff: f64) -> Self {
        self.options.retry.backoff = backoff.max(1.0);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn cache(mut self, mode: CacheMode) -> Self {
        self.options.cache = mode;
        self
    }

    pub fn secret_requests<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.secret_requests = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn inline_threshold(mut self, bytes: usize) -> Self {
        self.options.inline_threshold = bytes;
        self
    }

    pub fn fallback<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = TaskResult> + Send + 'static,
    {
        self.fallback = Some(task_fn(f));
        self
    }

    pub fn rollback<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = TaskResult> + Send + 'static,
    {
        self.rollback = Some(task_fn(f));
        self
    }

    pub fn output_storage(mut self, storage: Arc<dyn OutputStorage>) -> Self {
        self.output_storage = Some(storage);
        self
    }

    pub fn build(self) -> Task {
        Task {
            name: self.name,
            options: self.options,
            run: self.run,
            fallback: self.fallback,
            rollback: self.rollback,
            output_storage: self.output_storage,
        }
    }
}
