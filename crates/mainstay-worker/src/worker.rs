//! Worker loop
//!
//! Registers, subscribes to the dispatch channel, and for every delivered
//! execution: claim, load the procedure from the local registry, run the
//! workflow runtime with a checkpoint-per-event callback, and go back to
//! waiting. Cancellations arrive on the same channel and flip the in-memory
//! signal of the matching running execution. Infrastructure errors are
//! retried with backoff and never terminate the worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use mainstay_core::secrets::SecretStore;
use mainstay_core::{
    CheckpointFn, ExecutionContext, ExecutionEnv, ExecutionError, WorkflowRegistry,
};
use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::ControlPlaneClient;
use crate::probe::{ResourceProbe, StaticProbe};

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Doubling reconnect backoff, capped at [`RECONNECT_MAX`].
fn next_reconnect_delay(delay: Duration) -> Duration {
    std::cmp::min(delay * 2, RECONNECT_MAX)
}

/// Payload of an `execution_scheduled` event.
#[derive(Debug, Deserialize)]
struct ScheduledDelivery {
    workflow: WorkflowDelivery,
    context: ExecutionContext,
}

#[derive(Debug, Deserialize)]
struct WorkflowDelivery {
    name: String,
    version: i32,
}

/// Payload of an `execution_cancelled` event.
#[derive(Debug, Deserialize)]
struct CancelledDelivery {
    context: ExecutionContext,
}

/// A long-lived execution agent.
pub struct Worker {
    client: Arc<ControlPlaneClient>,
    registry: Arc<WorkflowRegistry>,
    probe: Box<dyn ResourceProbe>,
    running: Arc<DashMap<Uuid, CancellationToken>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        server_url: impl Into<String>,
        name: impl Into<String>,
        bootstrap_token: impl Into<String>,
        registry: Arc<WorkflowRegistry>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            client: Arc::new(ControlPlaneClient::new(server_url, name, bootstrap_token)),
            registry,
            probe: Box::new(StaticProbe::default()),
            running: Arc::new(DashMap::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send(true).ok();
    }

    /// Run until shutdown. Each iteration registers (rotating the session
    /// token) and consumes one SSE subscription; connection failures back
    /// off and retry.
    pub async fn run(&self) -> Result<(), ExecutionError> {
        let mut delay = RECONNECT_MIN;
        loop {
            if *self.shutdown_rx.borrow() {
                info!("worker shutting down");
                return Ok(());
            }

            match self.session().await {
                Ok(()) => {
                    delay = RECONNECT_MIN;
                }
                Err(err) => {
                    warn!(error = %err, "control-plane session ended, reconnecting");
                    let mut shutdown_rx = self.shutdown_rx.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                    delay = next_reconnect_delay(delay);
                }
            }
        }
    }

    /// One register + subscribe cycle.
    async fn session(&self) -> Result<(), ExecutionError> {
        let registration = self.probe.registration(self.client.worker_name());
        self.client.register(&registration).await?;
        info!(worker = %self.client.worker_name(), "registered with control plane");

        let mut events = Box::pin(self.client.connect().await?);
        info!("dispatch subscription established");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            let event = tokio::select! {
                _ = shutdown_rx.changed() => return Ok(()),
                event = futures::StreamExt::next(&mut events) => event,
            };

            let Some(event) = event else {
                return Err(ExecutionError::Database {
                    kind: "http".to_string(),
                    message: "dispatch subscription closed".to_string(),
                });
            };
            let event = event?;

            match event.event.as_str() {
                "execution_scheduled" => self.on_scheduled(&event.data),
                "execution_cancelled" => self.on_cancelled(&event.data).await,
                "keep-alive" => debug!("keep-alive"),
                "error" => warn!(detail = %event.data, "control plane reported an error"),
                other => debug!(event = other, "ignoring unknown event"),
            }
        }
    }

    /// Claim and run a delivered execution on its own task so the
    /// subscription keeps draining (cancellations must get through while
    /// executions run).
    fn on_scheduled(&self, data: &str) {
        let delivery: ScheduledDelivery = match serde_json::from_str(data) {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(error = %err, "malformed execution_scheduled payload");
                return;
            }
        };

        info!(
            workflow = %delivery.workflow.name,
            version = delivery.workflow.version,
            execution_id = %delivery.context.execution_id,
            "execution scheduled"
        );

        let client = self.client.clone();
        let registry = self.registry.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            let execution_id = delivery.context.execution_id;
            if let Err(err) =
                run_execution(client, registry, running.clone(), delivery).await
            {
                if err.is_infrastructure() {
                    warn!(execution_id = %execution_id, error = %err, "execution attempt failed, leaving for redelivery");
                } else {
                    error!(execution_id = %execution_id, error = %err, "execution failed");
                }
            }
            running.remove(&execution_id);
        });
    }

    /// Flip the cancel signal of a running execution; finalize orphaned
    /// CANCELLING contexts this worker inherited after a crash.
    async fn on_cancelled(&self, data: &str) {
        let delivery: CancelledDelivery = match serde_json::from_str(data) {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(error = %err, "malformed execution_cancelled payload");
                return;
            }
        };
        let execution_id = delivery.context.execution_id;

        if let Some(entry) = self.running.get(&execution_id) {
            info!(execution_id = %execution_id, "cancelling running execution");
            entry.value().cancel();
            return;
        }

        // Not running here: the previous owner died mid-cancellation.
        info!(execution_id = %execution_id, "finalizing inherited cancellation");
        let mut ctx = delivery.context;
        let source = format!("{}_{}", ctx.workflow_name, ctx.execution_id);
        if ctx.cancel(&source, "operation cancelled").is_ok() {
            if let Err(err) = self.client.checkpoint(&ctx).await {
                warn!(execution_id = %execution_id, error = %err, "failed to checkpoint finalized cancellation");
            }
        }
    }
}

async fn run_execution(
    client: Arc<ControlPlaneClient>,
    registry: Arc<WorkflowRegistry>,
    running: Arc<DashMap<Uuid, CancellationToken>>,
    delivery: ScheduledDelivery,
) -> Result<(), ExecutionError> {
    let execution_id = delivery.context.execution_id;

    // Claim may lose the race to another worker; that is not an error.
    match client.claim(execution_id).await {
        Ok(_) => {}
        Err(ExecutionError::ContextNotFound { .. }) => {
            debug!(execution_id = %execution_id, "claim lost, execution taken elsewhere");
            return Ok(());
        }
        Err(err) => return Err(err),
    }
    info!(execution_id = %execution_id, "execution claimed");

    // The claimed context (with the claim event) is the authoritative copy.
    let ctx = client
        .fetch_context(&delivery.workflow.name, execution_id)
        .await?;

    let env = ExecutionEnv::new().with_secrets(Arc::new(RemoteSecretStore {
        client: client.clone(),
    }));
    let checkpoint = client_checkpoint(client.clone());
    let wctx = mainstay_core::WorkflowCtx::new(ctx, checkpoint, env);
    running.insert(execution_id, wctx.signal());

    let workflow = match registry.get(&delivery.workflow.name) {
        Ok(workflow) => workflow,
        Err(err) => {
            // The bundle names a procedure this worker was not built with;
            // the execution fails rather than hanging in CLAIMED forever.
            warn!(workflow = %delivery.workflow.name, "workflow not in local registry");
            let source = format!("{}_{}", delivery.workflow.name, execution_id);
            wctx.fail_unstartable(&source, err.to_value()).await?;
            return Err(err);
        }
    };

    let finished = workflow.execute(wctx).await?;
    info!(
        execution_id = %execution_id,
        state = %finished.state,
        "execution settled"
    );
    Ok(())
}

/// Checkpoint callback that posts snapshots to the control plane and awaits
/// the round-trip, preserving causal order of events.
fn client_checkpoint(client: Arc<ControlPlaneClient>) -> CheckpointFn {
    Arc::new(move |ctx| {
        let client = client.clone();
        Box::pin(async move { client.checkpoint(&ctx).await })
    })
}

/// Secret resolution over the control-plane API. Management operations live
/// on the control plane; workers only read.
struct RemoteSecretStore {
    client: Arc<ControlPlaneClient>,
}

#[async_trait]
impl SecretStore for RemoteSecretStore {
    async fn get(&self, names: &[String]) -> Result<HashMap<String, String>, ExecutionError> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }
        self.client.resolve_secrets(names).await
    }

    async fn set(&self, _name: &str, _value: &str) -> Result<(), ExecutionError> {
        Err(ExecutionError::Database {
            kind: "http".to_string(),
            message: "secrets are managed on the control plane".to_string(),
        })
    }

    async fn remove(&self, _name: &str) -> Result<(), ExecutionError> {
        Err(ExecutionError::Database {
            kind: "http".to_string(),
            message: "secrets are managed on the control plane".to_string(),
        })
    }

    async fn list(&self) -> Result<Vec<String>, ExecutionError> {
        Err(ExecutionError::Database {
            kind: "http".to_string(),
            message: "secrets are managed on the control plane".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::{registration, spawn_control_plane, TestControlPlane, BOOTSTRAP_TOKEN};
    use mainstay_core::store::{ContextStore, WorkerRegistry, WorkflowCatalog};
    use mainstay_core::worker::WorkerInfo;
    use mainstay_core::{ExecutionEventType, ExecutionState, Workflow};
    use serde_json::{json, Value};

    /// Worker whose client already holds a session token.
    async fn registered_worker(
        tcp: &TestControlPlane,
        name: &str,
        registry: Arc<WorkflowRegistry>,
    ) -> Worker {
        let worker = Worker::new(tcp.url.clone(), name, BOOTSTRAP_TOKEN, registry);
        worker
            .client
            .register(&registration(name))
            .await
            .expect("register");
        worker
    }

    async fn registered_info(tcp: &TestControlPlane, name: &str) -> WorkerInfo {
        tcp.state
            .workers
            .register(registration(name))
            .await
            .expect("register info")
    }

    fn greeter_workflow() -> Workflow {
        Workflow::new("greeter", |ctx| async move {
            let name = ctx.input().await.unwrap_or(Value::Null);
            Ok(json!(format!("Hello, {}", name.as_str().unwrap_or("world"))))
        })
    }

    fn delivery(ctx: mainstay_core::ExecutionContext) -> ScheduledDelivery {
        ScheduledDelivery {
            workflow: WorkflowDelivery {
                name: ctx.workflow_name.clone(),
                version: 1,
            },
            context: ctx,
        }
    }

    #[test]
    fn test_reconnect_delay_doubles_and_caps() {
        assert_eq!(next_reconnect_delay(RECONNECT_MIN), Duration::from_secs(2));
        assert_eq!(
            next_reconnect_delay(Duration::from_secs(8)),
            Duration::from_secs(16)
        );
        assert_eq!(next_reconnect_delay(Duration::from_secs(20)), RECONNECT_MAX);
        assert_eq!(next_reconnect_delay(RECONNECT_MAX), RECONNECT_MAX);
    }

    #[tokio::test]
    async fn test_session_surfaces_connection_failure() {
        // Nothing listens here; registration fails as retryable infra.
        let registry = Arc::new(WorkflowRegistry::new());
        let worker = Worker::new("http://127.0.0.1:9", "w-offline", "boot", registry);

        let err = worker.session().await.expect_err("no control plane");
        assert!(err.is_infrastructure());
    }

    #[tokio::test]
    async fn test_run_execution_claim_lost_is_ok() {
        let tcp = spawn_control_plane().await;
        let registry = Arc::new(WorkflowRegistry::new());
        registry.register(greeter_workflow());
        let worker = registered_worker(&tcp, "w-late", registry).await;

        tcp.state
            .catalog
            .save("greeter", b"bundle".to_vec(), None, None)
            .await
            .expect("catalog save");
        let ctx = mainstay_core::ExecutionContext::new("greeter", Some(json!("Joe")));
        tcp.state.contexts.save(&ctx).await.expect("save");

        // Another worker got there first: the execution is bound elsewhere.
        let rival = registered_info(&tcp, "w-early").await;
        let bound = tcp
            .state
            .contexts
            .next_execution(&rival)
            .await
            .expect("next_execution")
            .expect("offered to rival");

        let result = run_execution(
            worker.client.clone(),
            worker.registry.clone(),
            worker.running.clone(),
            delivery(bound),
        )
        .await;
        assert!(result.is_ok());

        // The execution is untouched, still scheduled to the rival.
        let stored = tcp.state.contexts.get(ctx.execution_id).await.expect("get");
        assert_eq!(stored.state, ExecutionState::Scheduled);
        assert_eq!(stored.current_worker.as_deref(), Some("w-early"));
    }

    #[tokio::test]
    async fn test_run_execution_drives_workflow_to_completion() {
        let tcp = spawn_control_plane().await;
        let registry = Arc::new(WorkflowRegistry::new());
        registry.register(greeter_workflow());
        let worker = registered_worker(&tcp, "w-run", registry).await;

        tcp.state
            .catalog
            .save("greeter", b"bundle".to_vec(), None, None)
            .await
            .expect("catalog save");
        let ctx = mainstay_core::ExecutionContext::new("greeter", Some(json!("Joe")));
        tcp.state.contexts.save(&ctx).await.expect("save");

        let info = tcp.state.workers.get("w-run").await.expect("worker info");
        let bound = tcp
            .state
            .contexts
            .next_execution(&info)
            .await
            .expect("next_execution")
            .expect("offered");

        run_execution(
            worker.client.clone(),
            worker.registry.clone(),
            worker.running.clone(),
            delivery(bound),
        )
        .await
        .expect("run_execution");

        let stored = tcp.state.contexts.get(ctx.execution_id).await.expect("get");
        assert!(stored.has_succeeded());
        assert_eq!(stored.output(), Some(&json!("Hello, Joe")));
        assert!(stored
            .events
            .iter()
            .any(|e| e.event_type == ExecutionEventType::WorkflowClaimed));
    }

    #[tokio::test]
    async fn test_run_execution_fails_unregistered_workflow() {
        let tcp = spawn_control_plane().await;
        // Empty registry: the delivered workflow has no local procedure.
        let worker = registered_worker(&tcp, "w-empty", Arc::new(WorkflowRegistry::new())).await;

        tcp.state
            .catalog
            .save("greeter", b"bundle".to_vec(), None, None)
            .await
            .expect("catalog save");
        let ctx = mainstay_core::ExecutionContext::new("greeter", None);
        tcp.state.contexts.save(&ctx).await.expect("save");

        let info = tcp.state.workers.get("w-empty").await.expect("worker info");
        let bound = tcp
            .state
            .contexts
            .next_execution(&info)
            .await
            .expect("next_execution")
            .expect("offered");

        let err = run_execution(
            worker.client.clone(),
            worker.registry.clone(),
            worker.running.clone(),
            delivery(bound),
        )
        .await
        .expect_err("unregistered workflow");
        assert!(matches!(err, ExecutionError::WorkflowNotFound { .. }));

        // Failed rather than hanging in CLAIMED.
        let stored = tcp.state.contexts.get(ctx.execution_id).await.expect("get");
        assert!(stored.has_failed());
        assert_eq!(
            stored.events.last().expect("events").event_type,
            ExecutionEventType::WorkflowFailed
        );
    }

    #[tokio::test]
    async fn test_on_cancelled_flips_running_signal() {
        let tcp = spawn_control_plane().await;
        let worker = registered_worker(&tcp, "w-signal", Arc::new(WorkflowRegistry::new())).await;

        let ctx = mainstay_core::ExecutionContext::new("greeter", None);
        let token = CancellationToken::new();
        worker.running.insert(ctx.execution_id, token.clone());

        let data = json!({ "context": ctx }).to_string();
        worker.on_cancelled(&data).await;

        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_on_cancelled_finalizes_inherited_cancellation() {
        let tcp = spawn_control_plane().await;
        let worker = registered_worker(&tcp, "w-inherit", Arc::new(WorkflowRegistry::new())).await;

        tcp.state
            .catalog
            .save("greeter", b"bundle".to_vec(), None, None)
            .await
            .expect("catalog save");
        let ctx = mainstay_core::ExecutionContext::new("greeter", None);
        tcp.state.contexts.save(&ctx).await.expect("save");

        // Bound, claimed, then cancelled while no local task is running:
        // the previous owner died mid-cancellation.
        let info = tcp.state.workers.get("w-inherit").await.expect("worker info");
        let bound = tcp
            .state
            .contexts
            .next_execution(&info)
            .await
            .expect("next_execution")
            .expect("offered");
        tcp.state
            .contexts
            .claim(bound.execution_id, &info)
            .await
            .expect("claim");
        let cancelling = tcp
            .state
            .contexts
            .begin_cancel(ctx.execution_id)
            .await
            .expect("begin_cancel");

        let data = json!({ "context": cancelling }).to_string();
        worker.on_cancelled(&data).await;

        let stored = tcp.state.contexts.get(ctx.execution_id).await.expect("get");
        assert!(stored.has_cancelled());
        assert_eq!(
            stored.events.last().expect("events").event_type,
            ExecutionEventType::WorkflowCancelled
        );
    }
}
