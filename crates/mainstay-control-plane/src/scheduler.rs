//! Schedule evaluator
//!
//! Background loop that turns due schedules into `CREATED` executions,
//! making them immediately eligible for dispatch. Failures are counted on
//! the schedule and never terminate the loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mainstay_core::store::{ContextStore, ScheduleStore, WorkflowCatalog};
use mainstay_core::ExecutionContext;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Evaluator configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due schedules are polled.
    pub tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
        }
    }
}

/// Background schedule evaluator.
pub struct Scheduler {
    contexts: Arc<dyn ContextStore>,
    catalog: Arc<dyn WorkflowCatalog>,
    schedules: Arc<dyn ScheduleStore>,
    config: SchedulerConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        contexts: Arc<dyn ContextStore>,
        catalog: Arc<dyn WorkflowCatalog>,
        schedules: Arc<dyn ScheduleStore>,
        config: SchedulerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            contexts,
            catalog,
            schedules,
            config,
            shutdown_rx,
        }
    }

    /// Run until shutdown is signalled.
    pub async fn run(mut self) {
        info!(tick = ?self.config.tick, "scheduler started");
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    info!("scheduler shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.config.tick) => {
                    self.tick().await;
                }
            }
        }
    }

    /// One evaluation round. Every due schedule creates one execution and
    /// advances; per-schedule errors are recorded and skipped.
    pub async fn tick(&self) {
        let now = Utc::now();
        let due = match self.schedules.due(now).await {
            Ok(due) => due,
            Err(err) => {
                warn!(error = %err, "failed to load due schedules");
                return;
            }
        };

        for schedule in due {
            let fired = self.fire(&schedule).await;
            if let Err(err) = &fired {
                warn!(
                    schedule_id = %schedule.id,
                    workflow = %schedule.workflow_name,
                    error = %err,
                    "schedule fire failed"
                );
            }
            if let Err(err) = self
                .schedules
                .mark_run(schedule.id, now, fired.is_ok())
                .await
            {
                warn!(schedule_id = %schedule.id, error = %err, "failed to advance schedule");
            }
        }
    }

    async fn fire(
        &self,
        schedule: &mainstay_core::schedule::Schedule,
    ) -> Result<ExecutionContext, mainstay_core::ExecutionError> {
        let record = self.catalog.get(&schedule.workflow_name, None).await?;

        let mut ctx = ExecutionContext::new(schedule.workflow_name.clone(), schedule.input.clone());
        if let Some(requests) = record.requests {
            ctx = ctx.with_requests(requests);
        }
        let ctx = self.contexts.save(&ctx).await?;
        debug!(
            schedule_id = %schedule.id,
            workflow = %schedule.workflow_name,
            execution_id = %ctx.execution_id,
            "schedule fired"
        );
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mainstay_core::memory::{
        InMemoryContextStore, InMemoryScheduleStore, InMemoryWorkflowCatalog,
    };
    use mainstay_core::schedule::{Schedule, ScheduleSpec, ScheduleStatus};
    use serde_json::json;

    struct Fixture {
        contexts: Arc<InMemoryContextStore>,
        schedules: Arc<InMemoryScheduleStore>,
        scheduler: Scheduler,
    }

    async fn fixture() -> Fixture {
        let contexts = Arc::new(InMemoryContextStore::new());
        let catalog = Arc::new(InMemoryWorkflowCatalog::new());
        let schedules = Arc::new(InMemoryScheduleStore::new());
        catalog
            .save("report", b"bundle".to_vec(), None, None)
            .await
            .unwrap();

        let (_tx, rx) = watch::channel(false);
        let scheduler = Scheduler::new(
            contexts.clone(),
            catalog,
            schedules.clone(),
            SchedulerConfig::default(),
            rx,
        );
        Fixture {
            contexts,
            schedules,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_due_schedule_creates_execution() {
        let f = fixture().await;

        // An interval schedule whose first fire is already in the past.
        let mut schedule = Schedule::new(
            "report",
            ScheduleSpec::interval(Duration::from_secs(60), "UTC"),
            Some(json!({"kind": "daily"})),
            Utc::now() - chrono::Duration::seconds(120),
        )
        .unwrap();
        schedule.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
        f.schedules.create(schedule.clone()).await.unwrap();

        f.scheduler.tick().await;

        assert_eq!(f.contexts.len(), 1);
        let advanced = f.schedules.get(schedule.id).await.unwrap();
        assert_eq!(advanced.run_count, 1);
        assert!(advanced.next_run_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_unknown_workflow_counts_failure() {
        let f = fixture().await;

        let mut schedule = Schedule::new(
            "ghost",
            ScheduleSpec::interval(Duration::from_secs(60), "UTC"),
            None,
            Utc::now(),
        )
        .unwrap();
        schedule.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
        f.schedules.create(schedule.clone()).await.unwrap();

        f.scheduler.tick().await;

        assert_eq!(f.contexts.len(), 0);
        let advanced = f.schedules.get(schedule.id).await.unwrap();
        assert_eq!(advanced.failure_count, 1);
        assert_eq!(advanced.run_count, 0);
    }

    #[tokio::test]
    async fn test_once_schedule_fires_once_and_deactivates() {
        let f = fixture().await;

        let run_at = Utc::now() - chrono::Duration::seconds(1);
        let schedule = Schedule::new(
            "report",
            ScheduleSpec::once(run_at, "UTC"),
            None,
            run_at - chrono::Duration::seconds(60),
        )
        .unwrap();
        f.schedules.create(schedule.clone()).await.unwrap();

        f.scheduler.tick().await;
        f.scheduler.tick().await;

        // Fired exactly once, then deactivated.
        assert_eq!(f.contexts.len(), 1);
        let done = f.schedules.get(schedule.id).await.unwrap();
        assert_eq!(done.status, ScheduleStatus::Paused);
        assert_eq!(done.next_run_at, None);
    }
}
