//! In-memory store implementations
//!
//! Reference semantics for the store traits, used by tests and embedded
//! runs. The PostgreSQL implementations must match this behavior; the
//! context-store merge and claim rules here are the contract.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::errors::ExecutionError;
use crate::event::ExecutionState;
use crate::resources::ResourceRequest;
use crate::schedule::Schedule;
use crate::store::{
    ContextStore, ScheduleStore, WorkerRegistry, WorkflowCatalog, WorkflowRecord, WorkflowSummary,
};
use crate::worker::{generate_session_token, WorkerInfo, WorkerRegistration};

fn not_found(execution_id: Uuid) -> ExecutionError {
    ExecutionError::ContextNotFound {
        execution_id: execution_id.to_string(),
    }
}

/// In-memory [`ContextStore`].
#[derive(Default)]
pub struct InMemoryContextStore {
    contexts: RwLock<HashMap<Uuid, ExecutionContext>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }

    /// Whether a worker would be offered this context.
    fn eligible(ctx: &ExecutionContext, worker: &WorkerInfo) -> bool {
        let state_ok = match ctx.state {
            ExecutionState::Created => true,
            // Re-offer only to the already-bound worker (reconnect path).
            ExecutionState::Scheduled => ctx.current_worker.as_deref() == Some(&worker.name),
            // A paused execution re-enters dispatch once an operator has
            // supplied a resume payload.
            ExecutionState::Paused => ctx.resume_payload.is_some(),
            _ => false,
        };
        if !state_ok {
            return false;
        }
        match &ctx.requests {
            Some(requests) => requests.matches_worker(&worker.resources, &worker.packages),
            None => true,
        }
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn get(&self, execution_id: Uuid) -> Result<ExecutionContext, ExecutionError> {
        self.contexts
            .read()
            .get(&execution_id)
            .cloned()
            .ok_or_else(|| not_found(execution_id))
    }

    async fn save(&self, ctx: &ExecutionContext) -> Result<ExecutionContext, ExecutionError> {
        let mut contexts = self.contexts.write();
        match contexts.get_mut(&ctx.execution_id) {
            Some(stored) => {
                let known: Vec<_> = stored.events.iter().map(|e| e.dedup_key()).collect();
                let fresh: Vec<_> = ctx
                    .events_not_in(&known)
                    .into_iter()
                    .cloned()
                    .collect();
                stored.events.extend(fresh);
                stored.state = ctx.state;
                stored.current_worker = ctx.current_worker.clone();
                stored.resume_payload = ctx.resume_payload.clone();
                Ok(stored.clone())
            }
            None => {
                contexts.insert(ctx.execution_id, ctx.clone());
                Ok(ctx.clone())
            }
        }
    }

    async fn next_execution(
        &self,
        worker: &WorkerInfo,
    ) -> Result<Option<ExecutionContext>, ExecutionError> {
        let mut contexts = self.contexts.write();

        // Oldest first: execution ids are time-ordered (UUID v7).
        let mut candidates: Vec<Uuid> = contexts
            .values()
            .filter(|ctx| Self::eligible(ctx, worker))
            .map(|ctx| ctx.execution_id)
            .collect();
        candidates.sort();

        let Some(execution_id) = candidates.into_iter().next() else {
            return Ok(None);
        };

        let ctx = contexts.get_mut(&execution_id).expect("candidate exists");
        if ctx.state != ExecutionState::Scheduled {
            ctx.schedule(&worker.name)?;
        }
        Ok(Some(ctx.clone()))
    }

    async fn claim(
        &self,
        execution_id: Uuid,
        worker: &WorkerInfo,
    ) -> Result<ExecutionContext, ExecutionError> {
        let mut contexts = self.contexts.write();
        let ctx = contexts
            .get_mut(&execution_id)
            .ok_or_else(|| not_found(execution_id))?;
        // Claims against the wrong state or worker all surface the same way;
        // the caller cannot distinguish a lost race from a missing row.
        ctx.claim(&worker.name).map_err(|_| not_found(execution_id))?;
        Ok(ctx.clone())
    }

    async fn next_cancellation(
        &self,
        worker: &WorkerInfo,
    ) -> Result<Option<ExecutionContext>, ExecutionError> {
        let contexts = self.contexts.read();
        Ok(contexts
            .values()
            .find(|ctx| {
                ctx.state == ExecutionState::Cancelling
                    && ctx.current_worker.as_deref() == Some(&worker.name)
            })
            .cloned())
    }

    async fn begin_cancel(&self, execution_id: Uuid) -> Result<ExecutionContext, ExecutionError> {
        let mut contexts = self.contexts.write();
        let ctx = contexts
            .get_mut(&execution_id)
            .ok_or_else(|| not_found(execution_id))?;
        ctx.begin_cancel("control-plane")?;
        Ok(ctx.clone())
    }

    async fn request_resume(
        &self,
        execution_id: Uuid,
        resume_payload: Option<Value>,
    ) -> Result<ExecutionContext, ExecutionError> {
        let mut contexts = self.contexts.write();
        let ctx = contexts
            .get_mut(&execution_id)
            .ok_or_else(|| not_found(execution_id))?;
        if !ctx.is_paused() {
            return Err(ExecutionError::InvalidTransition {
                from: ctx.state.to_string(),
                event: "resume".to_string(),
            });
        }
        // A stored payload is the dispatch eligibility marker, so a resume
        // without one still records an explicit null.
        ctx.resume_payload = Some(resume_payload.unwrap_or(Value::Null));
        Ok(ctx.clone())
    }
}

/// In-memory [`WorkflowCatalog`].
#[derive(Default)]
pub struct InMemoryWorkflowCatalog {
    workflows: RwLock<HashMap<String, Vec<WorkflowRecord>>>,
}

impl InMemoryWorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowCatalog for InMemoryWorkflowCatalog {
    async fn save(
        &self,
        name: &str,
        source: Vec<u8>,
        imports: Option<Value>,
        requests: Option<ResourceRequest>,
    ) -> Result<WorkflowRecord, ExecutionError> {
        let mut workflows = self.workflows.write();
        let versions = workflows.entry(name.to_string()).or_default();
        let version = versions.iter().map(|r| r.version).max().unwrap_or(0) + 1;
        let record = WorkflowRecord {
            id: Uuid::now_v7(),
            name: name.to_string(),
            version,
            source,
            imports,
            requests,
        };
        versions.push(record.clone());
        Ok(record)
    }

    async fn get(
        &self,
        name: &str,
        version: Option<i32>,
    ) -> Result<WorkflowRecord, ExecutionError> {
        let workflows = self.workflows.read();
        let versions = workflows
            .get(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ExecutionError::WorkflowNotFound {
                name: name.to_string(),
            })?;
        let record = match version {
            Some(version) => versions.iter().find(|r| r.version == version),
            None => versions.iter().max_by_key(|r| r.version),
        };
        record
            .cloned()
            .ok_or_else(|| ExecutionError::WorkflowNotFound {
                name: name.to_string(),
            })
    }

    async fn list(&self) -> Result<Vec<WorkflowSummary>, ExecutionError> {
        let workflows = self.workflows.read();
        let mut summaries: Vec<WorkflowSummary> = workflows
            .iter()
            .filter_map(|(name, versions)| {
                versions.iter().map(|r| r.version).max().map(|version| {
                    WorkflowSummary {
                        name: name.clone(),
                        version,
                    }
                })
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    async fn delete(&self, name: &str, version: Option<i32>) -> Result<(), ExecutionError> {
        let mut workflows = self.workflows.write();
        let versions = workflows
            .get_mut(name)
            .ok_or_else(|| ExecutionError::WorkflowNotFound {
                name: name.to_string(),
            })?;
        match version {
            Some(version) => versions.retain(|r| r.version != version),
            None => versions.clear(),
        }
        if versions.is_empty() {
            workflows.remove(name);
        }
        Ok(())
    }
}

/// In-memory [`WorkerRegistry`].
#[derive(Default)]
pub struct InMemoryWorkerRegistry {
    workers: RwLock<HashMap<String, WorkerInfo>>,
}

impl InMemoryWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryWorkerRegistry {
    async fn register(
        &self,
        registration: WorkerRegistration,
    ) -> Result<WorkerInfo, ExecutionError> {
        let worker = WorkerInfo {
            name: registration.name.clone(),
            session_token: generate_session_token(),
            runtime: registration.runtime,
            resources: registration.resources,
            packages: registration.packages,
        };
        self.workers
            .write()
            .insert(worker.name.clone(), worker.clone());
        Ok(worker)
    }

    async fn get(&self, name: &str) -> Result<WorkerInfo, ExecutionError> {
        self.workers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutionError::WorkerNotFound {
                name: name.to_string(),
            })
    }

    async fn authenticate(&self, name: &str, token: &str) -> Result<WorkerInfo, ExecutionError> {
        let worker = self.get(name).await?;
        if worker.session_token != token {
            return Err(ExecutionError::WorkerNotFound {
                name: name.to_string(),
            });
        }
        Ok(worker)
    }

    async fn list(&self) -> Result<Vec<WorkerInfo>, ExecutionError> {
        let mut workers: Vec<WorkerInfo> = self.workers.read().values().cloned().collect();
        workers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workers)
    }
}

/// In-memory [`ScheduleStore`].
#[derive(Default)]
pub struct InMemoryScheduleStore {
    schedules: RwLock<HashMap<Uuid, Schedule>>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn schedule_not_found(id: Uuid) -> ExecutionError {
    ExecutionError::ScheduleNotFound { id: id.to_string() }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn create(&self, schedule: Schedule) -> Result<Schedule, ExecutionError> {
        self.schedules
            .write()
            .insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn get(&self, id: Uuid) -> Result<Schedule, ExecutionError> {
        self.schedules
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| schedule_not_found(id))
    }

    async fn update(&self, schedule: Schedule) -> Result<Schedule, ExecutionError> {
        let mut schedules = self.schedules.write();
        if !schedules.contains_key(&schedule.id) {
            return Err(schedule_not_found(schedule.id));
        }
        schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn delete(&self, id: Uuid) -> Result<(), ExecutionError> {
        self.schedules
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| schedule_not_found(id))
    }

    async fn list(&self) -> Result<Vec<Schedule>, ExecutionError> {
        let mut schedules: Vec<Schedule> = self.schedules.read().values().cloned().collect();
        schedules.sort_by_key(|s| s.id);
        Ok(schedules)
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, ExecutionError> {
        let mut due: Vec<Schedule> = self
            .schedules
            .read()
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        Ok(due)
    }

    async fn mark_run(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        succeeded: bool,
    ) -> Result<Schedule, ExecutionError> {
        let mut schedules = self.schedules.write();
        let schedule = schedules.get_mut(&id).ok_or_else(|| schedule_not_found(id))?;
        schedule.record_run(at, succeeded)?;
        Ok(schedule.clone())
    }
}
