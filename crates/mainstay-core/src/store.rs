//! Persistence traits
//!
//! The runtime is persistence-agnostic: these traits define the contract and
//! the in-memory implementations in [`crate::memory`] provide the reference
//! semantics. The PostgreSQL implementations live in the storage crate and
//! must behave identically (the context-store merge and claim rules are
//! load-bearing for replay and exclusivity).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::errors::ExecutionError;
use crate::resources::ResourceRequest;
use crate::schedule::Schedule;
use crate::worker::{WorkerInfo, WorkerRegistration};

/// Transactional persistence of execution contexts and their events.
///
/// `save` merges: only events whose `(event_id, type)` pair is not yet
/// stored are appended, never reordered. This makes checkpoints idempotent.
#[async_trait]
pub trait ContextStore: Send + Sync + 'static {
    async fn get(&self, execution_id: Uuid) -> Result<ExecutionContext, ExecutionError>;

    /// Upsert the context; returns the stored state after merging.
    async fn save(&self, ctx: &ExecutionContext) -> Result<ExecutionContext, ExecutionError>;

    /// Atomically pick the next execution this worker can run: a context in
    /// `CREATED`/`SCHEDULED` state (or `PAUSED` with a resume payload
    /// waiting) whose resource requests the worker satisfies. The picked
    /// context transitions to `SCHEDULED` bound to the worker. Row-locked
    /// with skip-on-locked semantics so concurrent pollers never block each
    /// other or double-assign.
    async fn next_execution(
        &self,
        worker: &WorkerInfo,
    ) -> Result<Option<ExecutionContext>, ExecutionError>;

    /// `SCHEDULED → CLAIMED`, only for the bound worker. Unknown executions
    /// and foreign claims both surface as `ContextNotFound`.
    async fn claim(
        &self,
        execution_id: Uuid,
        worker: &WorkerInfo,
    ) -> Result<ExecutionContext, ExecutionError>;

    /// A context in `CANCELLING` bound to this worker, if any. Also the
    /// recovery path: a worker that inherits a `CANCELLING` context finalizes
    /// it.
    async fn next_cancellation(
        &self,
        worker: &WorkerInfo,
    ) -> Result<Option<ExecutionContext>, ExecutionError>;

    /// Record cancellation intent for a non-finished execution.
    async fn begin_cancel(&self, execution_id: Uuid) -> Result<ExecutionContext, ExecutionError>;

    /// Store a resume payload for a paused execution, making it eligible for
    /// re-dispatch.
    async fn request_resume(
        &self,
        execution_id: Uuid,
        resume_payload: Option<Value>,
    ) -> Result<ExecutionContext, ExecutionError>;
}

/// A versioned workflow source bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    /// Opaque source bundle bytes (stored base64 on the wire).
    #[serde(with = "base64_bytes")]
    pub source: Vec<u8>,
    /// Declared imports metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imports: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceRequest>,
}

/// Compact listing entry: name plus latest version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub name: String,
    pub version: i32,
}

/// Versioned storage of workflow bundles.
///
/// Saving an existing `name` appends `version = max + 1`; `get` without a
/// version returns the latest.
#[async_trait]
pub trait WorkflowCatalog: Send + Sync + 'static {
    async fn save(
        &self,
        name: &str,
        source: Vec<u8>,
        imports: Option<Value>,
        requests: Option<ResourceRequest>,
    ) -> Result<WorkflowRecord, ExecutionError>;

    async fn get(
        &self,
        name: &str,
        version: Option<i32>,
    ) -> Result<WorkflowRecord, ExecutionError>;

    async fn list(&self) -> Result<Vec<WorkflowSummary>, ExecutionError>;

    async fn delete(&self, name: &str, version: Option<i32>) -> Result<(), ExecutionError>;
}

/// Registration and session-token authentication of workers.
#[async_trait]
pub trait WorkerRegistry: Send + Sync + 'static {
    /// Create or replace the worker record; a fresh session token is issued
    /// on every registration.
    async fn register(&self, registration: WorkerRegistration)
        -> Result<WorkerInfo, ExecutionError>;

    async fn get(&self, name: &str) -> Result<WorkerInfo, ExecutionError>;

    /// Worker lookup that also verifies the session token.
    async fn authenticate(&self, name: &str, token: &str) -> Result<WorkerInfo, ExecutionError>;

    async fn list(&self) -> Result<Vec<WorkerInfo>, ExecutionError>;
}

/// Persistence of schedules plus the bookkeeping the evaluator loop needs.
#[async_trait]
pub trait ScheduleStore: Send + Sync + 'static {
    async fn create(&self, schedule: Schedule) -> Result<Schedule, ExecutionError>;

    async fn get(&self, id: Uuid) -> Result<Schedule, ExecutionError>;

    async fn update(&self, schedule: Schedule) -> Result<Schedule, ExecutionError>;

    async fn delete(&self, id: Uuid) -> Result<(), ExecutionError>;

    async fn list(&self) -> Result<Vec<Schedule>, ExecutionError>;

    /// Active schedules whose `next_run_at` is due at `now`.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, ExecutionError>;

    /// Record the outcome of a fire: bumps counters, advances `next_run_at`,
    /// marks one-shot schedules executed and deactivates them.
    async fn mark_run(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        succeeded: bool,
    ) -> Result<Schedule, ExecutionError>;
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}
