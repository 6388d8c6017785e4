//! # Mainstay Execution Core
//!
//! A durable workflow orchestration engine: workflows are ordinary async
//! procedures composed of tasks, and every step is recorded as an event so
//! executions survive failure, restart, pause/resume and cancellation, and
//! replay deterministically.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Workflow runtime                        │
//! │   (lifecycle events, pause/cancel translation, checkpoint)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Task runtime                          │
//! │  (replay short-circuit, retries, timeout, fallback, cache)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ExecutionContext                        │
//! │        (append-only event log, validated transitions)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ContextStore                           │
//! │       (idempotent event merge, dispatch, claim, cancel)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use mainstay_core::prelude::*;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ExecutionError> {
//! let say_hello = Arc::new(Task::new("say_hello", |input| async move {
//!     let name: String = input.arg(0)?;
//!     Ok(json!(format!("Hello, {name}")))
//! }));
//!
//! let task = say_hello.clone();
//! let workflow = Workflow::new("hello_world", move |ctx| {
//!     let task = task.clone();
//!     async move {
//!         let name = ctx.input().await.unwrap_or(json!("world"));
//!         task.call(&ctx, vec![name]).await
//!     }
//! });
//!
//! let store = Arc::new(InMemoryContextStore::new());
//! let ctx = workflow
//!     .run(store, ExecutionEnv::new(), RunOptions::with_input(json!("Joe")))
//!     .await?;
//! assert_eq!(ctx.output(), Some(&json!("Hello, Joe")));
//! # Ok(())
//! # }
//! ```

pub mod builtins;
pub mod clock;
pub mod combinators;
pub mod config;
pub mod context;
pub mod errors;
pub mod event;
pub mod memory;
pub mod output_storage;
pub mod registry;
pub mod resources;
pub mod runtime;
pub mod schedule;
pub mod secrets;
pub mod store;
pub mod task;
pub mod worker;
pub mod workflow;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::combinators::{parallel, pipeline, Graph};
    pub use crate::context::{ExecutionContext, ExecutionSummary};
    pub use crate::errors::{ExecutionError, TimeoutScope};
    pub use crate::event::{ExecutionEvent, ExecutionEventType, ExecutionState};
    pub use crate::memory::{
        InMemoryContextStore, InMemoryScheduleStore, InMemoryWorkerRegistry,
        InMemoryWorkflowCatalog,
    };
    pub use crate::registry::WorkflowRegistry;
    pub use crate::runtime::{noop_checkpoint, ExecutionEnv, WorkflowCtx};
    pub use crate::store::{ContextStore, ScheduleStore, WorkerRegistry, WorkflowCatalog};
    pub use crate::task::{CacheMode, RetryPolicy, Task, TaskError, TaskInput};
    pub use crate::workflow::{RunOptions, Workflow};
}

// Re-export key types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{ExecutionContext, ExecutionSummary};
pub use errors::{ExecutionError, TimeoutScope};
pub use event::{ExecutionEvent, ExecutionEventType, ExecutionState};
pub use registry::WorkflowRegistry;
pub use runtime::{noop_checkpoint, CheckpointFn, ExecutionEnv, WorkflowCtx};
pub use store::{
    ContextStore, ScheduleStore, WorkerRegistry, WorkflowCatalog, WorkflowRecord, WorkflowSummary,
};
pub use task::{CacheMode, RetryPolicy, Task, TaskBuilder, TaskError, TaskInput};
pub use workflow::{store_checkpoint, RunOptions, Workflow};
