//! Mainstay worker
//!
//! Long-lived execution agent. Deployments build their worker binary by
//! registering compiled workflows and starting the loop:
//!
//! ```ignore
//! use std::sync::Arc;
//! use mainstay_core::{Workflow, WorkflowRegistry};
//! use mainstay_worker::Worker;
//!
//! let registry = Arc::new(WorkflowRegistry::new());
//! registry.register(Workflow::new("hello_world", |ctx| async move {
//!     // ...
//! #   Ok(serde_json::Value::Null)
//! }));
//!
//! let worker = Worker::new("http://localhost:8000", "worker-1", "bootstrap", registry);
//! worker.run().await?;
//! ```

pub mod client;
pub mod probe;
pub mod worker;

#[cfg(test)]
pub(crate) mod testsupport;

pub use client::ControlPlaneClient;
pub use probe::{ResourceProbe, StaticProbe};
pub use worker::Worker;
