//! Mainstay control plane
//!
//! Serves the HTTP surface (workflow upload/run/status/cancel, worker
//! registration and the SSE dispatch channel, schedule CRUD) and runs the
//! background schedule evaluator.

pub mod api;
pub mod auth;
pub mod dispatcher;
pub mod error;
pub mod openapi;
pub mod scheduler;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use state::AppState;
