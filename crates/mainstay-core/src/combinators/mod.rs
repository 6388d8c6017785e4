//! Composition primitives
//!
//! - [`parallel`] awaits N in-flight task calls; the first error drops the
//!   remaining siblings and surfaces.
//! - [`pipeline`] feeds task outputs forward, a → b → c.
//! - [`Graph`] resolves a DAG of named tasks in topological order,
//!   evaluating independent siblings concurrently.

mod graph;

pub use graph::{Graph, GraphBuilder};

use futures::future::BoxFuture;
use serde_json::Value;

use crate::errors::ExecutionError;
use crate::runtime::WorkflowCtx;
use crate::task::Task;

/// Await all calls, in call order. Failure policy: the first error cancels
/// the still-running siblings (their futures are dropped) and surfaces.
pub async fn parallel(
    calls: Vec<BoxFuture<'_, Result<Value, ExecutionError>>>,
) -> Result<Vec<Value>, ExecutionError> {
    futures::future::try_join_all(calls).await
}

/// Run tasks in sequence, feeding each output as the next task's single
/// argument. Returns the last task's output.
pub async fn pipeline(
    ctx: &WorkflowCtx,
    tasks: &[&Task],
    input: Value,
) -> Result<Value, ExecutionError> {
    let mut current = input;
    for task in tasks {
        current = task.call(ctx, vec![current]).await?;
    }
    Ok(current)
}
