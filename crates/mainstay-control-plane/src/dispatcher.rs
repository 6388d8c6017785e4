//! Worker dispatch channel
//!
//! One persistent SSE subscription per worker. The control plane polls the
//! context store on the worker's behalf: cancellations first (they preempt
//! new work), then the next assignable execution. Idle polling backs off
//! exponentially from 100 ms to 5 s and snaps back the moment something is
//! delivered.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::stream::{self, Stream};
use mainstay_core::worker::WorkerInfo;
use serde_json::json;
use tracing::{debug, warn};

use crate::state::AppState;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);
const BACKOFF_FACTOR: f64 = 1.5;
const ERROR_PAUSE: Duration = Duration::from_secs(5);

/// Idle polls between keep-alive events (~once a minute at max backoff).
const KEEP_ALIVE_EVERY: u32 = 12;

struct PollLoop {
    state: AppState,
    worker: WorkerInfo,
    delay: Duration,
    idle_polls: u32,
}

impl PollLoop {
    fn back_off(&mut self) {
        self.delay = std::cmp::min(self.delay.mul_f64(BACKOFF_FACTOR), MAX_POLL_INTERVAL);
        self.idle_polls += 1;
    }

    fn reset(&mut self) {
        self.delay = MIN_POLL_INTERVAL;
        self.idle_polls = 0;
    }

    /// One poll round; returns the next event to deliver, if any.
    async fn poll(&mut self) -> Option<SseEvent> {
        match self.state.contexts.next_cancellation(&self.worker).await {
            Ok(Some(ctx)) => {
                debug!(
                    worker = %self.worker.name,
                    execution_id = %ctx.execution_id,
                    "delivering cancellation"
                );
                self.reset();
                return Some(
                    SseEvent::default()
                        .event("execution_cancelled")
                        .data(json!({ "context": ctx }).to_string()),
                );
            }
            Ok(None) => {}
            Err(err) => {
                warn!(worker = %self.worker.name, error = %err, "cancellation poll failed");
                tokio::time::sleep(ERROR_PAUSE).await;
                return Some(SseEvent::default().event("error").data(err.to_string()));
            }
        }

        match self.state.contexts.next_execution(&self.worker).await {
            Ok(Some(ctx)) => {
                let workflow = match self.state.catalog.get(&ctx.workflow_name, None).await {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(
                            worker = %self.worker.name,
                            workflow = %ctx.workflow_name,
                            error = %err,
                            "workflow bundle missing for scheduled execution"
                        );
                        return Some(SseEvent::default().event("error").data(err.to_string()));
                    }
                };

                debug!(
                    worker = %self.worker.name,
                    execution_id = %ctx.execution_id,
                    workflow = %workflow.name,
                    "delivering execution"
                );
                self.reset();
                Some(
                    SseEvent::default()
                        .event("execution_scheduled")
                        .data(
                            json!({
                                "workflow": {
                                    "name": workflow.name,
                                    "version": workflow.version,
                                    "source": BASE64.encode(&workflow.source),
                                },
                                "context": ctx,
                            })
                            .to_string(),
                        ),
                )
            }
            Ok(None) => {
                self.back_off();
                tokio::time::sleep(self.delay).await;
                if self.idle_polls % KEEP_ALIVE_EVERY == 0 {
                    Some(SseEvent::default().event("keep-alive").data(""))
                } else {
                    None
                }
            }
            Err(err) => {
                warn!(worker = %self.worker.name, error = %err, "execution poll failed");
                tokio::time::sleep(ERROR_PAUSE).await;
                Some(SseEvent::default().event("error").data(err.to_string()))
            }
        }
    }
}

/// Build the SSE response for one worker subscription.
pub fn worker_stream(
    state: AppState,
    worker: WorkerInfo,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let poll = PollLoop::new(state, worker);

    let stream = stream::unfold(poll, |mut poll| async move {
        loop {
            if let Some(event) = poll.poll().await {
                return Some((Ok(event), poll));
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

impl PollLoop {
    fn new(state: AppState, worker: WorkerInfo) -> Self {
        Self {
            state,
            worker,
            delay: MIN_POLL_INTERVAL,
            idle_polls: 0,
        }
    }
}
