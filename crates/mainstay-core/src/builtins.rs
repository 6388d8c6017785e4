//! Built-in deterministic tasks
//!
//! Time, UUIDs and randomness are sources of nondeterminism; routing them
//! through recorded tasks makes their outputs part of the event log, so
//! replay returns the original values verbatim. Each helper derives its call
//! identity from its arguments: repeated calls with identical arguments
//! share one recorded result, so disambiguate loop iterations with an
//! argument (an index does fine).

use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value};

use crate::errors::ExecutionError;
use crate::event::{call_identity, ExecutionEvent, ExecutionEventType};
use crate::runtime::WorkflowCtx;
use crate::task::Task;

/// Current UTC time, recorded on first execution and replayed afterwards.
pub async fn now(ctx: &WorkflowCtx) -> Result<Value, ExecutionError> {
    let task = Task::new("now", |input| async move {
        Ok(json!(input.clock.now().to_rfc3339()))
    });
    task.call(ctx, vec![]).await
}

/// Recorded random UUID (v4).
pub async fn uuid4(ctx: &WorkflowCtx) -> Result<Value, ExecutionError> {
    let task = Task::new("uuid4", |_input| async move {
        Ok(json!(uuid::Uuid::new_v4().to_string()))
    });
    task.call(ctx, vec![]).await
}

/// Recorded random integer in `[low, high]` (inclusive).
pub async fn randint(ctx: &WorkflowCtx, low: i64, high: i64) -> Result<i64, ExecutionError> {
    let task = Task::new("randint", |input| async move {
        let low: i64 = input.arg(0)?;
        let high: i64 = input.arg(1)?;
        if low > high {
            return Err(format!("empty range: {low}..={high}").into());
        }
        let value = rand::thread_rng().gen_range(low..=high);
        Ok(json!(value))
    });
    let value = task.call(ctx, vec![json!(low), json!(high)]).await?;
    serde_json::from_value(value).map_err(ExecutionError::from)
}

/// Recorded random integer from `start..stop` stepping by `step`.
pub async fn randrange(
    ctx: &WorkflowCtx,
    start: i64,
    stop: i64,
    step: i64,
) -> Result<i64, ExecutionError> {
    let task = Task::new("randrange", |input| async move {
        let start: i64 = input.arg(0)?;
        let stop: i64 = input.arg(1)?;
        let step: i64 = input.arg(2)?;
        if step <= 0 || start >= stop {
            return Err(format!("empty range: {start}..{stop} step {step}").into());
        }
        let span = stop - start;
        let width = (span + step - 1) / step;
        let pick = rand::thread_rng().gen_range(0..width);
        Ok(json!(start + pick * step))
    });
    let value = task
        .call(ctx, vec![json!(start), json!(stop), json!(step)])
        .await?;
    serde_json::from_value(value).map_err(ExecutionError::from)
}

/// Durable, cancellation-aware sleep. Recorded, so replay does not wait
/// again.
pub async fn sleep(ctx: &WorkflowCtx, duration: Duration) -> Result<(), ExecutionError> {
    let task = Task::new("sleep", |input| async move {
        let secs: f64 = input.arg(0)?;
        let clock = input.clock.clone();
        tokio::select! {
            biased;
            _ = input.signal.cancelled() => {
                // Surfaced as a task error; the runtime's select above the
                // task future turns concurrent cancellation into the control
                // signal, this is just the late-check fallback.
                Err("cancelled during sleep".into())
            }
            _ = clock.sleep(Duration::from_secs_f64(secs)) => Ok(Value::Null),
        }
    });
    ctx.check_cancellation()?;
    task.call(ctx, vec![json!(duration.as_secs_f64())]).await?;
    Ok(())
}

/// Voluntary suspension point.
///
/// First un-replayed encounter surfaces [`ExecutionError::PauseRequested`]
/// and the workflow parks as `PAUSED`. After the operator resumes the
/// execution, the same call completes with the resume payload (or the label
/// when none was supplied). Labels must be unique per dynamic call site.
pub async fn pause(ctx: &WorkflowCtx, label: &str) -> Result<Value, ExecutionError> {
    ctx.check_cancellation()?;

    let args = vec![json!(label)];
    let event_id = call_identity("pause", &args, &[]);

    // Replayed completion: a previous resume already went through here.
    let recorded = ctx
        .with_ctx(|c| c.find_task_output(&event_id).map(|e| e.value.clone()))
        .await;
    if let Some(value) = recorded {
        ctx.record_task_event(ExecutionEvent::new(
            &event_id,
            &event_id,
            ExecutionEventType::TaskResumed,
            "pause",
            None,
        ))
        .await?;
        return Ok(value.unwrap_or(Value::Null));
    }

    let started = ctx
        .with_ctx(|c| c.has_event(&event_id, ExecutionEventType::TaskStarted))
        .await;
    if !started {
        ctx.record_task_event(ExecutionEvent::new(
            &event_id,
            &event_id,
            ExecutionEventType::TaskStarted,
            "pause",
            Some(json!(label)),
        ))
        .await?;
    }

    // Second encounter: this label already paused the execution once, so the
    // pending resume payload becomes the pause's value. An absent or null
    // payload falls back to the label.
    let reached_before = ctx.with_ctx(|c| c.has_pause_point(label)).await;
    if reached_before {
        let payload = ctx
            .resume_payload()
            .await
            .filter(|v| !v.is_null())
            .unwrap_or_else(|| json!(label));
        ctx.record_task_event(ExecutionEvent::new(
            &event_id,
            &event_id,
            ExecutionEventType::TaskCompleted,
            "pause",
            Some(payload.clone()),
        ))
        .await?;
        return Ok(payload);
    }

    Err(ExecutionError::PauseRequested {
        label: label.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::ExecutionContext;
    use crate::runtime::{noop_checkpoint, ExecutionEnv};
    use chrono::Utc;
    use std::sync::Arc;

    fn handle() -> WorkflowCtx {
        let mut ctx = ExecutionContext::new("wf", None);
        ctx.start("test").unwrap();
        WorkflowCtx::new(ctx, noop_checkpoint(), ExecutionEnv::new())
    }

    #[tokio::test]
    async fn test_now_is_replay_stable() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut ctx = ExecutionContext::new("wf", None);
        ctx.start("test").unwrap();
        let wctx = WorkflowCtx::new(
            ctx,
            noop_checkpoint(),
            ExecutionEnv::new().with_clock(clock.clone()),
        );

        let first = now(&wctx).await.unwrap();
        clock.advance(Duration::from_secs(3600));
        let second = now(&wctx).await.unwrap();

        // The second call replays the recorded value despite the clock move.
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_uuid4_recorded_once() {
        let wctx = handle();
        let first = uuid4(&wctx).await.unwrap();
        let second = uuid4(&wctx).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_randint_within_bounds() {
        let wctx = handle();
        let value = randint(&wctx, 5, 10).await.unwrap();
        assert!((5..=10).contains(&value));
    }

    #[tokio::test]
    async fn test_randint_rejects_empty_range() {
        let wctx = handle();
        assert!(randint(&wctx, 10, 5).await.is_err());
    }

    #[tokio::test]
    async fn test_randrange_respects_step() {
        let wctx = handle();
        let value = randrange(&wctx, 0, 100, 10).await.unwrap();
        assert_eq!(value % 10, 0);
        assert!((0..100).contains(&value));
    }

    #[tokio::test]
    async fn test_sleep_records_and_replays() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut ctx = ExecutionContext::new("wf", None);
        ctx.start("test").unwrap();
        let wctx = WorkflowCtx::new(
            ctx,
            noop_checkpoint(),
            ExecutionEnv::new().with_clock(clock.clone()),
        );

        sleep(&wctx, Duration::from_secs(60)).await.unwrap();
        assert_eq!(clock.sleeps().len(), 1);

        // Replay: no second sleep.
        sleep(&wctx, Duration::from_secs(60)).await.unwrap();
        assert_eq!(clock.sleeps().len(), 1);
    }

    #[tokio::test]
    async fn test_pause_two_phase_contract() {
        let wctx = handle();

        // First encounter parks the workflow.
        let err = pause(&wctx, "gate").await.unwrap_err();
        assert!(matches!(err, ExecutionError::PauseRequested { ref label } if label == "gate"));

        // The runtime records the pause point and later the resume.
        wctx.mutate_and_checkpoint(|c| c.pause("src", "gate"))
            .await
            .unwrap();
        wctx.mutate_and_checkpoint(|c| {
            c.resume_payload = Some(json!({"approved": true}));
            c.resume("src")
        })
        .await
        .unwrap();

        // Second encounter completes with the payload.
        let value = pause(&wctx, "gate").await.unwrap();
        assert_eq!(value, json!({"approved": true}));

        // Third encounter replays the recorded completion.
        let replayed = pause(&wctx, "gate").await.unwrap();
        assert_eq!(replayed, value);
    }

    #[tokio::test]
    async fn test_pause_falls_back_to_label() {
        let wctx = handle();
        let _ = pause(&wctx, "checkpoint-1").await.unwrap_err();
        wctx.mutate_and_checkpoint(|c| c.pause("src", "checkpoint-1"))
            .await
            .unwrap();
        wctx.mutate_and_checkpoint(|c| c.resume("src")).await.unwrap();

        let value = pause(&wctx, "checkpoint-1").await.unwrap();
        assert_eq!(value, json!("checkpoint-1"));
    }
}
