//! End-to-end engine scenarios driven through the in-memory store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use mainstay_core::builtins;
use mainstay_core::combinators::parallel;
use mainstay_core::prelude::*;
use serde_json::{json, Value};

fn events_of(ctx: &ExecutionContext) -> Vec<ExecutionEventType> {
    ctx.events.iter().map(|e| e.event_type).collect()
}

fn count(ctx: &ExecutionContext, event_type: ExecutionEventType) -> usize {
    ctx.events
        .iter()
        .filter(|e| e.event_type == event_type)
        .count()
}

#[tokio::test]
async fn test_hello_world() {
    let say_hello = Arc::new(Task::new("say_hello", |input| async move {
        let name: String = input.arg(0)?;
        Ok(json!(format!("Hello, {name}")))
    }));

    let task = say_hello.clone();
    let workflow = Workflow::new("hello_world", move |ctx| {
        let task = task.clone();
        async move {
            let name = ctx.input().await.unwrap_or(Value::Null);
            task.call(&ctx, vec![name]).await
        }
    });

    let store = Arc::new(InMemoryContextStore::new());
    let ctx = workflow
        .run(
            store.clone(),
            ExecutionEnv::new(),
            RunOptions::with_input(json!("Joe")),
        )
        .await
        .unwrap();

    assert!(ctx.has_succeeded());
    assert_eq!(ctx.output(), Some(&json!("Hello, Joe")));
    assert_eq!(
        events_of(&ctx),
        vec![
            ExecutionEventType::WorkflowStarted,
            ExecutionEventType::TaskStarted,
            ExecutionEventType::TaskCompleted,
            ExecutionEventType::WorkflowCompleted,
        ]
    );

    // The stored copy matches what the runtime returned.
    let stored = store.get(ctx.execution_id).await.unwrap();
    assert_eq!(stored.events, ctx.events);
}

#[tokio::test]
async fn test_retry_then_succeed() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_task = calls.clone();

    let flaky = Arc::new(
        Task::builder("flaky", move |_input| {
            let calls = calls_in_task.clone();
            async move {
                let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= 2 {
                    Err(format!("attempt {attempt} failed").into())
                } else {
                    Ok(json!(42))
                }
            }
        })
        .retry_max_attempts(3)
        .retry_delay(Duration::from_secs(1))
        .retry_backoff(2.0)
        .build(),
    );

    let task = flaky.clone();
    let workflow = Workflow::new("retry_then_succeed", move |ctx| {
        let task = task.clone();
        async move { task.call(&ctx, vec![]).await }
    });

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(InMemoryContextStore::new());
    let ctx = workflow
        .run(
            store,
            ExecutionEnv::new().with_clock(clock.clone()),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert!(ctx.has_succeeded());
    assert_eq!(ctx.output(), Some(&json!(42)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    assert_eq!(count(&ctx, ExecutionEventType::TaskRetryStarted), 2);
    assert_eq!(count(&ctx, ExecutionEventType::TaskRetryCompleted), 2);
    assert_eq!(count(&ctx, ExecutionEventType::TaskCompleted), 1);
    // Initial failure + first retry's failure.
    assert_eq!(count(&ctx, ExecutionEventType::TaskFailed), 2);

    // Backoff schedule: 1s then 2s.
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeout_with_fallback() {
    let slow = Arc::new(
        Task::builder("slow", |_input| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!("never"))
        })
        .timeout(Duration::from_secs(1))
        .fallback(|input| async move {
            let x: Value = input.arg(0)?;
            Ok(json!(["fellback", x]))
        })
        .build(),
    );

    let task = slow.clone();
    let workflow = Workflow::new("timeout_with_fallback", move |ctx| {
        let task = task.clone();
        async move {
            let input = ctx.input().await.unwrap_or(Value::Null);
            task.call(&ctx, vec![input]).await
        }
    });

    let store = Arc::new(InMemoryContextStore::new());
    let ctx = workflow
        .run(
            store,
            ExecutionEnv::new(),
            RunOptions::with_input(json!(7)),
        )
        .await
        .unwrap();

    assert!(ctx.has_succeeded());
    assert_eq!(ctx.output(), Some(&json!(["fellback", 7])));

    let types = events_of(&ctx);
    let failed_pos = types
        .iter()
        .position(|t| *t == ExecutionEventType::TaskFailed)
        .expect("timeout recorded as TASK_FAILED");
    let fallback_pos = types
        .iter()
        .position(|t| *t == ExecutionEventType::TaskFallbackStarted)
        .expect("fallback started");
    assert!(failed_pos < fallback_pos);
    assert_eq!(count(&ctx, ExecutionEventType::TaskFallbackCompleted), 1);

    // The recorded failure is the timeout.
    let failure = ctx
        .events
        .iter()
        .find(|e| e.event_type == ExecutionEventType::TaskFailed)
        .unwrap();
    assert_eq!(failure.value.as_ref().unwrap()["error"], "timeout");
}

fn pause_workflow(tasks: Arc<PauseTasks>) -> Workflow {
    Workflow::new("pause_with_input", move |ctx| {
        let tasks = tasks.clone();
        async move {
            let initial = tasks.initial.call(&ctx, vec![]).await?;
            let user_input = builtins::pause(&ctx, "waiting").await?;
            tasks
                .process
                .call(&ctx, vec![initial, user_input])
                .await
        }
    })
}

struct PauseTasks {
    initial: Task,
    process: Task,
}

impl PauseTasks {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            initial: Task::new("initial_task", |_input| async move {
                Ok(json!({"stage": "initial", "data": [1, 2, 3]}))
            }),
            process: Task::new("process_with_input", |input| async move {
                let initial: Value = input.arg(0)?;
                let user_input: Value = input.arg(1)?;
                let multiplier = user_input
                    .get("multiplier")
                    .and_then(Value::as_i64)
                    .unwrap_or(1);
                let total: i64 = initial["data"]
                    .as_array()
                    .map(|data| data.iter().filter_map(Value::as_i64).sum())
                    .unwrap_or(0);
                Ok(json!({
                    "result": total + multiplier,
                    "payload": user_input,
                }))
            }),
        })
    }
}

#[tokio::test]
async fn test_pause_and_resume_with_payload() {
    let tasks = PauseTasks::new();
    let workflow = pause_workflow(tasks);
    let store = Arc::new(InMemoryContextStore::new());

    // First run parks at the pause point.
    let paused = workflow
        .run(store.clone(), ExecutionEnv::new(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(paused.state, ExecutionState::Paused);
    assert!(paused.is_paused());
    assert_eq!(paused.paused_label(), Some("waiting"));
    assert_eq!(
        paused.events.last().unwrap().event_type,
        ExecutionEventType::WorkflowPaused
    );

    // Resume with a payload; replayed prefix is not re-executed.
    let resumed = workflow
        .run(
            store.clone(),
            ExecutionEnv::new(),
            RunOptions::resume(paused.execution_id, Some(json!({"multiplier": 5}))),
        )
        .await
        .unwrap();

    assert!(resumed.has_succeeded());
    let output = resumed.output().unwrap();
    assert_eq!(output["result"], json!(11));
    assert_eq!(output["payload"], json!({"multiplier": 5}));
    assert!(resumed.has_resumed());
}

#[tokio::test]
async fn test_resume_without_payload_yields_label() {
    let tasks = PauseTasks::new();
    let workflow = pause_workflow(tasks);
    let store = Arc::new(InMemoryContextStore::new());

    let paused = workflow
        .run(store.clone(), ExecutionEnv::new(), RunOptions::default())
        .await
        .unwrap();
    let resumed = workflow
        .run(
            store,
            ExecutionEnv::new(),
            RunOptions::resume(paused.execution_id, None),
        )
        .await
        .unwrap();

    assert!(resumed.has_succeeded());
    // The pause value falls back to its label.
    assert_eq!(resumed.output().unwrap()["payload"], json!("waiting"));
}

#[tokio::test]
async fn test_cancellation_mid_task() {
    let long_running = Arc::new(Task::new("long_running", |input| async move {
        for _ in 0..10 {
            if input.signal.is_cancelled() {
                return Err("cancelled".into());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(json!("finished"))
    }));

    let task = long_running.clone();
    let workflow = Workflow::new("cancellation", move |ctx| {
        let task = task.clone();
        async move { task.call(&ctx, vec![]).await }
    });

    let store = Arc::new(InMemoryContextStore::new());
    let ctx = ExecutionContext::new("cancellation", None);
    let ctx = store.save(&ctx).await.unwrap();
    let signal = ctx.cancel_signal();

    let wctx = WorkflowCtx::new(
        ctx,
        mainstay_core::store_checkpoint(store.clone()),
        ExecutionEnv::new(),
    );

    let run = tokio::spawn({
        let workflow = workflow.clone();
        async move { workflow.execute(wctx).await }
    });

    tokio::time::sleep(Duration::from_millis(120)).await;
    signal.cancel();

    let finished = run.await.unwrap().unwrap();
    assert_eq!(finished.state, ExecutionState::Cancelled);
    assert!(finished.has_cancelled());
    assert_eq!(
        finished.events.last().unwrap().event_type,
        ExecutionEventType::WorkflowCancelled
    );

    let cancelling_pos = finished
        .events
        .iter()
        .position(|e| e.event_type == ExecutionEventType::WorkflowCancelling)
        .expect("WORKFLOW_CANCELLING present");
    let cancelled_pos = finished
        .events
        .iter()
        .position(|e| e.event_type == ExecutionEventType::WorkflowCancelled)
        .unwrap();
    assert!(cancelling_pos < cancelled_pos);
}

#[tokio::test]
async fn test_parallel_fan_out() {
    struct Greetings {
        say_hi: Task,
        say_hello: Task,
        diga_ola: Task,
        saluda: Task,
    }

    fn greeting(name: &str, format: &'static str) -> Task {
        Task::new(name, move |input| async move {
            let who: String = input.arg(0)?;
            Ok(json!(format.replace("{}", &who)))
        })
    }

    let greetings = Arc::new(Greetings {
        say_hi: greeting("say_hi", "Hi, {}"),
        say_hello: greeting("say_hello", "Hello, {}"),
        diga_ola: greeting("diga_ola", "Ola, {}"),
        saluda: greeting("saluda", "Hola, {}"),
    });

    let tasks = greetings.clone();
    let workflow = Workflow::new("parallel_tasks", move |ctx| {
        let tasks = tasks.clone();
        async move {
            let name = ctx.input().await.unwrap_or(Value::Null);
            let results = parallel(vec![
                tasks.say_hi.call(&ctx, vec![name.clone()]).boxed(),
                tasks.say_hello.call(&ctx, vec![name.clone()]).boxed(),
                tasks.diga_ola.call(&ctx, vec![name.clone()]).boxed(),
                tasks.saluda.call(&ctx, vec![name.clone()]).boxed(),
            ])
            .await?;
            Ok(json!(results))
        }
    });

    let store = Arc::new(InMemoryContextStore::new());
    let ctx = workflow
        .run(
            store,
            ExecutionEnv::new(),
            RunOptions::with_input(json!("Joe")),
        )
        .await
        .unwrap();

    assert!(ctx.has_succeeded());
    assert_eq!(
        ctx.output(),
        Some(&json!(["Hi, Joe", "Hello, Joe", "Ola, Joe", "Hola, Joe"]))
    );

    // All four completions precede the workflow completion.
    let completed_pos = ctx
        .events
        .iter()
        .position(|e| e.event_type == ExecutionEventType::WorkflowCompleted)
        .unwrap();
    let task_completions: Vec<usize> = ctx
        .events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.event_type == ExecutionEventType::TaskCompleted)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(task_completions.len(), 4);
    assert!(task_completions.iter().all(|pos| *pos < completed_pos));
}

#[tokio::test]
async fn test_replay_does_not_reinvoke_recorded_tasks() {
    let invocations = Arc::new(AtomicU32::new(0));
    let counter = invocations.clone();

    let tracked = Arc::new(Task::new("tracked", move |_input| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!("ran"))
        }
    }));

    let task = tracked.clone();
    let workflow = Workflow::new("replayable", move |ctx| {
        let task = task.clone();
        async move {
            let first = task.call(&ctx, vec![json!(1)]).await?;
            let gate = builtins::pause(&ctx, "gate").await?;
            Ok(json!([first, gate]))
        }
    });

    let store = Arc::new(InMemoryContextStore::new());
    let paused = workflow
        .run(store.clone(), ExecutionEnv::new(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let resumed = workflow
        .run(
            store.clone(),
            ExecutionEnv::new(),
            RunOptions::resume(paused.execution_id, Some(json!("go"))),
        )
        .await
        .unwrap();

    // The recorded task was replayed, not re-executed.
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert!(resumed.has_succeeded());
    assert_eq!(resumed.output(), Some(&json!(["ran", "go"])));
    assert!(resumed
        .events
        .iter()
        .any(|e| e.event_type == ExecutionEventType::TaskResumed));
}

#[tokio::test]
async fn test_rerun_of_finished_execution_is_idempotent() {
    let invocations = Arc::new(AtomicU32::new(0));
    let counter = invocations.clone();

    let effect = Arc::new(Task::new("effect", move |_input| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!("done"))
        }
    }));

    let task = effect.clone();
    let workflow = Workflow::new("idempotent", move |ctx| {
        let task = task.clone();
        async move { task.call(&ctx, vec![]).await }
    });

    let store = Arc::new(InMemoryContextStore::new());
    let first = workflow
        .run(store.clone(), ExecutionEnv::new(), RunOptions::default())
        .await
        .unwrap();

    let second = workflow
        .run(
            store.clone(),
            ExecutionEnv::new(),
            RunOptions::resume(first.execution_id, None),
        )
        .await
        .unwrap();

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(first.output(), second.output());
    assert_eq!(
        serde_json::to_string(&first.events).unwrap(),
        serde_json::to_string(&second.events).unwrap()
    );
}

#[tokio::test]
async fn test_failure_records_error_as_final_value() {
    let doomed = Arc::new(Task::new("doomed", |_input| async move {
        Err(TaskError::with_value(
            "invalid input",
            json!({"field": "name"}),
        ))
    }));

    let task = doomed.clone();
    let workflow = Workflow::new("failing", move |ctx| {
        let task = task.clone();
        async move { task.call(&ctx, vec![]).await }
    });

    let store = Arc::new(InMemoryContextStore::new());
    let ctx = workflow
        .run(store, ExecutionEnv::new(), RunOptions::default())
        .await
        .unwrap();

    assert!(ctx.has_failed());
    assert_eq!(ctx.state, ExecutionState::Failed);
    let last = ctx.events.last().unwrap();
    assert_eq!(last.event_type, ExecutionEventType::WorkflowFailed);
    assert_eq!(last.value.as_ref().unwrap()["error"], "task_failed");
    // The whole log survives for inspection.
    assert!(count(&ctx, ExecutionEventType::TaskFailed) >= 1);
}

#[tokio::test]
async fn test_rollback_runs_on_surfaced_failure() {
    let rolled_back = Arc::new(AtomicU32::new(0));
    let rollback_counter = rolled_back.clone();

    let writer = Arc::new(
        Task::builder("writer", |_input| async move {
            Err::<Value, TaskError>("write failed".into())
        })
        .rollback(move |_input| {
            let counter = rollback_counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
        .build(),
    );

    let task = writer.clone();
    let workflow = Workflow::new("compensating", move |ctx| {
        let task = task.clone();
        async move { task.call(&ctx, vec![]).await }
    });

    let store = Arc::new(InMemoryContextStore::new());
    let ctx = workflow
        .run(store, ExecutionEnv::new(), RunOptions::default())
        .await
        .unwrap();

    assert!(ctx.has_failed());
    assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
    assert_eq!(count(&ctx, ExecutionEventType::TaskRollbackStarted), 1);
    assert_eq!(count(&ctx, ExecutionEventType::TaskRollbackCompleted), 1);
}

#[tokio::test]
async fn test_task_map_preserves_order_and_identity() {
    let double = Arc::new(Task::new("double", |input| async move {
        let n: i64 = input.arg(0)?;
        Ok(json!(n * 2))
    }));

    let task = double.clone();
    let workflow = Workflow::new("mapper", move |ctx| {
        let task = task.clone();
        async move {
            let results = task
                .map(&ctx, vec![json!(1), json!(2), json!(3), json!(1)])
                .await?;
            Ok(json!(results))
        }
    });

    let store = Arc::new(InMemoryContextStore::new());
    let ctx = workflow
        .run(store, ExecutionEnv::new(), RunOptions::default())
        .await
        .unwrap();

    assert!(ctx.has_succeeded());
    assert_eq!(ctx.output(), Some(&json!([2, 4, 6, 2])));
    // Duplicate items at different positions stay distinct calls.
    assert_eq!(count(&ctx, ExecutionEventType::TaskCompleted), 4);
}

#[tokio::test]
async fn test_sub_workflow_recorded_as_span() {
    let inner_task = Arc::new(Task::new("shout", |input| async move {
        let s: String = input.arg(0)?;
        Ok(json!(s.to_uppercase()))
    }));

    let task = inner_task.clone();
    let child = Workflow::new("shouter", move |ctx| {
        let task = task.clone();
        async move {
            let input = ctx.input().await.unwrap_or(Value::Null);
            task.call(&ctx, vec![input]).await
        }
    });

    let child = Arc::new(child);
    let child_for_parent = child.clone();
    let parent = Workflow::new("parent", move |ctx| {
        let child = child_for_parent.clone();
        async move {
            let out = child.call(&ctx, Some(json!("quiet"))).await?;
            Ok(json!({"child_said": out}))
        }
    });

    let store = Arc::new(InMemoryContextStore::new());
    let ctx = parent
        .run(store.clone(), ExecutionEnv::new(), RunOptions::default())
        .await
        .unwrap();

    assert!(ctx.has_succeeded());
    assert_eq!(ctx.output(), Some(&json!({"child_said": "QUIET"})));

    // The child ran in its own independently checkpointed context.
    let span = ctx
        .events
        .iter()
        .find(|e| e.event_type == ExecutionEventType::TaskStarted)
        .unwrap();
    assert!(span.name.starts_with("subflow_"));
}

#[tokio::test]
async fn test_global_cache_spans_executions() {
    let invocations = Arc::new(AtomicU32::new(0));
    let counter = invocations.clone();

    let cached = Arc::new(
        Task::builder("expensive_cross_run", move |input| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let tag: String = input.arg(0)?;
                Ok(json!(format!("result-{tag}")))
            }
        })
        .cache(CacheMode::Global)
        .build(),
    );

    let task = cached.clone();
    let workflow = Workflow::new("cached", move |ctx| {
        let task = task.clone();
        async move { task.call(&ctx, vec![json!("x")]).await }
    });

    let store = Arc::new(InMemoryContextStore::new());
    let first = workflow
        .run(store.clone(), ExecutionEnv::new(), RunOptions::default())
        .await
        .unwrap();
    // A fresh execution with the same call hits the shared cache.
    let second = workflow
        .run(store, ExecutionEnv::new(), RunOptions::default())
        .await
        .unwrap();

    assert!(first.has_succeeded() && second.has_succeeded());
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(first.output(), second.output());
    // The cache hit is still recorded as a completion in the second log.
    assert_eq!(count(&second, ExecutionEventType::TaskCompleted), 1);
}
