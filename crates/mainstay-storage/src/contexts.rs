//! PostgreSQL context store
//!
//! Executions live in two tables: one row per execution plus its ordered
//! event log. `save` merges events idempotently by `(event_id, type)`;
//! `next_execution` claims with `FOR UPDATE SKIP LOCKED` so concurrent
//! pollers neither block nor double-assign.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mainstay_core::resources::ResourceRequest;
use mainstay_core::store::ContextStore;
use mainstay_core::worker::WorkerInfo;
use mainstay_core::{ExecutionContext, ExecutionError, ExecutionEvent, ExecutionEventType, ExecutionState};
use serde_json::Value;
use sqlx::{PgConnection, Postgres, Transaction};
use uuid::Uuid;

use crate::database::{db_err, Database};
use crate::payload;

fn not_found(execution_id: Uuid) -> ExecutionError {
    ExecutionError::ContextNotFound {
        execution_id: execution_id.to_string(),
    }
}

fn state_to_str(state: ExecutionState) -> String {
    state.to_string()
}

fn state_from_str(text: &str) -> Result<ExecutionState, ExecutionError> {
    serde_json::from_value(Value::String(text.to_string()))
        .map_err(|_| ExecutionError::Serialization(format!("unknown execution state '{text}'")))
}

fn event_type_from_str(text: &str) -> Result<ExecutionEventType, ExecutionError> {
    serde_json::from_value(Value::String(text.to_string()))
        .map_err(|_| ExecutionError::Serialization(format!("unknown event type '{text}'")))
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    execution_id: Uuid,
    workflow_id: String,
    workflow_name: String,
    input: Option<String>,
    state: String,
    worker_name: Option<String>,
    requests: Option<String>,
    resume_payload: Option<String>,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: String,
    source_id: String,
    #[sqlx(rename = "type")]
    event_type: String,
    name: String,
    value: Option<String>,
    time: DateTime<Utc>,
}

impl EventRow {
    fn into_event(self) -> Result<ExecutionEvent, ExecutionError> {
        Ok(ExecutionEvent {
            id: self.event_id,
            source_id: self.source_id,
            event_type: event_type_from_str(&self.event_type)?,
            name: self.name,
            value: payload::decode_opt(&self.value)?,
            time: self.time,
        })
    }
}

const EXECUTION_COLUMNS: &str = "execution_id, workflow_id, workflow_name, input, state, \
                                 worker_name, requests, resume_payload";

/// [`ContextStore`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresContextStore {
    db: Database,
}

impl PostgresContextStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn load_events(
        conn: &mut PgConnection,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionEvent>, ExecutionError> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT event_id, source_id, type, name, value, time
            FROM execution_events
            WHERE execution_id = $1
            ORDER BY id
            "#,
        )
        .bind(execution_id)
        .fetch_all(conn)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    async fn load_context(
        conn: &mut PgConnection,
        row: ExecutionRow,
    ) -> Result<ExecutionContext, ExecutionError> {
        let events = Self::load_events(conn, row.execution_id).await?;
        let requests: Option<ResourceRequest> = row
            .requests
            .as_deref()
            .map(payload::decode_typed)
            .transpose()?;

        Ok(ExecutionContext::from_parts(
            row.execution_id,
            row.workflow_id,
            row.workflow_name,
            payload::decode_opt(&row.input)?,
            events,
            state_from_str(&row.state)?,
            row.worker_name,
            requests,
            payload::decode_opt(&row.resume_payload)?,
        ))
    }

    async fn fetch_row(
        conn: &mut PgConnection,
        execution_id: Uuid,
        lock: bool,
    ) -> Result<Option<ExecutionRow>, ExecutionError> {
        let query = if lock {
            format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions WHERE execution_id = $1 FOR UPDATE"
            )
        } else {
            format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE execution_id = $1")
        };
        sqlx::query_as::<_, ExecutionRow>(&query)
            .bind(execution_id)
            .fetch_optional(conn)
            .await
            .map_err(db_err)
    }

    /// Insert the context's events that are not yet stored, preserving their
    /// in-memory order. The unique `(execution_id, event_id, type)` index
    /// backstops races between concurrent checkpoints.
    async fn merge_events(
        tx: &mut Transaction<'_, Postgres>,
        ctx: &ExecutionContext,
    ) -> Result<(), ExecutionError> {
        let stored = sqlx::query_as::<_, (String, String)>(
            "SELECT event_id, type FROM execution_events WHERE execution_id = $1",
        )
        .bind(ctx.execution_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)?;

        let known: Vec<(String, ExecutionEventType)> = stored
            .into_iter()
            .map(|(id, ty)| Ok((id, event_type_from_str(&ty)?)))
            .collect::<Result<_, ExecutionError>>()?;

        for event in ctx.events_not_in(&known) {
            sqlx::query(
                r#"
                INSERT INTO execution_events
                    (execution_id, event_id, source_id, type, name, value, time)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (execution_id, event_id, type) DO NOTHING
                "#,
            )
            .bind(ctx.execution_id)
            .bind(&event.id)
            .bind(&event.source_id)
            .bind(event.event_type.to_string())
            .bind(&event.name)
            .bind(payload::encode_opt(&event.value)?)
            .bind(event.time)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn update_row(
        tx: &mut Transaction<'_, Postgres>,
        ctx: &ExecutionContext,
    ) -> Result<(), ExecutionError> {
        sqlx::query(
            r#"
            UPDATE executions
            SET state = $2,
                output = $3,
                worker_name = $4,
                resume_payload = $5,
                updated_at = now()
            WHERE execution_id = $1
            "#,
        )
        .bind(ctx.execution_id)
        .bind(state_to_str(ctx.state))
        .bind(payload::encode_opt(&ctx.output().cloned())?)
        .bind(&ctx.current_worker)
        .bind(payload::encode_opt(&ctx.resume_payload)?)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Persist a transition applied to an already-locked context.
    async fn persist(
        tx: &mut Transaction<'_, Postgres>,
        ctx: &ExecutionContext,
    ) -> Result<(), ExecutionError> {
        Self::merge_events(tx, ctx).await?;
        Self::update_row(tx, ctx).await
    }
}

#[async_trait]
impl ContextStore for PostgresContextStore {
    async fn get(&self, execution_id: Uuid) -> Result<ExecutionContext, ExecutionError> {
        let mut conn = self.db.pool().acquire().await.map_err(db_err)?;
        let row = Self::fetch_row(&mut *conn, execution_id, false)
            .await?
            .ok_or_else(|| not_found(execution_id))?;
        Self::load_context(&mut *conn, row).await
    }

    async fn save(&self, ctx: &ExecutionContext) -> Result<ExecutionContext, ExecutionError> {
        let mut tx = self.db.pool().begin().await.map_err(db_err)?;

        let existing = Self::fetch_row(&mut *tx, ctx.execution_id, true).await?;
        if existing.is_none() {
            sqlx::query(
                r#"
                INSERT INTO executions
                    (execution_id, workflow_id, workflow_name, input, output, state,
                     worker_name, requests, resume_payload)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(ctx.execution_id)
            .bind(&ctx.workflow_id)
            .bind(&ctx.workflow_name)
            .bind(payload::encode_opt(&ctx.input)?)
            .bind(payload::encode_opt(&ctx.output().cloned())?)
            .bind(state_to_str(ctx.state))
            .bind(&ctx.current_worker)
            .bind(
                ctx.requests
                    .as_ref()
                    .map(payload::encode_typed)
                    .transpose()?,
            )
            .bind(payload::encode_opt(&ctx.resume_payload)?)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            Self::merge_events(&mut tx, ctx).await?;
        } else {
            Self::persist(&mut tx, ctx).await?;
        }

        tx.commit().await.map_err(db_err)?;
        self.get(ctx.execution_id).await
    }

    async fn next_execution(
        &self,
        worker: &WorkerInfo,
    ) -> Result<Option<ExecutionContext>, ExecutionError> {
        let mut tx = self.db.pool().begin().await.map_err(db_err)?;

        let candidates = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM executions
            WHERE state = 'CREATED'
               OR (state = 'SCHEDULED' AND worker_name = $1)
               OR (state = 'PAUSED' AND resume_payload IS NOT NULL)
            ORDER BY execution_id
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(&worker.name)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        for row in candidates {
            let matches = match row.requests.as_deref() {
                Some(encoded) => {
                    let requests: ResourceRequest = payload::decode_typed(encoded)?;
                    requests.matches_worker(&worker.resources, &worker.packages)
                }
                None => true,
            };
            if !matches {
                continue;
            }

            let mut ctx = Self::load_context(&mut *tx, row).await?;
            if ctx.state != ExecutionState::Scheduled {
                ctx.schedule(&worker.name)?;
                Self::persist(&mut tx, &ctx).await?;
            }
            tx.commit().await.map_err(db_err)?;
            return Ok(Some(ctx));
        }

        tx.rollback().await.map_err(db_err)?;
        Ok(None)
    }

    async fn claim(
        &self,
        execution_id: Uuid,
        worker: &WorkerInfo,
    ) -> Result<ExecutionContext, ExecutionError> {
        let mut tx = self.db.pool().begin().await.map_err(db_err)?;

        let row = Self::fetch_row(&mut *tx, execution_id, true)
            .await?
            .ok_or_else(|| not_found(execution_id))?;
        let mut ctx = Self::load_context(&mut *tx, row).await?;
        // Claims against the wrong state or worker all surface the same way;
        // the caller cannot distinguish a lost race from a missing row.
        ctx.claim(&worker.name).map_err(|_| not_found(execution_id))?;
        Self::persist(&mut tx, &ctx).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(ctx)
    }

    async fn next_cancellation(
        &self,
        worker: &WorkerInfo,
    ) -> Result<Option<ExecutionContext>, ExecutionError> {
        let mut conn = self.db.pool().acquire().await.map_err(db_err)?;
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM executions
            WHERE state = 'CANCELLING' AND worker_name = $1
            ORDER BY execution_id
            LIMIT 1
            "#
        ))
        .bind(&worker.name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(Self::load_context(&mut *conn, row).await?)),
            None => Ok(None),
        }
    }

    async fn begin_cancel(&self, execution_id: Uuid) -> Result<ExecutionContext, ExecutionError> {
        let mut tx = self.db.pool().begin().await.map_err(db_err)?;

        let row = Self::fetch_row(&mut *tx, execution_id, true)
            .await?
            .ok_or_else(|| not_found(execution_id))?;
        let mut ctx = Self::load_context(&mut *tx, row).await?;
        ctx.begin_cancel("control-plane")?;
        Self::persist(&mut tx, &ctx).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(ctx)
    }

    async fn request_resume(
        &self,
        execution_id: Uuid,
        resume_payload: Option<Value>,
    ) -> Result<ExecutionContext, ExecutionError> {
        let mut tx = self.db.pool().begin().await.map_err(db_err)?;

        let row = Self::fetch_row(&mut *tx, execution_id, true)
            .await?
            .ok_or_else(|| not_found(execution_id))?;
        let mut ctx = Self::load_context(&mut *tx, row).await?;
        if !ctx.is_paused() {
            return Err(ExecutionError::InvalidTransition {
                from: ctx.state.to_string(),
                event: "resume".to_string(),
            });
        }
        // A stored payload is the dispatch eligibility marker, so a resume
        // without one still records an explicit null.
        ctx.resume_payload = Some(resume_payload.unwrap_or(Value::Null));
        Self::update_row(&mut tx, &ctx).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(ctx)
    }
}
