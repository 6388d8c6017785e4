//! PostgreSQL schedule store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mainstay_core::schedule::{Schedule, ScheduleSpec, ScheduleStatus};
use mainstay_core::store::ScheduleStore;
use mainstay_core::ExecutionError;
use serde_json::Value;
use uuid::Uuid;

use crate::database::{db_err, Database};
use crate::payload;

fn schedule_not_found(id: Uuid) -> ExecutionError {
    ExecutionError::ScheduleNotFound { id: id.to_string() }
}

fn spec_type(spec: &ScheduleSpec) -> &'static str {
    match spec {
        ScheduleSpec::Cron { .. } => "cron",
        ScheduleSpec::Interval { .. } => "interval",
        ScheduleSpec::Once { .. } => "once",
    }
}

fn status_to_str(status: ScheduleStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "ACTIVE".to_string())
}

fn status_from_str(text: &str) -> Result<ScheduleStatus, ExecutionError> {
    serde_json::from_value(Value::String(text.to_string()))
        .map_err(|_| ExecutionError::Serialization(format!("unknown schedule status '{text}'")))
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: Uuid,
    workflow_name: String,
    body: String,
    input: Option<String>,
    status: String,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    run_count: i64,
    failure_count: i64,
}

impl ScheduleRow {
    fn into_schedule(self) -> Result<Schedule, ExecutionError> {
        Ok(Schedule {
            id: self.id,
            workflow_name: self.workflow_name,
            input: payload::decode_opt(&self.input)?,
            status: status_from_str(&self.status)?,
            spec: payload::decode_typed(&self.body)?,
            next_run_at: self.next_run_at,
            last_run_at: self.last_run_at,
            run_count: self.run_count as u64,
            failure_count: self.failure_count as u64,
        })
    }
}

const SCHEDULE_COLUMNS: &str = "id, workflow_name, body, input, status, next_run_at, \
                                last_run_at, run_count, failure_count";

/// [`ScheduleStore`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresScheduleStore {
    db: Database,
}

impl PostgresScheduleStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn write(&self, schedule: &Schedule, insert: bool) -> Result<(), ExecutionError> {
        let query = if insert {
            r#"
            INSERT INTO schedules
                (id, workflow_name, schedule_type, body, input, status,
                 next_run_at, last_run_at, run_count, failure_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#
        } else {
            r#"
            UPDATE schedules
            SET workflow_name = $2, schedule_type = $3, body = $4, input = $5,
                status = $6, next_run_at = $7, last_run_at = $8,
                run_count = $9, failure_count = $10
            WHERE id = $1
            "#
        };

        let result = sqlx::query(query)
            .bind(schedule.id)
            .bind(&schedule.workflow_name)
            .bind(spec_type(&schedule.spec))
            .bind(payload::encode_typed(&schedule.spec)?)
            .bind(payload::encode_opt(&schedule.input)?)
            .bind(status_to_str(schedule.status))
            .bind(schedule.next_run_at)
            .bind(schedule.last_run_at)
            .bind(schedule.run_count as i64)
            .bind(schedule.failure_count as i64)
            .execute(self.db.pool())
            .await
            .map_err(db_err)?;

        if !insert && result.rows_affected() == 0 {
            return Err(schedule_not_found(schedule.id));
        }
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for PostgresScheduleStore {
    async fn create(&self, schedule: Schedule) -> Result<Schedule, ExecutionError> {
        schedule.spec.validate()?;
        self.write(&schedule, true).await?;
        Ok(schedule)
    }

    async fn get(&self, id: Uuid) -> Result<Schedule, ExecutionError> {
        sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(db_err)?
        .ok_or_else(|| schedule_not_found(id))?
        .into_schedule()
    }

    async fn update(&self, schedule: Schedule) -> Result<Schedule, ExecutionError> {
        schedule.spec.validate()?;
        self.write(&schedule, false).await?;
        Ok(schedule)
    }

    async fn delete(&self, id: Uuid) -> Result<(), ExecutionError> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(schedule_not_found(id));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Schedule>, ExecutionError> {
        let rows = sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY id"
        ))
        .fetch_all(self.db.pool())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(ScheduleRow::into_schedule).collect()
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, ExecutionError> {
        let rows = sqlx::query_as::<_, ScheduleRow>(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS} FROM schedules
            WHERE status = 'ACTIVE' AND next_run_at IS NOT NULL AND next_run_at <= $1
            ORDER BY next_run_at
            "#
        ))
        .bind(now)
        .fetch_all(self.db.pool())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(ScheduleRow::into_schedule).collect()
    }

    async fn mark_run(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        succeeded: bool,
    ) -> Result<Schedule, ExecutionError> {
        let mut schedule = self.get(id).await?;
        schedule.record_run(at, succeeded)?;
        self.write(&schedule, false).await?;
        Ok(schedule)
    }
}
