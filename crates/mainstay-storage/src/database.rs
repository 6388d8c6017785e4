//! Connection pool and schema bootstrap

use std::time::Duration;

use mainstay_core::config::{DatabaseConfig, DatabaseType};
use mainstay_core::ExecutionError;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Map a sqlx failure onto the engine's infrastructure error.
pub(crate) fn db_err(err: sqlx::Error) -> ExecutionError {
    ExecutionError::Database {
        kind: "postgresql".to_string(),
        message: err.to_string(),
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflows (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    version INTEGER NOT NULL,
    imports TEXT,
    source TEXT NOT NULL,
    requests TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (name, version)
);

CREATE TABLE IF NOT EXISTS executions (
    execution_id UUID PRIMARY KEY,
    workflow_id TEXT NOT NULL,
    workflow_name TEXT NOT NULL,
    input TEXT,
    output TEXT,
    state TEXT NOT NULL,
    worker_name TEXT,
    requests TEXT,
    resume_payload TEXT,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_executions_state ON executions (state);

CREATE TABLE IF NOT EXISTS execution_events (
    id BIGSERIAL PRIMARY KEY,
    execution_id UUID NOT NULL REFERENCES executions (execution_id) ON DELETE CASCADE,
    event_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    type TEXT NOT NULL,
    name TEXT NOT NULL,
    value TEXT,
    time TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_execution_events_execution
    ON execution_events (execution_id, id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_execution_events_dedup
    ON execution_events (execution_id, event_id, type);

CREATE TABLE IF NOT EXISTS workers (
    name TEXT PRIMARY KEY,
    session_token TEXT NOT NULL,
    os_name TEXT NOT NULL,
    os_version TEXT NOT NULL,
    runtime_version TEXT NOT NULL,
    registered_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS worker_resources (
    worker_name TEXT PRIMARY KEY REFERENCES workers (name) ON DELETE CASCADE,
    cpu_total DOUBLE PRECISION NOT NULL,
    cpu_available DOUBLE PRECISION NOT NULL,
    memory_total BIGINT NOT NULL,
    memory_available BIGINT NOT NULL,
    disk_total BIGINT NOT NULL,
    disk_free BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS worker_gpus (
    id UUID PRIMARY KEY,
    worker_name TEXT NOT NULL REFERENCES workers (name) ON DELETE CASCADE,
    name TEXT NOT NULL,
    memory_total BIGINT NOT NULL,
    memory_available BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS worker_packages (
    worker_name TEXT NOT NULL REFERENCES workers (name) ON DELETE CASCADE,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    PRIMARY KEY (worker_name, name)
);

CREATE TABLE IF NOT EXISTS secrets (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schedules (
    id UUID PRIMARY KEY,
    workflow_name TEXT NOT NULL,
    schedule_type TEXT NOT NULL,
    body TEXT NOT NULL,
    input TEXT,
    status TEXT NOT NULL,
    next_run_at TIMESTAMPTZ,
    last_run_at TIMESTAMPTZ,
    run_count BIGINT NOT NULL DEFAULT 0,
    failure_count BIGINT NOT NULL DEFAULT 0
);
"#;

/// Shared handle to the PostgreSQL pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using the database configuration and bootstrap the schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, ExecutionError> {
        if config.database_type != DatabaseType::Postgresql {
            return Err(ExecutionError::Database {
                kind: "sqlite".to_string(),
                message: "the durable backend is PostgreSQL; use the in-memory stores for \
                          embedded runs"
                    .to_string(),
            });
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections())
            .acquire_timeout(config.pool_timeout)
            .idle_timeout(Some(config.pool_recycle))
            .connect(&config.url)
            .await
            .map_err(db_err)?;

        let db = Self::new(pool);
        db.migrate().await?;
        Ok(db)
    }

    /// Connect with defaults for ad-hoc use (tests, tooling).
    pub async fn from_url(url: &str) -> Result<Self, ExecutionError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .map_err(db_err)?;
        let db = Self::new(pool);
        db.migrate().await?;
        Ok(db)
    }

    /// Create tables and indexes when missing.
    pub async fn migrate(&self) -> Result<(), ExecutionError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        info!("database schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
