//! PostgreSQL worker registry

use async_trait::async_trait;
use mainstay_core::resources::{GpuInfo, InstalledPackage, WorkerResources, WorkerRuntime};
use mainstay_core::store::WorkerRegistry;
use mainstay_core::worker::{generate_session_token, WorkerInfo, WorkerRegistration};
use mainstay_core::ExecutionError;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::database::{db_err, Database};

fn worker_not_found(name: &str) -> ExecutionError {
    ExecutionError::WorkerNotFound {
        name: name.to_string(),
    }
}

#[derive(sqlx::FromRow)]
struct WorkerRow {
    name: String,
    session_token: String,
    os_name: String,
    os_version: String,
    runtime_version: String,
}

#[derive(sqlx::FromRow)]
struct ResourcesRow {
    cpu_total: f64,
    cpu_available: f64,
    memory_total: i64,
    memory_available: i64,
    disk_total: i64,
    disk_free: i64,
}

/// [`WorkerRegistry`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresWorkerRegistry {
    db: Database,
}

impl PostgresWorkerRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn load_worker(
        conn: &mut PgConnection,
        row: WorkerRow,
    ) -> Result<WorkerInfo, ExecutionError> {
        let resources = sqlx::query_as::<_, ResourcesRow>(
            r#"
            SELECT cpu_total, cpu_available, memory_total, memory_available,
                   disk_total, disk_free
            FROM worker_resources
            WHERE worker_name = $1
            "#,
        )
        .bind(&row.name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;

        let gpus: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT name, memory_total, memory_available
            FROM worker_gpus
            WHERE worker_name = $1
            ORDER BY name
            "#,
        )
        .bind(&row.name)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

        let packages: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT name, version
            FROM worker_packages
            WHERE worker_name = $1
            ORDER BY name
            "#,
        )
        .bind(&row.name)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

        let resources = resources
            .map(|r| WorkerResources {
                cpu_total: r.cpu_total,
                cpu_available: r.cpu_available,
                memory_total: r.memory_total as u64,
                memory_available: r.memory_available as u64,
                disk_total: r.disk_total as u64,
                disk_free: r.disk_free as u64,
                gpus: gpus
                    .into_iter()
                    .map(|(name, total, available)| GpuInfo {
                        name,
                        memory_total: total as u64,
                        memory_available: available as u64,
                    })
                    .collect(),
            })
            .unwrap_or_default();

        Ok(WorkerInfo {
            name: row.name,
            session_token: row.session_token,
            runtime: WorkerRuntime {
                os_name: row.os_name,
                os_version: row.os_version,
                runtime_version: row.runtime_version,
            },
            resources,
            packages: packages
                .into_iter()
                .map(|(name, version)| InstalledPackage { name, version })
                .collect(),
        })
    }
}

#[async_trait]
impl WorkerRegistry for PostgresWorkerRegistry {
    async fn register(
        &self,
        registration: WorkerRegistration,
    ) -> Result<WorkerInfo, ExecutionError> {
        let session_token = generate_session_token();
        let mut tx = self.db.pool().begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO workers (name, session_token, os_name, os_version, runtime_version)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO UPDATE
            SET session_token = EXCLUDED.session_token,
                os_name = EXCLUDED.os_name,
                os_version = EXCLUDED.os_version,
                runtime_version = EXCLUDED.runtime_version,
                registered_at = now()
            "#,
        )
        .bind(&registration.name)
        .bind(&session_token)
        .bind(&registration.runtime.os_name)
        .bind(&registration.runtime.os_version)
        .bind(&registration.runtime.runtime_version)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let resources = &registration.resources;
        sqlx::query(
            r#"
            INSERT INTO worker_resources
                (worker_name, cpu_total, cpu_available, memory_total, memory_available,
                 disk_total, disk_free)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (worker_name) DO UPDATE
            SET cpu_total = EXCLUDED.cpu_total,
                cpu_available = EXCLUDED.cpu_available,
                memory_total = EXCLUDED.memory_total,
                memory_available = EXCLUDED.memory_available,
                disk_total = EXCLUDED.disk_total,
                disk_free = EXCLUDED.disk_free
            "#,
        )
        .bind(&registration.name)
        .bind(resources.cpu_total)
        .bind(resources.cpu_available)
        .bind(resources.memory_total as i64)
        .bind(resources.memory_available as i64)
        .bind(resources.disk_total as i64)
        .bind(resources.disk_free as i64)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("DELETE FROM worker_gpus WHERE worker_name = $1")
            .bind(&registration.name)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for gpu in &resources.gpus {
            sqlx::query(
                r#"
                INSERT INTO worker_gpus (id, worker_name, name, memory_total, memory_available)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(&registration.name)
            .bind(&gpu.name)
            .bind(gpu.memory_total as i64)
            .bind(gpu.memory_available as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        sqlx::query("DELETE FROM worker_packages WHERE worker_name = $1")
            .bind(&registration.name)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for package in &registration.packages {
            sqlx::query(
                r#"
                INSERT INTO worker_packages (worker_name, name, version)
                VALUES ($1, $2, $3)
                ON CONFLICT (worker_name, name) DO UPDATE SET version = EXCLUDED.version
                "#,
            )
            .bind(&registration.name)
            .bind(&package.name)
            .bind(&package.version)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        self.get(&registration.name).await
    }

    async fn get(&self, name: &str) -> Result<WorkerInfo, ExecutionError> {
        let mut conn = self.db.pool().acquire().await.map_err(db_err)?;
        let row = sqlx::query_as::<_, WorkerRow>(
            r#"
            SELECT name, session_token, os_name, os_version, runtime_version
            FROM workers
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .ok_or_else(|| worker_not_found(name))?;

        Self::load_worker(&mut conn, row).await
    }

    async fn authenticate(&self, name: &str, token: &str) -> Result<WorkerInfo, ExecutionError> {
        let worker = self.get(name).await?;
        if worker.session_token != token {
            return Err(worker_not_found(name));
        }
        Ok(worker)
    }

    async fn list(&self) -> Result<Vec<WorkerInfo>, ExecutionError> {
        let mut conn = self.db.pool().acquire().await.map_err(db_err)?;
        let rows = sqlx::query_as::<_, WorkerRow>(
            r#"
            SELECT name, session_token, os_name, os_version, runtime_version
            FROM workers
            ORDER BY name
            "#,
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

        let mut workers = Vec::with_capacity(rows.len());
        for row in rows {
            workers.push(Self::load_worker(&mut conn, row).await?);
        }
        Ok(workers)
    }
}
