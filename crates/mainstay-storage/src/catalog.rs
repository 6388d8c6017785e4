//! PostgreSQL workflow catalog

use async_trait::async_trait;
use mainstay_core::resources::ResourceRequest;
use mainstay_core::store::{WorkflowCatalog, WorkflowRecord, WorkflowSummary};
use mainstay_core::ExecutionError;
use serde_json::Value;
use uuid::Uuid;

use crate::database::{db_err, Database};
use crate::payload;

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: Uuid,
    name: String,
    version: i32,
    imports: Option<String>,
    source: String,
    requests: Option<String>,
}

impl WorkflowRow {
    fn into_record(self) -> Result<WorkflowRecord, ExecutionError> {
        let requests: Option<ResourceRequest> = self
            .requests
            .as_deref()
            .map(payload::decode_typed)
            .transpose()?;
        Ok(WorkflowRecord {
            id: self.id,
            name: self.name,
            version: self.version,
            source: payload::decode_bytes(&self.source)?,
            imports: payload::decode_opt(&self.imports)?,
            requests,
        })
    }
}

/// [`WorkflowCatalog`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresWorkflowCatalog {
    db: Database,
}

impl PostgresWorkflowCatalog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl WorkflowCatalog for PostgresWorkflowCatalog {
    async fn save(
        &self,
        name: &str,
        source: Vec<u8>,
        imports: Option<Value>,
        requests: Option<ResourceRequest>,
    ) -> Result<WorkflowRecord, ExecutionError> {
        let mut tx = self.db.pool().begin().await.map_err(db_err)?;

        // The unique(name, version) constraint backstops concurrent saves of
        // the same workflow name.
        let (latest,): (Option<i32>,) =
            sqlx::query_as("SELECT MAX(version) FROM workflows WHERE name = $1")
                .bind(name)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
        let version = latest.unwrap_or(0) + 1;

        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            INSERT INTO workflows (id, name, version, imports, source, requests)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, name, version, imports, source, requests
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(name)
        .bind(version)
        .bind(payload::encode_opt(&imports)?)
        .bind(payload::encode_bytes(&source))
        .bind(requests.as_ref().map(payload::encode_typed).transpose()?)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        row.into_record()
    }

    async fn get(
        &self,
        name: &str,
        version: Option<i32>,
    ) -> Result<WorkflowRecord, ExecutionError> {
        let row = match version {
            Some(version) => sqlx::query_as::<_, WorkflowRow>(
                r#"
                SELECT id, name, version, imports, source, requests
                FROM workflows
                WHERE name = $1 AND version = $2
                "#,
            )
            .bind(name)
            .bind(version)
            .fetch_optional(self.db.pool())
            .await
            .map_err(db_err)?,
            None => sqlx::query_as::<_, WorkflowRow>(
                r#"
                SELECT id, name, version, imports, source, requests
                FROM workflows
                WHERE name = $1
                ORDER BY version DESC
                LIMIT 1
                "#,
            )
            .bind(name)
            .fetch_optional(self.db.pool())
            .await
            .map_err(db_err)?,
        };

        row.ok_or_else(|| ExecutionError::WorkflowNotFound {
            name: name.to_string(),
        })?
        .into_record()
    }

    async fn list(&self) -> Result<Vec<WorkflowSummary>, ExecutionError> {
        let rows: Vec<(String, i32)> = sqlx::query_as(
            r#"
            SELECT name, MAX(version)
            FROM workflows
            GROUP BY name
            ORDER BY name
            "#,
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|(name, version)| WorkflowSummary { name, version })
            .collect())
    }

    async fn delete(&self, name: &str, version: Option<i32>) -> Result<(), ExecutionError> {
        let result = match version {
            Some(version) => sqlx::query("DELETE FROM workflows WHERE name = $1 AND version = $2")
                .bind(name)
                .bind(version)
                .execute(self.db.pool())
                .await
                .map_err(db_err)?,
            None => sqlx::query("DELETE FROM workflows WHERE name = $1")
                .bind(name)
                .execute(self.db.pool())
                .await
                .map_err(db_err)?,
        };

        if result.rows_affected() == 0 {
            return Err(ExecutionError::WorkflowNotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }
}
