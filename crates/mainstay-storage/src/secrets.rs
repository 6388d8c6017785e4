//! PostgreSQL secret store, encrypted at rest

use std::collections::HashMap;

use async_trait::async_trait;
use mainstay_core::secrets::SecretStore;
use mainstay_core::ExecutionError;

use crate::database::{db_err, Database};
use crate::encryption::{EncryptionError, EncryptionService};

impl From<EncryptionError> for ExecutionError {
    fn from(err: EncryptionError) -> Self {
        ExecutionError::Serialization(err.to_string())
    }
}

/// [`SecretStore`] backed by PostgreSQL; values are sealed with
/// [`EncryptionService`] before they reach the database and only decrypted
/// when a task's `secret_requests` name them.
#[derive(Clone)]
pub struct PostgresSecretStore {
    db: Database,
    encryption: EncryptionService,
}

impl PostgresSecretStore {
    pub fn new(db: Database, encryption: EncryptionService) -> Self {
        Self { db, encryption }
    }
}

#[async_trait]
impl SecretStore for PostgresSecretStore {
    async fn get(&self, names: &[String]) -> Result<HashMap<String, String>, ExecutionError> {
        let mut resolved = HashMap::with_capacity(names.len());
        for name in names {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT value FROM secrets WHERE name = $1")
                    .bind(name)
                    .fetch_optional(self.db.pool())
                    .await
                    .map_err(db_err)?;
            let (sealed,) = row.ok_or_else(|| ExecutionError::SecretMissing {
                name: name.clone(),
            })?;
            resolved.insert(name.clone(), self.encryption.decrypt_to_string(&sealed)?);
        }
        Ok(resolved)
    }

    async fn set(&self, name: &str, value: &str) -> Result<(), ExecutionError> {
        let sealed = self.encryption.encrypt_string(value)?;
        sqlx::query(
            r#"
            INSERT INTO secrets (name, value)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(name)
        .bind(sealed)
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), ExecutionError> {
        sqlx::query("DELETE FROM secrets WHERE name = $1")
            .bind(name)
            .execute(self.db.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, ExecutionError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM secrets ORDER BY name")
            .fetch_all(self.db.pool())
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}
