//! Secret resolution
//!
//! Tasks declare `secret_requests`; the runtime resolves them immediately
//! before invoking user code, and the decrypted values never appear in the
//! event log. The durable, encrypted-at-rest implementation lives in the
//! storage crate; the in-memory one here backs tests and embedded runs.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::errors::ExecutionError;

/// Named secret storage.
#[async_trait]
pub trait SecretStore: Send + Sync + 'static {
    /// Resolve all requested names. Any missing name fails the whole request
    /// with `SecretMissing`.
    async fn get(&self, names: &[String]) -> Result<HashMap<String, String>, ExecutionError>;

    async fn set(&self, name: &str, value: &str) -> Result<(), ExecutionError>;

    async fn remove(&self, name: &str) -> Result<(), ExecutionError>;

    async fn list(&self) -> Result<Vec<String>, ExecutionError>;
}

/// In-memory secret store.
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<String, String>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.write().insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, names: &[String]) -> Result<HashMap<String, String>, ExecutionError> {
        let secrets = self.secrets.read();
        let mut resolved = HashMap::with_capacity(names.len());
        for name in names {
            match secrets.get(name) {
                Some(value) => {
                    resolved.insert(name.clone(), value.clone());
                }
                None => {
                    return Err(ExecutionError::SecretMissing { name: name.clone() });
                }
            }
        }
        Ok(resolved)
    }

    async fn set(&self, name: &str, value: &str) -> Result<(), ExecutionError> {
        self.secrets
            .write()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), ExecutionError> {
        self.secrets.write().remove(name);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, ExecutionError> {
        let mut names: Vec<String> = self.secrets.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
