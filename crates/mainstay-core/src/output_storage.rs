//! Large-output offloading
//!
//! Keeps context rows small: when a task configured with an output store
//! produces a value above the inline threshold, the value is stored
//! externally and the event records a reference instead. Concrete backends
//! are external collaborators; the trait plus an in-memory implementation
//! live here.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::errors::ExecutionError;

/// Values serialized above this many bytes are offloaded (when the task has
/// an output store configured).
pub const DEFAULT_INLINE_THRESHOLD: usize = 64 * 1024;

/// External storage for large task outputs.
#[async_trait]
pub trait OutputStorage: Send + Sync + 'static {
    /// Store a value and return the reference recorded in its place.
    async fn store(&self, key: &str, value: &Value) -> Result<Value, ExecutionError>;

    /// Resolve a previously stored reference back to the value.
    async fn retrieve(&self, reference: &Value) -> Result<Value, ExecutionError>;
}

/// Whether a value is an output reference produced by [`make_reference`].
pub fn is_reference(value: &Value) -> bool {
    value.get("$output_ref").is_some()
}

pub fn make_reference(backend: &str, key: &str) -> Value {
    json!({ "$output_ref": { "backend": backend, "key": key } })
}

pub fn reference_key(reference: &Value) -> Option<&str> {
    reference
        .get("$output_ref")
        .and_then(|r| r.get("key"))
        .and_then(|k| k.as_str())
}

/// In-memory output storage for tests and embedded runs.
#[derive(Default)]
pub struct InMemoryOutputStorage {
    values: RwLock<HashMap<String, Value>>,
}

impl InMemoryOutputStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

#[async_trait]
impl OutputStorage for InMemoryOutputStorage {
    async fn store(&self, key: &str, value: &Value) -> Result<Value, ExecutionError> {
        self.values.write().insert(key.to_string(), value.clone());
        Ok(make_reference("memory", key))
    }

    async fn retrieve(&self, reference: &Value) -> Result<Value, ExecutionError> {
        let key = reference_key(reference).ok_or_else(|| {
            ExecutionError::Serialization("value is not an output reference".to_string())
        })?;
        self.values
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| ExecutionError::Serialization(format!("output '{key}' not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let storage = InMemoryOutputStorage::new();
        let value = json!({"rows": vec![1; 100]});

        let reference = storage.store("task_abc", &value).await.unwrap();
        assert!(is_reference(&reference));
        assert_eq!(reference_key(&reference), Some("task_abc"));

        let restored = storage.retrieve(&reference).await.unwrap();
        assert_eq!(restored, value);
    }

    #[tokio::test]
    async fn test_retrieve_rejects_plain_values() {
        let storage = InMemoryOutputStorage::new();
        let err = storage.retrieve(&json!("not a ref")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Serialization(_)));
    }
}
