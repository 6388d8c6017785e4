//! Task-level memoization
//!
//! Keyed by the call identity (task name + normalized args digest), storing
//! the last successful output. Per-execution by default; `Global` shares a
//! process-wide map across executions.

use std::collections::HashMap;
use std::sync::OnceLock;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scope of task result caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// No caching.
    #[default]
    Off,
    /// Cache within the current execution only.
    Execution,
    /// Cache across executions in this process.
    Global,
}

fn global_cache() -> &'static DashMap<String, Value> {
    static CACHE: OnceLock<DashMap<String, Value>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

/// Per-execution cache handle with access to the shared global map.
#[derive(Default)]
pub struct TaskCache {
    local: Mutex<HashMap<String, Value>>,
}

impl TaskCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, mode: CacheMode, key: &str) -> Option<Value> {
        match mode {
            CacheMode::Off => None,
            CacheMode::Execution => self.local.lock().get(key).cloned(),
            CacheMode::Global => global_cache().get(key).map(|v| v.clone()),
        }
    }

    pub fn put(&self, mode: CacheMode, key: &str, value: &Value) {
        match mode {
            CacheMode::Off => {}
            CacheMode::Execution => {
                self.local.lock().insert(key.to_string(), value.clone());
            }
            CacheMode::Global => {
                global_cache().insert(key.to_string(), value.clone());
            }
        }
    }
}
