//! Shared application state

use std::sync::Arc;

use mainstay_core::config::Config;
use mainstay_core::memory::{
    InMemoryContextStore, InMemoryScheduleStore, InMemoryWorkerRegistry, InMemoryWorkflowCatalog,
};
use mainstay_core::secrets::{InMemorySecretStore, SecretStore};
use mainstay_core::store::{ContextStore, ScheduleStore, WorkerRegistry, WorkflowCatalog};

/// Store handles plus configuration, cloned into every router.
#[derive(Clone)]
pub struct AppState {
    pub contexts: Arc<dyn ContextStore>,
    pub catalog: Arc<dyn WorkflowCatalog>,
    pub workers: Arc<dyn WorkerRegistry>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        contexts: Arc<dyn ContextStore>,
        catalog: Arc<dyn WorkflowCatalog>,
        workers: Arc<dyn WorkerRegistry>,
        schedules: Arc<dyn ScheduleStore>,
        secrets: Arc<dyn SecretStore>,
        config: Config,
    ) -> Self {
        Self {
            contexts,
            catalog,
            workers,
            schedules,
            secrets,
            config: Arc::new(config),
        }
    }

    /// Fully in-memory state for tests and embedded runs.
    pub fn in_memory(config: Config) -> Self {
        Self::new(
            Arc::new(InMemoryContextStore::new()),
            Arc::new(InMemoryWorkflowCatalog::new()),
            Arc::new(InMemoryWorkerRegistry::new()),
            Arc::new(InMemoryScheduleStore::new()),
            Arc::new(InMemorySecretStore::new()),
            config,
        )
    }
}
