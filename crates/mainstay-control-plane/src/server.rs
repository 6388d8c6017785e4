//! Server assembly
//!
//! Wires configuration to stores, spawns the schedule evaluator and serves
//! the HTTP surface. Used by the control-plane binary and the CLI.

use std::sync::Arc;

use anyhow::{Context, Result};
use mainstay_core::config::Config;
use mainstay_core::secrets::InMemorySecretStore;
use mainstay_storage::{
    Database, EncryptionService, PostgresContextStore, PostgresScheduleStore, PostgresSecretStore,
    PostgresWorkerRegistry, PostgresWorkflowCatalog,
};
use tokio::sync::watch;

use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::state::AppState;

/// Build the application state against PostgreSQL.
pub async fn postgres_state(config: Config) -> Result<AppState> {
    let db = Database::connect(&config.database)
        .await
        .context("database connection failed")?;
    tracing::info!("database connection established");

    let secrets: Arc<dyn mainstay_core::secrets::SecretStore> =
        match &config.security.encryption_key {
            Some(key) => Arc::new(PostgresSecretStore::new(
                db.clone(),
                EncryptionService::new(key.clone()),
            )),
            None => {
                tracing::warn!("no encryption key configured; secrets are held in memory only");
                Arc::new(InMemorySecretStore::new())
            }
        };

    Ok(AppState::new(
        Arc::new(PostgresContextStore::new(db.clone())),
        Arc::new(PostgresWorkflowCatalog::new(db.clone())),
        Arc::new(PostgresWorkerRegistry::new(db.clone())),
        Arc::new(PostgresScheduleStore::new(db)),
        secrets,
        config,
    ))
}

/// Serve the control plane until ctrl-c.
pub async fn serve(state: AppState) -> Result<()> {
    let config = state.config.clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(
        state.contexts.clone(),
        state.catalog.clone(),
        state.schedules.clone(),
        SchedulerConfig::default(),
        shutdown_rx,
    );
    let scheduler_handle = tokio::spawn(scheduler.run());

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "control plane listening");

    axum::serve(listener, crate::api::router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    shutdown_tx.send(true).ok();
    scheduler_handle.await.ok();
    tracing::info!("control plane stopped");
    Ok(())
}
