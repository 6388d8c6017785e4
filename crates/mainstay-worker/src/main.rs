use std::sync::Arc;

use anyhow::{Context, Result};
use mainstay_core::config::Config;
use mainstay_core::WorkflowRegistry;
use mainstay_worker::Worker;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn generated_name() -> String {
    use rand::Rng;
    let suffix: u32 = rand::thread_rng().gen_range(0x100000..0xffffff);
    format!("worker-{suffix:x}")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("mainstay={}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let name = std::env::var("MAINSTAY_WORKER_NAME").unwrap_or_else(|_| generated_name());
    tracing::info!(worker = %name, server = %config.workers.server_url, "mainstay-worker starting...");

    // Deployments register their compiled workflows here (or embed the
    // worker as a library and pass a populated registry).
    let registry = Arc::new(WorkflowRegistry::new());
    if registry.names().is_empty() {
        tracing::warn!("no workflows registered; this worker can only finalize cancellations");
    }

    let worker = Worker::new(
        config.workers.server_url.clone(),
        name,
        config.workers.bootstrap_token.clone(),
        registry,
    );

    tokio::select! {
        result = worker.run() => {
            result.context("worker loop failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            worker.shutdown();
        }
    }

    tracing::info!("worker stopped");
    Ok(())
}
