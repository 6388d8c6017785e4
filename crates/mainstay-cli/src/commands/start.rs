//! `mainstay start` - run the servers

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use mainstay_core::config::Config;
use mainstay_core::WorkflowRegistry;
use mainstay_worker::Worker;

#[derive(Subcommand)]
pub enum StartCommand {
    /// Start the control-plane server
    ControlPlane {
        /// Host to bind to (overrides configuration)
        #[arg(long, short = 'H')]
        host: Option<String>,
        /// Port to bind to (overrides configuration)
        #[arg(long, short = 'p')]
        port: Option<u16>,
    },
    /// Start a worker
    Worker {
        /// Worker name; generated when omitted
        name: Option<String>,
        /// Control plane URL to connect to (overrides configuration)
        #[arg(long)]
        server_url: Option<String>,
    },
}

pub async fn run(command: StartCommand) -> Result<()> {
    let mut config = Config::from_env().context("failed to load configuration")?;

    match command {
        StartCommand::ControlPlane { host, port } => {
            if let Some(host) = host {
                config.server_host = host;
            }
            if let Some(port) = port {
                config.server_port = port;
            }
            println!(
                "Starting control-plane server at {}:{}",
                config.server_host, config.server_port
            );
            let state = mainstay_control_plane::server::postgres_state(config).await?;
            mainstay_control_plane::server::serve(state).await
        }
        StartCommand::Worker { name, server_url } => {
            if let Some(url) = server_url {
                config.workers.server_url = url;
            }
            let name = name.unwrap_or_else(|| {
                format!("worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..6])
            });
            println!("Starting worker '{name}' against {}", config.workers.server_url);

            let registry = Arc::new(WorkflowRegistry::new());
            let worker = Worker::new(
                config.workers.server_url.clone(),
                name,
                config.workers.bootstrap_token.clone(),
                registry,
            );

            tokio::select! {
                result = worker.run() => result.map_err(Into::into),
                _ = tokio::signal::ctrl_c() => {
                    worker.shutdown();
                    println!("Worker shutting down...");
                    Ok(())
                }
            }
        }
    }
}
