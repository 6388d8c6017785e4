mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use client::ApiClient;
use commands::{schedule::ScheduleCommand, start::StartCommand, workflow::WorkflowCommand};

/// Durable workflow orchestration.
#[derive(Parser)]
#[command(name = "mainstay", version, about)]
struct Cli {
    /// Control plane URL
    #[arg(long, global = true, env = "MAINSTAY_WORKERS__SERVER_URL",
          default_value = "http://localhost:8000")]
    server_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the servers
    #[command(subcommand)]
    Start(StartCommand),

    /// Manage and run workflows
    #[command(subcommand)]
    Workflow(WorkflowCommand),

    /// Manage schedules
    #[command(subcommand)]
    Schedule(ScheduleCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match cli.command {
        Command::Start(command) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| "mainstay=info".into()),
                )
                .init();
            commands::start::run(command).await
        }
        Command::Workflow(command) => {
            commands::workflow::run(ApiClient::new(cli.server_url), command).await
        }
        Command::Schedule(command) => {
            commands::schedule::run(ApiClient::new(cli.server_url), command).await
        }
    }
}
