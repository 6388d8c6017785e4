//! `mainstay workflow` - catalog and execution commands

use anyhow::{Context, Result};
use clap::Subcommand;
use serde_json::Value;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// List registered workflows
    List {
        /// Output raw JSON instead of the simple listing
        #[arg(long, short = 'f')]
        json: bool,
    },
    /// Show a workflow record
    Show {
        name: String,
        /// Specific version to show
        #[arg(long, short = 'v')]
        version: Option<i32>,
    },
    /// Register a workflow bundle from a file
    Register {
        name: String,
        /// Path to the source bundle
        file: String,
        /// Resource requests as inline JSON
        #[arg(long)]
        requests: Option<String>,
    },
    /// Run a workflow
    Run {
        name: String,
        /// Input as inline JSON (strings need quoting)
        input: Option<String>,
        /// sync | async | stream
        #[arg(long, short = 'm', default_value = "sync")]
        mode: String,
        /// Resume an existing execution
        #[arg(long, short = 'e')]
        execution_id: Option<Uuid>,
        /// Resume payload as inline JSON
        #[arg(long)]
        resume_payload: Option<String>,
        /// Show the full context including events
        #[arg(long, short = 'i')]
        inspect: bool,
    },
    /// Show the status of an execution
    Status {
        name: String,
        execution_id: Uuid,
        /// Show the full context including events
        #[arg(long, short = 'i')]
        inspect: bool,
    },
    /// Cancel an execution
    Cancel {
        name: String,
        execution_id: Uuid,
        /// sync | async
        #[arg(long, short = 'm', default_value = "async")]
        mode: String,
    },
}

fn parse_value(input: Option<String>, what: &str) -> Result<Option<Value>> {
    input
        .map(|text| {
            serde_json::from_str(&text)
                .or_else(|_| Ok::<Value, serde_json::Error>(Value::String(text)))
                .with_context(|| format!("invalid {what}"))
        })
        .transpose()
}

pub async fn run(client: ApiClient, command: WorkflowCommand) -> Result<()> {
    match command {
        WorkflowCommand::List { json } => {
            let listing = client.list_workflows().await?;
            if json {
                output::print_json(&listing, false);
            } else {
                output::print_workflow_list(&listing);
            }
        }
        WorkflowCommand::Show { name, version } => {
            let record = client.show_workflow(&name, version).await?;
            output::print_json(&record, false);
        }
        WorkflowCommand::Register {
            name,
            file,
            requests,
        } => {
            let source =
                std::fs::read(&file).with_context(|| format!("cannot read bundle '{file}'"))?;
            let requests = parse_value(requests, "requests JSON")?;
            let record = client.save_workflow(&name, &source, requests).await?;
            println!(
                "Registered workflow '{}' version {}.",
                record["name"].as_str().unwrap_or(&name),
                record["version"]
            );
        }
        WorkflowCommand::Run {
            name,
            input,
            mode,
            execution_id,
            resume_payload,
            inspect,
        } => {
            let input = parse_value(input, "input JSON")?;
            let resume_payload = parse_value(resume_payload, "resume payload JSON")?;
            let ctx = client
                .run_workflow(&name, &mode, input, execution_id, resume_payload, inspect)
                .await?;
            output::print_json(&ctx, false);
        }
        WorkflowCommand::Status {
            name,
            execution_id,
            inspect,
        } => {
            let ctx = client.status(&name, execution_id, inspect).await?;
            output::print_json(&ctx, false);
        }
        WorkflowCommand::Cancel {
            name,
            execution_id,
            mode,
        } => {
            let ctx = client.cancel(&name, execution_id, &mode).await?;
            output::print_json(&ctx, false);
        }
    }
    Ok(())
}
