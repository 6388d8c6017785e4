//! `mainstay schedule` - schedule management commands

use anyhow::Result;
use clap::Subcommand;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output;

#[derive(Subcommand)]
pub enum ScheduleCommand {
    /// List schedules
    List {
        /// Output raw JSON instead of the simple listing
        #[arg(long, short = 'f')]
        json: bool,
    },
    /// Pause a schedule
    Pause { id: Uuid },
    /// Resume a paused schedule
    Resume { id: Uuid },
    /// Delete a schedule
    Delete { id: Uuid },
}

pub async fn run(client: ApiClient, command: ScheduleCommand) -> Result<()> {
    match command {
        ScheduleCommand::List { json } => {
            let listing = client.list_schedules().await?;
            if json {
                output::print_json(&listing, false);
            } else {
                output::print_schedule_list(&listing);
            }
        }
        ScheduleCommand::Pause { id } => {
            let schedule = client.schedule_action(id, "pause").await?;
            println!("Paused schedule {}.", schedule["id"].as_str().unwrap_or("?"));
        }
        ScheduleCommand::Resume { id } => {
            let schedule = client.schedule_action(id, "resume").await?;
            println!(
                "Resumed schedule {} (next run at {}).",
                schedule["id"].as_str().unwrap_or("?"),
                schedule["next_run_at"].as_str().unwrap_or("-"),
            );
        }
        ScheduleCommand::Delete { id } => {
            client.delete_schedule(id).await?;
            println!("Deleted schedule {id}.");
        }
    }
    Ok(())
}
