//! Output formatting

use serde_json::Value;

/// Print a JSON value, pretty by default.
pub fn print_json(value: &Value, compact: bool) {
    let rendered = if compact {
        value.to_string()
    } else {
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    };
    println!("{rendered}");
}

/// Render a workflow listing as plain lines.
pub fn print_workflow_list(listing: &Value) {
    match listing["workflows"].as_array() {
        Some(workflows) if !workflows.is_empty() => {
            for workflow in workflows {
                println!(
                    "- {} (version {})",
                    workflow["name"].as_str().unwrap_or("?"),
                    workflow["version"]
                );
            }
        }
        _ => println!("No workflows found."),
    }
}

/// Render a schedule listing as plain lines.
pub fn print_schedule_list(listing: &Value) {
    match listing["schedules"].as_array() {
        Some(schedules) if !schedules.is_empty() => {
            for schedule in schedules {
                println!(
                    "- {} [{}] workflow={} next_run_at={}",
                    schedule["id"].as_str().unwrap_or("?"),
                    schedule["status"].as_str().unwrap_or("?"),
                    schedule["workflow_name"].as_str().unwrap_or("?"),
                    schedule["next_run_at"].as_str().unwrap_or("-"),
                );
            }
        }
        _ => println!("No schedules found."),
    }
}
