//! `taskmind detect`: run one email through task detection.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use taskmind_core::message::UserId;
use taskmind_tasks::{IncomingMessage, TaskOutcome, TaskPipeline};
use tokio::io::AsyncReadExt;

use super::runtime;

pub async fn run(
    file: Option<PathBuf>,
    id: String,
    user: String,
    received_at: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let received_at = match received_at {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map_err(|e| format!("Invalid --received-at '{raw}': {e}"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let raw_text = match file {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("Failed to read {}: {e}", path.display()))?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };

    let config = runtime::load_config()?;
    runtime::require_api_key(&config)?;
    let model = taskmind_providers::build_model(&config)?;
    let store = runtime::open_task_store(&config).await?;
    let pipeline = TaskPipeline::new(model, store, &config);

    let outcome = pipeline
        .process(IncomingMessage {
            source_message_id: id,
            owner: UserId(user),
            raw_text,
            received_at,
        })
        .await;

    match &outcome {
        TaskOutcome::Created {
            task,
            deduplicated: false,
        } => eprintln!("🎫 Created #{}: {}", task.ticket_id, task.title),
        TaskOutcome::Created {
            task,
            deduplicated: true,
        } => eprintln!("♻️  Already tracked as #{}", task.ticket_id),
        TaskOutcome::Discarded { reason, detail } => {
            eprintln!("🚫 Discarded ({reason}): {detail}")
        }
    }
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
