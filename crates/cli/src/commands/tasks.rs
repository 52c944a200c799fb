//! `taskmind tasks`: inspect and close detected tasks.

use taskmind_core::message::UserId;
use taskmind_core::task::{Task, TaskStatus, TaskStore};

use super::runtime;

pub async fn list(user: &str, status: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let status = match status {
        Some(s) => Some(TaskStatus::parse(s).ok_or_else(|| {
            format!("Unknown status '{s}'. Use: open, in_progress, done, cancelled")
        })?),
        None => None,
    };

    let config = runtime::load_config()?;
    let store = runtime::open_task_store(&config).await?;
    let tasks = store.list_tasks(&UserId::from(user), status).await?;

    if tasks.is_empty() {
        println!("📭 No tasks for \"{user}\"");
        return Ok(());
    }

    println!("📋 Tasks for \"{user}\" ({})", tasks.len());
    println!();
    for task in &tasks {
        print_row(task);
    }
    Ok(())
}

pub async fn next(user: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = runtime::load_config()?;
    let store = runtime::open_task_store(&config).await?;

    match store.next_task(&UserId::from(user)).await? {
        Some(task) => {
            println!("👉 Next up");
            println!();
            print_detail(&task);
        }
        None => println!("🎉 Nothing open for \"{user}\""),
    }
    Ok(())
}

pub async fn done(ticket: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = runtime::load_config()?;
    let store = runtime::open_task_store(&config).await?;

    let task = store.update_status(ticket, TaskStatus::Done).await?;
    println!("✅ #{} marked done: {}", task.ticket_id, task.title);
    Ok(())
}

fn print_row(task: &Task) {
    let due = task
        .due_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "-".into());
    println!(
        "  #{}  [{:<6}] {:<11} due {:<10}  {}",
        task.ticket_id, task.priority, task.status, due, task.title
    );
}

fn print_detail(task: &Task) {
    println!("  Ticket:    #{}", task.ticket_id);
    println!("  Title:     {}", task.title);
    println!("  Priority:  {}", task.priority);
    if let Some(due) = task.due_date {
        println!("  Due:       {}", due.format("%A %Y-%m-%d"));
    }
    println!("  Source:    {}", task.source_message_id);
    if !task.description.is_empty() {
        println!();
        println!("  {}", task.description);
    }
}
