//! `taskmind memory`: long-term memory maintenance.

use taskmind_core::memory::MemoryIndex;
use taskmind_core::message::UserId;
use taskmind_core::task::TaskStore;

use super::runtime;

pub async fn stats() -> Result<(), Box<dyn std::error::Error>> {
    let config = runtime::load_config()?;
    let (index, embedder) = runtime::open_index(&config)?;
    let stats = index.stats().await;

    println!("🧠 Memory Statistics");
    println!("====================");
    println!("  Directory:  {}", index.dir().display());
    println!("  Embedder:   {} ({} dims)", embedder.name(), stats.dimension);
    println!("  Live:       {}", stats.live);
    println!("  Erased:     {} (pending compaction)", stats.tombstoned);
    println!("  Log size:   {:.1} KB", stats.log_bytes as f64 / 1024.0);
    match stats.snapshot_offset {
        Some(offset) => println!("  Snapshot:   covers log up to byte {offset}"),
        None => println!("  Snapshot:   (none yet)"),
    }
    println!("  Min score:  {:.2}", config.memory.min_score);

    Ok(())
}

pub async fn compact() -> Result<(), Box<dyn std::error::Error>> {
    let config = runtime::load_config()?;
    let (index, _) = runtime::open_index(&config)?;

    let dropped = index.compact().await?;
    println!("🧹 Compacted memory index: {dropped} erased record(s) physically removed");
    Ok(())
}

/// Erase every memory and task owned by `user`.
pub async fn forget(user: &str, confirm: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !confirm {
        println!("⚠️  This permanently erases all memories and tasks for \"{user}\".");
        println!("   Re-run with --confirm to proceed.");
        return Ok(());
    }

    let config = runtime::load_config()?;
    let user_id = UserId::from(user);

    let (index, _) = runtime::open_index(&config)?;
    let memories = index.remove_user(&user_id).await?;
    if !config.memory.compact_on_erase {
        index.compact().await?;
    }

    let store = runtime::open_task_store(&config).await?;
    let tasks = store.delete_owner(&user_id).await?;

    tracing::info!(user = %user_id, memories, tasks, "User data erased");
    println!("🗑️  Erased {memories} memory record(s) and {tasks} task(s) for \"{user}\"");
    Ok(())
}
