//! Opening the on-disk stores a command needs.

use std::sync::Arc;

use taskmind_config::AppConfig;
use taskmind_core::provider::Embedder;
use taskmind_memory::{FileVectorIndex, IndexOptions};
use taskmind_tasks::SqliteTaskStore;
use tracing::debug;

pub fn load_config() -> Result<AppConfig, Box<dyn std::error::Error>> {
    Ok(AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?)
}

/// Open the long-term memory index under the configured data directory.
pub fn open_index(
    config: &AppConfig,
) -> Result<(Arc<FileVectorIndex>, Arc<dyn Embedder>), Box<dyn std::error::Error>> {
    let embedder = taskmind_providers::build_embedder(config)?;
    let options = IndexOptions::from_config(&config.memory, embedder.dimension());
    let dir = config.memory_dir();
    debug!(path = %dir.display(), embedder = embedder.name(), "Opening memory index");
    let index = FileVectorIndex::open(dir, embedder.clone(), options)?;
    Ok((Arc::new(index), embedder))
}

pub async fn open_task_store(
    config: &AppConfig,
) -> Result<Arc<SqliteTaskStore>, Box<dyn std::error::Error>> {
    let path = config.tasks_db_path();
    debug!(path = %path.display(), "Opening task store");
    Ok(Arc::new(SqliteTaskStore::open(&path).await?))
}

/// Fail early with a readable message when no model credentials exist.
pub fn require_api_key(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    if !config.has_api_key() {
        return Err(
            "No API key configured. Set TASKMIND_API_KEY (or OPENAI_API_KEY), or add provider.api_key to ~/.taskmind/config.toml"
                .into(),
        );
    }
    Ok(())
}
