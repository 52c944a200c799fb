//! Language model and embedding providers for TaskMind.
//!
//! All chat backends implement `taskmind_core::LanguageModel`; all
//! embedding functions implement `taskmind_core::Embedder`.

pub mod embedding;
pub mod openai_compat;

use std::sync::Arc;

use taskmind_config::AppConfig;
use taskmind_core::error::ProviderError;
use taskmind_core::provider::{Embedder, LanguageModel};

pub use embedding::{HashingEmbedder, OpenAiEmbedder};
pub use openai_compat::OpenAiCompatProvider;

/// Build the configured language model.
pub fn build_model(config: &AppConfig) -> Result<Arc<dyn LanguageModel>, ProviderError> {
    Ok(Arc::new(OpenAiCompatProvider::from_config(&config.provider)?))
}

/// Build the configured embedding function.
pub fn build_embedder(config: &AppConfig) -> Result<Arc<dyn Embedder>, ProviderError> {
    let dimension = config.memory.embedding_dimension;
    match config.provider.embedding_provider.as_str() {
        "remote" => Ok(Arc::new(OpenAiEmbedder::from_config(&config.provider, dimension)?)),
        _ => Ok(Arc::new(HashingEmbedder::new(dimension))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_embedder_is_local_hashing() {
        let embedder = build_embedder(&AppConfig::default()).unwrap();
        assert_eq!(embedder.name(), "hashing");
        assert_eq!(embedder.dimension(), 256);
    }

    #[test]
    fn remote_embedder_without_key_fails() {
        let mut config = AppConfig::default();
        config.provider.embedding_provider = "remote".into();
        assert!(build_embedder(&config).is_err());
    }

    #[test]
    fn model_needs_api_key() {
        let mut config = AppConfig::default();
        assert!(build_model(&config).is_err());
        config.provider.api_key = Some("sk-test".into());
        assert_eq!(build_model(&config).unwrap().name(), "openai");
    }
}
