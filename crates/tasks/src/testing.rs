//! Test doubles shared by the pipeline tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use taskmind_core::error::ProviderError;
use taskmind_core::provider::{LanguageModel, ModelRequest, ModelResponse};

/// Replays scripted answers, then repeats `fallback` (or fails) once the
/// script runs out.
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: Option<String>,
    requests: Mutex<Vec<ModelRequest>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn sequence(script: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(text: &str) -> Self {
        Self {
            fallback: Some(text.to_string()),
            ..Self::sequence(vec![])
        }
    }

    pub fn then_always(mut self, text: &str) -> Self {
        self.fallback = Some(text.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(ModelResponse::from_text(text, "scripted-1")),
            Some(Err(e)) => Err(e),
            None => match &self.fallback {
                Some(text) => Ok(ModelResponse::from_text(text.clone(), "scripted-1")),
                None => Err(ProviderError::InvalidResponse("script exhausted".into())),
            },
        }
    }
}
