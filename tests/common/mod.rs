//! Shared integration-test fixtures, following the teacher pack's own
//! `tests/common.rs` convention of one fixture module shared by every file
//! under `tests/`.
//!
//! `MockLlmProvider` is deliberately inert (its `complete` never emits real
//! NDJSON), so exercising the real chunk -> extract -> merge -> vector-sync
//! -> query path end to end needs a double that actually answers in
//! character. [`ScriptedLlmProvider`] is that double: embeddings still
//! delegate to `MockLlmProvider`'s deterministic hashing, only completions
//! are scripted, matched by a substring of the prompt the caller supplies.
//! The approach mirrors the `CountingGateway` already hand-written inside
//! `src/llm/cache.rs`'s own test module.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use graphrag_engine::config::{AppConfig, ChunkingConfig, ChunkingStrategy};
use graphrag_engine::error::Result;
use graphrag_engine::llm::mock::MockLlmProvider;
use graphrag_engine::llm::{ChatTurn, CompletionOptions, EmbeddingProvider, LlmGateway, SparseVector};

/// A scripted completion gateway: the first script whose `needle` is a
/// substring of the prompt wins; no match falls back to `fallback`
/// (`<|COMPLETE|>` by default, so an unscripted extraction gleaning/
/// continuation round contributes no spurious entities rather than
/// breaking the completion-delimiter check).
pub struct ScriptedLlmProvider {
    inner: Arc<MockLlmProvider>,
    scripts: Vec<(String, String)>,
    fallback: String,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl Clone for ScriptedLlmProvider {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            scripts: self.scripts.clone(),
            fallback: self.fallback.clone(),
            prompts: self.prompts.clone(),
        }
    }
}

impl Default for ScriptedLlmProvider {
    fn default() -> Self {
        Self {
            inner: Arc::new(MockLlmProvider::default()),
            scripts: Vec::new(),
            fallback: "<|COMPLETE|>".to_string(),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ScriptedLlmProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a canned response for the first prompt containing `needle`.
    pub fn on(mut self, needle: impl Into<String>, response: impl Into<String>) -> Self {
        self.scripts.push((needle.into(), response.into()));
        self
    }

    pub fn with_fallback(mut self, response: impl Into<String>) -> Self {
        self.fallback = response.into();
        self
    }

    /// Every prompt this provider has answered, in call order -- lets a test
    /// inspect what a query planner actually packed into context (e.g. that
    /// both directions of a bidirectional edge survived into the CSV)
    /// without the gateway needing to echo it back as the answer.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedLlmProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.inner.embed(texts).await
    }

    async fn sparse_embed(&self, texts: &[String]) -> Result<Vec<SparseVector>> {
        self.inner.sparse_embed(texts).await
    }
}

#[async_trait]
impl LlmGateway for ScriptedLlmProvider {
    async fn complete(&self, prompt: &str, _history: &[ChatTurn], _options: &CompletionOptions) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        for (needle, response) in &self.scripts {
            if prompt.contains(needle.as_str()) {
                return Ok(response.clone());
            }
        }
        Ok(self.fallback.clone())
    }
}

/// A config tuned so a handful of short sentences land in exactly one
/// chunk, which keeps a scenario's script keyed to one substring of the
/// whole document rather than having to predict a chunk boundary.
pub fn single_chunk_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.chunking = ChunkingConfig { size: 2000, overlap: 0, strategy: ChunkingStrategy::FixedWindow, ..cfg.chunking };
    cfg
}
