//! LLM Gateway (C3, spec.md §4.3).
//!
//! Generalizes the teacher's `LlmManager` (a single struct matching on
//! `LlmProvider` inside each method) into a provider-agnostic trait object,
//! the way `rust-ai-core`'s `GraphRAG` holds a `Box<dyn GraphStorage>` rather
//! than a concrete backend: the mock provider and a real `rig`-backed
//! provider both implement the same `LlmGateway`, so callers never match on
//! provider identity.

pub mod cache;
pub mod mock;
#[cfg(feature = "openai")]
pub mod openai_provider;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::error::{GraphRagError, Result};

/// One exchange in a chat history passed to `complete`.
#[derive(Clone, Debug)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Clone, Debug)]
pub struct CompletionOptions {
    pub model: String,
    pub temperature: f32,
    /// Delimiter the extractor watches for to decide output is complete
    /// (spec.md §4.4 step 2); `None` disables the check.
    pub completion_delimiter: Option<String>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            completion_delimiter: None,
        }
    }
}

/// A sparse (SPLADE-like) embedding: parallel index/weight arrays.
pub type SparseVector = (Vec<u32>, Vec<f32>);

/// Embedding half of the LLM gateway contract — the half the in-memory
/// vector stores depend on directly, split out so `storage::memory_vector`
/// and `storage::neo4j_vector` need not pull in completion machinery.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Sparse embeddings are optional: a provider with no SPLADE-like model
    /// loaded returns an error, which callers treat as "hybrid unavailable"
    /// rather than a hard failure (spec.md §4.7).
    async fn sparse_embed(&self, texts: &[String]) -> Result<Vec<SparseVector>>;
}

/// Full LLM gateway contract: completion plus embedding, behind a cache and
/// a concurrency semaphore (spec.md §4.3).
#[async_trait]
pub trait LlmGateway: EmbeddingProvider {
    async fn complete(
        &self,
        prompt: &str,
        history: &[ChatTurn],
        options: &CompletionOptions,
    ) -> Result<String>;
}

/// Bounds in-flight calls to an underlying gateway the way spec.md §4.3
/// calls for: a global semaphore for completions, a separate one for
/// embeddings, so a burst of extraction calls cannot starve vector upserts.
pub struct BoundedGateway<G: LlmGateway> {
    inner: G,
    completion_permits: Semaphore,
    embedding_permits: Semaphore,
}

impl<G: LlmGateway> BoundedGateway<G> {
    pub fn new(inner: G, max_concurrent: usize, embedding_max_concurrent: usize) -> Self {
        Self {
            inner,
            completion_permits: Semaphore::new(max_concurrent.max(1)),
            embedding_permits: Semaphore::new(embedding_max_concurrent.max(1)),
        }
    }
}

#[async_trait]
impl<G: LlmGateway> EmbeddingProvider for BoundedGateway<G> {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let _permit = self
            .embedding_permits
            .acquire()
            .await
            .map_err(|_| GraphRagError::fatal("embedding semaphore closed"))?;
        self.inner.embed(texts).await
    }

    async fn sparse_embed(&self, texts: &[String]) -> Result<Vec<SparseVector>> {
        let _permit = self
            .embedding_permits
            .acquire()
            .await
            .map_err(|_| GraphRagError::fatal("embedding semaphore closed"))?;
        self.inner.sparse_embed(texts).await
    }
}

#[async_trait]
impl<G: LlmGateway> LlmGateway for BoundedGateway<G> {
    async fn complete(&self, prompt: &str, history: &[ChatTurn], options: &CompletionOptions) -> Result<String> {
        let _permit = self
            .completion_permits
            .acquire()
            .await
            .map_err(|_| GraphRagError::fatal("completion semaphore closed"))?;
        self.inner.complete(prompt, history, options).await
    }
}

/// Heuristic used by the extraction gleaning/continuation loop (spec.md
/// §4.4 step 5) to decide whether a completion was cut off mid-output.
pub fn looks_truncated(text: &str, delimiter: Option<&str>) -> bool {
    if let Some(delim) = delimiter {
        if !text.contains(delim) {
            return true;
        }
    }
    let trimmed = text.trim_end();
    trimmed.ends_with('\u{2026}') || trimmed.ends_with("...")
}
