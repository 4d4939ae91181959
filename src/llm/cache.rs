//! LLM response cache (spec.md §4.3): completions are memoized through a KV
//! store keyed by `hash(prompt, history, model)`. Cache misses write through
//! on success only — a failed call is never cached (spec.md §7).

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{ChatTurn, CompletionOptions, EmbeddingProvider, LlmGateway, SparseVector};
use crate::error::Result;
use crate::storage::KVStorage;

fn cache_key(prompt: &str, history: &[ChatTurn], model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(b"\0");
    for turn in history {
        hasher.update(turn.role.as_bytes());
        hasher.update(b":");
        hasher.update(turn.content.as_bytes());
        hasher.update(b"\0");
    }
    hasher.update(prompt.as_bytes());
    format!("llmcache-{:x}", hasher.finalize())
}

/// Wraps any `LlmGateway` with cache-then-call semantics. Embedding calls
/// pass straight through — spec.md §4.3 scopes the cache to completions.
pub struct CachedGateway<G: LlmGateway> {
    inner: G,
    cache: Arc<dyn KVStorage>,
}

impl<G: LlmGateway> CachedGateway<G> {
    pub fn new(inner: G, cache: Arc<dyn KVStorage>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl<G: LlmGateway> EmbeddingProvider for CachedGateway<G> {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.inner.embed(texts).await
    }

    async fn sparse_embed(&self, texts: &[String]) -> Result<Vec<SparseVector>> {
        self.inner.sparse_embed(texts).await
    }
}

#[async_trait]
impl<G: LlmGateway> LlmGateway for CachedGateway<G> {
    async fn complete(&self, prompt: &str, history: &[ChatTurn], options: &CompletionOptions) -> Result<String> {
        let key = cache_key(prompt, history, &options.model);

        if let Some(cached) = self.cache.get_by_id(&key).await? {
            if let Some(text) = cached.as_str() {
                return Ok(text.to_string());
            }
        }

        let result = self.inner.complete(prompt, history, options).await?;

        let mut entry = std::collections::HashMap::new();
        entry.insert(key, serde_json::Value::String(result.clone()));
        // A cache write failure should not fail the call that produced the
        // answer; log and move on rather than propagating.
        if let Err(err) = self.cache.upsert(entry).await {
            tracing::warn!("failed to write LLM cache entry: {}", err.message);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockLlmProvider;
    use crate::storage::memory_kv::MemoryKVStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGateway {
        inner: MockLlmProvider,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingGateway {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.inner.embed(texts).await
        }
        async fn sparse_embed(&self, texts: &[String]) -> Result<Vec<SparseVector>> {
            self.inner.sparse_embed(texts).await
        }
    }

    #[async_trait]
    impl LlmGateway for CountingGateway {
        async fn complete(&self, prompt: &str, history: &[ChatTurn], options: &CompletionOptions) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.complete(prompt, history, options).await
        }
    }

    #[tokio::test]
    async fn repeated_identical_calls_hit_the_cache() {
        let counting = CountingGateway { inner: MockLlmProvider::default(), calls: AtomicUsize::new(0) };
        let cache: Arc<dyn KVStorage> = Arc::new(MemoryKVStorage::new("llm_cache", None));
        let gateway = CachedGateway::new(counting, cache);

        let options = CompletionOptions::default();
        let first = gateway.complete("hello", &[], &options).await.unwrap();
        let second = gateway.complete("hello", &[], &options).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(gateway.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_models_produce_distinct_cache_keys() {
        let a = cache_key("p", &[], "gpt-4o-mini");
        let b = cache_key("p", &[], "gpt-4o");
        assert_ne!(a, b);
    }
}
