//! Deterministic offline provider backing the `mock-llm` default feature.
//!
//! Grounded in the same spirit as the teacher's `answer_with_openai`/
//! `embed_with_openai` pair, minus the network call: hashing stands in for
//! a real embedding model, and a small templated extraction response stands
//! in for a real chat completion, so the full pipeline (chunk → extract →
//! embed → cluster → query) is exercisable without any external service.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{ChatTurn, CompletionOptions, EmbeddingProvider, LlmGateway, SparseVector};
use crate::error::{GraphRagError, Result};

const DENSE_DIMS: usize = 32;

#[derive(Default)]
pub struct MockLlmProvider;

impl MockLlmProvider {
    fn hash_embed(text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        let mut v = Vec::with_capacity(DENSE_DIMS);
        for i in 0..DENSE_DIMS {
            let byte = digest[i % digest.len()];
            v.push((byte as f32 / 255.0) * 2.0 - 1.0);
        }
        v
    }

    fn hash_sparse(text: &str) -> SparseVector {
        let mut indices = Vec::new();
        let mut values = Vec::new();
        for (i, token) in text.split_whitespace().enumerate().take(16) {
            let digest = Sha256::digest(token.as_bytes());
            let idx = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % 50_000;
            indices.push(idx);
            values.push(1.0 / (i as f32 + 1.0));
        }
        (indices, values)
    }
}

#[async_trait]
impl EmbeddingProvider for MockLlmProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::hash_embed(t)).collect())
    }

    async fn sparse_embed(&self, texts: &[String]) -> Result<Vec<SparseVector>> {
        if texts.is_empty() {
            return Err(GraphRagError::llm("sparse_embed called with no texts", false));
        }
        Ok(texts.iter().map(|t| Self::hash_sparse(t)).collect())
    }
}

#[async_trait]
impl LlmGateway for MockLlmProvider {
    async fn complete(&self, prompt: &str, history: &[ChatTurn], _options: &CompletionOptions) -> Result<String> {
        // Echo-style deterministic completion: good enough to drive
        // extraction's gleaning loop and query's final answer step in
        // tests and offline runs without a real model.
        let context_len: usize = history.iter().map(|t| t.content.len()).sum();
        Ok(format!(
            "[mock-llm response to {} chars of prompt, {} chars of history]",
            prompt.len(),
            context_len
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embed_is_deterministic() {
        let provider = MockLlmProvider::default();
        let a = provider.embed(&["hello".to_string()]).await.unwrap();
        let b = provider.embed(&["hello".to_string()]).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn embed_differs_across_distinct_texts() {
        let provider = MockLlmProvider::default();
        let a = provider.embed(&["hello".to_string()]).await.unwrap();
        let b = provider.embed(&["goodbye".to_string()]).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn sparse_embed_rejects_empty_batch() {
        let provider = MockLlmProvider::default();
        assert!(provider.sparse_embed(&[]).await.is_err());
    }

    #[tokio::test]
    async fn complete_reflects_prompt_length() {
        let provider = MockLlmProvider::default();
        let out = provider
            .complete("hi", &[], &CompletionOptions::default())
            .await
            .unwrap();
        assert!(out.contains("2 chars"));
    }
}
