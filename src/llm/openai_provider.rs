//! `rig`-backed [`LlmGateway`] (spec.md §4.3, the "real provider behind a
//! feature flag" half of the contract).
//!
//! Grounded directly on the teacher's `LlmManager::embed_with_openai` /
//! `answer_with_openai`: same client construction
//! (`openai::Client::from_env()`), same `EmbeddingsClient`/`CompletionClient`
//! extension traits, same `.agent(model).preamble(...).prompt(...)` shape.
//! Generalized from the teacher's two hardcoded methods into the two trait
//! methods [`EmbeddingProvider`]/[`LlmGateway`] require, and from a single
//! Spanish system preamble into the caller-supplied `history`/`prompt` this
//! crate's extraction and query planners already assemble.
//!
//! `rig` has no sparse/SPLADE embedding model, so `sparse_embed` always
//! reports unavailable — callers already treat that as "hybrid disabled"
//! rather than a hard failure (spec.md §4.7).

use async_trait::async_trait;
use rig::client::{CompletionClient, EmbeddingsClient};
use rig::completion::Prompt;
use rig::embeddings::EmbeddingModel;
use rig::providers::openai;

use super::{ChatTurn, CompletionOptions, EmbeddingProvider, LlmGateway, SparseVector};
use crate::error::{GraphRagError, Result};

pub struct OpenAiProvider {
    client: openai::Client,
    embedding_model: String,
}

impl OpenAiProvider {
    /// Reads credentials the way the teacher's client did: from the
    /// process environment (`OPENAI_API_KEY`), never from [`AppConfig`].
    pub fn from_env(embedding_model: impl Into<String>) -> Self {
        Self { client: openai::Client::from_env(), embedding_model: embedding_model.into() }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.client.embedding_model(self.embedding_model.as_str());
        let embeddings = model
            .embed_texts(texts.to_vec())
            .await
            .map_err(|e| GraphRagError::llm(format!("openai embedding call failed: {e}"), true))?;
        Ok(embeddings.into_iter().map(|e| e.vec.into_iter().map(|v| v as f32).collect()).collect())
    }

    async fn sparse_embed(&self, _texts: &[String]) -> Result<Vec<SparseVector>> {
        Err(GraphRagError::llm("openai provider has no sparse embedding model", false))
    }
}

#[async_trait]
impl LlmGateway for OpenAiProvider {
    async fn complete(&self, prompt: &str, history: &[ChatTurn], options: &CompletionOptions) -> Result<String> {
        let preamble = history
            .iter()
            .map(|turn| format!("{}: {}", turn.role, turn.content))
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut agent_builder = self.client.agent(options.model.as_str());
        if !preamble.is_empty() {
            agent_builder = agent_builder.preamble(&preamble);
        }
        let agent = agent_builder.build();

        agent
            .prompt(prompt)
            .await
            .map_err(|e| GraphRagError::llm(format!("openai completion call failed: {e}"), true))
    }
}
