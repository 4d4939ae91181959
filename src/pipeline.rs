//! Pipeline Orchestrator (C9, spec.md §4.9).
//!
//! Replaces the teacher's `ingest_directory` (walk a directory, embed and
//! write each file's chunks straight to Neo4j as it goes) with the
//! doc→chunk→extract→merge→vector-sync sequence spec.md calls for:
//! documents process strictly sequentially so C5's batch commit never
//! collides across documents, while chunking and extraction within one
//! document run concurrently bounded by C3's semaphore.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::chunking::{get_chunks_with_ids, Tokenizer};
use crate::community;
use crate::config::AppConfig;
use crate::error::Result;
use crate::extraction::extract_chunk;
use crate::graph_merge::DocumentMerger;
use crate::ids::document_id;
use crate::llm::LlmGateway;
use crate::storage::StorageTier;
use crate::vector_sync::{sync_community_descriptions, sync_entity_vectors};

/// Per-document outcome, aggregated into an [`IngestSummary`].
#[derive(Debug)]
enum DocOutcome {
    Ingested { entities: usize, relationships: usize },
    Skipped { reason: String },
    Failed { error: String },
}

/// Result of one `ingest` call (spec.md §7 "orchestrator returns a summary
/// with success/failure counts").
#[derive(Debug, Default, serde::Serialize)]
pub struct IngestSummary {
    pub documents_submitted: usize,
    pub documents_new: usize,
    pub documents_ingested: usize,
    pub documents_skipped: usize,
    pub documents_failed: usize,
    pub chunks_new: usize,
    pub entities_extracted: usize,
    pub relationships_extracted: usize,
    pub communities_generated: usize,
}

impl std::fmt::Display for IngestSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} documents submitted, {} new, {} ingested, {} skipped, {} failed; \
             {} chunks, {} entities, {} relationships extracted; {} communities generated",
            self.documents_submitted,
            self.documents_new,
            self.documents_ingested,
            self.documents_skipped,
            self.documents_failed,
            self.chunks_new,
            self.entities_extracted,
            self.relationships_extracted,
            self.communities_generated,
        )
    }
}

/// Ingests raw document text bodies end to end (spec.md §4.9 `ingest(docs)`).
///
/// Documents are processed strictly sequentially — this is the deliberate
/// serialization spec.md §4.5/§5 calls for, eliminating the teacher's
/// cross-document graph deadlocks at the cost of inter-document
/// parallelism. Chunking and extraction concurrency within one document
/// remain bounded only by `gateway`'s own semaphore.
pub async fn ingest(
    storage: &StorageTier,
    gateway: &dyn LlmGateway,
    tokenizer: &dyn Tokenizer,
    cfg: &AppConfig,
    docs: Vec<String>,
) -> Result<IngestSummary> {
    let mut summary = IngestSummary { documents_submitted: docs.len(), ..Default::default() };

    let doc_ids: Vec<String> = docs.iter().map(|d| document_id(d)).collect();
    let new_doc_ids = storage.full_docs.filter_keys(&doc_ids).await?;
    summary.documents_new = new_doc_ids.len();

    let new_doc_id_set: std::collections::HashSet<&str> = new_doc_ids.iter().map(|s| s.as_str()).collect();
    let mut new_docs: HashMap<String, String> = HashMap::new();
    for (id, content) in doc_ids.iter().zip(docs.iter()) {
        if new_doc_id_set.contains(id.as_str()) {
            new_docs.insert(id.clone(), content.clone());
        }
    }
    if !new_docs.is_empty() {
        let upserts: HashMap<String, serde_json::Value> = new_docs
            .iter()
            .map(|(id, content)| (id.clone(), serde_json::json!({ "content": content })))
            .collect();
        storage.full_docs.upsert(upserts).await?;
    }

    let mut touched_entities: Vec<String> = Vec::new();

    for doc_id in &new_doc_ids {
        let content = match new_docs.get(doc_id) {
            Some(c) => c.clone(),
            None => continue,
        };

        let outcome = ingest_one_document(storage, gateway, tokenizer, cfg, doc_id, &content, &mut touched_entities).await;
        match outcome {
            DocOutcome::Ingested { entities, relationships } => {
                summary.documents_ingested += 1;
                summary.entities_extracted += entities;
                summary.relationships_extracted += relationships;
            }
            DocOutcome::Skipped { reason } => {
                warn!(doc_id, reason, "document skipped");
                summary.documents_skipped += 1;
            }
            DocOutcome::Failed { error } => {
                warn!(doc_id, error, "document ingest failed after retries, continuing with remaining documents");
                summary.documents_failed += 1;
            }
        }
    }

    if !touched_entities.is_empty() {
        summary.communities_generated =
            community::run_community_pass(storage.graph.as_ref(), storage.community_reports.as_ref(), gateway, &cfg.llm)
                .await?;

        sync_community_descriptions(storage.graph.as_ref(), storage.entity_vectors.as_ref(), &touched_entities).await?;
    }

    storage.graph.index_done_callback().await?;
    storage.entity_vectors.index_done_callback().await?;
    storage.chunk_vectors.index_done_callback().await?;
    storage.full_docs.index_done_callback().await?;
    storage.text_chunks.index_done_callback().await?;
    storage.community_reports.index_done_callback().await?;

    info!(summary = %summary, "ingest complete");
    Ok(summary)
}

async fn ingest_one_document(
    storage: &StorageTier,
    gateway: &dyn LlmGateway,
    tokenizer: &dyn Tokenizer,
    cfg: &AppConfig,
    doc_id: &str,
    content: &str,
    touched_entities: &mut Vec<String>,
) -> DocOutcome {
    let chunk_pairs = get_chunks_with_ids(doc_id, content, tokenizer, &cfg.chunking);
    let chunk_ids: Vec<String> = chunk_pairs.iter().map(|(id, _)| id.clone()).collect();

    let new_chunk_ids = match storage.text_chunks.filter_keys(&chunk_ids).await {
        Ok(ids) => ids,
        Err(err) => return DocOutcome::Failed { error: err.message },
    };
    let new_chunk_set: std::collections::HashSet<&str> = new_chunk_ids.iter().map(|s| s.as_str()).collect();

    let new_chunks: Vec<(String, crate::chunking::Chunk)> = chunk_pairs
        .into_iter()
        .filter(|(id, _)| new_chunk_set.contains(id.as_str()))
        .collect();

    if !new_chunks.is_empty() {
        let upserts: HashMap<String, serde_json::Value> = new_chunks
            .iter()
            .map(|(id, chunk)| {
                (
                    id.clone(),
                    serde_json::json!({
                        "content": chunk.content,
                        "tokens": chunk.tokens,
                        "chunk_order_index": chunk.chunk_order_index,
                        "full_doc_id": chunk.full_doc_id,
                    }),
                )
            })
            .collect();
        if let Err(err) = storage.text_chunks.upsert(upserts).await {
            return DocOutcome::Failed { error: err.message };
        }
    }

    if new_chunks.is_empty() {
        return DocOutcome::Skipped { reason: "no new chunks to extract".to_string() };
    }

    // Extraction within one document runs concurrently; the LLM gateway's
    // own semaphore (spec.md §4.3) is the only bound, per spec.md §4.9 step 4.
    let extractions = join_all(new_chunks.iter().map(|(id, chunk)| {
        extract_chunk(gateway, id, &chunk.content, &cfg.entity_extraction, &cfg.llm.chat_model)
    }))
    .await;

    let mut merger = DocumentMerger::new();
    let mut any_nodes = false;
    for extraction in extractions {
        match extraction {
            Ok(result) => {
                if !result.nodes.is_empty() {
                    any_nodes = true;
                }
                merger.add(result);
            }
            Err(err) => warn!(doc_id, "chunk extraction failed: {}", err.message),
        }
    }

    if !any_nodes {
        return DocOutcome::Skipped { reason: "extraction yielded zero nodes".to_string() };
    }

    let batch = match merger.finish(storage.graph.as_ref(), gateway, &cfg.llm).await {
        Ok(b) => b,
        Err(err) => return DocOutcome::Failed { error: err.message },
    };
    let node_count = batch.nodes.len();
    let edge_count = batch.edges.len();
    let entity_names: Vec<String> = batch.nodes.iter().map(|(id, _)| id.clone()).collect();

    if let Err(err) = storage
        .graph
        .execute_document_batch(batch, cfg.storage.neo4j_batch_size)
        .await
    {
        return DocOutcome::Failed { error: err.message };
    }

    // Vector upsert failure bubbles up and prevents the has_vector flip,
    // preserving consistency for the next run (spec.md §4.9 "Failure
    // semantics").
    if let Err(err) = sync_entity_vectors(storage.graph.as_ref(), storage.entity_vectors.as_ref(), &entity_names).await {
        return DocOutcome::Failed { error: err.message };
    }

    touched_entities.extend(entity_names);
    DocOutcome::Ingested { entities: node_count, relationships: edge_count }
}
