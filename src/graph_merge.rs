//! Graph Batch Merger (C5, spec.md §4.5).
//!
//! Replaces the teacher's `upsert_graph_data` (one Cypher `MERGE` per
//! node/edge, fired immediately as each chunk finishes) with an in-memory
//! accumulator: every extraction result for one document folds into a
//! single [`GraphBatch`] before any write touches the graph store, the way
//! the spec's "eliminate the O(N) transaction storm" goal calls for.

use std::collections::HashMap;

use tracing::warn;

use crate::chunking::{Tokenizer, WhitespaceTokenizer};
use crate::config::LlmConfig;
use crate::error::Result;
use crate::extraction::ExtractionResult;
use crate::llm::{ChatTurn, CompletionOptions, LlmGateway};
use crate::storage::{EdgeData, GraphBatch, GraphStorage, NodeData};
use crate::text_util::{sanitize_label, sep_join};

fn estimate_tokens(text: &str) -> usize {
    WhitespaceTokenizer.encode(text).len()
}

/// Renders the `entity_relation_summary` prompt (spec.md §4.5) used to
/// collapse a merged node's joined descriptions once they exceed the
/// configured token budget.
fn render_entity_relation_summary_prompt(entity_name: &str, entity_type: &str, descriptions: &str) -> String {
    format!(
        "Several text fragments describe the same entity, extracted from different \
         parts of a document. Combine them into one concise description that keeps \
         every distinct fact and loses none of the relationships mentioned.\n\n\
         Entity: {entity_name} ({entity_type})\nFragments:\n{descriptions}"
    )
}

#[derive(Default)]
struct MergingNode {
    entity_type_votes: HashMap<String, usize>,
    descriptions: Vec<String>,
    source_ids: Vec<String>,
}

#[derive(Default)]
struct MergingEdge {
    weight: f64,
    descriptions: Vec<String>,
    source_ids: Vec<String>,
    relation_type: Option<String>,
}

/// Accumulates one document's extraction results in memory, applying the
/// merge rules of spec.md §4.5, then produces a single [`GraphBatch`].
pub struct DocumentMerger {
    nodes: HashMap<String, MergingNode>,
    edges: HashMap<(String, String), MergingEdge>,
}

impl DocumentMerger {
    pub fn new() -> Self {
        Self { nodes: HashMap::new(), edges: HashMap::new() }
    }

    /// Folds one chunk's extraction result in. Call once per chunk of the
    /// document, in any order — merge rules are associative/commutative.
    pub fn add(&mut self, result: ExtractionResult) {
        for (id, fragment) in result.nodes {
            let entry = self.nodes.entry(id).or_default();
            *entry.entity_type_votes.entry(fragment.entity_type).or_insert(0) += 1;
            entry.descriptions.push(fragment.description);
            entry.source_ids.push(fragment.source_id);
        }
        for (src, tgt, fragment) in result.edges {
            let entry = self.edges.entry((src, tgt)).or_default();
            entry.weight += fragment.weight;
            entry.descriptions.push(fragment.description);
            entry.source_ids.push(fragment.source_id);
            // Preserved from the first occurrence carrying a non-default
            // type (spec.md §4.5 Edge merge); a run of default "RELATED"
            // fragments never locks the slot, so a later non-default type
            // still wins.
            if entry.relation_type.is_none() && fragment.relation_type != "RELATED" {
                entry.relation_type = Some(fragment.relation_type);
            }
        }
    }

    /// Resolves the in-memory merge against the graph's current state
    /// (placeholder creation, `has_vector` carry-forward) and returns the
    /// batch ready for [`GraphStorage::execute_document_batch`]. When a
    /// merged node's joined description exceeds `llm_cfg`'s token budget,
    /// collapses it via the `entity_relation_summary` prompt (spec.md §4.5),
    /// the same pattern `community.rs::summarize_community` uses for
    /// over-budget community packs.
    pub async fn finish(self, graph: &dyn GraphStorage, gateway: &dyn LlmGateway, llm_cfg: &LlmConfig) -> Result<GraphBatch> {
        let mut batch = GraphBatch::default();
        let mut present: std::collections::HashSet<String> = self.nodes.keys().cloned().collect();

        for (id, merging) in self.nodes {
            let entity_type = majority_vote(&merging.entity_type_votes);
            let mut description = sep_join(merging.descriptions);
            let source_id = sep_join(merging.source_ids);

            if estimate_tokens(&description) > llm_cfg.entity_summary_token_budget as usize {
                let prompt = render_entity_relation_summary_prompt(&id, &entity_type, &description);
                let options = CompletionOptions { model: llm_cfg.chat_model.clone(), temperature: 0.0, completion_delimiter: None };
                match gateway.complete(&prompt, &[] as &[ChatTurn], &options).await {
                    Ok(summary) if !summary.trim().is_empty() => description = summary,
                    Ok(_) => warn!(entity = %id, "entity_relation_summary returned empty text, keeping raw join"),
                    Err(err) => warn!(entity = %id, "entity_relation_summary call failed, keeping raw join: {}", err.message),
                }
            }

            // has_vector is carried from the existing store's value,
            // read once, never re-derived here — C7 owns the flip.
            let has_vector = graph.get_node(&id).await?.map(|n| n.has_vector).unwrap_or(false);

            batch.nodes.push((
                id,
                NodeData {
                    entity_type: sanitize_label(&entity_type),
                    description,
                    source_id,
                    has_vector,
                    community_description: None,
                    community_ids: Vec::new(),
                },
            ));
        }

        for ((src, tgt), merging) in self.edges {
            for endpoint in [&src, &tgt] {
                if !present.contains(endpoint) && !graph.has_node(endpoint).await? {
                    present.insert(endpoint.clone());
                    batch.nodes.push((
                        endpoint.clone(),
                        NodeData {
                            entity_type: "UNKNOWN".to_string(),
                            description: sep_join(merging.source_ids.clone()),
                            source_id: sep_join(merging.source_ids.clone()),
                            has_vector: false,
                            community_description: None,
                            community_ids: Vec::new(),
                        },
                    ));
                }
            }

            batch.edges.push((
                src,
                tgt,
                EdgeData {
                    description: sep_join(merging.descriptions),
                    weight: merging.weight,
                    source_id: sep_join(merging.source_ids),
                    relation_type: merging.relation_type.unwrap_or_else(|| "RELATED".to_string()),
                    order: 0,
                },
            ));
        }

        Ok(batch)
    }
}

fn majority_vote(votes: &HashMap<String, usize>) -> String {
    votes
        .iter()
        .max_by_key(|(name, count)| (**count, std::cmp::Reverse(name.clone())))
        .map(|(name, _)| name.clone())
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;
    use crate::extraction::{EdgeFragment, NodeFragment};
    use crate::llm::mock::MockLlmProvider;
    use crate::storage::memory_graph::MemoryGraphStorage;

    fn node_result(id: &str, entity_type: &str, description: &str, chunk_id: &str) -> ExtractionResult {
        let mut result = ExtractionResult::default();
        result.nodes.insert(
            id.to_string(),
            NodeFragment {
                entity_type: entity_type.to_string(),
                description: description.to_string(),
                source_id: chunk_id.to_string(),
            },
        );
        result
    }

    #[tokio::test]
    async fn majority_vote_picks_most_frequent_type() {
        let graph = MemoryGraphStorage::new();
        let gateway = MockLlmProvider::default();
        let llm_cfg = LlmConfig::default();
        let mut merger = DocumentMerger::new();
        merger.add(node_result("ACME", "ORGANIZATION", "a company", "chunk-1"));
        merger.add(node_result("ACME", "ORGANIZATION", "still a company", "chunk-2"));
        merger.add(node_result("ACME", "PERSON", "mistaken tag", "chunk-3"));

        let batch = merger.finish(&graph, &gateway, &llm_cfg).await.unwrap();
        let (_, data) = batch.nodes.iter().find(|(id, _)| id == "ACME").unwrap();
        assert_eq!(data.entity_type, "ORGANIZATION");
    }

    #[tokio::test]
    async fn descriptions_are_sep_joined_and_deduped() {
        let graph = MemoryGraphStorage::new();
        let gateway = MockLlmProvider::default();
        let llm_cfg = LlmConfig::default();
        let mut merger = DocumentMerger::new();
        merger.add(node_result("ACME", "ORGANIZATION", "desc one", "chunk-1"));
        merger.add(node_result("ACME", "ORGANIZATION", "desc one", "chunk-2"));
        merger.add(node_result("ACME", "ORGANIZATION", "desc two", "chunk-3"));

        let batch = merger.finish(&graph, &gateway, &llm_cfg).await.unwrap();
        let (_, data) = batch.nodes.iter().find(|(id, _)| id == "ACME").unwrap();
        assert_eq!(data.description, "desc one<SEP>desc two");
    }

    #[tokio::test]
    async fn edge_merge_lets_later_non_default_type_win_over_leading_defaults() {
        let graph = MemoryGraphStorage::new();
        let gateway = MockLlmProvider::default();
        let llm_cfg = LlmConfig::default();
        let mut merger = DocumentMerger::new();
        let mut r1 = ExtractionResult::default();
        r1.edges.push((
            "A".to_string(),
            "B".to_string(),
            EdgeFragment { description: "x".to_string(), weight: 1.0, source_id: "c1".to_string(), relation_type: "RELATED".to_string() },
        ));
        let mut r2 = ExtractionResult::default();
        r2.edges.push((
            "A".to_string(),
            "B".to_string(),
            EdgeFragment { description: "y".to_string(), weight: 1.0, source_id: "c2".to_string(), relation_type: "EMPLOYS".to_string() },
        ));
        merger.add(r1);
        merger.add(r2);

        let batch = merger.finish(&graph, &gateway, &llm_cfg).await.unwrap();
        let (_, _, data) = batch.edges.iter().find(|(s, t, _)| s == "A" && t == "B").unwrap();
        assert_eq!(data.relation_type, "EMPLOYS");
    }

    #[tokio::test]
    async fn edge_weight_sums_within_batch() {
        let graph = MemoryGraphStorage::new();
        let gateway = MockLlmProvider::default();
        let llm_cfg = LlmConfig::default();
        let mut merger = DocumentMerger::new();
        let mut r1 = ExtractionResult::default();
        r1.edges.push((
            "A".to_string(),
            "B".to_string(),
            EdgeFragment { description: "x".to_string(), weight: 1.0, source_id: "c1".to_string(), relation_type: "RELATED".to_string() },
        ));
        let mut r2 = ExtractionResult::default();
        r2.edges.push((
            "A".to_string(),
            "B".to_string(),
            EdgeFragment { description: "y".to_string(), weight: 2.0, source_id: "c2".to_string(), relation_type: "RELATED".to_string() },
        ));
        merger.add(r1);
        merger.add(r2);

        let batch = merger.finish(&graph, &gateway, &llm_cfg).await.unwrap();
        let (_, _, data) = batch.edges.iter().find(|(s, t, _)| s == "A" && t == "B").unwrap();
        assert_eq!(data.weight, 3.0);
    }

    #[tokio::test]
    async fn edge_to_unknown_node_creates_placeholder() {
        let graph = MemoryGraphStorage::new();
        let gateway = MockLlmProvider::default();
        let llm_cfg = LlmConfig::default();
        let mut merger = DocumentMerger::new();
        let mut result = ExtractionResult::default();
        result.edges.push((
            "A".to_string(),
            "GHOST".to_string(),
            EdgeFragment { description: "links to".to_string(), weight: 1.0, source_id: "c1".to_string(), relation_type: "RELATED".to_string() },
        ));
        merger.add(result);

        let batch = merger.finish(&graph, &gateway, &llm_cfg).await.unwrap();
        let placeholder = batch.nodes.iter().find(|(id, _)| id == "GHOST" || id == "A");
        assert!(placeholder.is_some());
        let ghost = batch.nodes.iter().find(|(id, _)| id == "GHOST").unwrap();
        assert_eq!(ghost.1.entity_type, "UNKNOWN");
        assert!(!ghost.1.has_vector);
    }

    #[tokio::test]
    async fn has_vector_carried_from_existing_store_unchanged() {
        let graph = MemoryGraphStorage::new();
        let gateway = MockLlmProvider::default();
        let llm_cfg = LlmConfig::default();
        graph
            .upsert_node(
                "ACME",
                NodeData {
                    entity_type: "ORGANIZATION".to_string(),
                    description: "existing".to_string(),
                    source_id: "chunk-0".to_string(),
                    has_vector: true,
                    community_description: None,
                    community_ids: Vec::new(),
                },
            )
            .await
            .unwrap();

        let mut merger = DocumentMerger::new();
        merger.add(node_result("ACME", "ORGANIZATION", "new mention", "chunk-1"));
        let batch = merger.finish(&graph, &gateway, &llm_cfg).await.unwrap();
        let (_, data) = batch.nodes.iter().find(|(id, _)| id == "ACME").unwrap();
        assert!(data.has_vector);
    }

    #[tokio::test]
    async fn description_over_budget_is_collapsed_via_entity_relation_summary() {
        let graph = MemoryGraphStorage::new();
        let gateway = MockLlmProvider::default();
        let mut llm_cfg = LlmConfig::default();
        llm_cfg.entity_summary_token_budget = 3;

        let mut merger = DocumentMerger::new();
        merger.add(node_result(
            "ACME",
            "ORGANIZATION",
            "a description with far more than three whitespace tokens in it",
            "chunk-1",
        ));

        let batch = merger.finish(&graph, &gateway, &llm_cfg).await.unwrap();
        let (_, data) = batch.nodes.iter().find(|(id, _)| id == "ACME").unwrap();
        assert!(
            data.description.starts_with("[mock-llm response to"),
            "over-budget description should be replaced by the summary completion, got: {}",
            data.description
        );
    }

    #[tokio::test]
    async fn description_under_budget_is_left_as_raw_join() {
        let graph = MemoryGraphStorage::new();
        let gateway = MockLlmProvider::default();
        let llm_cfg = LlmConfig::default();

        let mut merger = DocumentMerger::new();
        merger.add(node_result("ACME", "ORGANIZATION", "short desc", "chunk-1"));

        let batch = merger.finish(&graph, &gateway, &llm_cfg).await.unwrap();
        let (_, data) = batch.nodes.iter().find(|(id, _)| id == "ACME").unwrap();
        assert_eq!(data.description, "short desc");
    }
}
