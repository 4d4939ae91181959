//! Vector Sync Layer (C7, spec.md §4.7).
//!
//! Owns the two-phase `has_vector` protocol: a node's vector only counts as
//! present once both the upsert succeeds AND the graph field flip succeeds.
//! Grounded in the teacher's embed-then-ingest flow (`ingest.rs::ingest_file`
//! embeds before the graph write), generalized into its own stage since C5
//! now separates graph merge from vector sync entirely.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::error::Result;
use crate::ids::entity_vector_id;
use crate::storage::{FieldValue, GraphStorage, VectorStorage, VectorUpsertInput};
use crate::text_util::sep_split;

/// Runs the post-extraction upsert protocol for a batch of just-written
/// entity ids. `entity_names` are the graph node ids (already-normalized
/// entity names, spec.md §3), distinct from the vector ids this function
/// derives internally.
pub async fn sync_entity_vectors(
    graph: &dyn GraphStorage,
    entity_vectors: &dyn VectorStorage,
    entity_names: &[String],
) -> Result<()> {
    if entity_names.is_empty() {
        return Ok(());
    }

    let nodes = graph.get_nodes_batch(entity_names).await?;
    let mut data = HashMap::new();
    let mut vector_id_to_name = HashMap::new();

    for (name, node) in entity_names.iter().zip(nodes.into_iter()) {
        let Some(node) = node else { continue };
        let vector_id = entity_vector_id(name);
        let mut payload = HashMap::new();
        payload.insert("entity_name".to_string(), serde_json::Value::String(name.clone()));
        payload.insert("entity_type".to_string(), serde_json::Value::String(node.entity_type.clone()));

        data.insert(
            vector_id.clone(),
            VectorUpsertInput { content: format!("{name} {}", node.description), payload },
        );
        vector_id_to_name.insert(vector_id, name.clone());
    }

    if data.is_empty() {
        return Ok(());
    }

    // On failure this propagates and has_vector is never flipped — the
    // next ingest pass will retry these entities (spec.md §4.7 step 4).
    entity_vectors.upsert(data).await?;

    graph
        .batch_update_node_field(entity_names, "has_vector", FieldValue::Bool(true))
        .await?;

    info!(count = entity_names.len(), "entity vectors synced, has_vector flipped");
    Ok(())
}

/// Community-phase payload update (spec.md §4.7): every node with
/// `has_vector == true` gets its `community_description` pushed into the
/// vector payload, without touching `content`/`embedding`.
pub async fn sync_community_descriptions(
    graph: &dyn GraphStorage,
    entity_vectors: &dyn VectorStorage,
    entity_names: &[String],
) -> Result<()> {
    let nodes = graph.get_nodes_batch(entity_names).await?;
    let mut updates = HashMap::new();
    let mut skipped = 0usize;

    for (name, node) in entity_names.iter().zip(nodes.into_iter()) {
        let Some(node) = node else { continue };
        if !node.has_vector {
            skipped += 1;
            continue;
        }
        let Some(community_description) = node.community_description.as_ref() else { continue };
        let vector_id = entity_vector_id(name);
        let mut fields = HashMap::new();
        fields.insert("entity_name".to_string(), serde_json::Value::String(name.clone()));
        fields.insert("entity_type".to_string(), serde_json::Value::String(node.entity_type.clone()));
        fields.insert(
            "community_description".to_string(),
            serde_json::Value::String(format!("{name} {community_description}")),
        );
        updates.insert(vector_id, fields);
    }

    if skipped > 0 {
        warn!(skipped, "skipped community payload update for nodes without a synced vector");
    }
    if updates.is_empty() {
        return Ok(());
    }

    entity_vectors.update_payload(updates).await
}

/// Source-id helper: recovers the chunk ids a merged node's `<SEP>`-joined
/// `source_id` field packs together, for callers building local-query context.
pub fn source_chunk_ids(source_id: &str) -> Vec<String> {
    sep_split(source_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_graph::MemoryGraphStorage;
    use crate::storage::memory_vector::MemoryVectorStorage;
    use crate::storage::NodeData;
    use std::sync::Arc;

    async fn seed_node(graph: &MemoryGraphStorage, id: &str, description: &str) {
        graph
            .upsert_node(
                id,
                NodeData {
                    entity_type: "ORGANIZATION".to_string(),
                    description: description.to_string(),
                    source_id: "chunk-1".to_string(),
                    has_vector: false,
                    community_description: None,
                    community_ids: Vec::new(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sync_flips_has_vector_only_after_upsert_succeeds() {
        let graph = MemoryGraphStorage::new();
        seed_node(&graph, "ACME", "a company").await;

        let provider = Arc::new(crate::llm::mock::MockLlmProvider::default());
        let vectors = MemoryVectorStorage::new(provider, "entities");

        sync_entity_vectors(&graph, &vectors, &["ACME".to_string()]).await.unwrap();

        let node = graph.get_node("ACME").await.unwrap().unwrap();
        assert!(node.has_vector);
    }

    #[tokio::test]
    async fn community_sync_skips_nodes_without_vector() {
        let graph = MemoryGraphStorage::new();
        seed_node(&graph, "GHOST", "not yet vectorized").await;

        let provider = Arc::new(crate::llm::mock::MockLlmProvider::default());
        let vectors = MemoryVectorStorage::new(provider, "entities");

        sync_community_descriptions(&graph, &vectors, &["GHOST".to_string()]).await.unwrap();
        assert_eq!(vectors.len(), 0);
    }

    #[test]
    fn source_chunk_ids_splits_sep_joined_field() {
        assert_eq!(source_chunk_ids("chunk-1<SEP>chunk-2"), vec!["chunk-1", "chunk-2"]);
    }
}
