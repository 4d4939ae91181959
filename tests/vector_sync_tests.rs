//! Vector Sync Layer integration coverage: the has_vector flip protocol and
//! the community-description payload stamp, driven against a real
//! `MemoryGraphStorage` + `MemoryVectorStorage` pair rather than the
//! single-node fixtures the in-crate unit tests use.

use std::sync::Arc;

use graphrag_engine::ids::entity_vector_id;
use graphrag_engine::llm::mock::MockLlmProvider;
use graphrag_engine::llm::EmbeddingProvider;
use graphrag_engine::storage::memory_graph::MemoryGraphStorage;
use graphrag_engine::storage::memory_vector::MemoryVectorStorage;
use graphrag_engine::storage::{FieldValue, GraphStorage, NodeData, VectorStorage};
use graphrag_engine::vector_sync::{sync_community_descriptions, sync_entity_vectors};

async fn seed(graph: &MemoryGraphStorage, id: &str, entity_type: &str, description: &str) {
    graph
        .upsert_node(
            id,
            NodeData {
                entity_type: entity_type.to_string(),
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
async fn sync_then_community_stamp_round_trips_through_the_vector_store() {
    let graph = MemoryGraphStorage::new();
    seed(&graph, "ACME CORP", "ORGANIZATION", "a widget maker").await;
    seed(&graph, "JANE ROE", "PERSON", "an engineer at ACME CORP").await;

    let embeddings: Arc<dyn EmbeddingProvider> = Arc::new(MockLlmProvider::default());
    let entity_vectors = MemoryVectorStorage::new(embeddings, "entities");

    let names = vec!["ACME CORP".to_string(), "JANE ROE".to_string()];
    sync_entity_vectors(&graph, &entity_vectors, &names).await.unwrap();

    assert!(graph.get_node("ACME CORP").await.unwrap().unwrap().has_vector);
    assert!(graph.get_node("JANE ROE").await.unwrap().unwrap().has_vector);

    let direct = entity_vectors.query("a widget maker", 5).await.unwrap();
    let acme_hit = direct.iter().find(|r| r.id == entity_vector_id("ACME CORP")).expect("ACME CORP vector must exist");
    assert_eq!(acme_hit.payload.get("entity_name").unwrap(), "ACME CORP");
    assert_eq!(acme_hit.payload.get("entity_type").unwrap(), "ORGANIZATION");

    // Only ACME CORP gets a community description; JANE ROE is left with
    // has_vector true but no description yet -- sync must not choke on that.
    graph
        .batch_update_node_field(&["ACME CORP".to_string()], "community_description", FieldValue::Str("the widget-making community".to_string()))
        .await
        .unwrap();

    sync_community_descriptions(&graph, &entity_vectors, &names).await.unwrap();

    let after = entity_vectors.query("a widget maker", 5).await.unwrap();
    let acme_after = after.iter().find(|r| r.id == entity_vector_id("ACME CORP")).unwrap();
    let community_description = acme_after.payload.get("community_description").unwrap().as_str().unwrap();
    assert!(community_description.contains("the widget-making community"));
    // content/embedding are protected fields and must never surface in payload.
    assert!(!acme_after.payload.contains_key("content"));
    assert!(!acme_after.payload.contains_key("embedding"));
}

#[tokio::test]
async fn community_sync_skips_a_node_whose_vector_was_never_flipped() {
    let graph = MemoryGraphStorage::new();
    seed(&graph, "GHOST", "UNKNOWN", "placeholder, never directly extracted").await;

    graph
        .batch_update_node_field(&["GHOST".to_string()], "community_description", FieldValue::Str("some community".to_string()))
        .await
        .unwrap();

    let embeddings: Arc<dyn EmbeddingProvider> = Arc::new(MockLlmProvider::default());
    let entity_vectors = MemoryVectorStorage::new(embeddings, "entities");

    // No prior sync_entity_vectors call: GHOST's has_vector stays false.
    sync_community_descriptions(&graph, &entity_vectors, &["GHOST".to_string()]).await.unwrap();

    let hits = entity_vectors.query("placeholder", 5).await.unwrap();
    assert!(hits.is_empty(), "a node skipped for missing has_vector must never get a vector record written");
}
