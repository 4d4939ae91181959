//! In-memory `VectorStorage` (the `nano`/`hnsw`-equivalent default backend).
//!
//! Dense similarity is brute-force cosine over a `dashmap`-backed table —
//! adequate for the engine's own batch sizes and for tests; a real HNSW/
//! Qdrant backend would implement the same trait behind `storage::build_storage`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{VectorQueryResult, VectorStorage, VectorUpsertInput};
use crate::error::Result;
use crate::llm::EmbeddingProvider;

#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct Record {
    content: String,
    embedding: Vec<f32>,
    sparse: Option<(Vec<u32>, Vec<f32>)>,
    payload: HashMap<String, serde_json::Value>,
}

pub struct MemoryVectorStorage {
    records: DashMap<String, Record>,
    embeddings: Arc<dyn EmbeddingProvider>,
    namespace: &'static str,
}

impl MemoryVectorStorage {
    pub fn new(embeddings: Arc<dyn EmbeddingProvider>, namespace: &'static str) -> Self {
        Self {
            records: DashMap::new(),
            embeddings,
            namespace,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    fn dense_hits(&self, query_vec: &[f32], top_k: usize) -> Vec<(String, f64)> {
        let mut scored: Vec<(String, f64)> = self
            .records
            .iter()
            .map(|r| (r.key().clone(), cosine_similarity(query_vec, &r.embedding)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }

    fn sparse_hits(&self, query_sparse: &(Vec<u32>, Vec<f32>), top_k: usize) -> Vec<(String, f64)> {
        let mut scored: Vec<(String, f64)> = self
            .records
            .iter()
            .filter_map(|r| r.sparse.as_ref().map(|s| (r.key().clone(), sparse_dot(query_sparse, s))))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)) as f64
}

fn sparse_dot(a: &(Vec<u32>, Vec<f32>), b: &(Vec<u32>, Vec<f32>)) -> f64 {
    let map: HashMap<u32, f32> = a.0.iter().copied().zip(a.1.iter().copied()).collect();
    let mut sum = 0.0f32;
    for (idx, val) in b.0.iter().zip(b.1.iter()) {
        if let Some(other) = map.get(idx) {
            sum += other * val;
        }
    }
    sum as f64
}

/// Reciprocal Rank Fusion over two ranked lists (spec.md §4.7, GLOSSARY).
fn rrf_fuse(dense: &[(String, f64)], sparse: &[(String, f64)], k: u32, top_k: usize) -> Vec<(String, f64)> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    for (rank, (id, _)) in dense.iter().enumerate() {
        *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (k as f64 + rank as f64 + 1.0);
    }
    for (rank, (id, _)) in sparse.iter().enumerate() {
        *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (k as f64 + rank as f64 + 1.0);
    }
    let mut fused: Vec<(String, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    fused.truncate(top_k);
    fused
}

#[async_trait]
impl VectorStorage for MemoryVectorStorage {
    async fn upsert(&self, data: HashMap<String, VectorUpsertInput>) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = data.keys().cloned().collect();
        let texts: Vec<String> = ids.iter().map(|id| data[id].content.clone()).collect();

        let dense = self.embeddings.embed(&texts).await?;
        let sparse = self.embeddings.sparse_embed(&texts).await.ok();

        for (i, id) in ids.iter().enumerate() {
            let input = &data[id];
            let record = Record {
                content: input.content.clone(),
                embedding: dense.get(i).cloned().unwrap_or_default(),
                sparse: sparse.as_ref().and_then(|s| s.get(i).cloned()),
                payload: input.payload.clone(),
            };
            self.records.insert(id.clone(), record);
        }
        debug!(namespace = self.namespace, count = ids.len(), "vector upsert complete");
        Ok(())
    }

    async fn update_payload(&self, updates: HashMap<String, HashMap<String, serde_json::Value>>) -> Result<()> {
        for (id, mut fields) in updates {
            let dropped_content = fields.remove("content").is_some();
            let dropped_embedding = fields.remove("embedding").is_some();
            if dropped_content || dropped_embedding {
                debug!(namespace = self.namespace, id, "dropped protected field(s) from payload update");
            }
            if let Some(mut record) = self.records.get_mut(&id) {
                for (k, v) in fields {
                    record.payload.insert(k, v);
                }
            } else {
                debug!(namespace = self.namespace, id, "payload update skipped: no such vector record");
            }
        }
        Ok(())
    }

    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<VectorQueryResult>> {
        let query_vec = self.embeddings.embed(&[text.to_string()]).await?;
        let Some(query_vec) = query_vec.into_iter().next() else {
            return Ok(Vec::new());
        };
        let hits = self.dense_hits(&query_vec, top_k);
        Ok(hits
            .into_iter()
            .filter_map(|(id, score)| {
                self.records.get(&id).map(|r| VectorQueryResult {
                    id: id.clone(),
                    distance: score,
                    payload: r.payload.clone(),
                })
            })
            .collect())
    }

    async fn query_hybrid(&self, text: &str, top_k: usize) -> Result<Vec<VectorQueryResult>> {
        let query_sparse = self.embeddings.sparse_embed(&[text.to_string()]).await.ok();
        let Some(query_sparse) = query_sparse.and_then(|v| v.into_iter().next()) else {
            return self.query(text, top_k).await;
        };

        let dense_vec = self.embeddings.embed(&[text.to_string()]).await?;
        let Some(dense_vec) = dense_vec.into_iter().next() else {
            return Ok(Vec::new());
        };

        let dense = self.dense_hits(&dense_vec, top_k * 1);
        let sparse = self.sparse_hits(&query_sparse, top_k * 2);
        let fused = rrf_fuse(&dense, &sparse, 60, top_k);

        Ok(fused
            .into_iter()
            .filter_map(|(id, score)| {
                self.records.get(&id).map(|r| VectorQueryResult {
                    id: id.clone(),
                    distance: score,
                    payload: r.payload.clone(),
                })
            })
            .collect())
    }

    async fn export_snapshot(&self) -> Result<serde_json::Value> {
        let records: HashMap<String, Record> =
            self.records.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
        serde_json::to_value(records).map_err(crate::error::GraphRagError::from)
    }

    async fn import_snapshot(&self, data: serde_json::Value) -> Result<()> {
        let records: HashMap<String, Record> = serde_json::from_value(data).map_err(crate::error::GraphRagError::from)?;
        self.records.clear();
        for (id, record) in records {
            self.records.insert(id, record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockLlmProvider;

    fn upsert_input(content: &str) -> VectorUpsertInput {
        VectorUpsertInput { content: content.to_string(), payload: HashMap::new() }
    }

    #[tokio::test]
    async fn update_payload_drops_content_and_embedding() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(MockLlmProvider::default());
        let store = MemoryVectorStorage::new(provider, "entities");
        let mut data = HashMap::new();
        data.insert("ent-1".to_string(), upsert_input("hello world"));
        store.upsert(data).await.unwrap();

        let mut fields = HashMap::new();
        fields.insert("content".to_string(), serde_json::json!("malicious override"));
        fields.insert("community_description".to_string(), serde_json::json!("a summary"));
        let mut updates = HashMap::new();
        updates.insert("ent-1".to_string(), fields);
        store.update_payload(updates).await.unwrap();

        let hit = store.records.get("ent-1").unwrap();
        assert_eq!(hit.content, "hello world");
        assert_eq!(hit.payload.get("community_description").unwrap(), "a summary");
        assert!(!hit.payload.contains_key("content"));
    }

    #[tokio::test]
    async fn query_returns_closest_by_cosine() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(MockLlmProvider::default());
        let store = MemoryVectorStorage::new(provider, "entities");
        let mut data = HashMap::new();
        data.insert("a".to_string(), upsert_input("cats and dogs"));
        data.insert("b".to_string(), upsert_input("quantum computing"));
        store.upsert(data).await.unwrap();

        let results = store.query("cats", 1).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn update_payload_on_missing_id_does_not_error() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(MockLlmProvider::default());
        let store = MemoryVectorStorage::new(provider, "entities");
        let mut fields = HashMap::new();
        fields.insert("entity_type".to_string(), serde_json::json!("PERSON"));
        let mut updates = HashMap::new();
        updates.insert("ghost".to_string(), fields);
        store.update_payload(updates).await.unwrap();
    }
}
