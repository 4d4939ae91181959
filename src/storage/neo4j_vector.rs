//! Real Neo4j-backed `VectorStorage`, adapted from the teacher's
//! `vector_store.rs` (`CALL db.index.vector.queryNodes`). Feature-gated
//! behind `neo4j`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use neo4rs::{query, Graph};
use tracing::{debug, info};

use super::{VectorQueryResult, VectorStorage, VectorUpsertInput};
use crate::error::{GraphRagError, Result};
use crate::llm::EmbeddingProvider;

pub struct Neo4jVectorStorage {
    graph: Graph,
    embeddings: Arc<dyn EmbeddingProvider>,
    index_name: String,
    label: String,
    dimensions: u32,
}

impl Neo4jVectorStorage {
    pub fn new(
        graph: Graph,
        embeddings: Arc<dyn EmbeddingProvider>,
        index_name: impl Into<String>,
        label: impl Into<String>,
        dimensions: u32,
    ) -> Self {
        Self { graph, embeddings, index_name: index_name.into(), label: label.into(), dimensions }
    }

    pub async fn ensure_index(&self) -> Result<()> {
        let mut cursor = self
            .graph
            .execute(
                query("SHOW VECTOR INDEXES YIELD name WHERE name = $name RETURN name")
                    .param("name", self.index_name.as_str()),
            )
            .await
            .map_err(|e| GraphRagError::fatal(format!("index lookup failed: {e}")))?;

        if cursor
            .next()
            .await
            .map_err(|e| GraphRagError::fatal(format!("index lookup cursor failed: {e}")))?
            .is_some()
        {
            info!(index = self.index_name, "vector index already exists");
            return Ok(());
        }

        let cypher = format!(
            "CREATE VECTOR INDEX {name} FOR (n:{label}) ON (n.embedding) \
             OPTIONS {{indexConfig: {{`vector.dimensions`: {dims}, `vector.similarity_function`: 'cosine'}}}}",
            name = self.index_name,
            label = self.label,
            dims = self.dimensions,
        );
        self.graph
            .run(query(&cypher))
            .await
            .map_err(|e| GraphRagError::fatal(format!("index creation failed: {e}")))?;
        info!(index = self.index_name, "vector index created");
        Ok(())
    }
}

#[async_trait]
impl VectorStorage for Neo4jVectorStorage {
    async fn upsert(&self, data: HashMap<String, VectorUpsertInput>) -> Result<()> {
        let ids: Vec<String> = data.keys().cloned().collect();
        let texts: Vec<String> = ids.iter().map(|id| data[id].content.clone()).collect();
        let embeddings = self.embeddings.embed(&texts).await?;

        for (i, id) in ids.iter().enumerate() {
            let input = &data[id];
            let embedding: Vec<f64> = embeddings
                .get(i)
                .map(|v| v.iter().map(|f| *f as f64).collect())
                .unwrap_or_default();
            let payload_json = serde_json::to_string(&input.payload)?;
            self.graph
                .run(
                    query(&format!(
                        "MERGE (n:{label} {{id: $id}}) SET n.content = $content, n.embedding = $embedding, n.payload = $payload",
                        label = self.label
                    ))
                    .param("id", id.as_str())
                    .param("content", input.content.as_str())
                    .param("embedding", embedding)
                    .param("payload", payload_json),
                )
                .await
                .map_err(|e| GraphRagError::transient(format!("vector upsert failed: {e}")))?;
        }
        Ok(())
    }

    async fn update_payload(&self, updates: HashMap<String, HashMap<String, serde_json::Value>>) -> Result<()> {
        for (id, mut fields) in updates {
            if fields.remove("content").is_some() || fields.remove("embedding").is_some() {
                debug!(id, "dropped protected field(s) from neo4j payload update");
            }
            let mut cursor = self
                .graph
                .execute(
                    query(&format!("MATCH (n:{label} {{id: $id}}) RETURN n.payload AS payload", label = self.label))
                        .param("id", id.as_str()),
                )
                .await
                .map_err(|e| GraphRagError::transient(format!("payload read failed: {e}")))?;
            let existing: String = cursor
                .next()
                .await
                .map_err(|e| GraphRagError::transient(format!("payload cursor failed: {e}")))?
                .and_then(|row| row.get("payload"))
                .unwrap_or_else(|| "{}".to_string());
            let mut merged: HashMap<String, serde_json::Value> =
                serde_json::from_str(&existing).unwrap_or_default();
            merged.extend(fields);
            let payload_json = serde_json::to_string(&merged)?;

            self.graph
                .run(
                    query(&format!("MATCH (n:{label} {{id: $id}}) SET n.payload = $payload", label = self.label))
                        .param("id", id.as_str())
                        .param("payload", payload_json),
                )
                .await
                .map_err(|e| GraphRagError::transient(format!("payload write failed: {e}")))?;
        }
        Ok(())
    }

    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<VectorQueryResult>> {
        let embedding = self.embeddings.embed(&[text.to_string()]).await?;
        let Some(vector) = embedding.into_iter().next() else {
            return Ok(Vec::new());
        };
        let vector: Vec<f64> = vector.into_iter().map(|f| f as f64).collect();

        let mut cursor = self
            .graph
            .execute(
                query(
                    "CALL db.index.vector.queryNodes($index_name, $k, $embedding) \
                     YIELD node, score \
                     RETURN node.id AS id, score, node.payload AS payload \
                     ORDER BY score DESC",
                )
                .param("index_name", self.index_name.as_str())
                .param("k", top_k as i64)
                .param("embedding", vector),
            )
            .await
            .map_err(|e| GraphRagError::transient(format!("vector query failed: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = cursor
            .next()
            .await
            .map_err(|e| GraphRagError::transient(format!("vector query cursor failed: {e}")))?
        {
            let id: String = row.get("id").unwrap_or_default();
            let score: f64 = row.get("score").unwrap_or(0.0);
            let payload_str: String = row.get("payload").unwrap_or_else(|| "{}".to_string());
            let payload = serde_json::from_str(&payload_str).unwrap_or_default();
            out.push(VectorQueryResult { id, distance: score, payload });
        }
        Ok(out)
    }
}
