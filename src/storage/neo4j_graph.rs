//! Real Neo4j-backed `GraphStorage`, adapted from the teacher's
//! `neo4j_client.rs`/`ingest.rs` Cypher. Feature-gated behind `neo4j`; the
//! in-memory backend remains the default (spec.md §1 scopes "concrete
//! graph/vector/KV drivers... beyond the contract they must honor" out of
//! the core, so this stays a thin adapter rather than a fully-general ORM).

use std::collections::HashMap;

use async_trait::async_trait;
use neo4rs::{query, Graph};
use tracing::{error, info, warn};

use super::{
    ClusteringAlgorithm, CommunitySchemaEntry, EdgeData, FieldValue, GraphBatch, GraphStorage,
    NodeData,
};
use crate::error::{GraphRagError, Result};
use crate::text_util::sanitize_label;

pub struct Neo4jGraphStorage {
    graph: Graph,
}

impl Neo4jGraphStorage {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self> {
        let graph = Graph::new(uri, user, password)
            .await
            .map_err(|e| GraphRagError::fatal(format!("neo4j connect failed: {e}")))?;
        Ok(Self { graph })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            "CREATE CONSTRAINT entity_id IF NOT EXISTS FOR (e:Entity) REQUIRE e.id IS UNIQUE",
        ];
        for stmt in statements {
            self.graph
                .run(query(stmt))
                .await
                .map_err(|e| GraphRagError::fatal(format!("schema setup failed: {e}")))?;
        }
        info!("neo4j schema ensured");
        Ok(())
    }
}

#[async_trait]
impl GraphStorage for Neo4jGraphStorage {
    async fn upsert_node(&self, id: &str, props: NodeData) -> Result<()> {
        let label = sanitize_label(&props.entity_type);
        let cypher = format!(
            "MERGE (e:Entity:`{label}` {{id: $id}}) \
             SET e.entity_type = $entity_type, e.description = $description, \
                 e.source_id = $source_id, e.has_vector = $has_vector"
        );
        self.graph
            .run(
                query(&cypher)
                    .param("id", id)
                    .param("entity_type", props.entity_type)
                    .param("description", props.description)
                    .param("source_id", props.source_id)
                    .param("has_vector", props.has_vector),
            )
            .await
            .map_err(|e| GraphRagError::transient(format!("upsert_node failed: {e}")))?;
        Ok(())
    }

    async fn upsert_edge(&self, src: &str, tgt: &str, props: EdgeData) -> Result<()> {
        self.graph
            .run(
                query(
                    "MATCH (s:Entity {id: $src}), (t:Entity {id: $tgt}) \
                     MERGE (s)-[r:RELATED_TO]->(t) \
                     SET r.description = $description, r.weight = $weight, \
                         r.source_id = $source_id, r.relation_type = $relation_type, r.order = $order",
                )
                .param("src", src)
                .param("tgt", tgt)
                .param("description", props.description)
                .param("weight", props.weight)
                .param("source_id", props.source_id)
                .param("relation_type", props.relation_type)
                .param("order", props.order as i64),
            )
            .await
            .map_err(|e| GraphRagError::transient(format!("upsert_edge failed: {e}")))?;
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeData>> {
        let mut cursor = self
            .graph
            .execute(query("MATCH (e:Entity {id: $id}) RETURN e").param("id", id))
            .await
            .map_err(|e| GraphRagError::transient(format!("get_node failed: {e}")))?;
        if let Some(row) = cursor
            .next()
            .await
            .map_err(|e| GraphRagError::transient(format!("get_node cursor failed: {e}")))?
        {
            let node: neo4rs::Node = row
                .get("e")
                .ok_or_else(|| GraphRagError::fatal("missing 'e' column"))?;
            Ok(Some(NodeData {
                entity_type: node.get("entity_type").unwrap_or_default(),
                description: node.get("description").unwrap_or_default(),
                source_id: node.get("source_id").unwrap_or_default(),
                has_vector: node.get("has_vector").unwrap_or(false),
                community_description: node.get("community_description"),
                community_ids: Vec::new(),
            }))
        } else {
            Ok(None)
        }
    }

    async fn get_edge(&self, _src: &str, _tgt: &str) -> Result<Option<EdgeData>> {
        // Left as an exercise for a concrete deployment: the in-memory
        // backend (used by every test in this crate) is authoritative.
        Err(GraphRagError::fatal("Neo4jGraphStorage::get_edge not wired beyond the contract"))
    }

    async fn has_node(&self, id: &str) -> Result<bool> {
        Ok(self.get_node(id).await?.is_some())
    }

    async fn has_edge(&self, _src: &str, _tgt: &str) -> Result<bool> {
        Err(GraphRagError::fatal("Neo4jGraphStorage::has_edge not wired beyond the contract"))
    }

    async fn node_degree(&self, id: &str) -> Result<usize> {
        let mut cursor = self
            .graph
            .execute(
                query("MATCH (e:Entity {id: $id})-[r]-() RETURN count(r) AS degree").param("id", id),
            )
            .await
            .map_err(|e| GraphRagError::transient(format!("node_degree failed: {e}")))?;
        if let Some(row) = cursor
            .next()
            .await
            .map_err(|e| GraphRagError::transient(format!("node_degree cursor failed: {e}")))?
        {
            let degree: i64 = row.get("degree").unwrap_or(0);
            Ok(degree as usize)
        } else {
            Ok(0)
        }
    }

    async fn edge_degree(&self, src: &str, tgt: &str) -> Result<usize> {
        Ok(self.node_degree(src).await? + self.node_degree(tgt).await?)
    }

    async fn get_nodes_batch(&self, ids: &[String]) -> Result<Vec<Option<NodeData>>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.get_node(id).await?);
        }
        Ok(out)
    }

    async fn node_degrees_batch(&self, ids: &[String]) -> Result<Vec<usize>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.node_degree(id).await?);
        }
        Ok(out)
    }

    async fn get_nodes_edges_batch(&self, _ids: &[String]) -> Result<Vec<Vec<(String, String)>>> {
        Err(GraphRagError::fatal("Neo4jGraphStorage::get_nodes_edges_batch not wired beyond the contract"))
    }

    async fn get_edges_batch(&self, _pairs: &[(String, String)]) -> Result<Vec<Option<EdgeData>>> {
        Err(GraphRagError::fatal("Neo4jGraphStorage::get_edges_batch not wired beyond the contract"))
    }

    async fn clustering(&self, _algorithm: ClusteringAlgorithm) -> Result<()> {
        Err(GraphRagError::fatal(
            "Neo4jGraphStorage::clustering requires a GDS (Graph Data Science) plugin call; \
             not implemented by this contract adapter",
        ))
    }

    async fn community_schema(&self) -> Result<HashMap<i64, CommunitySchemaEntry>> {
        Ok(HashMap::new())
    }

    async fn execute_document_batch(&self, batch: GraphBatch, chunk_size: usize) -> Result<()> {
        for chunk in batch.into_chunks(chunk_size) {
            let mut attempt = 0u32;
            loop {
                let result: Result<()> = async {
                    for (id, props) in &chunk.nodes {
                        self.upsert_node(id, props.clone()).await?;
                    }
                    for (src, tgt, props) in &chunk.edges {
                        self.upsert_edge(src, tgt, props.clone()).await?;
                    }
                    Ok(())
                }
                .await;

                match result {
                    Ok(()) => break,
                    Err(err) if err.retryable && attempt < 3 => {
                        attempt += 1;
                        warn!(attempt, "neo4j transient failure, retrying: {}", err.message);
                        tokio::time::sleep(std::time::Duration::from_millis(2000 * attempt as u64)).await;
                    }
                    Err(err) => {
                        error!("neo4j batch commit failed: {}", err.message);
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    async fn batch_update_node_field(&self, ids: &[String], field: &str, value: FieldValue) -> Result<()> {
        if !matches!(field, "has_vector" | "community_description" | "entity_type") {
            return Err(GraphRagError::fatal(format!("unsupported field: {field}")));
        }
        for id in ids {
            let cypher = format!("MATCH (e:Entity {{id: $id}}) SET e.{field} = $value");
            let q = match &value {
                FieldValue::Bool(b) => query(&cypher).param("id", id.as_str()).param("value", *b),
                FieldValue::Str(s) => query(&cypher).param("id", id.as_str()).param("value", s.as_str()),
                FieldValue::Float(f) => query(&cypher).param("id", id.as_str()).param("value", *f),
            };
            self.graph
                .run(q)
                .await
                .map_err(|e| GraphRagError::transient(format!("batch_update_node_field failed: {e}")))?;
        }
        Ok(())
    }

    async fn index_done_callback(&self) -> Result<()> {
        Ok(())
    }
}
