//! In-memory `GraphStorage` (the `networkx-equivalent` default backend).
//!
//! Grounded in the teacher's Neo4j usage pattern (per-document transaction,
//! `MERGE ... SET n += props` semantics) but backed by `dashmap` concurrent
//! maps instead of a driver — the concurrent-map choice follows
//! `codegraph-storage`'s `dashmap` dependency in the example pack.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;
use petgraph::algo::connected_components;
use petgraph::graph::{NodeIndex, UnGraph};
use tokio::time::sleep;
use tracing::{error, warn};

use super::{
    ClusteringAlgorithm, CommunitySchemaEntry, EdgeData, FieldValue, GraphBatch, GraphStorage,
    NodeData,
};
use crate::error::{GraphRagError, Result};

/// Simulated transient-failure injection for retry tests. Not part of the
/// public contract; set via [`MemoryGraphStorage::fail_next_commits`].
#[derive(Default)]
struct FailureInjector {
    remaining: std::sync::atomic::AtomicU32,
}

pub struct MemoryGraphStorage {
    nodes: DashMap<String, NodeData>,
    edges: DashMap<(String, String), EdgeData>,
    communities: DashMap<i64, CommunitySchemaEntry>,
    injector: FailureInjector,
}

impl MemoryGraphStorage {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            edges: DashMap::new(),
            communities: DashMap::new(),
            injector: FailureInjector::default(),
        }
    }

    /// Test hook: the next N calls to `execute_document_batch` raise a
    /// transient error before writing (used to exercise the retry path).
    #[cfg(test)]
    pub fn fail_next_commits(&self, n: u32) {
        self.injector.remaining.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    fn degree_of(&self, id: &str) -> usize {
        self.edges
            .iter()
            .filter(|e| e.key().0 == id || e.key().1 == id)
            .count()
    }

    async fn commit_chunk(&self, batch: &GraphBatch) -> Result<()> {
        if self.injector.remaining.load(std::sync::atomic::Ordering::SeqCst) > 0 {
            self.injector.remaining.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            return Err(GraphRagError::transient("simulated deadlock"));
        }

        for (id, props) in &batch.nodes {
            self.nodes
                .entry(id.clone())
                .and_modify(|existing| {
                    // SET n += props: field-level replace, no re-merge.
                    existing.entity_type = props.entity_type.clone();
                    existing.description = props.description.clone();
                    existing.source_id = props.source_id.clone();
                    existing.has_vector = props.has_vector;
                })
                .or_insert_with(|| props.clone());
        }
        for (src, tgt, props) in &batch.edges {
            if !self.nodes.contains_key(src) {
                self.nodes.insert(src.clone(), NodeData {
                    entity_type: "UNKNOWN".to_string(),
                    has_vector: false,
                    ..Default::default()
                });
            }
            if !self.nodes.contains_key(tgt) {
                self.nodes.insert(tgt.clone(), NodeData {
                    entity_type: "UNKNOWN".to_string(),
                    has_vector: false,
                    ..Default::default()
                });
            }
            self.edges.insert((src.clone(), tgt.clone()), props.clone());
        }
        Ok(())
    }
}

impl Default for MemoryGraphStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStorage for MemoryGraphStorage {
    async fn upsert_node(&self, id: &str, props: NodeData) -> Result<()> {
        self.nodes.insert(id.to_string(), props);
        Ok(())
    }

    async fn upsert_edge(&self, src: &str, tgt: &str, props: EdgeData) -> Result<()> {
        self.edges.insert((src.to_string(), tgt.to_string()), props);
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeData>> {
        Ok(self.nodes.get(id).map(|n| n.clone()))
    }

    async fn get_edge(&self, src: &str, tgt: &str) -> Result<Option<EdgeData>> {
        Ok(self.edges.get(&(src.to_string(), tgt.to_string())).map(|e| e.clone()))
    }

    async fn has_node(&self, id: &str) -> Result<bool> {
        Ok(self.nodes.contains_key(id))
    }

    async fn has_edge(&self, src: &str, tgt: &str) -> Result<bool> {
        Ok(self.edges.contains_key(&(src.to_string(), tgt.to_string())))
    }

    async fn node_degree(&self, id: &str) -> Result<usize> {
        Ok(self.degree_of(id))
    }

    async fn edge_degree(&self, src: &str, tgt: &str) -> Result<usize> {
        Ok(self.degree_of(src) + self.degree_of(tgt))
    }

    async fn get_nodes_batch(&self, ids: &[String]) -> Result<Vec<Option<NodeData>>> {
        Ok(ids.iter().map(|id| self.nodes.get(id).map(|n| n.clone())).collect())
    }

    async fn node_degrees_batch(&self, ids: &[String]) -> Result<Vec<usize>> {
        Ok(ids.iter().map(|id| self.degree_of(id)).collect())
    }

    async fn get_nodes_edges_batch(&self, ids: &[String]) -> Result<Vec<Vec<(String, String)>>> {
        Ok(ids
            .iter()
            .map(|id| {
                self.edges
                    .iter()
                    .filter(|e| &e.key().0 == id || &e.key().1 == id)
                    .map(|e| e.key().clone())
                    .collect()
            })
            .collect())
    }

    async fn get_edges_batch(&self, pairs: &[(String, String)]) -> Result<Vec<Option<EdgeData>>> {
        Ok(pairs
            .iter()
            .map(|key| self.edges.get(key).map(|e| e.clone()))
            .collect())
    }

    async fn clustering(&self, algorithm: ClusteringAlgorithm) -> Result<()> {
        let ClusteringAlgorithm::HierarchicalLeiden = algorithm;

        self.communities.clear();
        for mut node in self.nodes.iter_mut() {
            node.community_ids.clear();
        }

        let node_ids: Vec<String> = self.nodes.iter().map(|n| n.key().clone()).collect();
        if node_ids.is_empty() {
            return Ok(());
        }

        let mut index_of: HashMap<String, NodeIndex> = HashMap::new();
        let mut graph = UnGraph::<String, ()>::new_undirected();
        for id in &node_ids {
            let idx = graph.add_node(id.clone());
            index_of.insert(id.clone(), idx);
        }
        for edge in self.edges.iter() {
            let (src, tgt) = edge.key();
            if let (Some(&a), Some(&b)) = (index_of.get(src), index_of.get(tgt)) {
                graph.add_edge(a, b, ());
            }
        }

        // Level 0: connected components, coarsest grouping.
        let mut component_of: HashMap<NodeIndex, usize> = HashMap::new();
        let num_components = connected_components(&graph);
        {
            // petgraph's connected_components doesn't expose per-node labels
            // directly, so derive them via a union-find-free BFS pass.
            let mut visited = vec![false; graph.node_count()];
            let mut label = 0usize;
            for start in graph.node_indices() {
                if visited[start.index()] {
                    continue;
                }
                let mut stack = vec![start];
                while let Some(n) = stack.pop() {
                    if visited[n.index()] {
                        continue;
                    }
                    visited[n.index()] = true;
                    component_of.insert(n, label);
                    for neighbor in graph.neighbors(n) {
                        if !visited[neighbor.index()] {
                            stack.push(neighbor);
                        }
                    }
                }
                label += 1;
            }
            debug_assert_eq!(label, num_components);
        }

        let mut level0_members: HashMap<usize, Vec<NodeIndex>> = HashMap::new();
        for (&idx, &comp) in &component_of {
            level0_members.entry(comp).or_default().push(idx);
        }

        let total_edges = self.edges.len().max(1) as f64;
        let mut next_id: i64 = 0;
        let min_split_size = 4usize;

        for (_comp, members) in level0_members {
            let level0_id = next_id;
            next_id += 1;

            let member_ids: Vec<String> = members.iter().map(|&i| graph[i].clone()).collect();
            let member_set: HashSet<&str> = member_ids.iter().map(|s| s.as_str()).collect();

            let member_edges: Vec<(String, String)> = self
                .edges
                .iter()
                .filter(|e| member_set.contains(e.key().0.as_str()) && member_set.contains(e.key().1.as_str()))
                .map(|e| e.key().clone())
                .collect();

            let chunk_ids: HashSet<String> = member_ids
                .iter()
                .filter_map(|id| self.nodes.get(id).map(|n| crate::text_util::sep_split(&n.source_id)))
                .flatten()
                .collect();

            let mut sub_ids = Vec::new();
            if member_ids.len() >= min_split_size {
                // Refine level 0 into two finer sub-communities at level 1
                // by degree rank (deterministic stand-in for a real Leiden
                // refinement pass — see DESIGN.md).
                let mut by_degree: Vec<(String, usize)> = member_ids
                    .iter()
                    .map(|id| (id.clone(), self.degree_of(id)))
                    .collect();
                by_degree.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
                let mid = by_degree.len() / 2;
                let halves = [&by_degree[..mid], &by_degree[mid..]];

                for half in halves {
                    if half.is_empty() {
                        continue;
                    }
                    let sub_id = next_id;
                    next_id += 1;
                    let sub_set: HashSet<&str> = half.iter().map(|(id, _)| id.as_str()).collect();
                    let sub_edges: Vec<(String, String)> = member_edges
                        .iter()
                        .filter(|(s, t)| sub_set.contains(s.as_str()) && sub_set.contains(t.as_str()))
                        .cloned()
                        .collect();
                    let sub_nodes: Vec<String> = half.iter().map(|(id, _)| id.clone()).collect();
                    let sub_chunks: HashSet<String> = sub_nodes
                        .iter()
                        .filter_map(|id| self.nodes.get(id).map(|n| crate::text_util::sep_split(&n.source_id)))
                        .flatten()
                        .collect();
                    let occurrence = sub_edges.len() as f64 / total_edges;

                    self.communities.insert(sub_id, CommunitySchemaEntry {
                        level: 1,
                        title: format!("Community {sub_id}"),
                        nodes: sub_nodes.clone(),
                        edges: sub_edges,
                        chunk_ids: sub_chunks.into_iter().collect(),
                        occurrence,
                        sub_communities: Vec::new(),
                        report_string: None,
                        report_json: None,
                    });
                    sub_ids.push(sub_id);

                    for id in sub_nodes {
                        if let Some(mut node) = self.nodes.get_mut(&id) {
                            node.community_ids.push(sub_id);
                        }
                    }
                }
            }

            let occurrence = member_edges.len() as f64 / total_edges;
            self.communities.insert(level0_id, CommunitySchemaEntry {
                level: 0,
                title: format!("Community {level0_id}"),
                nodes: member_ids.clone(),
                edges: member_edges,
                chunk_ids: chunk_ids.into_iter().collect(),
                occurrence,
                sub_communities: sub_ids,
                report_string: None,
                report_json: None,
            });

            for id in &member_ids {
                if let Some(mut node) = self.nodes.get_mut(id) {
                    node.community_ids.push(level0_id);
                }
            }
        }

        Ok(())
    }

    async fn community_schema(&self) -> Result<HashMap<i64, CommunitySchemaEntry>> {
        Ok(self.communities.iter().map(|e| (*e.key(), e.value().clone())).collect())
    }

    async fn execute_document_batch(&self, batch: GraphBatch, chunk_size: usize) -> Result<()> {
        for chunk in batch.into_chunks(chunk_size) {
            if chunk.is_empty() {
                continue;
            }
            let mut attempt = 0u32;
            let max_attempts = 3u32;
            let mut backoff_ms = 2_000u64;
            loop {
                match self.commit_chunk(&chunk).await {
                    Ok(()) => break,
                    Err(err) if err.retryable && attempt + 1 < max_attempts => {
                        attempt += 1;
                        warn!(attempt, "transient graph write failure, retrying: {}", err.message);
                        sleep(std::time::Duration::from_millis(backoff_ms)).await;
                        backoff_ms = (backoff_ms * 2).min(10_000);
                    }
                    Err(err) if err.retryable => {
                        error!("graph write failed after {attempt} retries: {}", err.message);
                        return Err(err);
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    async fn batch_update_node_field(&self, ids: &[String], field: &str, value: FieldValue) -> Result<()> {
        for id in ids {
            let Some(mut node) = self.nodes.get_mut(id) else {
                return Err(GraphRagError::consistency(format!(
                    "batch_update_node_field({field}) requested for unknown node '{id}'"
                )));
            };
            match (field, &value) {
                ("has_vector", FieldValue::Bool(b)) => node.has_vector = *b,
                ("community_description", FieldValue::Str(s)) => {
                    node.community_description = Some(s.clone())
                }
                ("entity_type", FieldValue::Str(s)) => node.entity_type = s.clone(),
                _ => {
                    return Err(GraphRagError::fatal(format!(
                        "unsupported batch_update_node_field target: {field}"
                    )))
                }
            }
        }
        Ok(())
    }

    async fn index_done_callback(&self) -> Result<()> {
        Ok(())
    }

    async fn export_snapshot(&self) -> Result<serde_json::Value> {
        let nodes: Vec<(String, NodeData)> = self.nodes.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
        let edges: Vec<(String, String, EdgeData)> =
            self.edges.iter().map(|e| (e.key().0.clone(), e.key().1.clone(), e.value().clone())).collect();
        let communities: Vec<(i64, CommunitySchemaEntry)> =
            self.communities.iter().map(|e| (*e.key(), e.value().clone())).collect();
        Ok(serde_json::json!({ "nodes": nodes, "edges": edges, "communities": communities }))
    }

    async fn import_snapshot(&self, data: serde_json::Value) -> Result<()> {
        self.nodes.clear();
        self.edges.clear();
        self.communities.clear();

        let nodes: Vec<(String, NodeData)> = serde_json::from_value(
            data.get("nodes").cloned().unwrap_or(serde_json::Value::Null),
        )
        .map_err(GraphRagError::from)?;
        let edges: Vec<(String, String, EdgeData)> = serde_json::from_value(
            data.get("edges").cloned().unwrap_or(serde_json::Value::Null),
        )
        .map_err(GraphRagError::from)?;
        let communities: Vec<(i64, CommunitySchemaEntry)> = serde_json::from_value(
            data.get("communities").cloned().unwrap_or(serde_json::Value::Null),
        )
        .map_err(GraphRagError::from)?;

        for (id, node) in nodes {
            self.nodes.insert(id, node);
        }
        for (src, tgt, edge) in edges {
            self.edges.insert((src, tgt), edge);
        }
        for (id, entry) in communities {
            self.communities.insert(id, entry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(has_vector: bool) -> NodeData {
        NodeData {
            entity_type: "PERSON".to_string(),
            description: "desc".to_string(),
            source_id: "chunk-1".to_string(),
            has_vector,
            community_description: None,
            community_ids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn placeholder_node_created_for_unknown_edge_endpoint() {
        let store = MemoryGraphStorage::new();
        let mut batch = GraphBatch::default();
        batch.edges.push((
            "A".to_string(),
            "B".to_string(),
            EdgeData { relation_type: "RELATED".to_string(), weight: 1.0, ..Default::default() },
        ));
        store.execute_document_batch(batch, 1000).await.unwrap();

        let a = store.get_node("A").await.unwrap().unwrap();
        assert!(!a.has_vector);
        assert_eq!(a.entity_type, "UNKNOWN");
    }

    #[tokio::test]
    async fn set_replace_semantics_on_existing_node() {
        let store = MemoryGraphStorage::new();
        store.upsert_node("A", node(true)).await.unwrap();

        let mut batch = GraphBatch::default();
        batch.nodes.push(("A".to_string(), NodeData {
            entity_type: "ORGANIZATION".to_string(),
            description: "updated".to_string(),
            source_id: "chunk-2".to_string(),
            has_vector: false,
            community_description: None,
            community_ids: Vec::new(),
        }));
        store.execute_document_batch(batch, 1000).await.unwrap();

        let a = store.get_node("A").await.unwrap().unwrap();
        assert_eq!(a.entity_type, "ORGANIZATION");
        assert_eq!(a.description, "updated");
    }

    #[tokio::test]
    async fn retry_then_succeed_on_transient_error() {
        let store = MemoryGraphStorage::new();
        store.fail_next_commits(2);
        let mut batch = GraphBatch::default();
        batch.nodes.push(("A".to_string(), node(true)));
        store.execute_document_batch(batch, 1000).await.unwrap();
        assert!(store.has_node("A").await.unwrap());
    }

    #[tokio::test]
    async fn batch_update_unknown_id_is_consistency_error() {
        let store = MemoryGraphStorage::new();
        let err = store
            .batch_update_node_field(&["ghost".to_string()], "has_vector", FieldValue::Bool(true))
            .await
            .unwrap_err();
        assert!(err.message.starts_with("UNEXPECTED:"));
    }

    #[tokio::test]
    async fn clustering_groups_connected_nodes_into_one_community() {
        let store = MemoryGraphStorage::new();
        store.upsert_node("A", node(true)).await.unwrap();
        store.upsert_node("B", node(true)).await.unwrap();
        store.upsert_edge("A", "B", EdgeData { relation_type: "RELATED".to_string(), ..Default::default() }).await.unwrap();

        store.clustering(ClusteringAlgorithm::HierarchicalLeiden).await.unwrap();
        let schema = store.community_schema().await.unwrap();
        assert_eq!(schema.len(), 1);
        let community = schema.values().next().unwrap();
        assert_eq!(community.level, 0);
        assert!(community.nodes.contains(&"A".to_string()));
        assert!(community.nodes.contains(&"B".to_string()));
    }

    #[tokio::test]
    async fn node_degrees_batch_empty_input_is_empty_output() {
        let store = MemoryGraphStorage::new();
        let degrees = store.node_degrees_batch(&[]).await.unwrap();
        assert!(degrees.is_empty());
    }

    #[tokio::test]
    async fn get_nodes_batch_preserves_order_with_nulls() {
        let store = MemoryGraphStorage::new();
        store.upsert_node("A", node(true)).await.unwrap();
        let results = store
            .get_nodes_batch(&["A".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert!(results[0].is_some());
        assert!(results[1].is_none());
    }
}
