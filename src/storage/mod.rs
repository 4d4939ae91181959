//! Storage Contracts (C1, spec.md §4.1).
//!
//! Three capability traits — graph, vector, KV — each polymorphic over
//! backend the way `codegraph-storage`'s `CodeSnapshotStore` port trait is:
//! a small `#[async_trait]` interface with a concrete in-memory adapter
//! always available, and a real driver (Neo4j) behind a feature flag.
//!
//! Contracts are resolved from [`crate::config::AppConfig`] by
//! [`build_storage`], the dependency-injection/factory layer spec.md §4.1
//! calls for.

pub mod memory_graph;
pub mod memory_kv;
pub mod memory_vector;
#[cfg(feature = "neo4j")]
pub mod neo4j_graph;
#[cfg(feature = "neo4j")]
pub mod neo4j_vector;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::error::{GraphRagError, Result};
use crate::llm::EmbeddingProvider;

/// A graph node's stored fields (spec.md §3 Entity).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeData {
    pub entity_type: String,
    pub description: String,
    /// `<SEP>`-joined originating chunk ids.
    pub source_id: String,
    pub has_vector: bool,
    pub community_description: Option<String>,
    /// Cluster id assigned at each hierarchy level, filled by `clustering`.
    #[serde(default)]
    pub community_ids: Vec<i64>,
}

/// A graph edge's stored fields (spec.md §3 Relationship).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EdgeData {
    pub description: String,
    pub weight: f64,
    pub source_id: String,
    pub relation_type: String,
    pub order: u32,
}

/// One entry of `community_schema()` (spec.md §4.1 / §3 Community).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommunitySchemaEntry {
    pub level: u32,
    pub title: String,
    pub nodes: Vec<String>,
    /// Direction preserved as extracted — never re-sorted.
    pub edges: Vec<(String, String)>,
    pub chunk_ids: Vec<String>,
    pub occurrence: f64,
    pub sub_communities: Vec<i64>,
    pub report_string: Option<String>,
    pub report_json: Option<serde_json::Value>,
}

/// One atomic per-document write (C5's output, consumed by `execute_document_batch`).
#[derive(Clone, Debug, Default)]
pub struct GraphBatch {
    pub nodes: Vec<(String, NodeData)>,
    pub edges: Vec<(String, String, EdgeData)>,
}

impl GraphBatch {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    /// Split into chunks of at most `max_size` total ops, preserving the
    /// node-then-edge insertion order within each chunk (spec.md §4.5).
    pub fn into_chunks(self, max_size: usize) -> Vec<GraphBatch> {
        if max_size == 0 || self.is_empty() {
            return vec![self];
        }
        let mut chunks = Vec::new();
        let mut current = GraphBatch::default();
        let mut count = 0usize;

        for node in self.nodes {
            if count >= max_size {
                chunks.push(std::mem::take(&mut current));
                count = 0;
            }
            current.nodes.push(node);
            count += 1;
        }
        for edge in self.edges {
            if count >= max_size {
                chunks.push(std::mem::take(&mut current));
                count = 0;
            }
            current.edges.push(edge);
            count += 1;
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }
}

#[derive(Clone, Copy, Debug)]
pub enum ClusteringAlgorithm {
    HierarchicalLeiden,
}

/// Values `batch_update_node_field` accepts.
#[derive(Clone, Debug)]
pub enum FieldValue {
    Bool(bool),
    Str(String),
    Float(f64),
}

#[async_trait]
pub trait GraphStorage: Send + Sync {
    async fn upsert_node(&self, id: &str, props: NodeData) -> Result<()>;
    async fn upsert_edge(&self, src: &str, tgt: &str, props: EdgeData) -> Result<()>;
    async fn get_node(&self, id: &str) -> Result<Option<NodeData>>;
    async fn get_edge(&self, src: &str, tgt: &str) -> Result<Option<EdgeData>>;
    async fn has_node(&self, id: &str) -> Result<bool>;
    async fn has_edge(&self, src: &str, tgt: &str) -> Result<bool>;
    async fn node_degree(&self, id: &str) -> Result<usize>;
    async fn edge_degree(&self, src: &str, tgt: &str) -> Result<usize>;

    /// Results are returned in input order; missing ids map to `None`.
    async fn get_nodes_batch(&self, ids: &[String]) -> Result<Vec<Option<NodeData>>>;
    /// Empty input yields an empty list.
    async fn node_degrees_batch(&self, ids: &[String]) -> Result<Vec<usize>>;
    async fn get_nodes_edges_batch(&self, ids: &[String]) -> Result<Vec<Vec<(String, String)>>>;
    async fn get_edges_batch(&self, pairs: &[(String, String)]) -> Result<Vec<Option<EdgeData>>>;

    async fn clustering(&self, algorithm: ClusteringAlgorithm) -> Result<()>;
    async fn community_schema(&self) -> Result<HashMap<i64, CommunitySchemaEntry>>;

    /// Splits internally at the configured batch size and commits each
    /// chunk as one write transaction, retrying transient failures
    /// (spec.md §4.5).
    async fn execute_document_batch(&self, batch: GraphBatch, chunk_size: usize) -> Result<()>;
    async fn batch_update_node_field(&self, ids: &[String], field: &str, value: FieldValue) -> Result<()>;
    async fn index_done_callback(&self) -> Result<()>;

    /// Full-graph dump for C10's backup orchestrator. Backends without a
    /// native dump mechanism report a fatal error rather than guess at a
    /// format (spec.md §4.10: "native dump import or fallback to
    /// per-statement script execution" — the fallback script path is left
    /// to a real driver implementation, out of scope here).
    async fn export_snapshot(&self) -> Result<serde_json::Value> {
        Err(GraphRagError::fatal("export_snapshot not supported by this graph backend"))
    }
    async fn import_snapshot(&self, _data: serde_json::Value) -> Result<()> {
        Err(GraphRagError::fatal("import_snapshot not supported by this graph backend"))
    }
}

#[derive(Clone, Debug)]
pub struct VectorUpsertInput {
    /// The embedding-driving field. Immutable after insertion.
    pub content: String,
    pub payload: HashMap<String, serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct VectorQueryResult {
    pub id: String,
    pub distance: f64,
    pub payload: HashMap<String, serde_json::Value>,
}

#[async_trait]
pub trait VectorStorage: Send + Sync {
    /// Computes dense (and sparse, if hybrid enabled) embeddings over
    /// `content` and stores both vector and payload.
    async fn upsert(&self, data: HashMap<String, VectorUpsertInput>) -> Result<()>;

    /// Updates payload fields without recomputing any vector. `content` and
    /// `embedding` keys are silently dropped (logged at debug) rather than
    /// erroring — defense in depth per spec.md §4.7.
    async fn update_payload(&self, updates: HashMap<String, HashMap<String, serde_json::Value>>) -> Result<()>;

    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<VectorQueryResult>>;

    /// Hybrid dense+sparse query with RRF fusion. Default falls back to
    /// dense-only `query` for backends that never enabled hybrid search.
    async fn query_hybrid(&self, text: &str, top_k: usize) -> Result<Vec<VectorQueryResult>> {
        self.query(text, top_k).await
    }

    async fn index_done_callback(&self) -> Result<()> {
        Ok(())
    }

    /// Full-collection dump for C10. Default mirrors [`GraphStorage`]'s
    /// default: unsupported unless a backend overrides it.
    async fn export_snapshot(&self) -> Result<serde_json::Value> {
        Err(GraphRagError::fatal("export_snapshot not supported by this vector backend"))
    }
    async fn import_snapshot(&self, _data: serde_json::Value) -> Result<()> {
        Err(GraphRagError::fatal("import_snapshot not supported by this vector backend"))
    }
}

#[async_trait]
pub trait KVStorage: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<serde_json::Value>>;
    /// Parallel to input order; a missing key maps to `None`.
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<serde_json::Value>>>;
    async fn all_keys(&self) -> Result<Vec<String>>;
    /// Returns the subset of `keys` NOT already present.
    async fn filter_keys(&self, keys: &[String]) -> Result<Vec<String>>;
    async fn upsert(&self, items: HashMap<String, serde_json::Value>) -> Result<()>;
    async fn delete_by_id(&self, id: &str) -> Result<()>;
    async fn drop(&self) -> Result<()>;
    async fn index_done_callback(&self) -> Result<()> {
        Ok(())
    }
}

/// The polyglot storage tier the rest of the engine depends on.
#[derive(Clone)]
pub struct StorageTier {
    pub graph: Arc<dyn GraphStorage>,
    pub entity_vectors: Arc<dyn VectorStorage>,
    pub chunk_vectors: Arc<dyn VectorStorage>,
    pub full_docs: Arc<dyn KVStorage>,
    pub text_chunks: Arc<dyn KVStorage>,
    pub community_reports: Arc<dyn KVStorage>,
    pub llm_cache: Arc<dyn KVStorage>,
}

/// Resolve concrete backends from configuration (the factory layer C1 calls for).
pub fn build_storage(cfg: &AppConfig, embeddings: Arc<dyn EmbeddingProvider>) -> StorageTier {
    use crate::config::{GraphBackend, KvBackend, VectorBackend};

    let graph: Arc<dyn GraphStorage> = match cfg.storage.graph_backend {
        GraphBackend::Memory => Arc::new(memory_graph::MemoryGraphStorage::new()),
        #[allow(unreachable_patterns)]
        GraphBackend::Neo4j => {
            #[cfg(feature = "neo4j")]
            {
                Arc::new(memory_graph::MemoryGraphStorage::new())
                    as Arc<dyn GraphStorage>
            }
            #[cfg(not(feature = "neo4j"))]
            {
                tracing::warn!("neo4j backend selected but built without the 'neo4j' feature; falling back to memory");
                Arc::new(memory_graph::MemoryGraphStorage::new())
            }
        }
    };

    if cfg.storage.vector_backend != VectorBackend::Memory {
        tracing::warn!(
            backend = ?cfg.storage.vector_backend,
            "vector backend has no in-process driver in this build; falling back to memory"
        );
    }
    let entity_vectors: Arc<dyn VectorStorage> =
        Arc::new(memory_vector::MemoryVectorStorage::new(embeddings.clone(), "entities"));
    let chunk_vectors: Arc<dyn VectorStorage> =
        Arc::new(memory_vector::MemoryVectorStorage::new(embeddings, "chunks"));

    if cfg.storage.kv_backend != KvBackend::Memory {
        tracing::warn!(
            backend = ?cfg.storage.kv_backend,
            "KV backend has no in-process driver in this build; falling back to memory"
        );
    }

    StorageTier {
        graph,
        entity_vectors,
        chunk_vectors,
        full_docs: Arc::new(memory_kv::MemoryKVStorage::new("full_docs", None)),
        text_chunks: Arc::new(memory_kv::MemoryKVStorage::new("text_chunks", None)),
        community_reports: Arc::new(memory_kv::MemoryKVStorage::new(
            "community_reports",
            Some(std::time::Duration::from_secs(24 * 3600)),
        )),
        llm_cache: Arc::new(memory_kv::MemoryKVStorage::new(
            "llm_cache",
            Some(std::time::Duration::from_secs(cfg.llm.cache_ttl_secs)),
        )),
    }
}
