//! Configuration (spec.md §6). Typed, env-driven, teacher-style: `from_env`
//! reads `std::env::var` with `unwrap_or_else` defaults, never panics on a
//! bad value — invalid enums log a warning and fall back instead.

use std::collections::HashMap;
use std::env;

use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphBackend {
    Memory,
    Neo4j,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorBackend {
    Memory,
    Qdrant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KvBackend {
    Memory,
    Redis,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkingStrategy {
    FixedWindow,
    SeparatorGuided,
}

fn parse_enum_or_default<T: Copy>(var: &str, default: T, mapper: impl Fn(&str) -> Option<T>) -> T {
    match env::var(var) {
        Ok(raw) => match mapper(&raw.to_lowercase()) {
            Some(value) => value,
            None => {
                warn!("unrecognized value '{raw}' for {var}, falling back to default");
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_num_or_default<T: std::str::FromStr + Copy>(var: &str, default: T) -> T {
    match env::var(var) {
        Ok(raw) => raw.parse::<T>().unwrap_or_else(|_| {
            warn!("invalid numeric value for {var}='{raw}', falling back to default");
            default
        }),
        Err(_) => default,
    }
}

#[derive(Clone, Debug)]
pub struct HybridSearchConfig {
    pub enabled: bool,
    pub device: String,
    pub rrf_k: u32,
    pub sparse_top_k_multiplier: u32,
    pub dense_top_k_multiplier: u32,
    pub timeout_ms: u64,
}

impl Default for HybridSearchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device: "cpu".to_string(),
            rrf_k: 60,
            sparse_top_k_multiplier: 2,
            dense_top_k_multiplier: 1,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub graph_backend: GraphBackend,
    pub vector_backend: VectorBackend,
    pub kv_backend: KvBackend,
    pub hybrid_search: HybridSearchConfig,
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub neo4j_batch_size: usize,
    pub neo4j_max_connection_pool_size: u32,
    pub neo4j_connection_timeout_secs: u64,
    pub neo4j_encrypted: bool,
    pub neo4j_max_transaction_retry_time_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            graph_backend: GraphBackend::Memory,
            vector_backend: VectorBackend::Memory,
            kv_backend: KvBackend::Memory,
            hybrid_search: HybridSearchConfig::default(),
            neo4j_uri: "bolt://localhost:7687".to_string(),
            neo4j_user: "neo4j".to_string(),
            neo4j_password: String::new(),
            neo4j_batch_size: 1000,
            neo4j_max_connection_pool_size: 50,
            neo4j_connection_timeout_secs: 30,
            neo4j_encrypted: false,
            neo4j_max_transaction_retry_time_secs: 30,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EntityExtractionConfig {
    pub entity_types: Vec<String>,
    pub max_gleaning: u32,
    pub max_continuation_attempts: u32,
    /// Ordered (pattern, relation_type) pairs. A `Vec`, not a `HashMap`: the
    /// first-match substring scan is order-dependent (spec.md §9 Open
    /// Question), so callers must supply the order explicitly.
    pub relation_patterns: Vec<(String, String)>,
    pub enable_type_prefix_embeddings: bool,
}

impl Default for EntityExtractionConfig {
    fn default() -> Self {
        Self {
            entity_types: vec![
                "PERSON".to_string(),
                "ORGANIZATION".to_string(),
                "LOCATION".to_string(),
                "LAW".to_string(),
                "EVENT".to_string(),
                "CONCEPT".to_string(),
            ],
            max_gleaning: 1,
            max_continuation_attempts: 2,
            relation_patterns: Vec::new(),
            enable_type_prefix_embeddings: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub max_concurrent: usize,
    pub embedding_max_concurrent: usize,
    pub community_report_max_concurrency: usize,
    pub community_report_token_budget_ratio: f64,
    pub community_report_chat_overhead: u32,
    pub model_context_tokens: u32,
    pub chat_model: String,
    pub embedding_model: String,
    pub cache_ttl_secs: u64,
    /// Above this many (whitespace-estimated) tokens, a merged node's
    /// `<SEP>`-joined description is collapsed via the `entity_relation_summary`
    /// prompt instead of growing unbounded (spec.md §4.5).
    pub entity_summary_token_budget: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            embedding_max_concurrent: 8,
            community_report_max_concurrency: 8,
            community_report_token_budget_ratio: 0.75,
            community_report_chat_overhead: 1000,
            model_context_tokens: 8192,
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            cache_ttl_secs: 12 * 3600,
            entity_summary_token_budget: 500,
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueryConfig {
    pub local_template: Option<String>,
    pub global_template: Option<String>,
    pub enable_naive_rag: bool,
    pub local_max_token_budget: u32,
    pub global_community_level: u32,
    pub global_group_size: usize,
    /// How many entities the local-mode vector search retrieves before
    /// degree ranking and token-budget truncation whittle it down.
    pub local_top_k_entities: usize,
    /// How many chunks the naive-mode vector search retrieves.
    pub naive_top_k_chunks: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            local_template: None,
            global_template: None,
            enable_naive_rag: false,
            local_max_token_budget: 4000,
            global_community_level: 0,
            global_group_size: 10,
            local_top_k_entities: 20,
            naive_top_k_chunks: 10,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChunkingConfig {
    pub size: u32,
    pub overlap: u32,
    pub strategy: ChunkingStrategy,
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: 1200,
            overlap: 100,
            strategy: ChunkingStrategy::FixedWindow,
            separators: vec![
                "\n\n".to_string(),
                "\n".to_string(),
                ". ".to_string(),
                " ".to_string(),
            ],
        }
    }
}

/// Full application configuration, generalizing the teacher's flat
/// `AppConfig` into the option tree of spec.md §6.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub storage: StorageConfig,
    pub entity_extraction: EntityExtractionConfig,
    pub llm: LlmConfig,
    pub query: QueryConfig,
    pub chunking: ChunkingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:3322".to_string(),
            storage: StorageConfig::default(),
            entity_extraction: EntityExtractionConfig::default(),
            llm: LlmConfig::default(),
            query: QueryConfig::default(),
            chunking: ChunkingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the environment (`.env` honored via `dotenvy`
    /// in `main.rs`), falling back to defaults and logging a warning on any
    /// unrecognized value. Never fails outright — validation errors are
    /// warnings per spec.md §7.
    pub fn from_env() -> Self {
        let mut cfg = AppConfig::default();

        cfg.server_addr = env::var("SERVER_ADDR").unwrap_or(cfg.server_addr);

        cfg.storage.graph_backend = parse_enum_or_default(
            "STORAGE_GRAPH_BACKEND",
            cfg.storage.graph_backend,
            |s| match s {
                "memory" | "networkx" => Some(GraphBackend::Memory),
                "neo4j" => Some(GraphBackend::Neo4j),
                _ => None,
            },
        );
        cfg.storage.vector_backend = parse_enum_or_default(
            "STORAGE_VECTOR_BACKEND",
            cfg.storage.vector_backend,
            |s| match s {
                "memory" | "nano" | "hnsw" => Some(VectorBackend::Memory),
                "qdrant" => Some(VectorBackend::Qdrant),
                _ => None,
            },
        );
        cfg.storage.kv_backend = parse_enum_or_default(
            "STORAGE_KV_BACKEND",
            cfg.storage.kv_backend,
            |s| match s {
                "memory" | "json" => Some(KvBackend::Memory),
                "redis" => Some(KvBackend::Redis),
                _ => None,
            },
        );
        cfg.storage.hybrid_search.enabled = env::var("STORAGE_HYBRID_SEARCH_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(cfg.storage.hybrid_search.enabled);
        cfg.storage.neo4j_uri = env::var("NEO4J_URI").unwrap_or(cfg.storage.neo4j_uri);
        cfg.storage.neo4j_user = env::var("NEO4J_USER").unwrap_or(cfg.storage.neo4j_user);
        cfg.storage.neo4j_password = env::var("NEO4J_PASSWORD").unwrap_or(cfg.storage.neo4j_password);
        cfg.storage.neo4j_batch_size =
            parse_num_or_default("NEO4J_BATCH_SIZE", cfg.storage.neo4j_batch_size);

        cfg.llm.max_concurrent = parse_num_or_default("LLM_MAX_CONCURRENT", cfg.llm.max_concurrent);
        cfg.llm.community_report_max_concurrency = parse_num_or_default(
            "LLM_COMMUNITY_REPORT_MAX_CONCURRENCY",
            cfg.llm.community_report_max_concurrency,
        );
        cfg.llm.chat_model = env::var("LLM_CHAT_MODEL").unwrap_or(cfg.llm.chat_model);
        cfg.llm.embedding_model = env::var("LLM_EMBEDDING_MODEL").unwrap_or(cfg.llm.embedding_model);
        cfg.llm.entity_summary_token_budget =
            parse_num_or_default("LLM_ENTITY_SUMMARY_TOKEN_BUDGET", cfg.llm.entity_summary_token_budget);

        cfg.query.enable_naive_rag = env::var("QUERY_ENABLE_NAIVE_RAG")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(cfg.query.enable_naive_rag);
        cfg.query.local_template = env::var("QUERY_LOCAL_TEMPLATE").ok();
        cfg.query.global_template = env::var("QUERY_GLOBAL_TEMPLATE").ok();

        cfg.chunking.size = parse_num_or_default("CHUNKING_SIZE", cfg.chunking.size);
        cfg.chunking.overlap = parse_num_or_default("CHUNKING_OVERLAP", cfg.chunking.overlap);

        if cfg.chunking.overlap >= cfg.chunking.size {
            warn!(
                "CHUNKING_OVERLAP ({}) must be < CHUNKING_SIZE ({}); falling back to defaults",
                cfg.chunking.overlap, cfg.chunking.size
            );
            let default = ChunkingConfig::default();
            cfg.chunking.size = default.size;
            cfg.chunking.overlap = default.overlap;
        }

        cfg
    }

    /// Entity-type lookup table normalized the way extraction expects it.
    pub fn entity_type_set(&self) -> HashMap<String, String> {
        self.entity_extraction
            .entity_types
            .iter()
            .map(|t| (t.to_uppercase(), t.to_uppercase()))
            .collect()
    }
}
