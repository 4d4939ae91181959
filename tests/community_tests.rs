//! Community Engine integration coverage: the pool-exhaustion regression
//! from spec.md §8 scenario 4 -- many independent communities summarized
//! under a bounded-concurrency gateway must never have more in-flight
//! completions than `community_report_max_concurrency` allows, and every
//! community must still get a report.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use graphrag_engine::community::run_community_pass;
use graphrag_engine::config::LlmConfig;
use graphrag_engine::error::Result;
use graphrag_engine::llm::mock::MockLlmProvider;
use graphrag_engine::llm::{ChatTurn, CompletionOptions, EmbeddingProvider, LlmGateway, SparseVector};
use graphrag_engine::storage::memory_graph::MemoryGraphStorage;
use graphrag_engine::storage::memory_kv::MemoryKVStorage;
use graphrag_engine::storage::{EdgeData, GraphStorage, KVStorage, NodeData};

/// Tracks in-flight `complete` calls so the test can assert the bound held,
/// the way a real connection-pool exhaustion would show up as "more
/// concurrent checkouts than the pool size".
struct ConcurrencyTrackingGateway {
    inner: MockLlmProvider,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyTrackingGateway {
    fn new() -> Self {
        Self { inner: MockLlmProvider::default(), in_flight: AtomicUsize::new(0), peak: AtomicUsize::new(0) }
    }

    fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for ConcurrencyTrackingGateway {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.inner.embed(texts).await
    }
    async fn sparse_embed(&self, texts: &[String]) -> Result<Vec<SparseVector>> {
        self.inner.sparse_embed(texts).await
    }
}

#[async_trait]
impl LlmGateway for ConcurrencyTrackingGateway {
    async fn complete(&self, prompt: &str, history: &[ChatTurn], options: &CompletionOptions) -> Result<String> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = self.inner.complete(prompt, history, options).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Builds `pairs` disjoint two-node components, none reaching the size-4
/// split threshold, so every pair becomes exactly one level-0 community.
async fn seed_disjoint_pairs(graph: &MemoryGraphStorage, pairs: usize) {
    for i in 0..pairs {
        let a = format!("ENTITY-{i}-A");
        let b = format!("ENTITY-{i}-B");
        graph
            .upsert_node(&a, NodeData { entity_type: "PERSON".to_string(), description: a.clone(), has_vector: true, ..Default::default() })
            .await
            .unwrap();
        graph
            .upsert_node(&b, NodeData { entity_type: "PERSON".to_string(), description: b.clone(), has_vector: true, ..Default::default() })
            .await
            .unwrap();
        graph.upsert_edge(&a, &b, EdgeData { relation_type: "RELATED".to_string(), weight: 1.0, ..Default::default() }).await.unwrap();
    }
}

#[tokio::test]
async fn community_pass_never_exceeds_the_configured_concurrency_bound() {
    let graph = MemoryGraphStorage::new();
    seed_disjoint_pairs(&graph, 20).await;

    let reports: Arc<dyn KVStorage> = Arc::new(MemoryKVStorage::new("community_reports", None));
    let gateway = ConcurrencyTrackingGateway::new();
    let cfg = LlmConfig { community_report_max_concurrency: 3, ..LlmConfig::default() };

    let count = run_community_pass(&graph, reports.as_ref(), &gateway, &cfg).await.unwrap();

    assert_eq!(count, 20, "every disjoint pair must still get exactly one community report");
    assert!(
        gateway.peak_concurrency() <= 3,
        "peak in-flight completions ({}) must never exceed community_report_max_concurrency (3)",
        gateway.peak_concurrency()
    );
}

#[tokio::test]
async fn community_pass_with_concurrency_one_is_fully_serialized() {
    let graph = MemoryGraphStorage::new();
    seed_disjoint_pairs(&graph, 6).await;

    let reports: Arc<dyn KVStorage> = Arc::new(MemoryKVStorage::new("community_reports", None));
    let gateway = ConcurrencyTrackingGateway::new();
    let cfg = LlmConfig { community_report_max_concurrency: 1, ..LlmConfig::default() };

    let count = run_community_pass(&graph, reports.as_ref(), &gateway, &cfg).await.unwrap();

    assert_eq!(count, 6);
    assert_eq!(gateway.peak_concurrency(), 1, "concurrency=1 must serialize every summarization call");
}
