//! Wiring only: load config, resolve storage/gateway backends, start the
//! `axum` server. Carried forward from the teacher's own `main.rs` shape
//! (dotenvy + tracing_subscriber + graceful-shutdown channel + open the
//! browser), rewired to the new module tree (SPEC_FULL.md §0).

use std::sync::{Arc, Mutex};

use axum::Router;
use tokio::sync::oneshot;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use graphrag_engine::app_state::{AppState, Status};
use graphrag_engine::chunking::{Tokenizer, WhitespaceTokenizer};
use graphrag_engine::config::AppConfig;
use graphrag_engine::llm::cache::CachedGateway;
use graphrag_engine::llm::mock::MockLlmProvider;
use graphrag_engine::llm::{BoundedGateway, EmbeddingProvider, LlmGateway};
use graphrag_engine::storage::build_storage;
use graphrag_engine::api;

#[cfg(feature = "openai")]
use graphrag_engine::llm::openai_provider::OpenAiProvider;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cfg = AppConfig::from_env();

    // Embeddings are built first and handed to `build_storage` uncached
    // (spec.md §4.3 scopes the response cache to completions only); a
    // second, independent provider instance backs the completion path so it
    // can be wrapped in `CachedGateway` once `storage.llm_cache` exists.
    let embeddings = build_embedding_provider(&cfg);
    let storage = build_storage(&cfg, embeddings);
    let gateway = build_completion_gateway(&cfg, storage.llm_cache.clone());
    let tokenizer: Arc<dyn Tokenizer> = Arc::new(WhitespaceTokenizer);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let app_state = AppState {
        config: cfg.clone(),
        storage,
        gateway,
        tokenizer,
        status: Arc::new(Mutex::new(Status { is_busy: false, message: "ready".to_string(), progress: 0.0 })),
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    let app = Router::new()
        .nest("/", api::create_router(app_state.clone()))
        .fallback_service(ServeDir::new("frontend"))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr).await.unwrap();
    let server_url = format!("http://{}", server_addr);
    info!("listening on {}", &server_url);

    if webbrowser::open(&server_url).is_err() {
        info!("could not open a browser automatically; visit {} manually", server_url);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("shutdown signal received, draining connections");
        })
        .await
        .unwrap();

    info!("server shut down cleanly");
}

/// Resolves the embedding backend behind [`BoundedGateway`]'s concurrency
/// bound (spec.md §4.3). The `openai` feature swaps in a real `rig`-backed
/// provider; without it (the default build) the crate runs fully offline
/// against [`MockLlmProvider`].
fn build_embedding_provider(cfg: &AppConfig) -> Arc<dyn EmbeddingProvider> {
    #[cfg(feature = "openai")]
    {
        let provider = OpenAiProvider::from_env(cfg.llm.embedding_model.clone());
        Arc::new(BoundedGateway::new(provider, cfg.llm.max_concurrent, cfg.llm.embedding_max_concurrent))
    }

    #[cfg(not(feature = "openai"))]
    {
        Arc::new(BoundedGateway::new(
            MockLlmProvider::default(),
            cfg.llm.max_concurrent,
            cfg.llm.embedding_max_concurrent,
        ))
    }
}

/// Resolves the completion backend, bounded the same way and wrapped in the
/// KV-backed response cache (spec.md §4.3).
fn build_completion_gateway(cfg: &AppConfig, cache: Arc<dyn graphrag_engine::storage::KVStorage>) -> Arc<dyn LlmGateway> {
    #[cfg(feature = "openai")]
    {
        let provider = OpenAiProvider::from_env(cfg.llm.chat_model.clone());
        let bounded = BoundedGateway::new(provider, cfg.llm.max_concurrent, cfg.llm.embedding_max_concurrent);
        Arc::new(CachedGateway::new(bounded, cache))
    }

    #[cfg(not(feature = "openai"))]
    {
        let bounded =
            BoundedGateway::new(MockLlmProvider::default(), cfg.llm.max_concurrent, cfg.llm.embedding_max_concurrent);
        Arc::new(CachedGateway::new(bounded, cache))
    }
}
