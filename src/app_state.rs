use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::chunking::Tokenizer;
use crate::config::AppConfig;
use crate::llm::LlmGateway;
use crate::storage::StorageTier;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub storage: StorageTier,
    pub gateway: Arc<dyn LlmGateway>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub status: Arc<Mutex<Status>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub progress: f32,
}
