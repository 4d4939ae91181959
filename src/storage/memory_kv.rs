//! In-memory `KVStorage` (the `json`-equivalent default backend).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::KVStorage;
use crate::error::Result;

struct Entry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

pub struct MemoryKVStorage {
    items: DashMap<String, Entry>,
    #[allow(dead_code)]
    namespace: &'static str,
    ttl: Option<Duration>,
}

impl MemoryKVStorage {
    pub fn new(namespace: &'static str, ttl: Option<Duration>) -> Self {
        Self { items: DashMap::new(), namespace, ttl }
    }

    fn is_live(entry: &Entry) -> bool {
        match entry.expires_at {
            Some(exp) => Instant::now() < exp,
            None => true,
        }
    }
}

#[async_trait]
impl KVStorage for MemoryKVStorage {
    async fn get_by_id(&self, id: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.items.get(id).filter(|e| Self::is_live(e)).map(|e| e.value.clone()))
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<serde_json::Value>>> {
        Ok(ids
            .iter()
            .map(|id| self.items.get(id).filter(|e| Self::is_live(e)).map(|e| e.value.clone()))
            .collect())
    }

    async fn all_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .items
            .iter()
            .filter(|e| Self::is_live(e.value()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn filter_keys(&self, keys: &[String]) -> Result<Vec<String>> {
        Ok(keys
            .iter()
            .filter(|k| !self.items.get(k.as_str()).map(|e| Self::is_live(&e)).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn upsert(&self, items: std::collections::HashMap<String, serde_json::Value>) -> Result<()> {
        let expires_at = self.ttl.map(|d| Instant::now() + d);
        for (k, v) in items {
            self.items.insert(k, Entry { value: v, expires_at });
        }
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<()> {
        self.items.remove(id);
        Ok(())
    }

    async fn drop(&self) -> Result<()> {
        self.items.clear();
        Ok(())
    }
}
