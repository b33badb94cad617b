use super::{Pipeline, ReputationStore, StoreOp};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// In-process store. A whole pipeline runs under one write lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    hashes: RwLock<HashMap<String, HashMap<String, u64>>>,
    round_trips: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, key: &str, field: &str, count: u64) {
        self.hashes
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), count);
    }

    pub async fn get(&self, key: &str, field: &str) -> Option<u64> {
        self.hashes
            .read()
            .await
            .get(key)
            .and_then(|fields| fields.get(field))
            .copied()
    }

    /// Number of pipelines executed so far.
    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReputationStore for MemoryStore {
    async fn execute(&self, pipeline: &Pipeline) -> Result<Vec<Option<u64>>, StoreError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        let mut hashes = self.hashes.write().await;

        let replies = pipeline
            .ops()
            .iter()
            .map(|op| match op {
                StoreOp::IncrBy { key, field, delta } => {
                    let count = hashes
                        .entry(key.clone())
                        .or_default()
                        .entry(field.clone())
                        .or_insert(0);
                    *count = count.saturating_add(*delta);
                    Some(*count)
                }
                StoreOp::Get { key, field } => {
                    hashes.get(key).and_then(|fields| fields.get(field)).copied()
                }
            })
            .collect();

        Ok(replies)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
