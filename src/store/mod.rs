//! Reputation store: `(local_od, remote_od) -> count` kept as one hash per
//! local organizational domain.
//!
//! Operations are grouped into a [`Pipeline`] that travels to the store in a
//! single round trip and yields replies in request order. Callers rely on
//! that ordering only, never on cross-key atomicity.

pub mod memory;
pub mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::StoreError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Increment `field` of hash `key` by `delta`; replies with the new value.
    IncrBy {
        key: String,
        field: String,
        delta: u64,
    },
    /// Read `field` of hash `key`; replies with nothing when unset.
    Get { key: String, field: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    ops: Vec<StoreOp>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hincrby(&mut self, key: &str, field: &str, delta: u64) -> &mut Self {
        self.ops.push(StoreOp::IncrBy {
            key: key.to_string(),
            field: field.to_string(),
            delta,
        });
        self
    }

    pub fn hget(&mut self, key: &str, field: &str) -> &mut Self {
        self.ops.push(StoreOp::Get {
            key: key.to_string(),
            field: field.to_string(),
        });
        self
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[async_trait]
pub trait ReputationStore: Send + Sync {
    /// Execute every operation in one round trip, replies in request order.
    async fn execute(&self, pipeline: &Pipeline) -> Result<Vec<Option<u64>>, StoreError>;

    fn name(&self) -> &'static str;
}

/// Build the configured backend. Redis connects lazily, so an unreachable
/// server does not prevent startup.
pub fn from_config(config: &StoreConfig) -> anyhow::Result<Arc<dyn ReputationStore>> {
    let store: Arc<dyn ReputationStore> = match config.backend {
        StoreBackend::Redis => Arc::new(RedisStore::open(&config.url)?),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}

/// Batched increment and lookup with a bounded wait per round trip.
#[derive(Clone)]
pub struct ReputationClient {
    store: Arc<dyn ReputationStore>,
    timeout: Duration,
}

impl ReputationClient {
    pub fn new(store: Arc<dyn ReputationStore>, timeout: Duration) -> Self {
        ReputationClient { store, timeout }
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Increment `(local_od, remote_od)` by one for every remote domain.
    /// Returns the new counts in the order of `remote_ods`.
    pub async fn increment_batch(
        &self,
        local_od: &str,
        remote_ods: &[String],
    ) -> Result<Vec<u64>, StoreError> {
        let mut pipeline = Pipeline::new();
        for remote_od in remote_ods {
            pipeline.hincrby(local_od, remote_od, 1);
        }

        self.run(&pipeline)
            .await?
            .into_iter()
            .map(|reply| reply.ok_or_else(|| StoreError::Unavailable("increment returned nil".into())))
            .collect()
    }

    /// Prior correspondence count for `(local_od, remote_od)`; `None` when never recorded.
    pub async fn query(&self, local_od: &str, remote_od: &str) -> Result<Option<u64>, StoreError> {
        let mut pipeline = Pipeline::new();
        pipeline.hget(local_od, remote_od);
        Ok(self.run(&pipeline).await?.into_iter().next().flatten())
    }

    /// Look up several `(local_od, remote_od)` pairs in one round trip.
    pub async fn query_batch(
        &self,
        pairs: &[(String, String)],
    ) -> Result<Vec<Option<u64>>, StoreError> {
        let mut pipeline = Pipeline::new();
        for (local_od, remote_od) in pairs {
            pipeline.hget(local_od, remote_od);
        }
        self.run(&pipeline).await
    }

    async fn run(&self, pipeline: &Pipeline) -> Result<Vec<Option<u64>>, StoreError> {
        if pipeline.is_empty() {
            return Ok(Vec::new());
        }

        let replies = tokio::time::timeout(self.timeout, self.store.execute(pipeline))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout.as_millis() as u64))??;

        if replies.len() != pipeline.len() {
            return Err(StoreError::ReplyMismatch {
                expected: pipeline.len(),
                got: replies.len(),
            });
        }
        Ok(replies)
    }
}
