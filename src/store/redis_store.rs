use super::{Pipeline, ReputationStore, StoreOp};
use crate::error::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;

/// Redis-backed store: `HINCRBY`/`HGET` sent as one `MULTI`/`EXEC` pipeline.
pub struct RedisStore {
    client: redis::Client,
    conn: Mutex<Option<ConnectionManager>>,
}

impl RedisStore {
    /// Validate the URL. The connection itself is made on first use.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(RedisStore {
            client,
            conn: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        log::info!("connecting to redis");
        let conn = ConnectionManager::new(self.client.clone()).await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl ReputationStore for RedisStore {
    async fn execute(&self, pipeline: &Pipeline) -> Result<Vec<Option<u64>>, StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in pipeline.ops() {
            match op {
                StoreOp::IncrBy { key, field, delta } => {
                    pipe.hincr(key, field, *delta);
                }
                StoreOp::Get { key, field } => {
                    pipe.hget(key, field);
                }
            }
        }

        let mut conn = self.connection().await?;
        let replies: Vec<Option<u64>> = pipe.query_async(&mut conn).await?;
        Ok(replies)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
