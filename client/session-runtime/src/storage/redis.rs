use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;

use super::LocalStore;
use crate::error::{Result, SessionError};

/// Redis-backed store for shared kiosk deployments.
///
/// Every write refreshes the key's TTL to the freshness window, so stale
/// drafts age out on their own.
pub struct RedisStore {
    redis: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisStore {
    pub async fn connect(uri: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(uri)?;

        tracing::info!("Attempting to connect to Redis draft store...");

        let redis = tokio::time::timeout(
            Duration::from_secs(10),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| SessionError::Storage("Redis connection timeout after 10s".into()))??;

        // Test connection
        let mut conn = redis.clone();
        tokio::time::timeout(
            Duration::from_secs(5),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| SessionError::Storage("Redis PING timeout after 5s".into()))??;

        tracing::info!("Redis draft store connection established");

        Ok(Self {
            redis,
            ttl_seconds: ttl.as_secs().max(1),
        })
    }
}

#[async_trait]
impl LocalStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        let mut conn = self.redis.clone();
        redis::cmd("SETEX")
            .arg(key)
            .arg(self.ttl_seconds)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
