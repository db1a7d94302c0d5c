//! Redis-backed counter backend.
//!
//! Counters are plain integer keys (`ip:<address>`, `token:<value>`)
//! updated with `INCR`, or with a small script when a counter window is in
//! force so the increment and its expiry land together. Block markers are
//! separate keys under `blocked:<subject-key>` written with `SET ... EX`, so
//! Redis expires them on its own. Each command is atomic; the admission protocol built on top
//! of them is not.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, IntoConnectionInfo, Script};
use tracing::{debug, info};

use super::storage::{ttl_secs, LimiterStorage, StorageError};
use super::subject::SubjectKey;

/// Increment a counter and give it a TTL if it has none.
///
/// KEYS[1] is the counter, ARGV[1] the window in seconds.
const INCREMENT_WITH_WINDOW: &str = r#"
local count = redis.call("INCR", KEYS[1])
if redis.call("TTL", KEYS[1]) < 0 then
    redis.call("EXPIRE", KEYS[1], tonumber(ARGV[1]))
end
return count
"#;

/// Redis implementation of [`LimiterStorage`].
///
/// Cloning is cheap: clones share the underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisStorage {
    connection_manager: ConnectionManager,
    increment_script: Script,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage").finish_non_exhaustive()
    }
}

impl RedisStorage {
    /// Connect to Redis, given a URL (e.g. `redis://127.0.0.1:6379/0`) or
    /// prepared connection info.
    pub async fn connect<T: IntoConnectionInfo>(info: T) -> Result<Self, StorageError> {
        let client = Client::open(info)?;
        let connection_manager = client.get_connection_manager().await?;

        info!("Connected to Redis counter backend");
        Ok(Self {
            connection_manager,
            increment_script: Script::new(INCREMENT_WITH_WINDOW),
        })
    }

    /// Check that the backend answers.
    pub async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection_manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl LimiterStorage for RedisStorage {
    async fn increment(
        &self,
        key: &SubjectKey,
        window: Option<Duration>,
    ) -> Result<u64, StorageError> {
        let mut conn = self.connection_manager.clone();
        let count: u64 = match window {
            Some(window) => {
                self.increment_script
                    .key(key.as_str())
                    .arg(ttl_secs(window))
                    .invoke_async(&mut conn)
                    .await?
            }
            None => conn.incr(key.as_str(), 1u64).await?,
        };
        Ok(count)
    }

    async fn is_blocked(&self, key: &SubjectKey) -> Result<bool, StorageError> {
        let mut conn = self.connection_manager.clone();
        let marker: Option<String> = conn.get(key.block_key()).await?;
        Ok(marker.is_some_and(|value| !value.is_empty()))
    }

    async fn block(&self, key: &SubjectKey, duration: Duration) -> Result<(), StorageError> {
        let mut conn = self.connection_manager.clone();
        let secs = ttl_secs(duration);
        let _: () = conn.set_ex(key.block_key(), "1", secs).await?;

        debug!(key = %key, ttl_secs = secs, "Installed block marker");
        Ok(())
    }

    async fn reset(&self, key: &SubjectKey) -> Result<(), StorageError> {
        let mut conn = self.connection_manager.clone();
        let _: u64 = conn.del(key.as_str()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    //! These tests need a live Redis and are skipped unless `REDIS_URL` is set.

    use super::*;

    fn redis_url() -> Option<String> {
        std::env::var("REDIS_URL").ok()
    }

    fn unique_token() -> SubjectKey {
        let n: u64 = rand::random();
        SubjectKey::token(&format!("gatekeeper_test_{n}"))
    }

    async fn cleanup(storage: &RedisStorage, key: &SubjectKey) {
        let mut conn = storage.connection_manager.clone();
        let _: u64 = conn.del(vec![key.as_str().to_string(), key.block_key()]).await.unwrap();
    }

    #[tokio::test]
    async fn test_increment_and_reset() {
        let Some(url) = redis_url() else { return };
        let storage = RedisStorage::connect(url.as_str()).await.unwrap();
        storage.ping().await.unwrap();
        let key = unique_token();

        assert_eq!(storage.increment(&key, None).await.unwrap(), 1);
        assert_eq!(storage.increment(&key, None).await.unwrap(), 2);

        storage.reset(&key).await.unwrap();
        storage.reset(&key).await.unwrap();
        assert_eq!(storage.increment(&key, None).await.unwrap(), 1);

        cleanup(&storage, &key).await;
    }

    #[tokio::test]
    async fn test_block_marker_expires() {
        let Some(url) = redis_url() else { return };
        let storage = RedisStorage::connect(url.as_str()).await.unwrap();
        let key = unique_token();

        assert!(!storage.is_blocked(&key).await.unwrap());
        storage.block(&key, Duration::from_secs(1)).await.unwrap();
        storage.block(&key, Duration::from_secs(1)).await.unwrap();
        assert!(storage.is_blocked(&key).await.unwrap());

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(!storage.is_blocked(&key).await.unwrap());

        cleanup(&storage, &key).await;
    }

    #[tokio::test]
    async fn test_reset_leaves_block_marker() {
        let Some(url) = redis_url() else { return };
        let storage = RedisStorage::connect(url.as_str()).await.unwrap();
        let key = unique_token();

        storage.increment(&key, None).await.unwrap();
        storage.block(&key, Duration::from_secs(5)).await.unwrap();
        storage.reset(&key).await.unwrap();

        assert!(storage.is_blocked(&key).await.unwrap());

        cleanup(&storage, &key).await;
    }

    #[tokio::test]
    async fn test_counter_window() {
        let Some(url) = redis_url() else { return };
        let storage = RedisStorage::connect(url.as_str()).await.unwrap();
        let key = unique_token();
        let window = Some(Duration::from_secs(1));

        assert_eq!(storage.increment(&key, window).await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(storage.increment(&key, window).await.unwrap(), 2);

        // The second increment did not push the deadline back.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(storage.increment(&key, window).await.unwrap(), 1);

        cleanup(&storage, &key).await;
    }

    #[tokio::test]
    async fn test_window_applied_to_counter_without_expiry() {
        let Some(url) = redis_url() else { return };
        let storage = RedisStorage::connect(url.as_str()).await.unwrap();
        let key = unique_token();

        storage.increment(&key, None).await.unwrap();
        assert_eq!(
            storage.increment(&key, Some(Duration::from_secs(1))).await.unwrap(),
            2
        );

        let mut conn = storage.connection_manager.clone();
        let ttl: i64 = conn.ttl(key.as_str()).await.unwrap();
        assert!(ttl > 0, "counter should carry a TTL, got {ttl}");

        cleanup(&storage, &key).await;
    }
}
