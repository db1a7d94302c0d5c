//! Storage trait for abstracting the shared counter backend.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::subject::SubjectKey;

/// Errors raised by a counter backend.
///
/// None of the storage operations recover locally; the caller decides
/// whether a failure admits or rejects the request.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The Redis backend rejected a command or the connection failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The backend could not be reached.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Trait for counter backends.
///
/// Each operation is individually atomic per key. Sequences of operations
/// are not; see [`RateLimiter::admit`](super::RateLimiter::admit).
#[async_trait]
pub trait LimiterStorage: Send + Sync {
    /// Increment the counter for `key` and return the new count.
    ///
    /// With a `window`, a counter that has no expiry yet gets one `window`
    /// from now, in the same atomic step as the increment. A counter that
    /// already expires keeps its deadline. Without a window the counter is
    /// left as it is.
    async fn increment(
        &self,
        key: &SubjectKey,
        window: Option<Duration>,
    ) -> Result<u64, StorageError>;

    /// Whether a live block marker exists for `key`.
    async fn is_blocked(&self, key: &SubjectKey) -> Result<bool, StorageError>;

    /// Install (or refresh) a block marker for `key` that expires after `duration`.
    async fn block(&self, key: &SubjectKey, duration: Duration) -> Result<(), StorageError>;

    /// Delete the counter for `key`. The block marker is left untouched.
    async fn reset(&self, key: &SubjectKey) -> Result<(), StorageError>;
}

/// Round a duration up to whole seconds, never below one.
///
/// Redis TTLs are expressed in seconds and a zero TTL is rejected.
pub(crate) fn ttl_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    let secs = if duration.subsec_nanos() > 0 { secs + 1 } else { secs };
    secs.max(1)
}
