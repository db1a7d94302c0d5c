//! Core admission engine.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, trace};

use super::rules::PolicyRegistry;
use super::storage::{LimiterStorage, StorageError};
use super::subject::SubjectKey;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allowed,
    /// The subject was already blocked; the counter was not touched.
    Blocked,
    /// This request crossed the limit and installed a new block.
    LimitExceeded,
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Threshold-then-cooldown rate limiter.
///
/// Each subject accumulates a counter until it crosses its policy limit.
/// Crossing installs a block marker for the policy's block duration and
/// wipes the counter, so accounting restarts from zero once the block
/// expires.
///
/// The limiter is shared across request tasks without any local locking.
pub struct RateLimiter {
    /// Shared counter backend
    storage: Arc<dyn LimiterStorage>,
    /// Policies resolved per request
    policies: Arc<PolicyRegistry>,
    /// Optional expiry a counter gets when it is created
    counter_window: Option<Duration>,
}

impl RateLimiter {
    /// Create a new rate limiter over a storage backend and policy registry.
    pub fn new(storage: Arc<dyn LimiterStorage>, policies: Arc<PolicyRegistry>) -> Self {
        Self {
            storage,
            policies,
            counter_window: None,
        }
    }

    /// Give counters a fixed window: a counter expires `window` after the
    /// increment that created it. The expiry is set by the same storage call
    /// as the increment, so a failed request never leaves a counter without one.
    pub fn with_counter_window(mut self, window: Option<Duration>) -> Self {
        self.counter_window = window;
        self
    }

    /// Decide whether a request from `key` with tier label `tier` may proceed.
    ///
    /// An empty tier label selects the anonymous (IP) policy; a label with no
    /// configured tier selects the token default.
    ///
    /// Any storage failure aborts the decision and is returned as-is. The
    /// caller chooses whether that admits or rejects the request.
    ///
    /// The check-block, increment, block-and-reset sequence is not atomic.
    /// Under concurrency a few requests past the limit may be admitted, and
    /// several callers crossing the limit together may each install the block
    /// and reset the counter. Both are idempotent, so the only cost is a
    /// small overshoot at the boundary.
    #[instrument(level = "debug", skip(self, key), fields(key = %key))]
    pub async fn admit(&self, key: &SubjectKey, tier: &str) -> Result<Decision, StorageError> {
        if self.storage.is_blocked(key).await? {
            trace!(key = %key, "Subject is blocked");
            return Ok(Decision::Blocked);
        }

        let policy = self.policies.for_label(tier);
        let count = self.storage.increment(key, self.counter_window).await?;

        trace!(
            key = %key,
            tier = %tier,
            count = count,
            limit = policy.limit,
            "Checked admission"
        );

        if count > policy.limit {
            self.storage.block(key, policy.block_duration).await?;
            self.storage.reset(key).await?;

            info!(
                key = %key,
                tier = %tier,
                limit = policy.limit,
                block_secs = policy.block_duration.as_secs(),
                "Limit exceeded, subject blocked"
            );
            return Ok(Decision::LimitExceeded);
        }

        debug!(key = %key, count = count, "Request admitted");
        Ok(Decision::Allowed)
    }

    /// Get the policy registry.
    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::Policy;
    use crate::ratelimit::MemoryStorage;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio_test::{assert_err, assert_ok};

    fn policy(limit: u64, secs: u64) -> Policy {
        Policy::new(limit, Duration::from_secs(secs)).unwrap()
    }

    fn registry() -> Arc<PolicyRegistry> {
        Arc::new(
            PolicyRegistry::new(policy(10, 2), policy(11, 60))
                .with_tier("public", policy(25, 15))
                .with_tier("premium", policy(30, 10))
                .with_tier("admin", policy(40, 5)),
        )
    }

    fn create_limiter() -> (RateLimiter, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let limiter = RateLimiter::new(storage.clone(), registry());
        (limiter, storage)
    }

    fn ip_key(ip: &str) -> SubjectKey {
        SubjectKey::ip(ip.parse().unwrap())
    }

    /// Admit requests until the first denial; returns how many were allowed.
    async fn allowed_before_denial(limiter: &RateLimiter, key: &SubjectKey, tier: &str, max: u64) -> u64 {
        for i in 0..max {
            if !limiter.admit(key, tier).await.unwrap().is_allowed() {
                return i;
            }
        }
        max
    }

    #[tokio::test]
    async fn test_allows_up_to_limit() {
        let (limiter, storage) = create_limiter();
        let key = ip_key("192.168.1.1");

        for _ in 0..10 {
            assert_eq!(limiter.admit(&key, "").await.unwrap(), Decision::Allowed);
        }
        assert_eq!(storage.counter_value(&key), Some(10));

        assert_eq!(limiter.admit(&key, "").await.unwrap(), Decision::LimitExceeded);
        assert!(storage.is_blocked(&key).await.unwrap());
        assert_eq!(storage.counter_value(&key), None);
    }

    #[tokio::test]
    async fn test_blocked_subject_does_not_count() {
        let (limiter, storage) = create_limiter();
        let key = ip_key("192.168.1.1");

        assert_eq!(allowed_before_denial(&limiter, &key, "", 30).await, 10);

        for _ in 0..5 {
            assert_eq!(limiter.admit(&key, "").await.unwrap(), Decision::Blocked);
        }
        assert_eq!(storage.counter_value(&key), None);
    }

    #[tokio::test]
    async fn test_block_overrides_counter() {
        let (limiter, storage) = create_limiter();
        let key = ip_key("192.168.1.1");

        storage.block(&key, Duration::from_secs(2)).await.unwrap();
        assert_eq!(limiter.admit(&key, "").await.unwrap(), Decision::Blocked);

        // A counter mutated elsewhere while blocked changes nothing.
        storage.reset(&key).await.unwrap();
        assert_eq!(limiter.admit(&key, "").await.unwrap(), Decision::Blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ip_scenario_recovers_after_block() {
        let (limiter, _storage) = create_limiter();
        let key = ip_key("192.168.1.2");

        assert_eq!(allowed_before_denial(&limiter, &key, "", 30).await, 10);
        assert!(!limiter.admit(&key, "").await.unwrap().is_allowed());

        tokio::time::advance(Duration::from_millis(2100)).await;
        assert!(limiter.admit(&key, "").await.unwrap().is_allowed());

        // The cycle repeats identically: 9 more allowed, then denial.
        assert_eq!(allowed_before_denial(&limiter, &key, "", 30).await, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_tiers_are_independent() {
        let (limiter, _storage) = create_limiter();
        let cases = [("public", 25, 15), ("premium", 30, 10), ("admin", 40, 5)];

        for (tier, limit, _) in cases {
            let key = SubjectKey::token(&format!("{tier}-token"));
            assert_eq!(allowed_before_denial(&limiter, &key, tier, limit + 5).await, limit);
        }

        // Each tier recovers after its own block duration.
        tokio::time::advance(Duration::from_millis(5100)).await;
        assert!(limiter.admit(&SubjectKey::token("admin-token"), "admin").await.unwrap().is_allowed());
        assert!(!limiter.admit(&SubjectKey::token("premium-token"), "premium").await.unwrap().is_allowed());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(limiter.admit(&SubjectKey::token("premium-token"), "premium").await.unwrap().is_allowed());
        assert!(!limiter.admit(&SubjectKey::token("public-token"), "public").await.unwrap().is_allowed());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(limiter.admit(&SubjectKey::token("public-token"), "public").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_unknown_tier_uses_token_default() {
        let (limiter, _storage) = create_limiter();
        let key = SubjectKey::token("mystery");

        assert_eq!(allowed_before_denial(&limiter, &key, "platinum", 30).await, 11);
    }

    #[tokio::test]
    async fn test_subjects_are_isolated() {
        let (limiter, _storage) = create_limiter();
        let blocked = ip_key("10.0.0.1");
        let other = ip_key("10.0.0.2");

        allowed_before_denial(&limiter, &blocked, "", 30).await;
        assert!(limiter.admit(&other, "").await.unwrap().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_window_expires_count() {
        let storage = Arc::new(MemoryStorage::new());
        let limiter = RateLimiter::new(storage.clone(), registry())
            .with_counter_window(Some(Duration::from_secs(1)));
        let key = ip_key("192.168.1.3");

        for _ in 0..10 {
            assert!(limiter.admit(&key, "").await.unwrap().is_allowed());
        }

        tokio::time::advance(Duration::from_secs(1)).await;

        // The window rolled over, so the 11th request starts a fresh count.
        assert!(limiter.admit(&key, "").await.unwrap().is_allowed());
        assert_eq!(storage.counter_value(&key), Some(1));
    }

    #[tokio::test]
    async fn test_concurrent_admission_blocks_subject() {
        let storage = Arc::new(MemoryStorage::new());
        let limiter = Arc::new(RateLimiter::new(storage.clone(), registry()));
        let key = ip_key("172.16.0.1");

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                let key = key.clone();
                tokio::spawn(async move { limiter.admit(&key, "").await.unwrap() })
            })
            .collect();

        let decisions: Vec<Decision> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let allowed = decisions.iter().filter(|d| d.is_allowed()).count();
        assert!(allowed >= 10, "at least the limit is admitted, got {allowed}");
        assert!(allowed < 50, "the boundary overshoot is bounded, got {allowed}");
        assert!(storage.is_blocked(&key).await.unwrap());
    }

    /// Storage that records calls and can be told to fail.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        fail_on: Mutex<Option<&'static str>>,
        fail_once: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FlakyStorage {
        fn failing_on(op: &'static str) -> Self {
            let storage = Self::default();
            *storage.fail_on.lock() = Some(op);
            storage
        }

        fn failing_once_on(op: &'static str) -> Self {
            Self {
                fail_once: true,
                ..Self::failing_on(op)
            }
        }

        fn check(&self, op: &'static str) -> Result<(), StorageError> {
            self.calls.lock().push(op);
            let mut fail_on = self.fail_on.lock();
            if *fail_on == Some(op) {
                if self.fail_once {
                    *fail_on = None;
                }
                return Err(StorageError::Unavailable(format!("{op} failed")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LimiterStorage for FlakyStorage {
        async fn increment(
            &self,
            key: &SubjectKey,
            window: Option<Duration>,
        ) -> Result<u64, StorageError> {
            self.check("increment")?;
            self.inner.increment(key, window).await
        }

        async fn is_blocked(&self, key: &SubjectKey) -> Result<bool, StorageError> {
            self.check("is_blocked")?;
            self.inner.is_blocked(key).await
        }

        async fn block(&self, key: &SubjectKey, duration: Duration) -> Result<(), StorageError> {
            self.check("block")?;
            self.inner.block(key, duration).await
        }

        async fn reset(&self, key: &SubjectKey) -> Result<(), StorageError> {
            self.check("reset")?;
            self.inner.reset(key).await
        }
    }

    #[tokio::test]
    async fn test_storage_error_propagates() {
        let storage = Arc::new(FlakyStorage::failing_on("is_blocked"));
        let limiter = RateLimiter::new(storage.clone(), registry());

        let result = limiter.admit(&ip_key("10.0.0.1"), "").await;
        assert!(matches!(assert_err!(result), StorageError::Unavailable(_)));

        // The failure aborts before any counter mutation.
        assert_eq!(*storage.calls.lock(), vec!["is_blocked"]);
    }

    #[tokio::test]
    async fn test_block_failure_aborts_decision() {
        let storage = Arc::new(FlakyStorage::failing_on("block"));
        let limiter = RateLimiter::new(storage.clone(), registry());
        let key = ip_key("10.0.0.1");

        for _ in 0..10 {
            assert_ok!(limiter.admit(&key, "").await);
        }
        assert_err!(limiter.admit(&key, "").await);
        assert!(!storage.calls.lock().contains(&"reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_window_survives_transient_failure() {
        let storage = Arc::new(FlakyStorage::failing_once_on("increment"));
        let limiter = RateLimiter::new(storage.clone(), registry())
            .with_counter_window(Some(Duration::from_secs(1)));
        let key = ip_key("10.0.0.9");

        assert_err!(limiter.admit(&key, "").await);

        for _ in 0..5 {
            assert_ok!(limiter.admit(&key, "").await);
            tokio::time::advance(Duration::from_secs(5)).await;
        }
        assert_ok!(limiter.admit(&key, "").await);

        // Every window started a fresh count.
        assert_eq!(storage.inner.counter_value(&key), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_window_applies_to_existing_counter() {
        let storage = Arc::new(MemoryStorage::new());
        let key = ip_key("10.0.0.10");
        storage.increment(&key, None).await.unwrap();
        storage.increment(&key, None).await.unwrap();

        let limiter = RateLimiter::new(storage.clone(), registry())
            .with_counter_window(Some(Duration::from_secs(1)));
        assert!(limiter.admit(&key, "").await.unwrap().is_allowed());
        assert_eq!(storage.counter_value(&key), Some(3));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.admit(&key, "").await.unwrap().is_allowed());
        assert_eq!(storage.counter_value(&key), Some(1));
    }

    #[tokio::test]
    async fn test_hot_path_round_trips() {
        let storage = Arc::new(FlakyStorage::default());
        let limiter = RateLimiter::new(storage.clone(), registry());
        let key = ip_key("10.0.0.1");

        limiter.admit(&key, "").await.unwrap();
        assert_eq!(*storage.calls.lock(), vec!["is_blocked", "increment"]);
    }
}
