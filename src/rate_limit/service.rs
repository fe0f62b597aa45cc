use super::tiers::TierConfig;
use super::types::{RateLimitKey, RateLimitResult};
use crate::metrics;
use crate::store::{FailoverStore, KeySpace, MemoryStore, SharedStore, StoreBackend};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Sliding-window rate limiter
///
/// The store is chosen once at construction. With a [`FailoverStore`] the
/// shared store answers while reachable and the per-instance fallback takes
/// over during outages; store errors never turn into an open door.
///
/// A result is `degraded` only when a shared store is configured and could
/// not answer. A local-only limiter is never degraded.
pub struct RateLimiterService {
    store: Arc<dyn SharedStore>,
    fallback: Arc<MemoryStore>,
    failover: Option<Arc<FailoverStore>>,
    keys: KeySpace,
}

impl std::fmt::Debug for RateLimiterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterService")
            .field("backend", &self.store.backend())
            .field("keys", &self.keys)
            .finish()
    }
}

impl RateLimiterService {
    /// Create a rate limiter over any store
    pub fn new(store: Arc<dyn SharedStore>, keys: KeySpace) -> Self {
        Self {
            store,
            fallback: Arc::new(MemoryStore::new()),
            failover: None,
            keys,
        }
    }

    /// Create a rate limiter with per-instance state only
    pub fn local_only(keys: KeySpace) -> Self {
        info!("Initializing local-only rate limiter");
        let fallback = Arc::new(MemoryStore::new());
        Self {
            store: fallback.clone(),
            fallback,
            failover: None,
            keys,
        }
    }

    /// Create a rate limiter over a shared store with local fallback
    pub fn with_failover(store: Arc<FailoverStore>, keys: KeySpace) -> Self {
        info!("Initializing rate limiter with shared store and local fallback");
        Self {
            fallback: store.fallback().clone(),
            store: store.clone(),
            failover: Some(store),
            keys,
        }
    }

    /// Decide whether one more request fits in `key`'s window
    ///
    /// Prune, count and insert happen as one atomic store operation, so two
    /// concurrent callers never both take the last slot.
    pub async fn allow(&self, key: &RateLimitKey, tier: &TierConfig) -> RateLimitResult {
        let store_key = self.keys.rate_limit(key.as_str());
        let member = Uuid::new_v4().to_string();
        let capacity = tier.capacity();

        let (outcome, degraded) = match self
            .store
            .record_in_window(&store_key, &member, tier.window_ms, capacity)
            .await
        {
            Ok(outcome) => (outcome, self.is_degraded()),
            Err(e) => {
                warn!(key = %key, error = %e, "Rate limit store failed, using local window");
                match self
                    .fallback
                    .record_in_window(&store_key, &member, tier.window_ms, capacity)
                    .await
                {
                    Ok(outcome) => (outcome, true),
                    Err(e) => {
                        error!(key = %key, error = %e, "Local rate limit window failed");
                        return RateLimitResult {
                            allowed: false,
                            limit: capacity,
                            remaining: 0,
                            reset_at: 0,
                            retry_after: Some(tier.window().as_secs().max(1)),
                            degraded: true,
                        };
                    }
                }
            }
        };

        let result = RateLimitResult::from_outcome(&outcome, capacity, tier.window_ms, degraded);
        let class = key.as_str().split(':').next().unwrap_or("unknown");
        metrics::record_rate_limit_decision(class, result.allowed, degraded);

        if result.allowed {
            debug!(
                key = %key,
                remaining = result.remaining,
                limit = result.limit,
                "Rate limit check passed"
            );
        } else {
            warn!(
                key = %key,
                limit = result.limit,
                retry_after = ?result.retry_after,
                "Rate limit exceeded"
            );
        }

        result
    }

    /// Whether the configured shared store is currently unreachable
    pub fn is_degraded(&self) -> bool {
        self.failover
            .as_ref()
            .is_some_and(|failover| failover.is_degraded())
    }

    /// Backend currently answering
    pub fn backend(&self) -> StoreBackend {
        self.store.backend()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::tiers::Tier;
    use std::time::Duration;

    fn limiter_with_clock() -> (RateLimiterService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (RateLimiterService::new(store, KeySpace::default()), clock)
    }

    #[tokio::test]
    async fn test_local_only_service() {
        let service = RateLimiterService::local_only(KeySpace::default());
        assert_eq!(service.backend(), StoreBackend::Memory);

        let tier = TierConfig::new(10, 60_000, 0);
        let key = RateLimitKey::ip(Tier::Unauthenticated, "192.168.1.1", "/api");

        for _ in 0..10 {
            let result = service.allow(&key, &tier).await;
            assert!(result.allowed);
            assert!(!result.degraded, "local-only state is not a degraded shared store");
        }
        assert!(!service.allow(&key, &tier).await.allowed);
    }

    #[tokio::test]
    async fn test_burst_shares_the_window() {
        let (service, _clock) = limiter_with_clock();
        let tier = TierConfig::new(3, 1_000, 2);
        let key = RateLimitKey::api(Tier::Authenticated, "u1", "/orders");

        for i in 0..5 {
            let result = service.allow(&key, &tier).await;
            assert!(result.allowed, "call {} should be admitted", i);
            assert_eq!(result.limit, 5);
            assert_eq!(result.remaining, 4 - i);
        }

        let result = service.allow(&key, &tier).await;
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_window_reopens_after_window_elapses() {
        let (service, clock) = limiter_with_clock();
        let tier = TierConfig::new(2, 1_000, 0);
        let key = RateLimitKey::login("1.2.3.4", "alice");

        assert!(service.allow(&key, &tier).await.allowed);
        assert!(service.allow(&key, &tier).await.allowed);
        let rejected = service.allow(&key, &tier).await;
        assert!(!rejected.allowed);
        assert_eq!(rejected.retry_after, Some(1));

        clock.advance(Duration::from_millis(1_000));
        assert!(service.allow(&key, &tier).await.allowed);
    }

    #[tokio::test]
    async fn test_rejection_does_not_consume_a_slot() {
        let (service, clock) = limiter_with_clock();
        let tier = TierConfig::new(1, 1_000, 0);
        let key = RateLimitKey::login("1.2.3.4", "bob");

        assert!(service.allow(&key, &tier).await.allowed);
        for _ in 0..5 {
            assert!(!service.allow(&key, &tier).await.allowed);
        }

        clock.advance(Duration::from_millis(1_000));
        let result = service.allow(&key, &tier).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let (service, _clock) = limiter_with_clock();
        let tier = TierConfig::new(1, 60_000, 0);

        let alice = RateLimitKey::login("1.2.3.4", "alice");
        let bob = RateLimitKey::login("1.2.3.4", "bob");

        assert!(service.allow(&alice, &tier).await.allowed);
        assert!(!service.allow(&alice, &tier).await.allowed);
        assert!(service.allow(&bob, &tier).await.allowed);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_service() {
        use crate::store::RedisStore;

        let redis = RedisStore::connect("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis");
        let failover = Arc::new(FailoverStore::new(
            Arc::new(redis),
            Arc::new(MemoryStore::new()),
            Duration::from_millis(250),
            Duration::from_secs(5),
        ));
        let service = RateLimiterService::with_failover(failover, KeySpace::new("test"));
        assert_eq!(service.backend(), StoreBackend::Redis);

        let tier = TierConfig::new(10, 60_000, 0);
        let key = RateLimitKey::ip(
            Tier::Unauthenticated,
            &format!("test-service-{}", rand::random::<u32>()),
            "/",
        );

        for _ in 0..10 {
            let result = service.allow(&key, &tier).await;
            assert!(result.allowed);
            assert!(!result.degraded);
        }
        assert!(!service.allow(&key, &tier).await.allowed);
    }
}
