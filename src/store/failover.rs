use super::memory::MemoryStore;
use super::{
    HashCondition, HashWrite, SharedStore, StoreBackend, StoreError, StoreResult, WindowOutcome,
};
use crate::metrics;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Claim on the single recovery attempt, released on drop
///
/// Dropping also covers a caller cancelled mid-attempt, which would
/// otherwise keep every later caller away from the primary.
struct RecoveryAttempt<'a>(&'a AtomicBool);

impl Drop for RecoveryAttempt<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Where one call goes
enum Route<'a> {
    Primary,
    Recovery(RecoveryAttempt<'a>),
    Fallback,
}

/// Which side of the failover store is serving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// The shared store answers
    Primary,
    /// The shared store is unreachable, per-instance memory answers
    Degraded,
}

impl std::fmt::Display for StoreMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreMode::Primary => write!(f, "primary"),
            StoreMode::Degraded => write!(f, "degraded"),
        }
    }
}

/// Store that prefers a shared primary and degrades to local memory
///
/// Every primary call is bounded by `op_timeout`. The first failure flips
/// the store into degraded mode; while degraded, a single caller retries the
/// primary once per `recovery_interval` and leaves degraded mode on success.
/// Limits stay enforced in degraded mode, just per gateway instance.
pub struct FailoverStore {
    primary: Arc<dyn SharedStore>,
    fallback: Arc<MemoryStore>,
    op_timeout: Duration,
    recovery_interval: Duration,
    degraded: AtomicBool,
    recovering: AtomicBool,
    last_attempt: Mutex<Instant>,
    mode_tx: watch::Sender<StoreMode>,
}

impl std::fmt::Debug for FailoverStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverStore")
            .field("primary", &self.primary)
            .field("mode", &self.mode())
            .field("op_timeout", &self.op_timeout)
            .field("recovery_interval", &self.recovery_interval)
            .finish()
    }
}

impl FailoverStore {
    pub fn new(
        primary: Arc<dyn SharedStore>,
        fallback: Arc<MemoryStore>,
        op_timeout: Duration,
        recovery_interval: Duration,
    ) -> Self {
        let (mode_tx, _) = watch::channel(StoreMode::Primary);
        metrics::record_store_mode(false);

        Self {
            primary,
            fallback,
            op_timeout,
            recovery_interval,
            degraded: AtomicBool::new(false),
            recovering: AtomicBool::new(false),
            last_attempt: Mutex::new(Instant::now()),
            mode_tx,
        }
    }

    pub fn mode(&self) -> StoreMode {
        if self.degraded.load(Ordering::Acquire) {
            StoreMode::Degraded
        } else {
            StoreMode::Primary
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.mode() == StoreMode::Degraded
    }

    /// Subscribe to mode transitions (health/metrics hook)
    pub fn subscribe(&self) -> watch::Receiver<StoreMode> {
        self.mode_tx.subscribe()
    }

    /// The per-instance fallback
    pub fn fallback(&self) -> &Arc<MemoryStore> {
        &self.fallback
    }

    fn stamp_attempt(&self) {
        if let Ok(mut last) = self.last_attempt.lock() {
            *last = Instant::now();
        }
    }

    /// Decide where this call goes
    fn pick_route(&self) -> Route<'_> {
        if !self.degraded.load(Ordering::Acquire) {
            return Route::Primary;
        }

        let due = self
            .last_attempt
            .lock()
            .map(|last| last.elapsed() >= self.recovery_interval)
            .unwrap_or(false);

        // Only one caller retries a degraded primary at a time
        if due
            && self
                .recovering
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            Route::Recovery(RecoveryAttempt(&self.recovering))
        } else {
            Route::Fallback
        }
    }

    fn enter_degraded(&self, op: &str, err: &StoreError) {
        self.stamp_attempt();
        metrics::record_store_error(op);

        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(
                operation = op,
                error = %err,
                "Shared store unavailable, entering degraded mode with local fallback"
            );
            metrics::record_store_mode(true);
            metrics::record_store_transition(StoreMode::Primary, StoreMode::Degraded);
            self.mode_tx.send_replace(StoreMode::Degraded);
        } else {
            debug!(operation = op, error = %err, "Shared store still unavailable");
        }
    }

    fn leave_degraded(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            info!("Shared store reachable again, leaving degraded mode");
            metrics::record_store_mode(false);
            metrics::record_store_transition(StoreMode::Degraded, StoreMode::Primary);
            self.mode_tx.send_replace(StoreMode::Primary);
        }
    }

    async fn route<'a, T, F>(&'a self, op: &'static str, call: F) -> StoreResult<T>
    where
        F: Fn(&'a dyn SharedStore) -> BoxFuture<'a, StoreResult<T>> + Send,
        T: Send,
    {
        let attempt = match self.pick_route() {
            Route::Fallback => return call(self.fallback.as_ref()).await,
            Route::Primary => None,
            Route::Recovery(attempt) => Some(attempt),
        };

        let result = tokio::time::timeout(self.op_timeout, call(self.primary.as_ref())).await;
        drop(attempt);

        match result {
            Ok(Ok(value)) => {
                self.leave_degraded();
                return Ok(value);
            }
            Ok(Err(err)) => self.enter_degraded(op, &err),
            Err(_) => self.enter_degraded(op, &StoreError::Timeout(self.op_timeout)),
        }

        call(self.fallback.as_ref()).await
    }
}

#[async_trait]
impl SharedStore for FailoverStore {
    fn backend(&self) -> StoreBackend {
        match self.mode() {
            StoreMode::Primary => self.primary.backend(),
            StoreMode::Degraded => self.fallback.backend(),
        }
    }

    async fn now_ms(&self) -> StoreResult<u64> {
        self.route("time", |s| s.now_ms()).await
    }

    async fn record_in_window(
        &self,
        key: &str,
        member: &str,
        window_ms: u64,
        capacity: u64,
    ) -> StoreResult<WindowOutcome> {
        self.route("window", |s| {
            s.record_in_window(key, member, window_ms, capacity)
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.route("get", |s| s.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.route("set", |s| s.set(key, value, ttl)).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.route("cas", |s| s.compare_and_set(key, expected, value, ttl))
            .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.route("delete", |s| s.delete(key)).await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.route("hset", |s| s.hash_set(key, field, value)).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.route("hget", |s| s.hash_get(key, field)).await
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<Vec<(String, String)>> {
        self.route("hgetall", |s| s.hash_get_all(key)).await
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.route("hdel", |s| s.hash_delete(key, field)).await
    }

    async fn hash_transaction(
        &self,
        conditions: &[HashCondition],
        writes: &[HashWrite],
    ) -> StoreResult<bool> {
        self.route("htxn", |s| s.hash_transaction(conditions, writes))
            .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.route("ping", |s| s.ping()).await
    }

    async fn maintain(&self) -> StoreResult<()> {
        self.fallback.purge_expired();

        if self.is_degraded() {
            // Ping routes through the recovery gate
            self.ping().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio::sync::Notify;

    /// Primary that fails every call until switched back on, or hangs
    #[derive(Debug)]
    struct SwitchableStore {
        inner: MemoryStore,
        up: AtomicBool,
        hang: AtomicBool,
        hung: Notify,
    }

    impl SwitchableStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                up: AtomicBool::new(true),
                hang: AtomicBool::new(false),
                hung: Notify::new(),
            }
        }

        async fn check(&self) -> StoreResult<()> {
            if self.hang.load(Ordering::SeqCst) {
                self.hung.notify_one();
                std::future::pending::<()>().await;
            }
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StoreError::Unavailable("switched off".to_string()))
            }
        }
    }

    #[async_trait]
    impl SharedStore for SwitchableStore {
        fn backend(&self) -> StoreBackend {
            StoreBackend::Redis
        }
        async fn now_ms(&self) -> StoreResult<u64> {
            self.check().await?;
            self.inner.now_ms().await
        }
        async fn record_in_window(
            &self,
            key: &str,
            member: &str,
            window_ms: u64,
            capacity: u64,
        ) -> StoreResult<WindowOutcome> {
            self.check().await?;
            self.inner
                .record_in_window(key, member, window_ms, capacity)
                .await
        }
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.check().await?;
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
            self.check().await?;
            self.inner.set(key, value, ttl).await
        }
        async fn compare_and_set(
            &self,
            key: &str,
            expected: Option<&str>,
            value: &str,
            ttl: Option<Duration>,
        ) -> StoreResult<bool> {
            self.check().await?;
            self.inner.compare_and_set(key, expected, value, ttl).await
        }
        async fn delete(&self, key: &str) -> StoreResult<()> {
            self.check().await?;
            self.inner.delete(key).await
        }
        async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
            self.check().await?;
            self.inner.hash_set(key, field, value).await
        }
        async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
            self.check().await?;
            self.inner.hash_get(key, field).await
        }
        async fn hash_get_all(&self, key: &str) -> StoreResult<Vec<(String, String)>> {
            self.check().await?;
            self.inner.hash_get_all(key).await
        }
        async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
            self.check().await?;
            self.inner.hash_delete(key, field).await
        }
        async fn hash_transaction(
            &self,
            conditions: &[HashCondition],
            writes: &[HashWrite],
        ) -> StoreResult<bool> {
            self.check().await?;
            self.inner.hash_transaction(conditions, writes).await
        }
        async fn ping(&self) -> StoreResult<()> {
            self.check().await
        }
    }

    fn failover(primary: Arc<SwitchableStore>, recovery: Duration) -> FailoverStore {
        let fallback = Arc::new(MemoryStore::with_clock(Arc::new(ManualClock::new(5_000))));
        FailoverStore::new(primary, fallback, Duration::from_millis(200), recovery)
    }

    #[tokio::test]
    async fn test_primary_serves_when_healthy() {
        let primary = Arc::new(SwitchableStore::new());
        let store = failover(primary.clone(), Duration::from_secs(60));

        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.mode(), StoreMode::Primary);
        assert_eq!(store.backend(), StoreBackend::Redis);
        assert_eq!(primary.inner.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_degrades_and_signals() {
        let primary = Arc::new(SwitchableStore::new());
        let store = failover(primary.clone(), Duration::from_secs(60));
        let mut modes = store.subscribe();

        primary.up.store(false, Ordering::SeqCst);

        let outcome = store.record_in_window("k", "m", 1_000, 1).await.unwrap();
        assert!(outcome.admitted);
        assert!(store.is_degraded());
        assert_eq!(store.backend(), StoreBackend::Memory);

        assert!(modes.has_changed().unwrap());
        assert_eq!(*modes.borrow_and_update(), StoreMode::Degraded);

        // Fallback still enforces the window
        let outcome = store.record_in_window("k", "m", 1_000, 1).await.unwrap();
        assert!(!outcome.admitted);

        // Fallback clock is used while degraded
        assert_eq!(store.now_ms().await.unwrap(), 5_000);
    }

    #[tokio::test]
    async fn test_recovers_after_interval() {
        let primary = Arc::new(SwitchableStore::new());
        let store = failover(primary.clone(), Duration::ZERO);

        primary.up.store(false, Ordering::SeqCst);
        store.ping().await.unwrap();
        assert!(store.is_degraded());

        primary.up.store(true, Ordering::SeqCst);
        store.ping().await.unwrap();
        assert_eq!(store.mode(), StoreMode::Primary);
    }

    #[tokio::test]
    async fn test_stays_degraded_until_interval_elapses() {
        let primary = Arc::new(SwitchableStore::new());
        let store = failover(primary.clone(), Duration::from_secs(3600));

        primary.up.store(false, Ordering::SeqCst);
        store.ping().await.unwrap();
        primary.up.store(true, Ordering::SeqCst);

        store.set("k", "v", None).await.unwrap();
        assert!(store.is_degraded());
        assert_eq!(primary.inner.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancelled_recovery_attempt_does_not_block_recovery() {
        let primary = Arc::new(SwitchableStore::new());
        let store = Arc::new(failover(primary.clone(), Duration::ZERO));

        primary.up.store(false, Ordering::SeqCst);
        store.ping().await.unwrap();
        assert!(store.is_degraded());

        // The recovery attempt hangs on the primary and its caller goes away
        primary.up.store(true, Ordering::SeqCst);
        primary.hang.store(true, Ordering::SeqCst);
        let attempt = tokio::spawn({
            let store = store.clone();
            async move { store.ping().await }
        });
        primary.hung.notified().await;
        attempt.abort();
        assert!(attempt.await.unwrap_err().is_cancelled());

        primary.hang.store(false, Ordering::SeqCst);
        store.ping().await.unwrap();
        assert_eq!(store.mode(), StoreMode::Primary);
    }
}
