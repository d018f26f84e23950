use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time;
use tracing::{debug, info, warn};

use crate::{
    config::LockConfig,
    error::{LockError, Result, StoreError},
    metrics::LockMetrics,
    models::{
        validate_job_name, validate_ttl, AcquireOutcome, FailurePolicy, HeldLock, OwnershipToken,
        ReleaseOutcome,
    },
    registry::OwnershipRegistry,
    store::LockBackend,
};

/// Cooperative mutual exclusion across process instances sharing one store.
///
/// No call ever waits for a lock to become free: every operation is a single
/// attempt against the backing store with an immediate answer.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Tries to take `key` for `ttl`. Returns `false` when another instance
    /// holds it, and also when the store is degraded under the fail-open
    /// policy.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Releases `key` if this instance still owns it. Only a transport
    /// failure is reported as an error.
    async fn release(&self, key: &str) -> Result<ReleaseOutcome>;

    /// Pushes the expiry of an owned lock out to `ttl` from now.
    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Best-effort release of every lock this instance holds. Returns the
    /// number of records actually deleted.
    async fn release_all(&self) -> usize;
}

/// [`DistributedLock`] implementation over any [`LockBackend`].
///
/// Cloning is cheap and clones share the backend, ownership registry and
/// metrics.
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    registry: OwnershipRegistry,
    config: Arc<LockConfig>,
    metrics: Arc<LockMetrics>,
}

impl LockManager {
    pub fn new(backend: impl LockBackend + 'static, config: LockConfig) -> Self {
        Self::with_registry(Arc::new(backend), config, OwnershipRegistry::new())
    }

    pub fn with_registry(
        backend: Arc<dyn LockBackend>,
        config: LockConfig,
        registry: OwnershipRegistry,
    ) -> Self {
        Self {
            backend,
            registry,
            config: Arc::new(config),
            metrics: LockMetrics::new(),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn registry(&self) -> &OwnershipRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<LockMetrics> {
        &self.metrics
    }

    /// Lock key for a job name under the configured namespace prefix.
    pub fn key_for(&self, job_name: &str) -> Result<String> {
        validate_job_name(job_name)?;
        Ok(format!("{}{}", self.config.key_prefix, job_name))
    }

    /// Same as [`DistributedLock::acquire`] but reports the diagnostic
    /// category instead of a plain boolean.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<AcquireOutcome> {
        validate_ttl(ttl)?;

        if self.config.probe_before_acquire {
            if let Err(e) = self.bounded(self.backend.ping()).await {
                warn!(
                    "Lock backend {} is unreachable, skipping {}: {}",
                    self.backend.name(),
                    key,
                    e
                );
                return self.degraded(key, AcquireOutcome::BackendUnreachable, e);
            }
        }

        let token = OwnershipToken::new();
        match self
            .bounded(self.backend.set_if_absent(key, &token.to_string(), ttl))
            .await
        {
            Ok(true) => {
                self.registry.insert(HeldLock::new(key, token, ttl));
                self.metrics.record_acquire(AcquireOutcome::Acquired);
                info!("Acquired lock: {} (ttl {:?})", key, ttl);
                Ok(AcquireOutcome::Acquired)
            }
            Ok(false) => {
                self.metrics.record_acquire(AcquireOutcome::HeldElsewhere);
                info!("Lock already held by another instance: {}", key);
                Ok(AcquireOutcome::HeldElsewhere)
            }
            Err(e) => {
                warn!("Error acquiring lock {}, skipping: {}", key, e);
                self.degraded(key, AcquireOutcome::BackendError, e)
            }
        }
    }

    /// Runs `job` only if `key` can be acquired, releasing the lock on every
    /// exit path.
    ///
    /// Returns `Ok(None)` without calling `job` when the lock is unavailable.
    /// The job's own error is returned unchanged; a failed release is logged
    /// and never replaces the job's result. If the job panics or the returned
    /// future is dropped mid-run, the release is handed to a background task.
    pub async fn with_lock<F, Fut, T, E>(
        &self,
        key: &str,
        ttl: Duration,
        job: F,
    ) -> std::result::Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<LockError>,
    {
        if !self.acquire(key, ttl).await? {
            self.metrics.record_run(false, false);
            debug!("Skipping job for {}: lock not acquired", key);
            return Ok(None);
        }

        let guard = ReleaseGuard::new(self.clone(), key);
        let result = job().await;

        if let Err(e) = self.release(key).await {
            warn!("Error releasing lock {} after execution: {}", key, e);
        }
        guard.disarm();

        self.metrics.record_run(true, result.is_err());
        result.map(Some)
    }

    async fn bounded<T, F>(&self, call: F) -> std::result::Result<T, StoreError>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        match time::timeout(self.config.op_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.config.op_timeout)),
        }
    }

    fn degraded(
        &self,
        key: &str,
        outcome: AcquireOutcome,
        source: StoreError,
    ) -> Result<AcquireOutcome> {
        self.metrics.record_acquire(outcome);
        match self.config.failure_policy {
            FailurePolicy::FailOpen => Ok(outcome),
            FailurePolicy::FailClosed => Err(LockError::BackendUnavailable {
                key: key.to_string(),
                source,
            }),
        }
    }
}

#[async_trait]
impl DistributedLock for LockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.try_acquire(key, ttl).await?.is_acquired())
    }

    async fn release(&self, key: &str) -> Result<ReleaseOutcome> {
        let Some(held) = self.registry.get(key) else {
            debug!("No lock token found for key: {}", key);
            self.metrics.record_release(ReleaseOutcome::NotHeld);
            return Ok(ReleaseOutcome::NotHeld);
        };

        let result = self
            .bounded(self.backend.compare_and_delete(key, &held.token.to_string()))
            .await;

        // The entry goes away whatever the store said
        self.registry.remove_if_token(key, held.token);

        match result {
            Ok(deleted) if deleted > 0 => {
                let held_for = chrono::Utc::now() - held.acquired_at;
                self.metrics.record_release(ReleaseOutcome::Released);
                info!(
                    "Released lock: {} (held {}ms)",
                    key,
                    held_for.num_milliseconds()
                );
                Ok(ReleaseOutcome::Released)
            }
            Ok(_) => {
                self.metrics.record_release(ReleaseOutcome::NotOwned);
                info!("Lock was not held or already expired: {}", key);
                Ok(ReleaseOutcome::NotOwned)
            }
            Err(e) => {
                self.metrics.record_release_error();
                warn!("Error releasing lock {}: {}", key, e);
                Err(e.into())
            }
        }
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool> {
        validate_ttl(ttl)?;

        let Some(token) = self.registry.token(key) else {
            debug!("No lock token found for key, not extending: {}", key);
            self.metrics.record_extend(false);
            return Ok(false);
        };

        match self
            .bounded(self.backend.compare_and_expire(key, &token.to_string(), ttl))
            .await
        {
            Ok(refreshed) if refreshed > 0 => {
                self.registry.refresh(key, token, ttl);
                self.metrics.record_extend(true);
                debug!("Extended lock: {} (ttl {:?})", key, ttl);
                Ok(true)
            }
            Ok(_) => {
                // Ownership is gone for good; keep the registry honest
                self.registry.remove_if_token(key, token);
                self.metrics.record_extend(false);
                warn!("Lock no longer owned, extension refused: {}", key);
                Ok(false)
            }
            Err(e) => {
                self.metrics.record_extend_error();
                warn!("Error extending lock {}: {}", key, e);
                Err(e.into())
            }
        }
    }

    async fn release_all(&self) -> usize {
        let keys = self.registry.keys();
        if keys.is_empty() {
            return 0;
        }

        info!("Releasing {} held lock(s)", keys.len());
        let mut released = 0;
        for key in keys {
            match self.release(&key).await {
                Ok(ReleaseOutcome::Released) => released += 1,
                Ok(_) => {}
                Err(e) => warn!("Error releasing lock {} during shutdown: {}", key, e),
            }
        }
        released
    }
}

/// Releases a lock from a background task when `with_lock` does not reach
/// its normal release, i.e. the job panicked or the future was dropped.
struct ReleaseGuard {
    manager: Option<LockManager>,
    key: String,
}

impl ReleaseGuard {
    fn new(manager: LockManager, key: &str) -> Self {
        Self {
            manager: Some(manager),
            key: key.to_string(),
        }
    }

    fn disarm(mut self) {
        self.manager = None;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(manager) = self.manager.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Job for {} ended abnormally, releasing lock in background", key);
                handle.spawn(async move {
                    if let Err(e) = manager.release(&key).await {
                        warn!("Error releasing lock {} after aborted job: {}", key, e);
                    }
                });
            }
            Err(_) => {
                warn!("No runtime to release lock {}; it will lapse after its TTL", key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    const TTL: Duration = Duration::from_secs(5);

    fn test_config() -> LockConfig {
        LockConfig {
            op_timeout: Duration::from_millis(100),
            ..LockConfig::default()
        }
    }

    fn manager_on(store: &MemoryBackend) -> LockManager {
        LockManager::new(store.clone(), test_config())
    }

    /// Wraps the memory store and injects failures per operation.
    #[derive(Clone, Default)]
    struct FaultyBackend {
        inner: MemoryBackend,
        ping_fails: bool,
        set_fails: bool,
        delete_fails: bool,
        expire_fails: bool,
        hang: bool,
    }

    impl FaultyBackend {
        async fn maybe_fail(&self, fails: bool, op: &str) -> std::result::Result<(), StoreError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            if fails {
                return Err(StoreError::Unavailable(format!("{} refused", op)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LockBackend for FaultyBackend {
        async fn set_if_absent(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> std::result::Result<bool, StoreError> {
            self.maybe_fail(self.set_fails, "set").await?;
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn compare_and_delete(
            &self,
            key: &str,
            expected: &str,
        ) -> std::result::Result<u64, StoreError> {
            self.maybe_fail(self.delete_fails, "delete").await?;
            self.inner.compare_and_delete(key, expected).await
        }

        async fn compare_and_expire(
            &self,
            key: &str,
            expected: &str,
            ttl: Duration,
        ) -> std::result::Result<u64, StoreError> {
            self.maybe_fail(self.expire_fails, "expire").await?;
            self.inner.compare_and_expire(key, expected, ttl).await
        }

        async fn ping(&self) -> std::result::Result<(), StoreError> {
            self.maybe_fail(self.ping_fails, "ping").await
        }

        fn name(&self) -> &'static str {
            "faulty"
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_acquire_release_reacquire_across_instances() {
        let store = MemoryBackend::new();
        let first = manager_on(&store);
        let second = manager_on(&store);

        assert!(first.acquire("job-A", TTL).await.unwrap());
        assert!(!second.acquire("job-A", TTL).await.unwrap());

        assert_eq!(first.release("job-A").await.unwrap(), ReleaseOutcome::Released);
        assert!(second.acquire("job-A", TTL).await.unwrap());
        assert!(!first.acquire("job-A", TTL).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion_under_contention() {
        let store = MemoryBackend::new();
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let manager = manager_on(&store);
                tokio::spawn(async move { manager.acquire("cron:lock:contended", TTL).await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_tokens_are_fresh_per_acquisition() {
        let store = MemoryBackend::new();
        let manager = manager_on(&store);

        assert!(manager.acquire("k", TTL).await.unwrap());
        let first = store.get("k").unwrap();
        assert_eq!(manager.registry().token("k").unwrap().to_string(), first);

        manager.release("k").await.unwrap();
        assert!(manager.acquire("k", TTL).await.unwrap());
        let second = store.get("k").unwrap();

        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_release_without_ownership_is_noop() {
        let store = MemoryBackend::new();
        let owner = manager_on(&store);
        let bystander = manager_on(&store);

        assert!(owner.acquire("k", TTL).await.unwrap());
        assert_eq!(bystander.release("k").await.unwrap(), ReleaseOutcome::NotHeld);
        assert!(store.get("k").is_some());
    }

    #[tokio::test]
    async fn test_stale_token_cannot_release_new_owner() {
        let store = MemoryBackend::new();
        let stale = manager_on(&store);
        let fresh = manager_on(&store);

        assert!(stale.acquire("k", Duration::from_millis(30)).await.unwrap());
        time::sleep(Duration::from_millis(60)).await;
        assert!(fresh.acquire("k", TTL).await.unwrap());
        let fresh_token = store.get("k").unwrap();

        assert_eq!(stale.release("k").await.unwrap(), ReleaseOutcome::NotOwned);
        assert!(!stale.registry().contains("k"));
        assert_eq!(store.get("k"), Some(fresh_token));
    }

    #[tokio::test]
    async fn test_extend_refreshes_owned_lock() {
        let store = MemoryBackend::new();
        let manager = manager_on(&store);

        assert!(manager.acquire("k", Duration::from_millis(200)).await.unwrap());
        assert!(manager.extend("k", Duration::from_secs(30)).await.unwrap());
        assert!(store.ttl("k").unwrap() > Duration::from_secs(20));
        assert!(!manager.registry().get("k").unwrap().is_probably_expired());
    }

    #[tokio::test]
    async fn test_extend_after_expiry_does_not_resurrect() {
        let store = MemoryBackend::new();
        let manager = manager_on(&store);

        assert!(manager.acquire("k", Duration::from_millis(30)).await.unwrap());
        time::sleep(Duration::from_millis(60)).await;

        assert!(!manager.extend("k", TTL).await.unwrap());
        assert!(store.get("k").is_none());
        assert!(!manager.registry().contains("k"));
    }

    #[tokio::test]
    async fn test_extend_after_release_returns_false() {
        let store = MemoryBackend::new();
        let manager = manager_on(&store);

        assert!(manager.acquire("k", TTL).await.unwrap());
        manager.release("k").await.unwrap();

        assert!(!manager.extend("k", TTL).await.unwrap());
        assert!(store.get("k").is_none());
    }

    #[tokio::test]
    async fn test_extend_does_not_adopt_unknown_record() {
        let store = MemoryBackend::new();
        store.set_if_absent("k", "left-over", TTL).await.unwrap();
        let manager = manager_on(&store);

        assert!(!manager.extend("k", Duration::from_secs(60)).await.unwrap());
        assert!(store.ttl("k").unwrap() <= TTL);
    }

    #[tokio::test]
    async fn test_invalid_ttl_is_rejected() {
        let store = MemoryBackend::new();
        let manager = manager_on(&store);

        let err = manager.acquire("k", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, LockError::InvalidTtl { .. }));
        assert!(store.is_empty());

        assert!(matches!(
            manager.extend("k", Duration::ZERO).await.unwrap_err(),
            LockError::InvalidTtl { .. }
        ));
    }

    #[tokio::test]
    async fn test_with_lock_runs_and_releases() {
        let store = MemoryBackend::new();
        let manager = manager_on(&store);

        let result: anyhow::Result<Option<u32>> = manager
            .with_lock("k", TTL, || async {
                assert!(store.get("k").is_some());
                Ok(42)
            })
            .await;

        assert_eq!(result.unwrap(), Some(42));
        assert!(store.get("k").is_none());
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_with_lock_skips_when_held_elsewhere() {
        let store = MemoryBackend::new();
        let holder = manager_on(&store);
        let contender = manager_on(&store);
        assert!(holder.acquire("k", TTL).await.unwrap());

        let ran = AtomicBool::new(false);
        let result: anyhow::Result<Option<()>> = contender
            .with_lock("k", TTL, || async {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(result.unwrap().is_none());
        assert!(!ran.load(Ordering::SeqCst));
        assert!(store.get("k").is_some());
        assert_eq!(contender.metrics().skipped_runs.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_with_lock_releases_when_job_fails() {
        let store = MemoryBackend::new();
        let manager = manager_on(&store);

        let result: anyhow::Result<Option<()>> = manager
            .with_lock("k", TTL, || async { Err(anyhow::anyhow!("job failed")) })
            .await;

        assert_eq!(result.unwrap_err().to_string(), "job failed");
        assert!(store.get("k").is_none());
        assert_eq!(manager.metrics().failed_runs.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_with_lock_job_error_wins_over_release_error() {
        let backend = FaultyBackend {
            delete_fails: true,
            ..Default::default()
        };
        let manager = LockManager::new(backend, test_config());

        let result: anyhow::Result<Option<()>> = manager
            .with_lock("k", TTL, || async { Err(anyhow::anyhow!("job failed")) })
            .await;
        assert_eq!(result.unwrap_err().to_string(), "job failed");

        // A successful job still reports success despite the failed release
        let result: anyhow::Result<Option<u8>> = manager
            .with_lock("other", TTL, || async { Ok(7) })
            .await;
        assert_eq!(result.unwrap(), Some(7));
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_panic() {
        let store = MemoryBackend::new();
        let manager = manager_on(&store);

        let task = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .with_lock("k", TTL, || async {
                        if true {
                            panic!("job exploded");
                        }
                        Ok::<(), anyhow::Error>(())
                    })
                    .await
            })
        };

        assert!(task.await.unwrap_err().is_panic());
        assert!(wait_until(|| store.get("k").is_none()).await);
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_cancellation() {
        let store = MemoryBackend::new();
        let manager = manager_on(&store);

        let outcome = time::timeout(
            Duration::from_millis(50),
            manager.with_lock("k", TTL, || async {
                time::sleep(Duration::from_secs(10)).await;
                Ok::<(), anyhow::Error>(())
            }),
        )
        .await;

        assert!(outcome.is_err());
        assert!(wait_until(|| store.get("k").is_none()).await);
    }

    #[tokio::test]
    async fn test_unreachable_backend_fails_open() {
        let backend = FaultyBackend {
            ping_fails: true,
            ..Default::default()
        };
        let manager = LockManager::new(backend, test_config());

        assert_eq!(
            manager.try_acquire("k", TTL).await.unwrap(),
            AcquireOutcome::BackendUnreachable
        );
        assert!(!manager.acquire("other", TTL).await.unwrap());
        assert!(manager.registry().is_empty());

        let ran = AtomicBool::new(false);
        let result: anyhow::Result<Option<()>> = manager
            .with_lock("k", TTL, || async {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(result.unwrap().is_none());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_set_error_is_reported_as_backend_error() {
        let backend = FaultyBackend {
            set_fails: true,
            ..Default::default()
        };
        let manager = LockManager::new(backend, test_config());

        assert_eq!(
            manager.try_acquire("k", TTL).await.unwrap(),
            AcquireOutcome::BackendError
        );
        let snapshot = manager.metrics().snapshot();
        assert_eq!(snapshot["acquire"]["backend_errors"], 1);
        assert_eq!(snapshot["acquire"]["backend_unreachable"], 0);
    }

    #[tokio::test]
    async fn test_unreachable_backend_fails_closed_when_configured() {
        let backend = FaultyBackend {
            ping_fails: true,
            ..Default::default()
        };
        let config = LockConfig {
            failure_policy: FailurePolicy::FailClosed,
            ..test_config()
        };
        let manager = LockManager::new(backend, config);

        let err = manager.acquire("k", TTL).await.unwrap_err();
        assert!(matches!(err, LockError::BackendUnavailable { ref key, .. } if key == "k"));

        let ran = AtomicBool::new(false);
        let result: anyhow::Result<Option<()>> = manager
            .with_lock("k", TTL, || async {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(result.is_err());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_hanging_backend_times_out() {
        let backend = FaultyBackend {
            hang: true,
            ..Default::default()
        };
        let manager = LockManager::new(backend, test_config());

        let started = Instant::now();
        assert!(!manager.acquire("k", TTL).await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(manager.metrics().backend_unreachable.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_skipping_probe_goes_straight_to_set() {
        let backend = FaultyBackend {
            ping_fails: true,
            ..Default::default()
        };
        let config = LockConfig {
            probe_before_acquire: false,
            ..test_config()
        };
        let manager = LockManager::new(backend, config);

        assert!(manager.acquire("k", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_transport_error_still_clears_registry() {
        let backend = FaultyBackend {
            delete_fails: true,
            ..Default::default()
        };
        let manager = LockManager::new(backend, test_config());

        assert!(manager.acquire("k", TTL).await.unwrap());
        let err = manager.release("k").await.unwrap_err();
        assert!(matches!(err, LockError::Store(StoreError::Unavailable(_))));
        assert!(!manager.registry().contains("k"));
        assert_eq!(manager.metrics().release_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_extend_transport_error_is_returned() {
        let backend = FaultyBackend {
            expire_fails: true,
            ..Default::default()
        };
        let manager = LockManager::new(backend, test_config());

        assert!(manager.acquire("k", TTL).await.unwrap());
        assert!(matches!(
            manager.extend("k", TTL).await.unwrap_err(),
            LockError::Store(_)
        ));
        // A transport error says nothing about ownership, so the entry stays
        assert!(manager.registry().contains("k"));
    }

    #[tokio::test]
    async fn test_release_all_releases_every_held_lock() {
        let store = MemoryBackend::new();
        let manager = manager_on(&store);
        let other = manager_on(&store);

        for job in ["a", "b", "c"] {
            assert!(manager.acquire(job, TTL).await.unwrap());
        }
        assert!(other.acquire("d", TTL).await.unwrap());

        assert_eq!(manager.release_all().await, 3);
        assert!(manager.registry().is_empty());
        assert!(store.get("a").is_none());
        assert!(store.get("d").is_some());

        assert_eq!(manager.release_all().await, 0);
    }

    #[tokio::test]
    async fn test_release_all_continues_past_failures() {
        let backend = FaultyBackend {
            delete_fails: true,
            ..Default::default()
        };
        let manager = LockManager::new(backend, test_config());

        assert!(manager.acquire("a", TTL).await.unwrap());
        assert!(manager.acquire("b", TTL).await.unwrap());

        assert_eq!(manager.release_all().await, 0);
        assert!(manager.registry().is_empty());
        assert_eq!(manager.metrics().release_errors.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_managers_keep_separate_registries() {
        let store = MemoryBackend::new();
        let a = manager_on(&store);
        let b = manager_on(&store);

        assert!(a.acquire("k", TTL).await.unwrap());
        assert!(a.registry().contains("k"));
        assert!(!b.registry().contains("k"));

        let shared = OwnershipRegistry::new();
        let c = LockManager::with_registry(Arc::new(store.clone()), test_config(), shared.clone());
        assert!(c.acquire("j", TTL).await.unwrap());
        assert!(shared.contains("j"));
    }

    #[tokio::test]
    async fn test_key_for_uses_configured_prefix() {
        let store = MemoryBackend::new();
        let manager = manager_on(&store);
        assert_eq!(manager.key_for("nightly-report").unwrap(), "cron:lock:nightly-report");
        assert!(matches!(
            manager.key_for("").unwrap_err(),
            LockError::InvalidJobName { .. }
        ));

        let custom = LockManager::new(
            store,
            LockConfig {
                key_prefix: "billing:lock:".to_string(),
                ..test_config()
            },
        );
        assert_eq!(custom.key_for("invoices").unwrap(), "billing:lock:invoices");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_with_lock_never_overlaps() {
        let store = MemoryBackend::new();
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager_on(&store);
                let active = active.clone();
                let overlaps = overlaps.clone();
                tokio::spawn(async move {
                    for _ in 0..20 {
                        let _: anyhow::Result<Option<()>> = manager
                            .with_lock("shared", TTL, || async {
                                if active.fetch_add(1, Ordering::SeqCst) > 0 {
                                    overlaps.fetch_add(1, Ordering::SeqCst);
                                }
                                tokio::task::yield_now().await;
                                active.fetch_sub(1, Ordering::SeqCst);
                                Ok(())
                            })
                            .await;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }
}
