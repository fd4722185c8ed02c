use crate::api::{EvaluatedFlag, FlagError};
use crate::flag_matching::FlagMatcher;
use crate::flag_request::Subject;
use crate::flag_store::SharedFlagStore;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// EvaluationCacheManager keeps recently evaluated flag sets per subject using
/// `moka` for caching.
///
/// Features:
/// - **TTL**: Each entry expires after a configurable window (default 5 minutes).
///   Expiry is the only invalidation; admin writes become visible to a subject
///   once their window lapses.
/// - **Per-subject coalescing**: Uses moka's `try_get_with` so that concurrent
///   requests for the same subject coalesce into a single evaluation pass, while
///   requests for different subjects proceed in parallel. This prevents
///   thundering herd on cache miss without introducing cross-subject blocking.
/// - **Errors are not cached**: A failed store read propagates to every
///   coalesced waiter and the next request retries.
///
/// Entries are keyed by subject id alone. A subject presenting a different role
/// or studio inside the TTL window is served the cached set.
///
/// ```text
/// EvaluationCacheManager {
///     store: PostgresFlagStore { pool },
///     cache: Cache<Uuid, Arc<Vec<EvaluatedFlag>>> {
///         // Example:
///         018f4a3e-...-01: [
///             EvaluatedFlag { key: "dark_mode", value: Boolean(true) },
///             EvaluatedFlag { key: "new_invoice_flow", value: Boolean(false) }
///         ],
///         018f4a3e-...-02: [
///             EvaluatedFlag { key: "dark_mode", value: Boolean(false) }
///         ]
///     }
/// }
/// ```
#[derive(Clone)]
pub struct EvaluationCacheManager {
    store: SharedFlagStore,
    cache: Cache<Uuid, Arc<Vec<EvaluatedFlag>>>,
}

impl EvaluationCacheManager {
    /// Default time-to-live for cached evaluations: 5 minutes.
    const DEFAULT_TTL_SECONDS: u64 = 300;

    /// Default maximum number of cached subjects.
    const DEFAULT_MAX_SUBJECT_ENTRIES: u64 = 100_000;

    pub fn new(store: SharedFlagStore, max_entries: Option<u64>, ttl_seconds: Option<u64>) -> Self {
        let cache = Cache::builder()
            .time_to_live(Duration::from_secs(
                ttl_seconds.unwrap_or(Self::DEFAULT_TTL_SECONDS),
            ))
            .max_capacity(max_entries.unwrap_or(Self::DEFAULT_MAX_SUBJECT_ENTRIES))
            .build();

        Self { store, cache }
    }

    /// Retrieves the evaluated flag set for a subject.
    ///
    /// Uses moka's `try_get_with` for per-subject coalescing:
    /// - If cached: returns immediately (cache hit)
    /// - If not cached: only one caller runs the evaluation, others wait for
    ///   the result
    /// - Different subjects evaluate in parallel (no cross-subject blocking)
    pub async fn get_evaluated_flags(
        &self,
        subject: &Subject,
    ) -> Result<Arc<Vec<EvaluatedFlag>>, FlagError> {
        if let Some(cached) = self.cache.get(&subject.id).await {
            return Ok(cached);
        }

        let store = self.store.clone();
        let subject = subject.clone();

        self.cache
            .try_get_with(subject.id, async move {
                FlagMatcher::new(subject, store)
                    .evaluate_all()
                    .await
                    .map(Arc::new)
            })
            .await
            .map_err(|arc_err| owned_store_error(&arc_err))
    }
}

// moka hands coalesced waiters the error behind an `Arc`, so an owned error has
// to be rebuilt for the response path. Evaluation only fails on store reads,
// which all map to service-level variants.
fn owned_store_error(err: &FlagError) -> FlagError {
    match err {
        FlagError::TimeoutError => FlagError::TimeoutError,
        FlagError::DataParsingError => FlagError::DataParsingError,
        _ => FlagError::DatabaseUnavailable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flag_definitions::{FeatureFlag, FlagScope, FlagValue, ValueType};
    use crate::flag_overrides::FlagOverride;
    use crate::flag_store::{FlagStore, FlagUpdate, NewFlag, NewOverride};
    use crate::test_utils::{test_subject, MemoryFlagStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::{Barrier, Notify};
    use tokio::time::{sleep, timeout};

    // ==================== Concurrency Tests ====================
    //
    // These tests verify the concurrency properties of EvaluationCacheManager:
    // - Same-subject coalescing: concurrent requests for one subject evaluate once
    // - Cross-subject parallelism: requests for different subjects run in parallel
    // - Error propagation: errors reach every coalesced waiter
    // - Error not cached: a failed evaluation is retried on the next request
    //
    // They use explicit synchronization (Notify, Barrier) instead of timing
    // delays to stay deterministic regardless of OS scheduling or CI load.

    /// A store wrapper that counts active-flag reads and supports
    /// synchronization primitives for testing concurrency behavior.
    ///
    /// Protocol for the Notify pair:
    /// 1. Test spawns N tasks that call get_evaluated_flags
    /// 2. First task enters the read, signals `fetch_started`, waits on `may_complete`
    /// 3. Test receives `fetch_started`, yields to let other tasks queue, signals `may_complete`
    /// 4. The read completes, all coalesced tasks get the result
    struct InstrumentedStore {
        inner: MemoryFlagStore,
        fetch_count: AtomicU32,
        /// Signaled when an active-flag read has started, the test waits on this
        fetch_started: Option<Arc<Notify>>,
        /// The read waits on this before completing, the test signals when ready
        may_complete: Option<Arc<Notify>>,
        /// Requires all participating reads to arrive before any can proceed
        barrier: Option<Arc<Barrier>>,
        /// When set, active-flag reads fail instead of delegating
        fail_reads: AtomicBool,
    }

    impl InstrumentedStore {
        fn new(inner: MemoryFlagStore) -> Self {
            Self {
                inner,
                fetch_count: AtomicU32::new(0),
                fetch_started: None,
                may_complete: None,
                barrier: None,
                fail_reads: AtomicBool::new(false),
            }
        }

        fn with_notify_pair(mut self, fetch_started: Arc<Notify>, may_complete: Arc<Notify>) -> Self {
            self.fetch_started = Some(fetch_started);
            self.may_complete = Some(may_complete);
            self
        }

        fn with_barrier(mut self, barrier: Arc<Barrier>) -> Self {
            self.barrier = Some(barrier);
            self
        }

        fn failing(self) -> Self {
            self.fail_reads.store(true, Ordering::SeqCst);
            self
        }

        fn set_fail_reads(&self, fail: bool) {
            self.fail_reads.store(fail, Ordering::SeqCst);
        }

        fn fetch_count(&self) -> u32 {
            self.fetch_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FlagStore for InstrumentedStore {
        async fn get_active_flags(&self) -> Result<Vec<FeatureFlag>, FlagError> {
            self.fetch_count.fetch_add(1, Ordering::SeqCst);

            if let Some(fetch_started) = &self.fetch_started {
                fetch_started.notify_one();
            }
            if let Some(may_complete) = &self.may_complete {
                may_complete.notified().await;
            }
            if let Some(barrier) = &self.barrier {
                barrier.wait().await;
            }
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(FlagError::DatabaseUnavailable);
            }

            self.inner.get_active_flags().await
        }

        async fn get_flag(&self, key: &str) -> Result<FeatureFlag, FlagError> {
            self.inner.get_flag(key).await
        }

        async fn list_flags(&self) -> Result<Vec<FeatureFlag>, FlagError> {
            self.inner.list_flags().await
        }

        async fn create_flag(&self, new_flag: NewFlag) -> Result<FeatureFlag, FlagError> {
            self.inner.create_flag(new_flag).await
        }

        async fn update_flag(
            &self,
            key: &str,
            update: FlagUpdate,
        ) -> Result<FeatureFlag, FlagError> {
            self.inner.update_flag(key, update).await
        }

        async fn delete_flag(&self, key: &str) -> Result<(), FlagError> {
            self.inner.delete_flag(key).await
        }

        async fn create_override(
            &self,
            new_override: NewOverride,
        ) -> Result<FlagOverride, FlagError> {
            self.inner.create_override(new_override).await
        }

        async fn deactivate_override(&self, id: Uuid) -> Result<FlagOverride, FlagError> {
            self.inner.deactivate_override(id).await
        }

        async fn get_subject_override(
            &self,
            flag: &FeatureFlag,
            subject_id: Uuid,
        ) -> Result<Option<FlagOverride>, FlagError> {
            self.inner.get_subject_override(flag, subject_id).await
        }

        async fn list_overrides(&self, flag_key: &str) -> Result<Vec<FlagOverride>, FlagError> {
            self.inner.list_overrides(flag_key).await
        }

        async fn ping(&self) -> Result<(), FlagError> {
            self.inner.ping().await
        }
    }

    fn seed_flag(key: &str) -> NewFlag {
        NewFlag {
            key: key.to_string(),
            name: key.to_string(),
            description: String::new(),
            category: String::new(),
            value_type: ValueType::Boolean,
            base_value: FlagValue::Boolean(true),
            scope: FlagScope::Global,
            target_roles: vec![],
            target_studios: vec![],
            rollout_percentage: 100,
            is_active: true,
        }
    }

    async fn seeded_store() -> MemoryFlagStore {
        let store = MemoryFlagStore::new();
        store.create_flag(seed_flag("dark_mode")).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_cache_hit_skips_the_store() {
        let instrumented = Arc::new(InstrumentedStore::new(seeded_store().await));
        let store: SharedFlagStore = instrumented.clone();
        let cache = EvaluationCacheManager::new(store, None, None);
        let subject = test_subject(Uuid::now_v7(), "student");

        let first = cache.get_evaluated_flags(&subject).await.unwrap();
        let second = cache.get_evaluated_flags(&subject).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].key, "dark_mode");
        assert_eq!(first[0].value, FlagValue::Boolean(true));
        assert_eq!(
            instrumented.fetch_count(),
            1,
            "Second request should be served from cache"
        );
    }

    #[tokio::test]
    async fn test_distinct_subjects_evaluate_separately() {
        let instrumented = Arc::new(InstrumentedStore::new(seeded_store().await));
        let store: SharedFlagStore = instrumented.clone();
        let cache = EvaluationCacheManager::new(store, None, None);

        cache
            .get_evaluated_flags(&test_subject(Uuid::now_v7(), "student"))
            .await
            .unwrap();
        cache
            .get_evaluated_flags(&test_subject(Uuid::now_v7(), "student"))
            .await
            .unwrap();

        assert_eq!(
            instrumented.fetch_count(),
            2,
            "Each subject gets its own evaluation"
        );
    }

    /// Tests that multiple concurrent requests for the same subject result in
    /// exactly one evaluation pass.
    ///
    /// This test is deterministic: it uses explicit synchronization to ensure
    /// all requests are queued before the evaluation completes, regardless of
    /// OS scheduling.
    #[tokio::test]
    async fn test_same_subject_coalescing() {
        const NUM_CONCURRENT_REQUESTS: usize = 10;

        let fetch_started = Arc::new(Notify::new());
        let may_complete = Arc::new(Notify::new());

        let instrumented = Arc::new(
            InstrumentedStore::new(seeded_store().await)
                .with_notify_pair(Arc::clone(&fetch_started), Arc::clone(&may_complete)),
        );
        let store: SharedFlagStore = instrumented.clone();
        let cache = EvaluationCacheManager::new(store, None, None);
        let subject = test_subject(Uuid::now_v7(), "student");

        // Spawn concurrent requests for the same subject
        let handles: Vec<_> = (0..NUM_CONCURRENT_REQUESTS)
            .map(|_| {
                let cache = cache.clone();
                let subject = subject.clone();
                tokio::spawn(async move { cache.get_evaluated_flags(&subject).await })
            })
            .collect();

        // Wait for the evaluation to start (with timeout for safety)
        timeout(Duration::from_secs(5), fetch_started.notified())
            .await
            .expect("Evaluation should have started");

        // Yield to the executor multiple times to ensure all other tasks have
        // entered get_evaluated_flags and are waiting on moka's internal
        // coalescing before we allow the evaluation to complete.
        for _ in 0..NUM_CONCURRENT_REQUESTS {
            tokio::task::yield_now().await;
        }

        // Now allow the evaluation to complete
        may_complete.notify_one();

        let results = timeout(Duration::from_secs(5), futures::future::join_all(handles))
            .await
            .expect("All requests should complete");

        for result in &results {
            assert!(
                result.as_ref().unwrap().is_ok(),
                "All requests should succeed"
            );
        }

        assert_eq!(
            instrumented.fetch_count(),
            1,
            "Only 1 evaluation should occur for {} concurrent requests to the same subject",
            NUM_CONCURRENT_REQUESTS
        );
    }

    /// Tests that concurrent requests for different subjects evaluate in parallel.
    ///
    /// The barrier inside the store read requires all N reads to arrive before
    /// any can proceed. If evaluations were serialized, this would deadlock.
    #[tokio::test]
    async fn test_cross_subject_parallelism() {
        const NUM_SUBJECTS: usize = 5;

        let barrier = Arc::new(Barrier::new(NUM_SUBJECTS));
        let instrumented =
            Arc::new(InstrumentedStore::new(seeded_store().await).with_barrier(Arc::clone(&barrier)));
        let store: SharedFlagStore = instrumented.clone();
        let cache = EvaluationCacheManager::new(store, None, None);

        let handles: Vec<_> = (0..NUM_SUBJECTS)
            .map(|_| {
                let cache = cache.clone();
                let subject = test_subject(Uuid::now_v7(), "student");
                tokio::spawn(async move { cache.get_evaluated_flags(&subject).await })
            })
            .collect();

        // A timeout here means the evaluations were serialized
        let results = timeout(Duration::from_secs(5), futures::future::join_all(handles))
            .await
            .expect("Deadlock detected: cross-subject requests should evaluate in parallel");

        for result in &results {
            assert!(
                result.as_ref().unwrap().is_ok(),
                "All requests should succeed"
            );
        }

        assert_eq!(
            instrumented.fetch_count(),
            NUM_SUBJECTS as u32,
            "Each subject should trigger exactly one evaluation"
        );
    }

    /// Tests that when the store read fails, all coalesced waiters receive the
    /// error.
    #[tokio::test]
    async fn test_error_propagation_to_coalesced_waiters() {
        const NUM_CONCURRENT_REQUESTS: usize = 5;

        let fetch_started = Arc::new(Notify::new());
        let may_complete = Arc::new(Notify::new());

        let instrumented = Arc::new(
            InstrumentedStore::new(seeded_store().await)
                .with_notify_pair(Arc::clone(&fetch_started), Arc::clone(&may_complete))
                .failing(),
        );
        let store: SharedFlagStore = instrumented.clone();
        let cache = EvaluationCacheManager::new(store, None, None);
        let subject = test_subject(Uuid::now_v7(), "student");

        let handles: Vec<_> = (0..NUM_CONCURRENT_REQUESTS)
            .map(|_| {
                let cache = cache.clone();
                let subject = subject.clone();
                tokio::spawn(async move { cache.get_evaluated_flags(&subject).await })
            })
            .collect();

        timeout(Duration::from_secs(5), fetch_started.notified())
            .await
            .expect("Evaluation should have started");

        for _ in 0..NUM_CONCURRENT_REQUESTS {
            tokio::task::yield_now().await;
        }

        may_complete.notify_one();

        let results = timeout(Duration::from_secs(5), futures::future::join_all(handles))
            .await
            .expect("All requests should complete");

        for (i, result) in results.iter().enumerate() {
            let inner = result.as_ref().unwrap();
            assert!(
                matches!(inner, Err(FlagError::DatabaseUnavailable)),
                "Request {} should have received DatabaseUnavailable",
                i
            );
        }

        assert_eq!(
            instrumented.fetch_count(),
            1,
            "Only 1 evaluation should occur even when it fails"
        );
    }

    /// Tests that errors are not cached and the next request retries.
    #[tokio::test]
    async fn test_error_not_cached() {
        let instrumented = Arc::new(InstrumentedStore::new(seeded_store().await).failing());
        let store: SharedFlagStore = instrumented.clone();
        let cache = EvaluationCacheManager::new(store, None, None);
        let subject = test_subject(Uuid::now_v7(), "student");

        let first = cache.get_evaluated_flags(&subject).await;
        assert!(matches!(first, Err(FlagError::DatabaseUnavailable)));

        instrumented.set_fail_reads(false);

        let second = cache.get_evaluated_flags(&subject).await.unwrap();
        assert_eq!(second[0].value, FlagValue::Boolean(true));
        assert_eq!(
            instrumented.fetch_count(),
            2,
            "Failed evaluation should be retried, not served from cache"
        );
    }

    /// Tests that cache entries expire after the configured TTL.
    #[tokio::test]
    async fn test_cache_expiry() {
        let instrumented = Arc::new(InstrumentedStore::new(seeded_store().await));
        let store: SharedFlagStore = instrumented.clone();
        let cache = EvaluationCacheManager::new(store, None, Some(1));
        let subject = test_subject(Uuid::now_v7(), "student");

        cache.get_evaluated_flags(&subject).await.unwrap();
        assert_eq!(instrumented.fetch_count(), 1);

        // moka runs on wall-clock time, so the expiry needs a real sleep
        sleep(Duration::from_millis(1100)).await;

        cache.get_evaluated_flags(&subject).await.unwrap();
        assert_eq!(
            instrumented.fetch_count(),
            2,
            "Expired entry should be re-evaluated"
        );
    }

    /// Tests that evaluation results flow through the cache unchanged, override
    /// included.
    #[tokio::test]
    async fn test_cached_set_reflects_overrides() {
        let memory = seeded_store().await;
        let subject = test_subject(Uuid::now_v7(), "student");
        memory
            .create_override(NewOverride {
                flag_key: "dark_mode".to_string(),
                subject_id: Some(subject.id),
                studio_id: None,
                value: FlagValue::Boolean(false),
            })
            .await
            .unwrap();

        let store: SharedFlagStore = Arc::new(InstrumentedStore::new(memory));
        let cache = EvaluationCacheManager::new(store, None, None);

        let evaluated = cache.get_evaluated_flags(&subject).await.unwrap();
        assert_eq!(evaluated[0].value, FlagValue::Boolean(false));
    }
}
