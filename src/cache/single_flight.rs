// =============================================================================
// Single-flight Recomputer — at most one upstream call per key
// =============================================================================
//
// `recompute` either joins the recomputation already registered for a key or
// claims the key with a new shared future. A claimed future is spawned onto
// the runtime immediately, so the write-back and marker cleanup happen even
// if every caller that awaited it has gone away.
//
// On success the fresh value is written with its horizon TTL. On failure or
// timeout the old (stale) entry is left untouched and the error counter is
// bumped: a stale serve beats no serve. The in-flight marker is cleared in
// both cases.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::cache::store::{InFlight, InFlightClaim, VerdictStore};
use crate::clock::Clock;
use crate::compute::ComputeProvider;
use crate::error::ComputeError;
use crate::runtime_config::ComputeConfig;
use crate::types::{CacheKey, RawVerdict};

/// Counters for the recompute path.
#[derive(Debug, Default)]
pub struct RecomputeStats {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    joined: AtomicU64,
}

/// Serialisable view of [`RecomputeStats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecomputeSnapshot {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub joined: u64,
}

impl RecomputeStats {
    pub fn snapshot(&self) -> RecomputeSnapshot {
        RecomputeSnapshot {
            started: self.started.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
        }
    }
}

pub struct Recomputer {
    store: Arc<dyn VerdictStore>,
    provider: Arc<dyn ComputeProvider>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    stats: Arc<RecomputeStats>,
}

impl Recomputer {
    pub fn new(
        store: Arc<dyn VerdictStore>,
        provider: Arc<dyn ComputeProvider>,
        clock: Arc<dyn Clock>,
        config: &ComputeConfig,
    ) -> Self {
        Self {
            store,
            provider,
            clock,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            timeout: Duration::from_millis(config.timeout_ms),
            stats: Arc::new(RecomputeStats::default()),
        }
    }

    pub fn stats(&self) -> RecomputeSnapshot {
        self.stats.snapshot()
    }

    /// Start (or join) the recomputation for `key`. Must be called from
    /// within a Tokio runtime.
    pub fn recompute(&self, key: &CacheKey) -> InFlight {
        let key_str = key.to_string();

        if let Some(existing) = self.store.get_in_flight(&key_str) {
            self.stats.joined.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key_str, "joined in-flight recomputation");
            return existing;
        }

        let fut = self.compute_and_store(key.clone()).boxed().shared();

        match self.store.claim_in_flight(&key_str, fut.clone()) {
            InFlightClaim::Existing(other) => {
                self.stats.joined.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key_str, "lost claim race, joining in-flight recomputation");
                other
            }
            InFlightClaim::Claimed => {
                self.stats.started.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(fut.clone());
                fut
            }
        }
    }

    fn compute_and_store(
        &self,
        key: CacheKey,
    ) -> impl std::future::Future<Output = Result<RawVerdict, ComputeError>> + Send + 'static {
        let store = self.store.clone();
        let provider = self.provider.clone();
        let clock = self.clock.clone();
        let permits = self.permits.clone();
        let timeout = self.timeout;
        let stats = self.stats.clone();

        async move {
            let key_str = key.to_string();

            // The deadline covers the wait for a permit as well as the call.
            let attempt = async {
                let _permit = permits
                    .acquire()
                    .await
                    .map_err(|e| ComputeError::Aborted(e.to_string()))?;
                provider.compute(key.symbol(), key.horizon()).await
            };
            let result = match tokio::time::timeout(timeout, attempt).await {
                Ok(res) => res,
                Err(_) => Err(ComputeError::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            };

            let result = match result {
                Ok(mut verdict) => {
                    if verdict.computed_at_ms <= 0 {
                        verdict.computed_at_ms = clock.now_ms();
                    }
                    store.set_with_horizon(&key_str, verdict.clone(), key.horizon());
                    stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key_str, "recomputation stored");
                    Ok(verdict)
                }
                Err(e) => {
                    let failures = stats.failed.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        key = %key_str,
                        error = %e,
                        failures,
                        "upstream compute failed, keeping stale value"
                    );
                    Err(e)
                }
            };

            store.clear_in_flight(&key_str);
            result
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::store::InMemoryStore;
    use crate::clock::ManualClock;
    use crate::runtime_config::CacheConfig;
    use crate::types::fixtures::raw;
    use crate::types::Horizon;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    /// Provider that counts calls, optionally blocks until released, and can
    /// be switched into failure mode.
    pub(crate) struct FakeProvider {
        pub calls: AtomicU64,
        pub fail: AtomicBool,
        pub gate: Option<Arc<Notify>>,
        pub confidence: parking_lot::Mutex<f64>,
    }

    impl FakeProvider {
        pub fn new() -> Self {
            Self {
                calls: AtomicU64::new(0),
                fail: AtomicBool::new(false),
                gate: None,
                confidence: parking_lot::Mutex::new(0.6),
            }
        }

        pub fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new()
            }
        }

        pub fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ComputeProvider for FakeProvider {
        async fn compute(
            &self,
            symbol: &str,
            horizon: Horizon,
        ) -> Result<RawVerdict, ComputeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(ComputeError::Upstream("boom".into()));
            }
            let mut v = raw(symbol, horizon);
            v.confidence = *self.confidence.lock();
            v.computed_at_ms = n as i64 * 1_000;
            Ok(v)
        }
    }

    fn setup(provider: Arc<FakeProvider>) -> (Arc<InMemoryStore>, Recomputer) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(10_000));
        let store = Arc::new(InMemoryStore::new(CacheConfig::default(), clock.clone()));
        let r = Recomputer::new(store.clone(), provider, clock, &ComputeConfig::default());
        (store, r)
    }

    #[tokio::test]
    async fn concurrent_recomputes_share_one_call() {
        let gate = Arc::new(Notify::new());
        let provider = Arc::new(FakeProvider::gated(gate.clone()));
        let (store, r) = setup(provider.clone());
        let key = CacheKey::new("BTCUSDT", Horizon::Short);

        let handles: Vec<InFlight> = (0..8).map(|_| r.recompute(&key)).collect();
        assert_eq!(store.stats().in_flight, 1);

        // Let the spawned task reach the gate, then release it.
        while provider.calls() == 0 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        for h in handles {
            assert_eq!(h.await.unwrap().symbol, "BTCUSDT");
        }
        assert_eq!(provider.calls(), 1);
        assert_eq!(r.stats().started, 1);
        assert_eq!(r.stats().joined, 7);
        assert!(store.get_in_flight("BTCUSDT:short").is_none());
        assert!(store.get_fresh("BTCUSDT:short").is_some());
    }

    #[tokio::test]
    async fn failure_keeps_stale_value_and_clears_marker() {
        let provider = Arc::new(FakeProvider::new());
        let (store, r) = setup(provider.clone());
        let key = CacheKey::new("ETHUSDT", Horizon::Medium);

        r.recompute(&key).await.unwrap();
        provider.fail.store(true, Ordering::SeqCst);

        let err = r.recompute(&key).await.unwrap_err();
        assert!(matches!(err, ComputeError::Upstream(_)));
        assert!(store.get_stale_ok("ETHUSDT:medium").is_some());
        assert!(store.get_in_flight("ETHUSDT:medium").is_none());
        assert_eq!(r.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_treated_as_failure() {
        let gate = Arc::new(Notify::new());
        let provider = Arc::new(FakeProvider::gated(gate));
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryStore::new(CacheConfig::default(), clock.clone()));
        let cfg = ComputeConfig {
            timeout_ms: 50,
            max_concurrent: 1,
        };
        let r = Recomputer::new(store.clone(), provider, clock, &cfg);

        let err = r
            .recompute(&CacheKey::new("SOLUSDT", Horizon::Long))
            .await
            .unwrap_err();
        assert_eq!(err, ComputeError::Timeout { timeout_ms: 50 });
        assert!(store.get_in_flight("SOLUSDT:long").is_none());
        assert!(store.get_stale_ok("SOLUSDT:long").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_permit_wait_counts_against_timeout() {
        let gate = Arc::new(Notify::new());
        let provider = Arc::new(FakeProvider::gated(gate));
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryStore::new(CacheConfig::default(), clock.clone()));
        let cfg = ComputeConfig {
            timeout_ms: 50,
            max_concurrent: 1,
        };
        let r = Recomputer::new(store, provider, clock, &cfg);

        let start = tokio::time::Instant::now();
        let holder = r.recompute(&CacheKey::new("BTCUSDT", Horizon::Short));
        let queued = r.recompute(&CacheKey::new("ETHUSDT", Horizon::Short));

        let err = queued.await.unwrap_err();
        assert_eq!(err, ComputeError::Timeout { timeout_ms: 50 });
        assert!(start.elapsed() <= Duration::from_millis(50));
        assert!(holder.await.is_err());
    }

    #[tokio::test]
    async fn marker_cleared_after_success_allows_new_recompute() {
        let provider = Arc::new(FakeProvider::new());
        let (_store, r) = setup(provider.clone());
        let key = CacheKey::new("BTCUSDT", Horizon::Long);

        r.recompute(&key).await.unwrap();
        r.recompute(&key).await.unwrap();
        assert_eq!(provider.calls(), 2);
    }
}
