// =============================================================================
// Warmup Job — keep a fixed watch-list hot
// =============================================================================
//
// Every run: drop watch-list pairs whose cache is already fresh, recompute
// the rest with bounded parallelism and a stagger, then prune dead entries.
// Task i starts no earlier than i * stagger after the run began; time spent
// queued for a parallelism slot counts towards that offset.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::info;

use super::{Job, TickReport};
use crate::cache::{Recomputer, VerdictStore};
use crate::runtime_config::WarmupConfig;
use crate::types::CacheKey;

pub struct WarmupJob {
    store: Arc<dyn VerdictStore>,
    recomputer: Arc<Recomputer>,
    config: WarmupConfig,
}

impl WarmupJob {
    pub fn new(store: Arc<dyn VerdictStore>, recomputer: Arc<Recomputer>, config: WarmupConfig) -> Self {
        Self {
            store,
            recomputer,
            config,
        }
    }
}

#[async_trait]
impl Job for WarmupJob {
    fn name(&self) -> &'static str {
        "warmup"
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.interval_ms)
    }

    async fn run_once(&self) -> anyhow::Result<TickReport> {
        let mut report = TickReport {
            scanned: self.config.watchlist.len(),
            ..TickReport::default()
        };

        let pending: Vec<CacheKey> = self
            .config
            .watchlist
            .iter()
            .map(|w| CacheKey::new(&w.symbol, w.horizon))
            .filter(|key| {
                let fresh = self.store.get_fresh(&key.to_string()).is_some();
                if fresh {
                    report.skipped_fresh += 1;
                }
                !fresh
            })
            .collect();
        report.triggered = pending.len();

        let stagger = Duration::from_millis(self.config.stagger_ms);
        let started = Instant::now();
        let results: Vec<bool> = stream::iter(pending.into_iter().enumerate())
            .map(|(i, key)| {
                let recomputer = self.recomputer.clone();
                let offset = stagger.saturating_mul(u32::try_from(i).unwrap_or(u32::MAX));
                let not_before = started.checked_add(offset).unwrap_or(started);
                async move {
                    tokio::time::sleep_until(not_before).await;
                    recomputer.recompute(&key).await.is_ok()
                }
            })
            .buffer_unordered(self.config.parallelism.max(1))
            .collect()
            .await;

        report.succeeded = results.iter().filter(|ok| **ok).count();
        report.failed = results.len() - report.succeeded;

        if self.config.prune_after_run {
            report.pruned = self.store.prune();
        }

        info!(
            watchlist = report.scanned,
            fresh = report.skipped_fresh,
            warmed = report.succeeded,
            failed = report.failed,
            pruned = report.pruned,
            "warmup run complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::single_flight::tests::FakeProvider;
    use crate::cache::InMemoryStore;
    use crate::clock::{Clock, ManualClock};
    use crate::compute::ComputeProvider;
    use crate::error::ComputeError;
    use crate::runtime_config::{CacheConfig, ComputeConfig, WatchItem};
    use crate::types::fixtures::raw;
    use crate::types::{Horizon, RawVerdict};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider that holds each call for a fixed time and records how many
    /// calls overlapped and when each one started.
    struct SlowProvider {
        hold: Duration,
        origin: Instant,
        active: AtomicUsize,
        peak: AtomicUsize,
        starts: Mutex<Vec<Duration>>,
    }

    impl SlowProvider {
        fn new(hold: Duration) -> Self {
            Self {
                hold,
                origin: Instant::now(),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                starts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ComputeProvider for SlowProvider {
        async fn compute(&self, symbol: &str, horizon: Horizon) -> Result<RawVerdict, ComputeError> {
            self.starts.lock().push(self.origin.elapsed());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(raw(symbol, horizon))
        }
    }

    fn watch(symbol: &str, horizon: Horizon) -> WatchItem {
        WatchItem {
            symbol: symbol.into(),
            horizon,
        }
    }

    fn setup(
        provider: Arc<dyn ComputeProvider>,
        config: WarmupConfig,
    ) -> (Arc<ManualClock>, Arc<InMemoryStore>, WarmupJob) {
        let clock = Arc::new(ManualClock::new(10_000_000));
        let store = Arc::new(InMemoryStore::new(CacheConfig::default(), clock.clone()));
        let recomputer = Arc::new(Recomputer::new(
            store.clone(),
            provider,
            clock.clone() as Arc<dyn Clock>,
            &ComputeConfig::default(),
        ));
        let job = WarmupJob::new(store.clone(), recomputer, config);
        (clock, store, job)
    }

    #[tokio::test(start_paused = true)]
    async fn warms_missing_pairs_and_skips_fresh_ones() {
        let provider = Arc::new(FakeProvider::new());
        let config = WarmupConfig {
            watchlist: vec![
                watch("BTCUSDT", Horizon::Short),
                watch("ETHUSDT", Horizon::Short),
                watch("SOLUSDT", Horizon::Medium),
            ],
            parallelism: 2,
            stagger_ms: 250,
            prune_after_run: false,
            ..WarmupConfig::default()
        };
        let (_clock, store, job) = setup(provider.clone(), config);
        store.set_with_horizon("BTCUSDT:short", raw("BTCUSDT", Horizon::Short), Horizon::Short);

        let report = job.run_once().await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.skipped_fresh, 1);
        assert_eq!(report.triggered, 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(provider.calls(), 2);
        assert!(store.get_fresh("ETHUSDT:short").is_some());
        assert!(store.get_fresh("SOLUSDT:medium").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn parallelism_bounds_overlap_and_stagger_does_not_stack_on_queueing() {
        let provider = Arc::new(SlowProvider::new(Duration::from_millis(100)));
        let config = WarmupConfig {
            watchlist: ["A", "B", "C", "D", "E"]
                .iter()
                .map(|s| watch(s, Horizon::Short))
                .collect(),
            parallelism: 2,
            stagger_ms: 10,
            prune_after_run: false,
            ..WarmupConfig::default()
        };
        let (_clock, _store, job) = setup(provider.clone(), config);

        let report = job.run_once().await.unwrap();
        assert_eq!(report.succeeded, 5);
        assert_eq!(provider.peak.load(Ordering::SeqCst), 2);

        let mut starts = provider.starts.lock().clone();
        starts.sort();
        let ms: Vec<u128> = starts.iter().map(|d| d.as_millis()).collect();
        // Two slots: offsets 0 and 10, then each queued task starts as soon
        // as a slot frees because its stagger offset has already passed.
        assert_eq!(ms, vec![0, 10, 100, 110, 200]);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_counted_and_dead_entries_pruned() {
        let provider = Arc::new(FakeProvider::new());
        provider.fail.store(true, Ordering::SeqCst);
        let config = WarmupConfig {
            watchlist: vec![watch("BTCUSDT", Horizon::Long)],
            prune_after_run: true,
            ..WarmupConfig::default()
        };
        let (clock, store, job) = setup(provider.clone(), config);
        store.set_with_horizon("DOGEUSDT:long", raw("DOGEUSDT", Horizon::Long), Horizon::Long);
        clock.advance(7 * 60 * 60 * 1000);

        let report = job.run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.pruned, 1);
        assert!(store.get_stale_ok("DOGEUSDT:long").is_none());
    }
}
