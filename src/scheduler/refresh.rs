// =============================================================================
// Refresh Job — recompute cache entries ahead of expiry
// =============================================================================
//
// Each tick walks every known key:
//   - skip keys already in flight
//   - skip keys not within `window_ms` of expiry
//   - trigger at most `max_per_tick` recomputations; the rest are deferred
//
// Triggers are fire-and-forget: the recomputer registers the in-flight
// marker before returning, writes back on success and keeps the stale value
// on failure. Results land in the recomputer's counters, not in the tick.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Job, TickReport};
use crate::cache::{Recomputer, VerdictStore};
use crate::runtime_config::RefreshConfig;
use crate::types::CacheKey;

pub struct RefreshJob {
    store: Arc<dyn VerdictStore>,
    recomputer: Arc<Recomputer>,
    config: RefreshConfig,
}

impl RefreshJob {
    pub fn new(store: Arc<dyn VerdictStore>, recomputer: Arc<Recomputer>, config: RefreshConfig) -> Self {
        Self {
            store,
            recomputer,
            config,
        }
    }
}

#[async_trait]
impl Job for RefreshJob {
    fn name(&self) -> &'static str {
        "refresh"
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.tick_ms)
    }

    async fn run_once(&self) -> anyhow::Result<TickReport> {
        let mut report = TickReport::default();

        for key in self.store.keys() {
            report.scanned += 1;

            if self.store.get_in_flight(&key).is_some() {
                report.skipped_in_flight += 1;
                continue;
            }
            if !self.store.is_near_expiry(&key, self.config.window_ms) {
                report.skipped_fresh += 1;
                continue;
            }
            if report.triggered >= self.config.max_per_tick {
                report.deferred += 1;
                continue;
            }
            let Some(cache_key) = CacheKey::parse(&key) else {
                warn!(key = %key, "refresh skipped undecodable cache key");
                continue;
            };

            // Dropping the handle is fine: the computation runs on its own task.
            let _ = self.recomputer.recompute(&cache_key);
            report.triggered += 1;
        }

        if report.triggered > 0 || report.deferred > 0 {
            debug!(
                scanned = report.scanned,
                triggered = report.triggered,
                deferred = report.deferred,
                "refresh tick"
            );
        }
        Ok(report)
    }
}
