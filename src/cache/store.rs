// =============================================================================
// Verdict Cache Store — horizon-aware TTL cache with an in-flight registry
// =============================================================================
//
// Holds the freshest raw verdict per `SYMBOL:horizon` key. Expiry is derived
// from the horizon TTL table at write time, so `expires_at >= computed_at`
// always holds. Readers never mutate entries.
//
// The in-flight registry stores one shared recomputation future per key.
// `claim_in_flight` is the only way the single-flight path registers a
// marker: it inserts atomically or hands back the marker already present.
//
// Thread safety:
//   - parking_lot::RwLock for the entry map (read-mostly).
//   - parking_lot::Mutex for the in-flight map (claim is check-and-insert).
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

use crate::clock::Clock;
use crate::error::ComputeError;
use crate::runtime_config::CacheConfig;
use crate::types::{Horizon, RawVerdict};

/// Shared handle to a running recomputation. Every clone resolves to the same
/// result.
pub type InFlight = Shared<BoxFuture<'static, Result<RawVerdict, ComputeError>>>;

// =============================================================================
// Types
// =============================================================================

/// One cached verdict.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: RawVerdict,
    pub computed_at_ms: i64,
    pub expires_at_ms: i64,
    pub horizon: Horizon,
}

impl CacheEntry {
    pub fn is_fresh(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Result of a stale-tolerant read.
#[derive(Debug, Clone)]
pub struct StaleRead {
    pub value: RawVerdict,
    pub stale: bool,
    pub computed_at_ms: i64,
    pub expires_at_ms: i64,
}

/// Outcome of trying to register a recomputation.
pub enum InFlightClaim {
    /// The caller's future is now the key's marker.
    Claimed,
    /// Another recomputation already owns the key.
    Existing(InFlight),
}

/// Point-in-time store counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub in_flight: usize,
    pub writes: u64,
    pub pruned_total: u64,
}

// =============================================================================
// Store interface
// =============================================================================

/// Storage seam for the serving path. The in-memory implementation below is
/// the production one; tests may substitute fakes.
pub trait VerdictStore: Send + Sync {
    /// Value for `key` only if it has not expired.
    fn get_fresh(&self, key: &str) -> Option<RawVerdict>;

    /// Last known value for `key`, flagged stale when expired.
    fn get_stale_ok(&self, key: &str) -> Option<StaleRead>;

    /// Write `value` with an expiry taken from the horizon TTL table.
    fn set_with_horizon(&self, key: &str, value: RawVerdict, horizon: Horizon);

    /// True when `key` expires within `window_ms`, has already expired, or
    /// is not cached at all.
    fn is_near_expiry(&self, key: &str, window_ms: u64) -> bool;

    /// Unconditionally register `fut` as the marker for `key`.
    fn set_in_flight(&self, key: &str, fut: InFlight);

    fn get_in_flight(&self, key: &str) -> Option<InFlight>;

    /// Atomically register `fut` unless a marker already exists.
    fn claim_in_flight(&self, key: &str, fut: InFlight) -> InFlightClaim;

    fn clear_in_flight(&self, key: &str);

    /// Drop entries older than the dead-entry threshold that are not being
    /// recomputed. Returns the number removed.
    fn prune(&self) -> usize;

    /// Every cached key.
    fn keys(&self) -> Vec<String>;

    fn stats(&self) -> CacheStats;
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// Config durations are u64; anything past i64::MAX saturates instead of
/// wrapping negative.
fn ms_to_i64(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

pub struct InMemoryStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
    pruned_total: AtomicU64,
}

impl InMemoryStore {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            config,
            clock,
            writes: AtomicU64::new(0),
            pruned_total: AtomicU64::new(0),
        }
    }

    /// Full entry for inspection.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }
}

impl VerdictStore for InMemoryStore {
    fn get_fresh(&self, key: &str) -> Option<RawVerdict> {
        let now = self.clock.now_ms();
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        entry.is_fresh(now).then(|| entry.value.clone())
    }

    fn get_stale_ok(&self, key: &str) -> Option<StaleRead> {
        let now = self.clock.now_ms();
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        Some(StaleRead {
            value: entry.value.clone(),
            stale: !entry.is_fresh(now),
            computed_at_ms: entry.computed_at_ms,
            expires_at_ms: entry.expires_at_ms,
        })
    }

    fn set_with_horizon(&self, key: &str, mut value: RawVerdict, horizon: Horizon) {
        let now = self.clock.now_ms();
        if value.computed_at_ms <= 0 {
            value.computed_at_ms = now;
        }
        let ttl = ms_to_i64(self.config.ttl_ms(horizon));
        let entry = CacheEntry {
            value,
            computed_at_ms: now,
            expires_at_ms: now.saturating_add(ttl),
            horizon,
        };
        self.entries.write().insert(key.to_string(), entry);
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(key, horizon = %horizon, ttl_ms = ttl, "cache entry written");
    }

    fn is_near_expiry(&self, key: &str, window_ms: u64) -> bool {
        let now = self.clock.now_ms();
        match self.entries.read().get(key) {
            Some(entry) => entry.expires_at_ms.saturating_sub(now) <= ms_to_i64(window_ms),
            None => true,
        }
    }

    fn set_in_flight(&self, key: &str, fut: InFlight) {
        self.in_flight.lock().insert(key.to_string(), fut);
    }

    fn get_in_flight(&self, key: &str) -> Option<InFlight> {
        self.in_flight.lock().get(key).cloned()
    }

    fn claim_in_flight(&self, key: &str, fut: InFlight) -> InFlightClaim {
        let mut in_flight = self.in_flight.lock();
        match in_flight.get(key) {
            Some(existing) => InFlightClaim::Existing(existing.clone()),
            None => {
                in_flight.insert(key.to_string(), fut);
                InFlightClaim::Claimed
            }
        }
    }

    fn clear_in_flight(&self, key: &str) {
        self.in_flight.lock().remove(key);
    }

    fn prune(&self) -> usize {
        let now = self.clock.now_ms();
        let dead_after = ms_to_i64(self.config.dead_entry_ms);
        let busy: Vec<String> = self.in_flight.lock().keys().cloned().collect();

        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, entry| {
            now.saturating_sub(entry.computed_at_ms) <= dead_after || busy.iter().any(|k| k == key)
        });
        let removed = before - entries.len();

        if removed > 0 {
            self.pruned_total.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, remaining = entries.len(), "pruned dead cache entries");
        }
        removed
    }

    fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.read().len(),
            in_flight: self.in_flight.lock().len(),
            writes: self.writes.load(Ordering::Relaxed),
            pruned_total: self.pruned_total.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::fixtures::raw;
    use futures_util::FutureExt;

    fn store(clock: Arc<ManualClock>) -> InMemoryStore {
        InMemoryStore::new(CacheConfig::default(), clock)
    }

    fn pending_marker() -> InFlight {
        futures_util::future::pending::<Result<RawVerdict, ComputeError>>()
            .boxed()
            .shared()
    }

    #[test]
    fn fresh_until_ttl_then_stale() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let s = store(clock.clone());
        let ttl = CacheConfig::default().ttl_ms(Horizon::Short) as i64;

        s.set_with_horizon("BTCUSDT:short", raw("BTCUSDT", Horizon::Short), Horizon::Short);

        clock.advance(ttl - 1);
        assert!(s.get_fresh("BTCUSDT:short").is_some());
        assert!(!s.get_stale_ok("BTCUSDT:short").unwrap().stale);

        clock.advance(1);
        assert!(s.get_fresh("BTCUSDT:short").is_none());
        let read = s.get_stale_ok("BTCUSDT:short").unwrap();
        assert!(read.stale);
        assert_eq!(read.value.symbol, "BTCUSDT");
    }

    #[test]
    fn expiry_never_precedes_computation() {
        let clock = Arc::new(ManualClock::new(42));
        let s = store(clock);
        for h in Horizon::ALL {
            let key = format!("ETHUSDT:{h}");
            s.set_with_horizon(&key, raw("ETHUSDT", h), h);
            let e = s.entry(&key).unwrap();
            assert!(e.expires_at_ms >= e.computed_at_ms);
            assert_eq!(e.horizon, h);
        }
    }

    #[test]
    fn oversized_ttl_saturates_instead_of_wrapping() {
        let clock = Arc::new(ManualClock::new(5_000));
        let config = CacheConfig {
            long_ttl_ms: u64::MAX,
            ..CacheConfig::default()
        };
        let s = InMemoryStore::new(config, clock.clone());
        s.set_with_horizon("BTCUSDT:long", raw("BTCUSDT", Horizon::Long), Horizon::Long);

        let e = s.entry("BTCUSDT:long").unwrap();
        assert_eq!(e.expires_at_ms, i64::MAX);
        assert!(e.expires_at_ms >= e.computed_at_ms);
        assert!(s.get_fresh("BTCUSDT:long").is_some());
        assert!(!s.is_near_expiry("BTCUSDT:long", 24 * 60 * 60 * 1000));
    }

    #[test]
    fn missing_key_reads_absent() {
        let s = store(Arc::new(ManualClock::new(0)));
        assert!(s.get_fresh("NOPE:short").is_none());
        assert!(s.get_stale_ok("NOPE:short").is_none());
        assert!(s.is_near_expiry("NOPE:short", 0));
    }

    #[test]
    fn near_expiry_window() {
        let clock = Arc::new(ManualClock::new(0));
        let s = store(clock.clone());
        let ttl = CacheConfig::default().ttl_ms(Horizon::Medium) as i64;
        s.set_with_horizon("SOLUSDT:medium", raw("SOLUSDT", Horizon::Medium), Horizon::Medium);

        assert!(!s.is_near_expiry("SOLUSDT:medium", 60_000));
        clock.advance(ttl - 60_000);
        assert!(s.is_near_expiry("SOLUSDT:medium", 60_000));
    }

    #[test]
    fn zero_upstream_timestamp_is_filled_on_write() {
        let clock = Arc::new(ManualClock::new(7_000));
        let s = store(clock);
        let mut v = raw("BTCUSDT", Horizon::Long);
        v.computed_at_ms = 0;
        s.set_with_horizon("BTCUSDT:long", v, Horizon::Long);
        assert_eq!(s.get_fresh("BTCUSDT:long").unwrap().computed_at_ms, 7_000);
    }

    #[test]
    fn claim_in_flight_is_exclusive() {
        let s = store(Arc::new(ManualClock::new(0)));
        assert!(matches!(
            s.claim_in_flight("K:short", pending_marker()),
            InFlightClaim::Claimed
        ));
        assert!(matches!(
            s.claim_in_flight("K:short", pending_marker()),
            InFlightClaim::Existing(_)
        ));
        assert_eq!(s.stats().in_flight, 1);

        s.clear_in_flight("K:short");
        assert!(s.get_in_flight("K:short").is_none());
        assert!(matches!(
            s.claim_in_flight("K:short", pending_marker()),
            InFlightClaim::Claimed
        ));
    }

    #[test]
    fn prune_drops_dead_entries_but_keeps_in_flight() {
        let clock = Arc::new(ManualClock::new(0));
        let s = store(clock.clone());
        s.set_with_horizon("A:short", raw("A", Horizon::Short), Horizon::Short);
        s.set_with_horizon("B:short", raw("B", Horizon::Short), Horizon::Short);
        s.set_in_flight("B:short", pending_marker());

        clock.advance(CacheConfig::default().dead_entry_ms as i64 + 1);
        s.set_with_horizon("C:short", raw("C", Horizon::Short), Horizon::Short);

        assert_eq!(s.prune(), 1);
        let mut keys = s.keys();
        keys.sort();
        assert_eq!(keys, vec!["B:short".to_string(), "C:short".to_string()]);
        assert_eq!(s.stats().pruned_total, 1);
    }

    #[test]
    fn overwrite_replaces_value() {
        let s = store(Arc::new(ManualClock::new(0)));
        let mut v = raw("BTCUSDT", Horizon::Short);
        s.set_with_horizon("BTCUSDT:short", v.clone(), Horizon::Short);
        v.confidence = 0.9;
        s.set_with_horizon("BTCUSDT:short", v, Horizon::Short);
        let got = s.get_fresh("BTCUSDT:short").unwrap();
        assert!((got.confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(s.stats().writes, 2);
    }
}
