// =============================================================================
// Runtime Configuration — tunables for the verdict serving core
// =============================================================================
//
// Every threshold the serving pipeline consults lives here: cache TTLs,
// scheduler cadence, stability smoothing and shock thresholds, invariant
// caps and governance hysteresis. The shock thresholds in particular are
// environment-tuned and must stay configurable.
//
// Persistence uses an atomic tmp + rename pattern. All fields carry serde
// defaults so that adding new fields never breaks loading an older file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{Action, Horizon, RiskLevel};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_short_ttl_ms() -> u64 {
    5 * 60 * 1000
}

fn default_medium_ttl_ms() -> u64 {
    15 * 60 * 1000
}

fn default_long_ttl_ms() -> u64 {
    60 * 60 * 1000
}

fn default_dead_entry_ms() -> u64 {
    6 * 60 * 60 * 1000
}

fn default_refresh_tick_ms() -> u64 {
    15_000
}

fn default_refresh_window_ms() -> u64 {
    60_000
}

fn default_max_refresh_per_tick() -> usize {
    16
}

fn default_warmup_interval_ms() -> u64 {
    120_000
}

fn default_watchlist() -> Vec<WatchItem> {
    ["BTCUSDT", "ETHUSDT", "SOLUSDT"]
        .iter()
        .flat_map(|s| {
            [Horizon::Short, Horizon::Medium].map(|h| WatchItem {
                symbol: s.to_string(),
                horizon: h,
            })
        })
        .collect()
}

fn default_warmup_parallelism() -> usize {
    2
}

fn default_warmup_stagger_ms() -> u64 {
    250
}

fn default_compute_timeout_ms() -> u64 {
    20_000
}

fn default_max_concurrent_computes() -> usize {
    4
}

fn default_sticky_direction_count() -> u32 {
    2
}

fn default_confidence_alpha() -> f64 {
    0.35
}

fn default_move_alpha() -> f64 {
    0.25
}

fn default_funding_shock_delta() -> f64 {
    0.25
}

fn default_confident_flip() -> f64 {
    0.70
}

fn default_min_action_confidence_delta() -> f64 {
    0.08
}

fn default_safe_action() -> Action {
    Action::Avoid
}

fn default_hard_confidence_cap() -> f64 {
    0.25
}

fn default_ml_modifier_bound() -> f64 {
    0.15
}

fn default_ml_penalty() -> f64 {
    0.85
}

fn default_conflict_penalty() -> f64 {
    0.80
}

fn default_risk_cap_penalty() -> f64 {
    0.90
}

fn default_protection_penalty() -> f64 {
    0.90
}

fn default_risk_caps() -> RiskCaps {
    RiskCaps::default()
}

// =============================================================================
// Cache
// =============================================================================

/// Horizon -> TTL table plus the dead-entry threshold used by `prune`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_short_ttl_ms")]
    pub short_ttl_ms: u64,

    #[serde(default = "default_medium_ttl_ms")]
    pub medium_ttl_ms: u64,

    #[serde(default = "default_long_ttl_ms")]
    pub long_ttl_ms: u64,

    /// Entries older than this (since computation) are dropped by `prune`.
    #[serde(default = "default_dead_entry_ms")]
    pub dead_entry_ms: u64,
}

impl CacheConfig {
    pub fn ttl_ms(&self, horizon: Horizon) -> u64 {
        match horizon {
            Horizon::Short => self.short_ttl_ms,
            Horizon::Medium => self.medium_ttl_ms,
            Horizon::Long => self.long_ttl_ms,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            short_ttl_ms: default_short_ttl_ms(),
            medium_ttl_ms: default_medium_ttl_ms(),
            long_ttl_ms: default_long_ttl_ms(),
            dead_entry_ms: default_dead_entry_ms(),
        }
    }
}

// =============================================================================
// Schedulers
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_refresh_tick_ms")]
    pub tick_ms: u64,

    /// Keys expiring within this window are recomputed ahead of time.
    #[serde(default = "default_refresh_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_max_refresh_per_tick")]
    pub max_per_tick: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_refresh_tick_ms(),
            window_ms: default_refresh_window_ms(),
            max_per_tick: default_max_refresh_per_tick(),
        }
    }
}

/// One `(symbol, horizon)` pair the warmup job keeps hot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchItem {
    pub symbol: String,
    pub horizon: Horizon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupConfig {
    #[serde(default = "default_warmup_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_watchlist")]
    pub watchlist: Vec<WatchItem>,

    #[serde(default = "default_warmup_parallelism")]
    pub parallelism: usize,

    /// Delay inserted before each warmup task after the first.
    #[serde(default = "default_warmup_stagger_ms")]
    pub stagger_ms: u64,

    #[serde(default = "default_true")]
    pub prune_after_run: bool,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_warmup_interval_ms(),
            watchlist: default_watchlist(),
            parallelism: default_warmup_parallelism(),
            stagger_ms: default_warmup_stagger_ms(),
            prune_after_run: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeConfig {
    #[serde(default = "default_compute_timeout_ms")]
    pub timeout_ms: u64,

    /// Upper bound on simultaneous upstream calls across all keys.
    #[serde(default = "default_max_concurrent_computes")]
    pub max_concurrent: usize,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_compute_timeout_ms(),
            max_concurrent: default_max_concurrent_computes(),
        }
    }
}

// =============================================================================
// Stability filter
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityConfig {
    /// Consecutive opposite readings required before a direction flip.
    #[serde(default = "default_sticky_direction_count")]
    pub sticky_direction_count: u32,

    /// EMA factor for confidence.
    #[serde(default = "default_confidence_alpha")]
    pub confidence_alpha: f64,

    /// EMA factor for expected move.
    #[serde(default = "default_move_alpha")]
    pub move_alpha: f64,

    /// Absolute funding-crowdedness change that counts as a shock.
    #[serde(default = "default_funding_shock_delta")]
    pub funding_shock_delta: f64,

    /// Confidence at or above which an UP <-> DOWN flip is a shock.
    #[serde(default = "default_confident_flip")]
    pub confident_flip_confidence: f64,

    /// Action changes backed by a smaller confidence move are held.
    #[serde(default = "default_min_action_confidence_delta")]
    pub min_action_confidence_delta: f64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            sticky_direction_count: default_sticky_direction_count(),
            confidence_alpha: default_confidence_alpha(),
            move_alpha: default_move_alpha(),
            funding_shock_delta: default_funding_shock_delta(),
            confident_flip_confidence: default_confident_flip(),
            min_action_confidence_delta: default_min_action_confidence_delta(),
        }
    }
}

// =============================================================================
// Invariants
// =============================================================================

/// Maximum confidence allowed per market risk level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCaps {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub extreme: f64,
}

impl RiskCaps {
    pub fn cap(&self, level: RiskLevel) -> f64 {
        match level {
            RiskLevel::Low => self.low,
            RiskLevel::Medium => self.medium,
            RiskLevel::High => self.high,
            RiskLevel::Extreme => self.extreme,
        }
    }
}

impl Default for RiskCaps {
    fn default() -> Self {
        Self {
            low: 0.95,
            medium: 0.85,
            high: 0.70,
            extreme: 0.55,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantConfig {
    /// Action forced when any HARD invariant fails.
    #[serde(default = "default_safe_action")]
    pub safe_action: Action,

    /// Confidence ceiling after a HARD violation.
    #[serde(default = "default_hard_confidence_cap")]
    pub hard_confidence_cap: f64,

    /// ML modifier must stay within `[-bound, +bound]`.
    #[serde(default = "default_ml_modifier_bound")]
    pub ml_modifier_bound: f64,

    #[serde(default = "default_ml_penalty")]
    pub ml_penalty: f64,

    #[serde(default = "default_conflict_penalty")]
    pub conflict_penalty: f64,

    #[serde(default = "default_risk_cap_penalty")]
    pub risk_cap_penalty: f64,

    #[serde(default = "default_protection_penalty")]
    pub protection_penalty: f64,

    #[serde(default = "default_risk_caps")]
    pub risk_caps: RiskCaps,
}

impl Default for InvariantConfig {
    fn default() -> Self {
        Self {
            safe_action: default_safe_action(),
            hard_confidence_cap: default_hard_confidence_cap(),
            ml_modifier_bound: default_ml_modifier_bound(),
            ml_penalty: default_ml_penalty(),
            conflict_penalty: default_conflict_penalty(),
            risk_cap_penalty: default_risk_cap_penalty(),
            protection_penalty: default_protection_penalty(),
            risk_caps: RiskCaps::default(),
        }
    }
}

// =============================================================================
// ServiceConfig
// =============================================================================

/// Top-level configuration for the verdict core.
///
/// Every section has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub refresh: RefreshConfig,

    #[serde(default)]
    pub warmup: WarmupConfig,

    #[serde(default)]
    pub compute: ComputeConfig,

    #[serde(default)]
    pub stability: StabilityConfig,

    #[serde(default)]
    pub invariants: InvariantConfig,

    #[serde(default)]
    pub governance: crate::governance::GovernanceConfig,
}

impl ServiceConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read service config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse service config from {}", path.display()))?;

        info!(
            path = %path.display(),
            watchlist = config.warmup.watchlist.len(),
            refresh_tick_ms = config.refresh.tick_ms,
            "service config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise service config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "service config saved (atomic)");
        Ok(())
    }

    /// Replace the warmup watch-list from a `SYM:horizon,SYM:horizon` list,
    /// as supplied through `AURORA_WATCHLIST`. Malformed items are skipped.
    pub fn apply_watchlist_override(&mut self, raw: &str) {
        let items: Vec<WatchItem> = raw
            .split(',')
            .filter_map(|item| crate::types::CacheKey::parse(item.trim()))
            .map(|key| WatchItem {
                symbol: key.symbol().to_string(),
                horizon: key.horizon(),
            })
            .collect();
        if !items.is_empty() {
            self.warmup.watchlist = items;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.refresh.tick_ms, 15_000);
        assert_eq!(cfg.warmup.interval_ms, 120_000);
        assert_eq!(cfg.stability.sticky_direction_count, 2);
        assert!((cfg.stability.confidence_alpha - 0.35).abs() < f64::EPSILON);
        assert!((cfg.stability.move_alpha - 0.25).abs() < f64::EPSILON);
        assert_eq!(cfg.invariants.safe_action, Action::Avoid);
        assert!((cfg.invariants.hard_confidence_cap - 0.25).abs() < f64::EPSILON);
        assert_eq!(cfg.warmup.watchlist.len(), 6);
    }

    #[test]
    fn shorter_horizons_expire_sooner() {
        let cache = CacheConfig::default();
        assert!(cache.ttl_ms(Horizon::Short) < cache.ttl_ms(Horizon::Medium));
        assert!(cache.ttl_ms(Horizon::Medium) < cache.ttl_ms(Horizon::Long));
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: ServiceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.refresh.window_ms, 60_000);
        assert_eq!(cfg.compute.max_concurrent, 4);
        assert!(cfg.warmup.prune_after_run);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "stability": { "sticky_direction_count": 3 },
            "invariants": { "safe_action": "HOLD" }
        }"#;
        let cfg: ServiceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.stability.sticky_direction_count, 3);
        assert!((cfg.stability.funding_shock_delta - 0.25).abs() < f64::EPSILON);
        assert_eq!(cfg.invariants.safe_action, Action::Hold);
        assert!((cfg.invariants.risk_caps.extreme - 0.55).abs() < f64::EPSILON);
    }

    #[test]
    fn watchlist_override_parses_pairs() {
        let mut cfg = ServiceConfig::default();
        cfg.apply_watchlist_override("btcusdt:short, ETHUSDT:30d, junk");
        assert_eq!(
            cfg.warmup.watchlist,
            vec![
                WatchItem {
                    symbol: "BTCUSDT".into(),
                    horizon: Horizon::Short
                },
                WatchItem {
                    symbol: "ETHUSDT".into(),
                    horizon: Horizon::Long
                },
            ]
        );
    }

    #[test]
    fn watchlist_override_ignores_empty_result() {
        let mut cfg = ServiceConfig::default();
        cfg.apply_watchlist_override("nothing-here");
        assert_eq!(cfg.warmup.watchlist.len(), 6);
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("aurora-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("service.json");

        let mut cfg = ServiceConfig::default();
        cfg.refresh.tick_ms = 1_234;
        cfg.save(&path).unwrap();

        let loaded = ServiceConfig::load(&path).unwrap();
        assert_eq!(loaded.refresh.tick_ms, 1_234);
        assert!(!path.with_extension("json.tmp").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
