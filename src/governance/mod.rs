// =============================================================================
// Governance Module
// =============================================================================
//
// System-health governance for verdict serving:
// - Degeneration monitor: five trend sub-signals folded into one 0..1 score
// - Mode selector + per-symbol guard with hysteresis and admin overrides
// - Policy overrides table and `apply_policy_to_signal`

pub mod degeneration;
pub mod guard;
pub mod policy;

use serde::{Deserialize, Serialize};

pub use degeneration::{
    compute_degeneration, select_mode, CalibrationMetrics, DegenerationReason, DegenerationResult,
    DriftMetrics, GuardContext, HealthBadge, PerfWindowMetrics, ReliabilityMetrics,
    TailRiskMetrics,
};
pub use guard::{
    GovernanceGuard, GuardCheck, GuardCheckOptions, GuardState, ModeOverride, RollbackHandler,
};
pub use policy::{apply_policy_to_signal, policy_for, BaseThresholds, PolicyOutcome, PolicyOverrides, PolicySignal};

// =============================================================================
// GovernanceMode
// =============================================================================

/// Protection level, ordered from least to most restrictive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GovernanceMode {
    #[default]
    Normal,
    ProtectionMode,
    FrozenOnly,
    HaltTrading,
}

impl GovernanceMode {
    /// One level looser; NORMAL stays NORMAL.
    pub fn step_down(self) -> Self {
        match self {
            Self::HaltTrading => Self::FrozenOnly,
            Self::FrozenOnly => Self::ProtectionMode,
            Self::ProtectionMode | Self::Normal => Self::Normal,
        }
    }

    pub fn is_normal(self) -> bool {
        self == Self::Normal
    }
}

impl std::fmt::Display for GovernanceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::ProtectionMode => write!(f, "PROTECTION_MODE"),
            Self::FrozenOnly => write!(f, "FROZEN_ONLY"),
            Self::HaltTrading => write!(f, "HALT_TRADING"),
        }
    }
}

// =============================================================================
// GovernanceConfig
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_escalate_after() -> u32 {
    2
}

fn default_recover_after() -> u32 {
    3
}

fn default_perf_bad_limit() -> u32 {
    3
}

fn default_protection_score() -> f64 {
    0.45
}

fn default_freeze_score() -> f64 {
    0.75
}

/// Relative weight of each sub-signal in the degeneration score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DegenerationWeights {
    pub reliability: f64,
    pub drift: f64,
    pub calibration: f64,
    pub tail_risk: f64,
    pub perf_window: f64,
}

impl Default for DegenerationWeights {
    fn default() -> Self {
        Self {
            reliability: 0.30,
            drift: 0.20,
            calibration: 0.15,
            tail_risk: 0.15,
            perf_window: 0.20,
        }
    }
}

/// Sub-signal thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DegenerationThresholds {
    /// 7-day reliability drop that maps to a full sub-score.
    pub reliability_drop_norm: f64,
    pub reliability_drop_warn: f64,
    pub drift_warn: f64,
    pub drift_critical: f64,
    /// ECE growth that maps to a full sub-score.
    pub ece_growth_norm: f64,
    pub ece_growth_warn: f64,
    /// Relative P95 drawdown expansion that maps to a full sub-score.
    pub tail_expansion_norm: f64,
    pub tail_expansion_warn: f64,
    pub sharpe_warn: f64,
    pub sharpe_critical: f64,
    pub drawdown_warn: f64,
    pub drawdown_critical: f64,
}

impl Default for DegenerationThresholds {
    fn default() -> Self {
        Self {
            reliability_drop_norm: 0.15,
            reliability_drop_warn: 0.05,
            drift_warn: 0.30,
            drift_critical: 0.60,
            ece_growth_norm: 0.05,
            ece_growth_warn: 0.02,
            tail_expansion_norm: 0.50,
            tail_expansion_warn: 0.20,
            sharpe_warn: 0.50,
            sharpe_critical: 0.0,
            drawdown_warn: 0.10,
            drawdown_critical: 0.20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfig {
    #[serde(default)]
    pub weights: DegenerationWeights,

    #[serde(default)]
    pub thresholds: DegenerationThresholds,

    /// Score above which PROTECTION_MODE is proposed.
    #[serde(default = "default_protection_score")]
    pub protection_score: f64,

    /// Score at or above which FROZEN_ONLY is proposed.
    #[serde(default = "default_freeze_score")]
    pub freeze_score: f64,

    /// Consecutive stricter proposals required before escalating.
    #[serde(default = "default_escalate_after")]
    pub escalate_after: u32,

    /// Consecutive looser proposals required before stepping down one level.
    #[serde(default = "default_recover_after")]
    pub recover_after: u32,

    /// Consecutive checks with Sharpe below warn that force PROTECTION and
    /// trigger a rollback.
    #[serde(default = "default_perf_bad_limit")]
    pub perf_bad_limit: u32,

    /// When false a HALT reliability badge proposes FROZEN_ONLY instead.
    #[serde(default = "default_true")]
    pub auto_halt: bool,

    /// Thresholds the per-mode add-ons are applied to.
    #[serde(default)]
    pub base_thresholds: BaseThresholds,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            weights: DegenerationWeights::default(),
            thresholds: DegenerationThresholds::default(),
            protection_score: default_protection_score(),
            freeze_score: default_freeze_score(),
            escalate_after: default_escalate_after(),
            recover_after: default_recover_after(),
            perf_bad_limit: default_perf_bad_limit(),
            auto_halt: true,
            base_thresholds: BaseThresholds::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_are_ordered_by_restrictiveness() {
        assert!(GovernanceMode::Normal < GovernanceMode::ProtectionMode);
        assert!(GovernanceMode::FrozenOnly < GovernanceMode::HaltTrading);
        assert_eq!(
            GovernanceMode::ProtectionMode.max(GovernanceMode::FrozenOnly),
            GovernanceMode::FrozenOnly
        );
    }

    #[test]
    fn step_down_is_one_level() {
        assert_eq!(GovernanceMode::HaltTrading.step_down(), GovernanceMode::FrozenOnly);
        assert_eq!(GovernanceMode::Normal.step_down(), GovernanceMode::Normal);
    }

    #[test]
    fn mode_serialises_screaming_snake() {
        let json = serde_json::to_string(&GovernanceMode::ProtectionMode).unwrap();
        assert_eq!(json, "\"PROTECTION_MODE\"");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: GovernanceConfig = serde_json::from_str(r#"{"escalate_after": 4}"#).unwrap();
        assert_eq!(cfg.escalate_after, 4);
        assert_eq!(cfg.perf_bad_limit, 3);
        assert!(cfg.auto_halt);
        assert!((cfg.weights.reliability - 0.30).abs() < f64::EPSILON);
    }
}
