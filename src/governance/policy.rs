// =============================================================================
// Governance Policy — per-mode overrides and signal gating
// =============================================================================
//
//   Mode            conf+  rel+   exposure  conf x  frozen  new   entropy
//   NORMAL          0.00   0.00   1.00      1.00    no      yes   base
//   PROTECTION_MODE 0.05   0.05   0.50      0.90    no      yes   0.85
//   FROZEN_ONLY     0.10   0.10   0.25      0.80    yes     yes   0.75
//   HALT_TRADING    0.20   0.20   0.00      0.00    yes     no    0.50
//
// Exposure is only ever multiplied down. The entropy limit is the lower of
// the base limit and the mode limit.
// =============================================================================

use serde::{Deserialize, Serialize};

use super::GovernanceMode;

/// Fixed overrides carried by a governance mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyOverrides {
    pub mode: GovernanceMode,
    pub confidence_threshold_add: f64,
    pub reliability_threshold_add: f64,
    pub max_exposure_multiplier: f64,
    pub confidence_multiplier: f64,
    pub frozen_only: bool,
    pub allow_new_trades: bool,
    pub entropy_hard_limit: Option<f64>,
}

pub fn policy_for(mode: GovernanceMode) -> PolicyOverrides {
    let (conf_add, rel_add, exposure, conf_mult, frozen_only, allow_new, entropy) = match mode {
        GovernanceMode::Normal => (0.0, 0.0, 1.0, 1.0, false, true, None),
        GovernanceMode::ProtectionMode => (0.05, 0.05, 0.5, 0.9, false, true, Some(0.85)),
        GovernanceMode::FrozenOnly => (0.10, 0.10, 0.25, 0.8, true, true, Some(0.75)),
        GovernanceMode::HaltTrading => (0.20, 0.20, 0.0, 0.0, true, false, Some(0.50)),
    };
    PolicyOverrides {
        mode,
        confidence_threshold_add: conf_add,
        reliability_threshold_add: rel_add,
        max_exposure_multiplier: exposure,
        confidence_multiplier: conf_mult,
        frozen_only,
        allow_new_trades: allow_new,
        entropy_hard_limit: entropy,
    }
}

/// Thresholds before any mode add-on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseThresholds {
    pub min_confidence: f64,
    pub min_reliability: f64,
    pub entropy_limit: f64,
}

impl Default for BaseThresholds {
    fn default() -> Self {
        Self {
            min_confidence: 0.35,
            min_reliability: 0.50,
            entropy_limit: 0.90,
        }
    }
}

/// Signal presented for gating. Reliability and entropy are optional;
/// their checks are skipped when absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySignal {
    pub confidence: f64,
    pub exposure: f64,
    #[serde(default)]
    pub reliability: Option<f64>,
    #[serde(default)]
    pub entropy: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyOutcome {
    pub mode: GovernanceMode,
    pub adjusted_confidence: f64,
    pub adjusted_exposure: f64,
    pub blocked: bool,
    pub block_reason: Option<String>,
}

/// Apply the active mode to a signal. Thresholds are compared against the
/// incoming confidence; the returned confidence and exposure are scaled
/// down by the mode.
pub fn apply_policy_to_signal(
    mode: GovernanceMode,
    signal: &PolicySignal,
    base: &BaseThresholds,
) -> PolicyOutcome {
    let policy = policy_for(mode);

    let min_confidence = base.min_confidence + policy.confidence_threshold_add;
    let min_reliability = base.min_reliability + policy.reliability_threshold_add;
    let entropy_limit = policy
        .entropy_hard_limit
        .map_or(base.entropy_limit, |l| l.min(base.entropy_limit));

    let block_reason = if !policy.allow_new_trades {
        Some(format!("{mode} disallows new trades"))
    } else if !signal.confidence.is_finite() || signal.confidence < min_confidence {
        Some(format!(
            "confidence {:.3} below {:.3} required in {mode}",
            signal.confidence, min_confidence
        ))
    } else if let Some(rel) = signal.reliability.filter(|r| *r < min_reliability) {
        Some(format!(
            "reliability {rel:.3} below {min_reliability:.3} required in {mode}"
        ))
    } else if let Some(ent) = signal.entropy.filter(|e| *e > entropy_limit) {
        Some(format!("entropy {ent:.3} above hard limit {entropy_limit:.3} in {mode}"))
    } else {
        None
    };

    let multiplier = policy.max_exposure_multiplier.clamp(0.0, 1.0);
    // Negative or non-finite exposure is treated as no exposure.
    let adjusted_exposure = if block_reason.is_some() || !signal.exposure.is_finite() {
        0.0
    } else {
        signal.exposure.max(0.0) * multiplier
    };
    let adjusted_confidence = if signal.confidence.is_finite() {
        signal.confidence * policy.confidence_multiplier.clamp(0.0, 1.0)
    } else {
        0.0
    };

    PolicyOutcome {
        mode,
        adjusted_confidence,
        adjusted_exposure,
        blocked: block_reason.is_some(),
        block_reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODES: [GovernanceMode; 4] = [
        GovernanceMode::Normal,
        GovernanceMode::ProtectionMode,
        GovernanceMode::FrozenOnly,
        GovernanceMode::HaltTrading,
    ];

    fn signal(confidence: f64, exposure: f64) -> PolicySignal {
        PolicySignal {
            confidence,
            exposure,
            ..PolicySignal::default()
        }
    }

    #[test]
    fn exposure_never_increases_outside_normal() {
        let base = BaseThresholds::default();
        for mode in MODES.into_iter().filter(|m| !m.is_normal()) {
            for exposure in [0.0, 0.1, 0.5, 1.0] {
                for confidence in [0.2, 0.5, 0.9] {
                    let out = apply_policy_to_signal(mode, &signal(confidence, exposure), &base);
                    assert!(out.adjusted_exposure <= exposure, "{mode} {exposure} {confidence}");
                    assert!(out.adjusted_confidence <= confidence);
                }
            }
        }
    }

    #[test]
    fn negative_exposure_is_floored_at_zero() {
        let base = BaseThresholds::default();
        for mode in [GovernanceMode::Normal, GovernanceMode::ProtectionMode] {
            let out = apply_policy_to_signal(mode, &signal(0.8, -1.0), &base);
            assert!(!out.blocked);
            assert_eq!(out.adjusted_exposure, 0.0, "{mode}");
        }
    }

    #[test]
    fn non_finite_exposure_yields_zero() {
        let base = BaseThresholds::default();
        for exposure in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let out = apply_policy_to_signal(GovernanceMode::ProtectionMode, &signal(0.8, exposure), &base);
            assert_eq!(out.adjusted_exposure, 0.0, "{exposure}");
        }
    }

    #[test]
    fn normal_passes_signal_through() {
        let out = apply_policy_to_signal(
            GovernanceMode::Normal,
            &signal(0.6, 0.4),
            &BaseThresholds::default(),
        );
        assert!(!out.blocked);
        assert_eq!(out.adjusted_exposure, 0.4);
        assert_eq!(out.adjusted_confidence, 0.6);
    }

    #[test]
    fn halt_blocks_everything() {
        let out = apply_policy_to_signal(
            GovernanceMode::HaltTrading,
            &signal(0.99, 1.0),
            &BaseThresholds::default(),
        );
        assert!(out.blocked);
        assert_eq!(out.adjusted_exposure, 0.0);
        assert!(out.block_reason.unwrap().contains("HALT_TRADING"));
    }

    #[test]
    fn protection_raises_confidence_threshold() {
        let base = BaseThresholds::default();
        // 0.38 clears the base 0.35 but not 0.40 in protection.
        assert!(!apply_policy_to_signal(GovernanceMode::Normal, &signal(0.38, 1.0), &base).blocked);
        let out = apply_policy_to_signal(GovernanceMode::ProtectionMode, &signal(0.38, 1.0), &base);
        assert!(out.blocked);
    }

    #[test]
    fn entropy_limit_is_lowered_by_mode() {
        let base = BaseThresholds::default();
        let mut s = signal(0.8, 1.0);
        s.entropy = Some(0.8);
        assert!(!apply_policy_to_signal(GovernanceMode::ProtectionMode, &s, &base).blocked);
        let frozen = apply_policy_to_signal(GovernanceMode::FrozenOnly, &s, &base);
        assert!(frozen.blocked);
        assert!(frozen.block_reason.unwrap().contains("entropy"));
    }

    #[test]
    fn reliability_checked_only_when_present() {
        let base = BaseThresholds::default();
        let mut s = signal(0.8, 1.0);
        assert!(!apply_policy_to_signal(GovernanceMode::FrozenOnly, &s, &base).blocked);
        s.reliability = Some(0.55);
        assert!(apply_policy_to_signal(GovernanceMode::FrozenOnly, &s, &base).blocked);
    }
}
