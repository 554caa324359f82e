// =============================================================================
// Degeneration Monitor — trend sub-signals -> score -> proposed mode
// =============================================================================
//
// Sub-signals (each scored 0..1, missing inputs score 0):
//   1. Reliability  — drop over the last 7 days, normalised.
//   2. Drift        — drift score against warn / critical thresholds.
//   3. Calibration  — ECE growth over its baseline, normalised.
//   4. Tail risk    — relative expansion of the P95 drawdown.
//   5. Perf window  — Sharpe and drawdown breakdown; one leg bad scores
//                     0.5, both bad (or either critical) scores 1.0.
//
// The weighted mean is the degeneration score. Together with the discrete
// badges it drives `select_mode`, which only *proposes* a mode: the guard
// applies hysteresis before anything changes.
// =============================================================================

use serde::{Deserialize, Serialize};

use super::{GovernanceConfig, GovernanceMode};

// =============================================================================
// Inputs
// =============================================================================

/// Discrete health badge published by the monitoring services. HALT is
/// only meaningful for reliability.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthBadge {
    #[default]
    Ok,
    Warn,
    Critical,
    Halt,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReliabilityMetrics {
    pub current: f64,
    pub seven_days_ago: f64,
    #[serde(default)]
    pub badge: Option<HealthBadge>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriftMetrics {
    pub score: f64,
    #[serde(default)]
    pub badge: Option<HealthBadge>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationMetrics {
    pub ece_current: f64,
    pub ece_baseline: f64,
    #[serde(default)]
    pub badge: Option<HealthBadge>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TailRiskMetrics {
    pub p95_drawdown_current: f64,
    pub p95_drawdown_baseline: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerfWindowMetrics {
    pub sharpe: f64,
    pub max_drawdown: f64,
}

/// Read-only view of the external health metrics for one check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardContext {
    #[serde(default)]
    pub reliability: Option<ReliabilityMetrics>,
    #[serde(default)]
    pub drift: Option<DriftMetrics>,
    #[serde(default)]
    pub calibration: Option<CalibrationMetrics>,
    #[serde(default)]
    pub tail_risk: Option<TailRiskMetrics>,
    #[serde(default)]
    pub perf_window: Option<PerfWindowMetrics>,
}

// =============================================================================
// Output
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DegenerationReason {
    ReliabilityDrop,
    DriftWarn,
    DriftCritical,
    CalibrationDegraded,
    TailRiskExpansion,
    PerfSharpeBreakdown,
    PerfDrawdownBreakdown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subscores {
    pub reliability: f64,
    pub drift: f64,
    pub calibration: f64,
    pub tail_risk: f64,
    pub perf_window: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Badges {
    pub reliability: HealthBadge,
    pub drift: HealthBadge,
    pub calibration: HealthBadge,
}

impl Badges {
    pub fn any_critical(&self) -> bool {
        [self.reliability, self.drift, self.calibration]
            .iter()
            .any(|b| *b >= HealthBadge::Critical)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DegenerationResult {
    pub score: f64,
    pub subscores: Subscores,
    pub reasons: Vec<DegenerationReason>,
    pub badges: Badges,
    /// Sharpe of the perf window was below the warn threshold.
    pub sharpe_below_warn: bool,
}

// =============================================================================
// Scoring
// =============================================================================

fn ratio(value: f64, norm: f64) -> f64 {
    if norm <= 0.0 || !value.is_finite() {
        return 0.0;
    }
    (value / norm).clamp(0.0, 1.0)
}

fn badge_for(value: f64, warn: f64, critical: f64) -> HealthBadge {
    if value >= critical {
        HealthBadge::Critical
    } else if value >= warn {
        HealthBadge::Warn
    } else {
        HealthBadge::Ok
    }
}

/// Fold the context into a degeneration score. Supplied badges win over
/// badges derived from the raw metrics.
pub fn compute_degeneration(cfg: &GovernanceConfig, ctx: &GuardContext) -> DegenerationResult {
    let t = &cfg.thresholds;
    let mut out = DegenerationResult::default();

    // --- Reliability --------------------------------------------------------
    if let Some(r) = &ctx.reliability {
        let drop = (r.seven_days_ago - r.current).max(0.0);
        out.subscores.reliability = ratio(drop, t.reliability_drop_norm);
        if drop >= t.reliability_drop_warn {
            out.reasons.push(DegenerationReason::ReliabilityDrop);
        }
        out.badges.reliability = r
            .badge
            .unwrap_or_else(|| badge_for(drop, t.reliability_drop_warn, t.reliability_drop_norm));
    }

    // --- Drift --------------------------------------------------------------
    if let Some(d) = &ctx.drift {
        out.subscores.drift = ratio(d.score, t.drift_critical);
        if d.score >= t.drift_critical {
            out.reasons.push(DegenerationReason::DriftCritical);
        } else if d.score >= t.drift_warn {
            out.reasons.push(DegenerationReason::DriftWarn);
        }
        out.badges.drift = d
            .badge
            .unwrap_or_else(|| badge_for(d.score, t.drift_warn, t.drift_critical));
    }

    // --- Calibration --------------------------------------------------------
    if let Some(c) = &ctx.calibration {
        let growth = (c.ece_current - c.ece_baseline).max(0.0);
        out.subscores.calibration = ratio(growth, t.ece_growth_norm);
        if growth >= t.ece_growth_warn {
            out.reasons.push(DegenerationReason::CalibrationDegraded);
        }
        out.badges.calibration = c
            .badge
            .unwrap_or_else(|| badge_for(growth, t.ece_growth_warn, t.ece_growth_norm));
    }

    // --- Tail risk ----------------------------------------------------------
    if let Some(tr) = &ctx.tail_risk {
        let expansion = if tr.p95_drawdown_baseline > 0.0 {
            (tr.p95_drawdown_current - tr.p95_drawdown_baseline) / tr.p95_drawdown_baseline
        } else {
            0.0
        };
        out.subscores.tail_risk = ratio(expansion, t.tail_expansion_norm);
        if expansion > t.tail_expansion_warn {
            out.reasons.push(DegenerationReason::TailRiskExpansion);
        }
    }

    // --- Performance window -------------------------------------------------
    if let Some(p) = &ctx.perf_window {
        let sharpe_bad = p.sharpe < t.sharpe_warn;
        let drawdown_bad = p.max_drawdown > t.drawdown_warn;
        let critical = p.sharpe <= t.sharpe_critical || p.max_drawdown >= t.drawdown_critical;

        out.sharpe_below_warn = sharpe_bad;
        if sharpe_bad {
            out.reasons.push(DegenerationReason::PerfSharpeBreakdown);
        }
        if drawdown_bad {
            out.reasons.push(DegenerationReason::PerfDrawdownBreakdown);
        }
        out.subscores.perf_window = match (sharpe_bad, drawdown_bad) {
            (true, true) => 1.0,
            _ if critical => 1.0,
            (true, false) | (false, true) => 0.5,
            (false, false) => 0.0,
        };
    }

    // --- Weighted mean ------------------------------------------------------
    let w = &cfg.weights;
    let total = w.reliability + w.drift + w.calibration + w.tail_risk + w.perf_window;
    let s = &out.subscores;
    let weighted = w.reliability * s.reliability
        + w.drift * s.drift
        + w.calibration * s.calibration
        + w.tail_risk * s.tail_risk
        + w.perf_window * s.perf_window;
    out.score = if total > 0.0 {
        (weighted / total).clamp(0.0, 1.0)
    } else {
        0.0
    };

    out
}

/// Mode proposed by a single check, before hysteresis and overrides.
pub fn select_mode(cfg: &GovernanceConfig, result: &DegenerationResult) -> GovernanceMode {
    if result.badges.reliability == HealthBadge::Halt {
        return if cfg.auto_halt {
            GovernanceMode::HaltTrading
        } else {
            GovernanceMode::FrozenOnly
        };
    }
    if result.score >= cfg.freeze_score {
        return GovernanceMode::FrozenOnly;
    }
    if result.score > cfg.protection_score || result.badges.any_critical() {
        return GovernanceMode::ProtectionMode;
    }
    GovernanceMode::Normal
}
