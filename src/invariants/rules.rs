// =============================================================================
// Invariant Rules — declarative rule table
// =============================================================================
//
// Every rule is a plain record: id, level, source, reason, optional SOFT
// penalty / confidence ceiling, and a pure predicate over the read-only
// `VerdictContext`. `Ok(true)` means the invariant holds. The table is data,
// so callers may swap in their own list.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::governance::GovernanceMode;
use crate::runtime_config::InvariantConfig;
use crate::stability::StabilizedVerdict;
use crate::types::{Action, Horizon, MacroRegime, RiskLevel, Strength};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ViolationLevel {
    Hard,
    Soft,
}

impl std::fmt::Display for ViolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hard => write!(f, "HARD"),
            Self::Soft => write!(f, "SOFT"),
        }
    }
}

/// Read-only snapshot the rules are evaluated against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictContext {
    pub symbol: String,
    pub horizon: Horizon,
    pub base_action: Action,
    pub base_candidates: Vec<Action>,
    pub final_action: Action,
    pub confidence: f64,
    pub position_size: f64,
    pub strength: Strength,
    pub macro_regime: MacroRegime,
    pub risk_level: RiskLevel,
    pub ml_modifier: f64,
    pub ml_action: Option<Action>,
    pub signal_conflict: bool,
    pub governance_mode: GovernanceMode,
}

impl VerdictContext {
    /// Context for a stabilised verdict: final action, confidence and size
    /// come from the stabilised fields, everything else from the raw payload.
    pub fn from_stabilized(v: &StabilizedVerdict, governance_mode: GovernanceMode) -> Self {
        let raw = &v.raw;
        Self {
            symbol: raw.symbol.clone(),
            horizon: raw.horizon,
            base_action: raw.base_action,
            base_candidates: raw.base_candidates.clone(),
            final_action: v.action,
            confidence: v.confidence,
            position_size: v.position_size,
            strength: raw.strength,
            macro_regime: raw.macro_regime,
            risk_level: raw.risk_level,
            ml_modifier: raw.ml_modifier,
            ml_action: raw.ml_action,
            signal_conflict: raw.signal_conflict,
            governance_mode,
        }
    }
}

pub type RuleCheck = fn(&VerdictContext, &InvariantConfig) -> Result<bool, String>;
pub type RuleKnob = fn(&VerdictContext, &InvariantConfig) -> f64;

#[derive(Clone)]
pub struct InvariantRule {
    pub id: &'static str,
    pub level: ViolationLevel,
    pub source: &'static str,
    pub reason: &'static str,
    /// SOFT confidence multiplier; ignored for HARD rules.
    pub penalty: Option<RuleKnob>,
    /// SOFT confidence ceiling applied on violation.
    pub ceiling: Option<RuleKnob>,
    pub check: RuleCheck,
}

impl std::fmt::Debug for InvariantRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvariantRule")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("source", &self.source)
            .finish()
    }
}

// ── Predicates ──────────────────────────────────────────────────────────────

fn confidence_in_range(ctx: &VerdictContext, _: &InvariantConfig) -> Result<bool, String> {
    Ok(ctx.confidence.is_finite() && (0.0..=1.0).contains(&ctx.confidence))
}

fn confidence_under_risk_cap(ctx: &VerdictContext, cfg: &InvariantConfig) -> Result<bool, String> {
    Ok(ctx.confidence <= cfg.risk_caps.cap(ctx.risk_level))
}

fn no_strong_in_panic(ctx: &VerdictContext, _: &InvariantConfig) -> Result<bool, String> {
    let strong = ctx.strength == Strength::Strong || ctx.final_action.is_strong();
    Ok(!(ctx.macro_regime.is_stressed() && strong))
}

fn full_risk_off_neutral_only(ctx: &VerdictContext, _: &InvariantConfig) -> Result<bool, String> {
    Ok(ctx.macro_regime != MacroRegime::FullRiskOff || ctx.final_action.is_neutral())
}

fn ml_modifier_bounded(ctx: &VerdictContext, cfg: &InvariantConfig) -> Result<bool, String> {
    if !ctx.ml_modifier.is_finite() {
        return Err(format!("ml_modifier is not finite: {}", ctx.ml_modifier));
    }
    Ok(ctx.ml_modifier.abs() <= cfg.ml_modifier_bound)
}

fn ml_action_in_candidates(ctx: &VerdictContext, _: &InvariantConfig) -> Result<bool, String> {
    Ok(match ctx.ml_action {
        None => true,
        Some(a) => a == ctx.base_action || ctx.base_candidates.contains(&a),
    })
}

fn final_follows_base_direction(ctx: &VerdictContext, _: &InvariantConfig) -> Result<bool, String> {
    Ok(!ctx
        .final_action
        .direction()
        .is_flip_of(ctx.base_action.direction()))
}

fn no_unflagged_conflict(ctx: &VerdictContext, _: &InvariantConfig) -> Result<bool, String> {
    Ok(!ctx.signal_conflict || ctx.final_action.is_neutral())
}

fn halt_opens_no_risk(ctx: &VerdictContext, _: &InvariantConfig) -> Result<bool, String> {
    Ok(ctx.governance_mode != GovernanceMode::HaltTrading || ctx.final_action.is_neutral())
}

fn governance_normal(ctx: &VerdictContext, _: &InvariantConfig) -> Result<bool, String> {
    Ok(ctx.governance_mode.is_normal())
}

// ── Penalties & ceilings ────────────────────────────────────────────────────

fn risk_cap_penalty(_: &VerdictContext, cfg: &InvariantConfig) -> f64 {
    cfg.risk_cap_penalty
}

fn risk_cap_ceiling(ctx: &VerdictContext, cfg: &InvariantConfig) -> f64 {
    cfg.risk_caps.cap(ctx.risk_level)
}

fn ml_penalty(_: &VerdictContext, cfg: &InvariantConfig) -> f64 {
    cfg.ml_penalty
}

fn conflict_penalty(_: &VerdictContext, cfg: &InvariantConfig) -> f64 {
    cfg.conflict_penalty
}

fn protection_penalty(_: &VerdictContext, cfg: &InvariantConfig) -> f64 {
    cfg.protection_penalty
}

// ── Table ───────────────────────────────────────────────────────────────────

/// Built-in rule table, evaluated in order.
pub fn default_rules() -> Vec<InvariantRule> {
    vec![
        InvariantRule {
            id: "CONFIDENCE_IN_RANGE",
            level: ViolationLevel::Hard,
            source: "core",
            reason: "confidence must be a finite value in [0, 1]",
            penalty: None,
            ceiling: None,
            check: confidence_in_range,
        },
        InvariantRule {
            id: "CONFIDENCE_RISK_CAP",
            level: ViolationLevel::Soft,
            source: "macro",
            reason: "confidence exceeds the cap for the current risk level",
            penalty: Some(risk_cap_penalty),
            ceiling: Some(risk_cap_ceiling),
            check: confidence_under_risk_cap,
        },
        InvariantRule {
            id: "NO_STRONG_IN_PANIC",
            level: ViolationLevel::Hard,
            source: "macro",
            reason: "strong actions are forbidden in PANIC / EXTREME regimes",
            penalty: None,
            ceiling: None,
            check: no_strong_in_panic,
        },
        InvariantRule {
            id: "FULL_RISK_OFF_NEUTRAL_ONLY",
            level: ViolationLevel::Hard,
            source: "macro",
            reason: "FULL_RISK_OFF permits only HOLD or AVOID",
            penalty: None,
            ceiling: None,
            check: full_risk_off_neutral_only,
        },
        InvariantRule {
            id: "ML_MODIFIER_BOUNDED",
            level: ViolationLevel::Soft,
            source: "ml",
            reason: "ML confidence modifier outside its allowed range",
            penalty: Some(ml_penalty),
            ceiling: None,
            check: ml_modifier_bounded,
        },
        InvariantRule {
            id: "ML_ACTION_IN_CANDIDATES",
            level: ViolationLevel::Hard,
            source: "ml",
            reason: "ML selected an action outside the base engine's candidates",
            penalty: None,
            ceiling: None,
            check: ml_action_in_candidates,
        },
        InvariantRule {
            id: "FINAL_FOLLOWS_BASE_DIRECTION",
            level: ViolationLevel::Hard,
            source: "core",
            reason: "final action reverses the base engine's direction",
            penalty: None,
            ceiling: None,
            check: final_follows_base_direction,
        },
        InvariantRule {
            id: "SIGNAL_CONFLICT_PENALTY",
            level: ViolationLevel::Soft,
            source: "signals",
            reason: "directional action while sub-signals conflict",
            penalty: Some(conflict_penalty),
            ceiling: None,
            check: no_unflagged_conflict,
        },
        InvariantRule {
            id: "GOVERNANCE_HALT_NO_NEW_RISK",
            level: ViolationLevel::Hard,
            source: "governance",
            reason: "HALT_TRADING permits no new risk",
            penalty: None,
            ceiling: None,
            check: halt_opens_no_risk,
        },
        InvariantRule {
            id: "GOVERNANCE_PROTECTION_PENALTY",
            level: ViolationLevel::Soft,
            source: "governance",
            reason: "governance is outside NORMAL mode",
            penalty: Some(protection_penalty),
            ceiling: None,
            check: governance_normal,
        },
    ]
}
