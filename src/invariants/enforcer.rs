// =============================================================================
// Invariant Enforcer — generic runner over the rule table
// =============================================================================
//
// Evaluation:
//   1. Run every rule. A predicate that returns `Err` or panics is recorded
//      as a HARD `RULE_EVALUATION_FAILED` violation (fail-safe).
//   2. SOFT violations multiply confidence by their penalties and apply any
//      ceilings. A non-finite penalty or ceiling is applied as 0.
//   3. Any HARD violation forces the safe action, caps confidence at
//      `hard_confidence_cap` and zeroes the position size.
//
// Output confidence is never above the input.
// =============================================================================

use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::rules::{default_rules, InvariantRule, VerdictContext, ViolationLevel};
use crate::runtime_config::InvariantConfig;
use crate::types::Action;

pub const RULE_EVALUATION_FAILED: &str = "RULE_EVALUATION_FAILED";

/// Penalty and ceiling read from a violated SOFT rule.
type Knobs = (Option<f64>, Option<f64>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub id: String,
    pub level: ViolationLevel,
    pub reason: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub context_snapshot: serde_json::Value,
}

/// Result of one enforcement pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcedVerdict {
    pub action: Action,
    pub confidence: f64,
    pub position_size: f64,
    pub input_confidence: f64,
    /// Product of the violated SOFT penalties (1.0 when none).
    pub penalty_product: f64,
    /// A HARD violation forced the safe action.
    pub forced: bool,
    pub violations: Vec<InvariantViolation>,
}

impl EnforcedVerdict {
    pub fn hard_count(&self) -> usize {
        self.violations
            .iter()
            .filter(|v| v.level == ViolationLevel::Hard)
            .count()
    }

    pub fn soft_count(&self) -> usize {
        self.violations.len() - self.hard_count()
    }
}

pub struct InvariantEnforcer {
    config: InvariantConfig,
    rules: Vec<InvariantRule>,
}

impl InvariantEnforcer {
    pub fn new(config: InvariantConfig) -> Self {
        Self::with_rules(config, default_rules())
    }

    /// Enforcer over a caller-supplied rule table.
    pub fn with_rules(config: InvariantConfig, rules: Vec<InvariantRule>) -> Self {
        Self { config, rules }
    }

    pub fn config(&self) -> &InvariantConfig {
        &self.config
    }

    pub fn rules(&self) -> &[InvariantRule] {
        &self.rules
    }

    pub fn evaluate(&self, ctx: &VerdictContext) -> EnforcedVerdict {
        let now = Utc::now();
        let snapshot = serde_json::to_value(ctx).unwrap_or(serde_json::Value::Null);

        let mut violations = Vec::new();
        let mut penalty_product = 1.0_f64;
        let mut ceiling = f64::INFINITY;

        for rule in &self.rules {
            // Knob lookups run under the same unwind guard as the predicate.
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<Option<Knobs>, String> {
                if (rule.check)(ctx, &self.config)? {
                    return Ok(None);
                }
                if rule.level == ViolationLevel::Hard {
                    return Ok(Some((None, None)));
                }
                Ok(Some((
                    rule.penalty.map(|p| p(ctx, &self.config)),
                    rule.ceiling.map(|c| c(ctx, &self.config)),
                )))
            }));

            let knobs = match outcome {
                Ok(Ok(None)) => continue,
                Ok(Ok(Some(knobs))) => Ok(knobs),
                Ok(Err(msg)) => Err(msg),
                Err(payload) => Err(panic_message(payload.as_ref())),
            };

            match knobs {
                Err(msg) => {
                    warn!(
                        symbol = %ctx.symbol,
                        rule = rule.id,
                        error = %msg,
                        "invariant rule evaluation failed, treating as HARD"
                    );
                    violations.push(InvariantViolation {
                        id: RULE_EVALUATION_FAILED.to_string(),
                        level: ViolationLevel::Hard,
                        reason: format!("rule {} evaluation failed: {msg}", rule.id),
                        source: rule.source.to_string(),
                        timestamp: now,
                        context_snapshot: snapshot.clone(),
                    });
                }
                Ok((penalty, cap)) => {
                    let mut reason = rule.reason.to_string();
                    if let Some(penalty) = penalty {
                        if penalty.is_finite() {
                            penalty_product *= penalty.clamp(0.0, 1.0);
                        } else {
                            penalty_product = 0.0;
                            reason.push_str(&format!(" (non-finite penalty {penalty}, applied as 0)"));
                        }
                    }
                    if let Some(cap) = cap {
                        if cap.is_finite() {
                            ceiling = ceiling.min(cap.max(0.0));
                        } else {
                            ceiling = 0.0;
                            reason.push_str(&format!(" (non-finite ceiling {cap}, applied as 0)"));
                        }
                    }
                    violations.push(InvariantViolation {
                        id: rule.id.to_string(),
                        level: rule.level,
                        reason,
                        source: rule.source.to_string(),
                        timestamp: now,
                        context_snapshot: snapshot.clone(),
                    });
                }
            }
        }

        let input = ctx.confidence;
        let forced = violations.iter().any(|v| v.level == ViolationLevel::Hard);

        let mut confidence = if input.is_finite() {
            (input * penalty_product).min(ceiling)
        } else {
            0.0
        };
        let (action, position_size) = if forced {
            confidence = confidence.min(self.config.hard_confidence_cap);
            (self.config.safe_action, 0.0)
        } else {
            (ctx.final_action, ctx.position_size)
        };
        if input.is_finite() {
            confidence = confidence.min(input);
        }

        if forced {
            warn!(
                symbol = %ctx.symbol,
                horizon = %ctx.horizon,
                violations = ?violations.iter().map(|v| v.id.as_str()).collect::<Vec<_>>(),
                action = %action,
                confidence = format!("{:.3}", confidence),
                "HARD invariant violated, safe action forced"
            );
        } else if !violations.is_empty() {
            debug!(
                symbol = %ctx.symbol,
                horizon = %ctx.horizon,
                penalty = format!("{:.3}", penalty_product),
                soft = violations.len(),
                "SOFT invariants penalised confidence"
            );
        }

        EnforcedVerdict {
            action,
            confidence,
            position_size,
            input_confidence: input,
            penalty_product,
            forced,
            violations,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "predicate panicked".to_string()
    }
}
