// =============================================================================
// Decision Envelope — Auditable record of every served verdict
// =============================================================================
//
// Every verdict flows through cache -> stability -> invariants -> governance.
// The Decision Envelope captures the verdict from each layer so that every
// served decision can be audited after the fact.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::governance::GovernanceMode;
use crate::types::{Action, Horizon};

/// Where the raw verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServedFrom {
    /// Fresh cache hit.
    Fresh,
    /// Expired entry served while a refresh runs in the background.
    Stale,
    /// Cold miss, this request started the recomputation.
    Recomputed,
    /// Cold miss, joined a recomputation already in flight.
    Joined,
}

impl std::fmt::Display for ServedFrom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Stale => write!(f, "stale"),
            Self::Recomputed => write!(f, "recomputed"),
            Self::Joined => write!(f, "joined"),
        }
    }
}

/// Complete auditable record of a served verdict, including all layer verdicts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEnvelope {
    /// Unique identifier for this decision (UUID v4).
    pub id: String,

    pub symbol: String,
    pub horizon: Horizon,
    pub served_from: ServedFrom,

    /// Stability layer verdict ("FIRST" / "SMOOTHED" / "SHOCK" / "REPLAY").
    pub stability_verdict: String,

    /// Invariant layer verdict ("PASS" / "SOFT_PENALTY" / "FORCED").
    pub invariant_verdict: String,

    /// Governance layer verdict ("PASS" / "CAPPED" / "BLOCKED").
    pub governance_verdict: String,

    pub governance_mode: GovernanceMode,

    pub final_action: Action,
    pub final_confidence: f64,
    pub final_position_size: f64,

    /// Ids of the invariants violated on this pass.
    #[serde(default)]
    pub violations: Vec<String>,

    /// Which layer forced or blocked the decision (if any).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking_layer: Option<String>,

    /// Human-readable reason for the forced or blocked decision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// ISO 8601 timestamp of when this decision was created.
    pub created_at: String,
}

impl DecisionEnvelope {
    /// Envelope with every layer passing; callers overwrite what differs.
    pub fn pass(
        symbol: impl Into<String>,
        horizon: Horizon,
        served_from: ServedFrom,
        final_action: Action,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            horizon,
            served_from,
            stability_verdict: "SMOOTHED".to_string(),
            invariant_verdict: "PASS".to_string(),
            governance_verdict: "PASS".to_string(),
            governance_mode: GovernanceMode::Normal,
            final_action,
            final_confidence: 0.0,
            final_position_size: 0.0,
            violations: Vec::new(),
            blocking_layer: None,
            reason: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Mark the decision as forced or blocked by `layer`. The first blocking
    /// layer wins.
    pub fn block(&mut self, layer: impl Into<String>, reason: impl Into<String>) {
        if self.blocking_layer.is_none() {
            self.blocking_layer = Some(layer.into());
            self.reason = Some(reason.into());
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocking_layer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_blocking_layer_wins() {
        let mut env = DecisionEnvelope::pass("BTCUSDT", Horizon::Short, ServedFrom::Fresh, Action::Buy);
        assert!(!env.is_blocked());
        env.block("invariants", "NO_STRONG_IN_PANIC");
        env.block("governance", "HALT_TRADING disallows new trades");
        assert_eq!(env.blocking_layer.as_deref(), Some("invariants"));
        assert_eq!(env.reason.as_deref(), Some("NO_STRONG_IN_PANIC"));
    }

    #[test]
    fn ids_are_unique_and_serialisation_skips_empty_reason() {
        let a = DecisionEnvelope::pass("ETHUSDT", Horizon::Long, ServedFrom::Stale, Action::Hold);
        let b = DecisionEnvelope::pass("ETHUSDT", Horizon::Long, ServedFrom::Stale, Action::Hold);
        assert_ne!(a.id, b.id);
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["served_from"], "stale");
        assert!(json.get("reason").is_none());
    }
}
