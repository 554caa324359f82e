// =============================================================================
// Governance Guard — per-symbol mode with hysteresis and overrides
// =============================================================================
//
// Each `check` scores the supplied context, asks `select_mode` for a
// proposal, then moves the stored mode only through counters:
//
//   - stricter proposal   -> `consecutive_bad += 1`; once it reaches
//                            `escalate_after`, escalate to the LEAST strict
//                            proposal seen during the streak.
//   - looser proposal     -> `consecutive_good += 1`; step down ONE level once
//                            it reaches `recover_after`.
//   - same as current     -> both counters reset.
//
// Performance-window streak: `perf_bad_limit` consecutive checks with Sharpe
// below warn lift the mode to at least PROTECTION_MODE immediately, fire the
// rollback handler once, and reset the streak.
//
// An administrative override pins the effective mode. If the latest check
// observed a HALT reliability badge the stricter of override and badge mode
// wins.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::degeneration::{compute_degeneration, select_mode, DegenerationResult, GuardContext, HealthBadge};
use super::policy::{apply_policy_to_signal, policy_for, PolicyOutcome, PolicyOverrides, PolicySignal};
use super::{GovernanceConfig, GovernanceMode};
use crate::clock::Clock;

/// Invoked when the performance-window streak trips.
pub trait RollbackHandler: Send + Sync {
    fn rollback(&self, symbol: &str, reason: &str);
}

/// Administrative pin on a symbol's mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeOverride {
    pub mode: GovernanceMode,
    pub reason: String,
    pub actor: String,
    #[serde(default)]
    pub set_at_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardState {
    /// Mode driven by checks, before any override.
    pub mode: GovernanceMode,
    pub consecutive_bad: u32,
    pub consecutive_good: u32,
    /// Least strict proposal seen in the current bad streak.
    #[serde(default)]
    pub bad_streak_floor: Option<GovernanceMode>,
    pub perf_bad_streak: u32,
    pub last_reliability_badge: HealthBadge,
    pub mode_override: Option<ModeOverride>,
    pub last_check_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct GuardCheckOptions {
    pub context: GuardContext,
    /// Optional signal to gate against the resulting mode.
    pub signal: Option<PolicySignal>,
}

/// Outcome of one `check`.
#[derive(Debug, Clone, Serialize)]
pub struct GuardCheck {
    pub symbol: String,
    /// Effective mode after overrides.
    pub mode: GovernanceMode,
    pub previous_mode: GovernanceMode,
    pub proposed_mode: GovernanceMode,
    pub degeneration: DegenerationResult,
    pub applied_policy: PolicyOverrides,
    pub signal_outcome: Option<PolicyOutcome>,
    pub rollback_triggered: bool,
    pub override_active: bool,
    pub override_conflict: bool,
}

impl GuardCheck {
    pub fn transitioned(&self) -> bool {
        self.mode != self.previous_mode
    }
}

pub struct GovernanceGuard {
    config: GovernanceConfig,
    clock: Arc<dyn Clock>,
    states: RwLock<HashMap<String, GuardState>>,
    rollback: Option<Arc<dyn RollbackHandler>>,
}

impl GovernanceGuard {
    pub fn new(config: GovernanceConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            escalate_after = config.escalate_after,
            recover_after = config.recover_after,
            perf_bad_limit = config.perf_bad_limit,
            auto_halt = config.auto_halt,
            "GovernanceGuard initialised"
        );
        Self {
            config,
            clock,
            states: RwLock::new(HashMap::new()),
            rollback: None,
        }
    }

    pub fn with_rollback_handler(mut self, handler: Arc<dyn RollbackHandler>) -> Self {
        self.rollback = Some(handler);
        self
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    fn badge_mode(&self) -> GovernanceMode {
        if self.config.auto_halt {
            GovernanceMode::HaltTrading
        } else {
            GovernanceMode::FrozenOnly
        }
    }

    /// Effective mode for a state: override if present, tightened by an
    /// observed HALT badge. Returns `(mode, conflict)`.
    fn effective(&self, state: &GuardState) -> (GovernanceMode, bool) {
        match &state.mode_override {
            None => (state.mode, false),
            Some(ov) => {
                if state.last_reliability_badge == HealthBadge::Halt && ov.mode < self.badge_mode() {
                    (self.badge_mode(), true)
                } else {
                    (ov.mode, false)
                }
            }
        }
    }

    /// Current effective mode without running a check.
    pub fn mode(&self, symbol: &str) -> GovernanceMode {
        self.states
            .read()
            .get(&symbol.to_uppercase())
            .map(|s| self.effective(s).0)
            .unwrap_or_default()
    }

    pub fn state(&self, symbol: &str) -> Option<GuardState> {
        self.states.read().get(&symbol.to_uppercase()).cloned()
    }

    // -------------------------------------------------------------------------
    // Check
    // -------------------------------------------------------------------------

    pub fn check(&self, symbol: &str, options: &GuardCheckOptions) -> GuardCheck {
        let symbol = symbol.to_uppercase();
        let degeneration = compute_degeneration(&self.config, &options.context);
        let mut proposed = select_mode(&self.config, &degeneration);

        let mut rollback_reason = None;
        let (previous_mode, mode, override_active, override_conflict) = {
            let mut states = self.states.write();
            let state = states.entry(symbol.clone()).or_default();
            let (previous_mode, _) = self.effective(state);

            state.last_check_at_ms = Some(self.clock.now_ms());
            state.last_reliability_badge = degeneration.badges.reliability;

            // --- Performance-window streak ---------------------------------
            if degeneration.sharpe_below_warn {
                state.perf_bad_streak += 1;
            } else {
                state.perf_bad_streak = 0;
            }
            if state.perf_bad_streak >= self.config.perf_bad_limit {
                proposed = proposed.max(GovernanceMode::ProtectionMode);
                state.mode = state.mode.max(GovernanceMode::ProtectionMode);
                state.consecutive_bad = 0;
                state.consecutive_good = 0;
                state.bad_streak_floor = None;
                rollback_reason = Some(format!(
                    "sharpe below warn for {} consecutive checks",
                    state.perf_bad_streak
                ));
                state.perf_bad_streak = 0;
            }

            // --- Hysteresis -------------------------------------------------
            if proposed > state.mode {
                state.consecutive_bad += 1;
                state.consecutive_good = 0;
                let target = state
                    .bad_streak_floor
                    .map_or(proposed, |floor| floor.min(proposed));
                state.bad_streak_floor = Some(target);
                if state.consecutive_bad >= self.config.escalate_after {
                    state.mode = target;
                    state.consecutive_bad = 0;
                    state.bad_streak_floor = None;
                }
            } else if proposed < state.mode {
                state.consecutive_good += 1;
                state.consecutive_bad = 0;
                state.bad_streak_floor = None;
                if state.consecutive_good >= self.config.recover_after {
                    state.mode = state.mode.step_down();
                    state.consecutive_good = 0;
                }
            } else {
                state.consecutive_bad = 0;
                state.consecutive_good = 0;
                state.bad_streak_floor = None;
            }

            let (mode, conflict) = self.effective(state);
            (previous_mode, mode, state.mode_override.is_some(), conflict)
        };

        if override_conflict {
            warn!(
                symbol = %symbol,
                mode = %mode,
                code = "OVERRIDE_CONFLICT",
                "override looser than observed HALT reliability, keeping stricter mode"
            );
        }

        let rollback_triggered = match rollback_reason {
            Some(reason) => {
                warn!(symbol = %symbol, reason = %reason, "performance window breakdown, rolling back");
                if let Some(handler) = &self.rollback {
                    handler.rollback(&symbol, &reason);
                }
                true
            }
            None => false,
        };

        if mode != previous_mode {
            warn!(
                symbol = %symbol,
                from = %previous_mode,
                to = %mode,
                score = format!("{:.3}", degeneration.score),
                reasons = ?degeneration.reasons,
                "governance mode transition"
            );
        } else {
            debug!(
                symbol = %symbol,
                mode = %mode,
                proposed = %proposed,
                score = format!("{:.3}", degeneration.score),
                "governance check"
            );
        }

        let signal_outcome = options
            .signal
            .as_ref()
            .map(|s| apply_policy_to_signal(mode, s, &self.config.base_thresholds));

        GuardCheck {
            symbol,
            mode,
            previous_mode,
            proposed_mode: proposed,
            degeneration,
            applied_policy: policy_for(mode),
            signal_outcome,
            rollback_triggered,
            override_active,
            override_conflict,
        }
    }

    // -------------------------------------------------------------------------
    // Administrative control
    // -------------------------------------------------------------------------

    /// Pin the mode for `symbol`. Returns the resulting effective mode, which
    /// may be stricter than requested when HALT reliability was observed.
    pub fn override_mode(&self, symbol: &str, mut ov: ModeOverride) -> GovernanceMode {
        let symbol = symbol.to_uppercase();
        ov.set_at_ms = self.clock.now_ms();

        let (mode, conflict) = {
            let mut states = self.states.write();
            let state = states.entry(symbol.clone()).or_default();
            state.mode_override = Some(ov.clone());
            self.effective(state)
        };

        warn!(
            symbol = %symbol,
            requested = %ov.mode,
            effective = %mode,
            actor = %ov.actor,
            reason = %ov.reason,
            "governance mode override set"
        );
        if conflict {
            warn!(
                symbol = %symbol,
                requested = %ov.mode,
                effective = %mode,
                code = "OVERRIDE_CONFLICT",
                "override looser than observed HALT reliability, keeping stricter mode"
            );
        }
        mode
    }

    /// Release an override. Returns true when one was present.
    pub fn clear_override(&self, symbol: &str) -> bool {
        let symbol = symbol.to_uppercase();
        let cleared = self
            .states
            .write()
            .get_mut(&symbol)
            .and_then(|s| s.mode_override.take())
            .is_some();
        if cleared {
            info!(symbol = %symbol, "governance mode override cleared");
        }
        cleared
    }
}
