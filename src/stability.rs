// =============================================================================
// Stability Filter — sticky direction + EMA smoothing with shock bypass
// =============================================================================
//
// Consumes each new raw verdict against the previous stabilised state for
// the same key and decides how much of it to let through:
//
//   1. First observation  — state is initialised from the raw verdict.
//   2. Shock              — macro regime change, funding-crowdedness jump,
//                           confident UP<->DOWN flip, or risk escalation to
//                           HIGH/EXTREME together with an action change.
//                           The raw verdict replaces the state outright and
//                           pending-direction counters reset.
//   3. Normal smoothing   — direction flips only after `sticky_direction_count`
//                           consecutive opposite readings; confidence and
//                           expected move follow separate EMAs; an action
//                           change backed by a marginal confidence move is
//                           held at the previous action/size.
//
// Every output carries the raw verdict and a `meta` block recording which
// path was taken.
//
// Concurrency: state lives in one `Mutex` per key, so concurrent updates to
// the same key are serialised and no pending-count increment is lost.
// Re-reading the same cached payload (same raw verdict) does not advance the
// state machine.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::runtime_config::StabilityConfig;
use crate::types::{Action, CacheKey, Direction, MacroRegime, RawVerdict, RiskLevel};

// =============================================================================
// Types
// =============================================================================

/// Why smoothing was bypassed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShockReason {
    MacroRegimeChange,
    FundingCrowdednessJump,
    ConfidentDirectionFlip,
    RiskEscalation,
}

/// Per-key stabilised state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StableVerdictState {
    pub direction: Direction,
    pub confidence: f64,
    pub expected_move_pct: f64,
    pub action: Action,
    pub position_size: f64,
    pub pending_direction: Option<Direction>,
    pub pending_count: u32,
    pub last_macro_regime: MacroRegime,
    pub last_risk_level: RiskLevel,
    pub last_funding_crowdedness: f64,
}

impl StableVerdictState {
    fn from_raw(raw: &RawVerdict) -> Self {
        Self {
            direction: raw.direction,
            confidence: raw.confidence,
            expected_move_pct: raw.expected_move_pct,
            action: raw.action,
            position_size: raw.position_size,
            pending_direction: None,
            pending_count: 0,
            last_macro_regime: raw.macro_regime,
            last_risk_level: raw.risk_level,
            last_funding_crowdedness: raw.funding_crowdedness,
        }
    }
}

/// Audit block describing how an output was produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StabilityMeta {
    pub first_observation: bool,
    pub shock: bool,
    pub shock_reasons: Vec<ShockReason>,
    pub smoothed: bool,
    pub action_held: bool,
    pub pending_direction: Option<Direction>,
    pub pending_count: u32,
    /// True when the same raw payload was seen before and the previous
    /// output was returned unchanged.
    pub replayed: bool,
}

/// Raw verdict plus its stabilised fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilizedVerdict {
    pub raw: RawVerdict,
    pub direction: Direction,
    pub confidence: f64,
    pub expected_move_pct: f64,
    pub action: Action,
    pub position_size: f64,
    pub meta: StabilityMeta,
}

impl StabilizedVerdict {
    fn from_state(raw: &RawVerdict, state: &StableVerdictState, meta: StabilityMeta) -> Self {
        Self {
            raw: raw.clone(),
            direction: state.direction,
            confidence: state.confidence,
            expected_move_pct: state.expected_move_pct,
            action: state.action,
            position_size: state.position_size,
            meta,
        }
    }
}

// =============================================================================
// Transition logic
// =============================================================================

/// Shock conditions between the stored state and a new raw verdict.
pub fn detect_shock(
    cfg: &StabilityConfig,
    prev: &StableVerdictState,
    raw: &RawVerdict,
) -> Vec<ShockReason> {
    let mut reasons = Vec::new();

    if raw.macro_regime != prev.last_macro_regime {
        reasons.push(ShockReason::MacroRegimeChange);
    }

    if (raw.funding_crowdedness - prev.last_funding_crowdedness).abs() > cfg.funding_shock_delta {
        reasons.push(ShockReason::FundingCrowdednessJump);
    }

    if raw.direction.is_flip_of(prev.direction) && raw.confidence >= cfg.confident_flip_confidence
    {
        reasons.push(ShockReason::ConfidentDirectionFlip);
    }

    if raw.risk_level.is_elevated()
        && raw.risk_level > prev.last_risk_level
        && raw.action != prev.action
    {
        reasons.push(ShockReason::RiskEscalation);
    }

    reasons
}

/// One state-machine step. Pure: returns the next state and the output.
pub fn step(
    cfg: &StabilityConfig,
    prior: Option<&StableVerdictState>,
    raw: &RawVerdict,
) -> (StableVerdictState, StabilizedVerdict) {
    let Some(prev) = prior else {
        let state = StableVerdictState::from_raw(raw);
        let meta = StabilityMeta {
            first_observation: true,
            ..StabilityMeta::default()
        };
        let out = StabilizedVerdict::from_state(raw, &state, meta);
        return (state, out);
    };

    let shock_reasons = detect_shock(cfg, prev, raw);
    if !shock_reasons.is_empty() {
        let state = StableVerdictState::from_raw(raw);
        let meta = StabilityMeta {
            shock: true,
            shock_reasons,
            ..StabilityMeta::default()
        };
        let out = StabilizedVerdict::from_state(raw, &state, meta);
        return (state, out);
    }

    let mut next = prev.clone();

    // --- Sticky direction ---------------------------------------------------
    if raw.direction == prev.direction {
        next.pending_direction = None;
        next.pending_count = 0;
    } else {
        if prev.pending_direction == Some(raw.direction) {
            next.pending_count = prev.pending_count + 1;
        } else {
            next.pending_direction = Some(raw.direction);
            next.pending_count = 1;
        }
        if next.pending_count >= cfg.sticky_direction_count {
            next.direction = raw.direction;
            next.pending_direction = None;
            next.pending_count = 0;
        }
    }

    // --- Action hold (compared against the stored confidence) ---------------
    let confidence_delta = (raw.confidence - prev.confidence).abs();
    let action_held =
        raw.action != prev.action && confidence_delta < cfg.min_action_confidence_delta;
    if !action_held {
        next.action = raw.action;
        next.position_size = raw.position_size;
    }

    // --- EMA smoothing ------------------------------------------------------
    next.confidence = ema(prev.confidence, raw.confidence, cfg.confidence_alpha);
    next.expected_move_pct = ema(prev.expected_move_pct, raw.expected_move_pct, cfg.move_alpha);

    next.last_macro_regime = raw.macro_regime;
    next.last_risk_level = raw.risk_level;
    next.last_funding_crowdedness = raw.funding_crowdedness;

    let meta = StabilityMeta {
        smoothed: true,
        action_held,
        pending_direction: next.pending_direction,
        pending_count: next.pending_count,
        ..StabilityMeta::default()
    };
    let out = StabilizedVerdict::from_state(raw, &next, meta);
    (next, out)
}

fn ema(prev: f64, value: f64, alpha: f64) -> f64 {
    prev + alpha.clamp(0.0, 1.0) * (value - prev)
}

// =============================================================================
// StabilityFilter
// =============================================================================

#[derive(Default)]
struct Slot {
    state: Option<StableVerdictState>,
    last: Option<StabilizedVerdict>,
}

/// Thread-safe filter holding one state slot per `SYMBOL:horizon` key.
pub struct StabilityFilter {
    config: StabilityConfig,
    slots: RwLock<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl StabilityFilter {
    pub fn new(config: StabilityConfig) -> Self {
        Self {
            config,
            slots: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &str) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slots.read().get(key) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Feed `raw` through the state machine for `key`.
    pub fn apply(&self, key: &CacheKey, raw: &RawVerdict) -> StabilizedVerdict {
        let key_str = key.to_string();
        let slot = self.slot(&key_str);
        let mut slot = slot.lock();

        if let Some(last) = &slot.last {
            if last.raw == *raw {
                let mut out = last.clone();
                out.meta.replayed = true;
                return out;
            }
        }

        let (next, out) = step(&self.config, slot.state.as_ref(), raw);

        if out.meta.shock {
            info!(
                key = %key_str,
                reasons = ?out.meta.shock_reasons,
                action = %out.action,
                "shock detected, smoothing bypassed"
            );
        } else {
            debug!(
                key = %key_str,
                direction = %out.direction,
                confidence = format!("{:.3}", out.confidence),
                pending = next.pending_count,
                action_held = out.meta.action_held,
                "verdict stabilised"
            );
        }

        slot.state = Some(next);
        slot.last = Some(out.clone());
        out
    }

    /// Current state for `key`, if any.
    pub fn state(&self, key: &CacheKey) -> Option<StableVerdictState> {
        let slot = self.slots.read().get(&key.to_string()).cloned()?;
        let state = slot.lock().state.clone();
        state
    }

    /// Drop every horizon state for `symbol`. Returns the number removed.
    pub fn reset(&self, symbol: &str) -> usize {
        let symbol = symbol.trim().to_uppercase();
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|key, _| CacheKey::parse(key).map_or(true, |k| k.symbol() != symbol));
        let removed = before - slots.len();
        info!(symbol = %symbol, removed, "stability state reset");
        removed
    }

    /// All current states, keyed by cache key.
    pub fn snapshot(&self) -> Vec<(String, StableVerdictState)> {
        let slots: Vec<(String, Arc<Mutex<Slot>>)> = self
            .slots
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        slots
            .into_iter()
            .filter_map(|(k, slot)| {
                let state = slot.lock().state.clone();
                state.map(|s| (k, s))
            })
            .collect()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::raw;
    use crate::types::Horizon;

    fn cfg() -> StabilityConfig {
        StabilityConfig::default()
    }

    fn base() -> RawVerdict {
        raw("BTCUSDT", Horizon::Short)
    }

    fn down(ts: i64) -> RawVerdict {
        let mut v = base();
        v.direction = Direction::Down;
        v.confidence = 0.55;
        v.computed_at_ms = ts;
        v
    }

    #[test]
    fn first_observation_is_unsmoothed() {
        let (state, out) = step(&cfg(), None, &base());
        assert!(out.meta.first_observation);
        assert!(!out.meta.smoothed);
        assert_eq!(state.direction, Direction::Up);
        assert!((out.confidence - 0.6).abs() < 1e-12);
    }

    #[test]
    fn sticky_direction_needs_two_consecutive_readings() {
        let (s0, _) = step(&cfg(), None, &base());

        let (s1, o1) = step(&cfg(), Some(&s0), &down(2));
        assert_eq!(o1.direction, Direction::Up);
        assert_eq!(o1.meta.pending_direction, Some(Direction::Down));
        assert_eq!(o1.meta.pending_count, 1);

        let (s2, o2) = step(&cfg(), Some(&s1), &down(3));
        assert_eq!(o2.direction, Direction::Down);
        assert_eq!(s2.pending_count, 0);
        assert_eq!(s2.pending_direction, None);
    }

    #[test]
    fn pending_resets_when_candidate_changes() {
        let (s0, _) = step(&cfg(), None, &base());
        let (s1, _) = step(&cfg(), Some(&s0), &down(2));

        let mut neutral = base();
        neutral.direction = Direction::Neutral;
        neutral.computed_at_ms = 3;
        let (s2, o2) = step(&cfg(), Some(&s1), &neutral);
        assert_eq!(o2.direction, Direction::Up);
        assert_eq!(s2.pending_direction, Some(Direction::Neutral));
        assert_eq!(s2.pending_count, 1);
    }

    #[test]
    fn same_direction_clears_pending() {
        let (s0, _) = step(&cfg(), None, &base());
        let (s1, _) = step(&cfg(), Some(&s0), &down(2));
        let mut up = base();
        up.computed_at_ms = 3;
        let (s2, _) = step(&cfg(), Some(&s1), &up);
        assert_eq!(s2.pending_count, 0);
        assert_eq!(s2.pending_direction, None);
    }

    #[test]
    fn regime_change_bypasses_smoothing() {
        let (s0, _) = step(&cfg(), None, &base());
        let (s1, _) = step(&cfg(), Some(&s0), &down(2));
        assert_eq!(s1.pending_count, 1);

        let mut shocked = down(3);
        shocked.macro_regime = MacroRegime::RiskOff;
        shocked.confidence = 0.42;
        shocked.expected_move_pct = -4.0;
        shocked.action = Action::Sell;
        shocked.position_size = 0.2;

        let (s2, out) = step(&cfg(), Some(&s1), &shocked);
        assert!(out.meta.shock);
        assert!(!out.meta.smoothed);
        assert_eq!(out.meta.shock_reasons, vec![ShockReason::MacroRegimeChange]);
        assert_eq!(out.direction, shocked.direction);
        assert_eq!(out.confidence, shocked.confidence);
        assert_eq!(out.expected_move_pct, shocked.expected_move_pct);
        assert_eq!(out.action, shocked.action);
        assert_eq!(out.position_size, shocked.position_size);
        assert_eq!(s2.pending_count, 0);
        assert_eq!(s2.pending_direction, None);
    }

    #[test]
    fn funding_jump_is_a_shock() {
        let (s0, _) = step(&cfg(), None, &base());
        let mut v = base();
        v.funding_crowdedness = s0.last_funding_crowdedness + 0.3;
        let reasons = detect_shock(&cfg(), &s0, &v);
        assert_eq!(reasons, vec![ShockReason::FundingCrowdednessJump]);
    }

    #[test]
    fn confident_flip_is_a_shock_but_weak_flip_is_not() {
        let (s0, _) = step(&cfg(), None, &base());
        let mut v = down(2);
        assert!(detect_shock(&cfg(), &s0, &v).is_empty());
        v.confidence = 0.7;
        assert_eq!(
            detect_shock(&cfg(), &s0, &v),
            vec![ShockReason::ConfidentDirectionFlip]
        );
    }

    #[test]
    fn risk_escalation_requires_action_change() {
        let (s0, _) = step(&cfg(), None, &base());
        let mut v = base();
        v.risk_level = RiskLevel::Extreme;
        assert!(detect_shock(&cfg(), &s0, &v).is_empty());
        v.action = Action::Hold;
        assert_eq!(detect_shock(&cfg(), &s0, &v), vec![ShockReason::RiskEscalation]);
    }

    #[test]
    fn confidence_and_move_follow_separate_emas() {
        let (s0, _) = step(&cfg(), None, &base());
        let mut v = base();
        v.confidence = 0.4;
        v.expected_move_pct = 6.0;
        let (_, out) = step(&cfg(), Some(&s0), &v);
        assert!((out.confidence - (0.6 + 0.35 * (0.4 - 0.6))).abs() < 1e-12);
        assert!((out.expected_move_pct - (2.0 + 0.25 * (6.0 - 2.0))).abs() < 1e-12);
        assert!(out.meta.smoothed);
    }

    #[test]
    fn marginal_confidence_holds_action() {
        let (s0, _) = step(&cfg(), None, &base());
        let mut v = base();
        v.action = Action::Hold;
        v.position_size = 0.0;
        v.confidence = 0.63;
        let (_, out) = step(&cfg(), Some(&s0), &v);
        assert!(out.meta.action_held);
        assert_eq!(out.action, Action::Buy);
        assert_eq!(out.position_size, 0.5);
    }

    #[test]
    fn decisive_confidence_adopts_new_action() {
        let (s0, _) = step(&cfg(), None, &base());
        let mut v = base();
        v.action = Action::StrongBuy;
        v.position_size = 0.8;
        v.confidence = 0.75;
        v.computed_at_ms = 2;
        let (_, out) = step(&cfg(), Some(&s0), &v);
        assert!(!out.meta.action_held);
        assert_eq!(out.action, Action::StrongBuy);
        assert_eq!(out.position_size, 0.8);
    }

    #[test]
    fn filter_replays_same_payload_without_advancing() {
        let f = StabilityFilter::new(cfg());
        let key = CacheKey::new("BTCUSDT", Horizon::Short);
        f.apply(&key, &base());

        let first = f.apply(&key, &down(2));
        let again = f.apply(&key, &down(2));
        assert!(again.meta.replayed);
        assert_eq!(again.direction, first.direction);
        assert_eq!(f.state(&key).unwrap().pending_count, 1);

        let flipped = f.apply(&key, &down(3));
        assert_eq!(flipped.direction, Direction::Down);
    }

    #[test]
    fn reset_drops_all_horizons_of_symbol_only() {
        let f = StabilityFilter::new(cfg());
        f.apply(&CacheKey::new("BTCUSDT", Horizon::Short), &base());
        f.apply(&CacheKey::new("BTCUSDT", Horizon::Long), &base());
        f.apply(&CacheKey::new("BTCUSDTX", Horizon::Long), &base());

        assert_eq!(f.reset("btcusdt"), 2);
        let snap = f.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].0, "BTCUSDTX:long");
    }

    #[test]
    fn concurrent_updates_are_serialised() {
        let f = Arc::new(StabilityFilter::new(cfg()));
        let key = CacheKey::new("ETHUSDT", Horizon::Medium);
        f.apply(&key, &base());

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let f = f.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    let mut v = base();
                    v.symbol = "ETHUSDT".into();
                    v.confidence = 0.6 + (i as f64) * 0.001;
                    v.computed_at_ms = 100 + i;
                    f.apply(&key, &v);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let state = f.state(&key).unwrap();
        assert_eq!(state.direction, Direction::Up);
        assert!(state.confidence > 0.6);
    }
}
