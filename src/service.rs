// =============================================================================
// Verdict Service — the serving core
// =============================================================================
//
// Ties the subsystems together behind one `Arc<VerdictService>`:
//
//   cache (fresh / in-flight / stale / recompute)
//     -> stability filter
//     -> invariant enforcer (with the symbol's governance mode)
//     -> governance policy (caps size, may block)
//     -> decision envelope + audit record
//
// Serving order for a key:
//   fresh entry        serve it
//   in-flight compute  await it; on failure serve the stale value or report
//                      unavailable without a second upstream call
//   stale entry        serve it flagged stale, trigger a background refresh
//   nothing            await a recompute; failure -> VerdictError::Unavailable
//
// Thread safety:
//   - Atomic counters for the serving path.
//   - parking_lot::RwLock for the recent-decision and error ring buffers.
//   - Subsystems manage their own interior mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::audit_log::{AuditEvent, AuditLog};
use crate::cache::{CacheStats, InMemoryStore, RecomputeSnapshot, Recomputer, VerdictStore};
use crate::clock::Clock;
use crate::compute::ComputeProvider;
use crate::decision_envelope::{DecisionEnvelope, ServedFrom};
use crate::error::{ComputeError, VerdictError};
use crate::governance::{
    apply_policy_to_signal, GovernanceGuard, GovernanceMode, GuardCheck, GuardCheckOptions,
    ModeOverride, PolicyOutcome, PolicySignal, RollbackHandler,
};
use crate::invariants::{EnforcedVerdict, InvariantEnforcer, VerdictContext, ViolationLevel};
use crate::runtime_config::ServiceConfig;
use crate::scheduler::{JobHandle, JobStatus, RefreshJob, WarmupJob};
use crate::stability::{StabilityFilter, StabilizedVerdict};
use crate::types::{Action, CacheKey, Horizon, RawVerdict};

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;
/// Maximum number of recent decisions to retain.
const MAX_RECENT_DECISIONS: usize = 100;

// =============================================================================
// Records & snapshots
// =============================================================================

/// A recorded error event for the status report.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// Optional machine-readable error code.
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Serving-path counters.
#[derive(Debug, Default)]
struct ServeStats {
    fresh_hits: AtomicU64,
    stale_serves: AtomicU64,
    misses: AtomicU64,
    joins: AtomicU64,
    unavailable: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServeSnapshot {
    pub fresh_hits: u64,
    pub stale_serves: u64,
    pub misses: u64,
    pub joins: u64,
    pub unavailable: u64,
}

impl ServeStats {
    fn snapshot(&self) -> ServeSnapshot {
        ServeSnapshot {
            fresh_hits: self.fresh_hits.load(Ordering::Relaxed),
            stale_serves: self.stale_serves.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
        }
    }
}

/// Everything a consumer gets back for one request.
#[derive(Debug, Clone, Serialize)]
pub struct ServedVerdict {
    pub symbol: String,
    pub horizon: Horizon,
    pub served_from: ServedFrom,
    /// The underlying cache entry had expired.
    pub stale: bool,
    pub action: Action,
    pub confidence: f64,
    pub position_size: f64,
    pub governance_mode: GovernanceMode,
    pub stabilized: StabilizedVerdict,
    pub enforced: EnforcedVerdict,
    pub policy: PolicyOutcome,
    pub envelope: DecisionEnvelope,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub server_time: i64,
    pub uptime_secs: u64,
    pub cache: CacheStats,
    pub recompute: RecomputeSnapshot,
    pub serve: ServeSnapshot,
    pub jobs: Vec<JobStatus>,
    pub audit_records: u64,
    pub stability_states: usize,
    pub recent_errors: Vec<ErrorRecord>,
}

// =============================================================================
// Rollback
// =============================================================================

/// Performance-window rollback: discard the symbol's smoothed state so the
/// next verdict restarts from the raw upstream value.
struct StabilityRollback {
    stability: Arc<StabilityFilter>,
}

impl RollbackHandler for StabilityRollback {
    fn rollback(&self, symbol: &str, reason: &str) {
        let cleared = self.stability.reset(symbol);
        warn!(symbol, reason, cleared, "stability state rolled back");
    }
}

// =============================================================================
// VerdictService
// =============================================================================

pub struct VerdictService {
    config: ServiceConfig,
    store: Arc<dyn VerdictStore>,
    recomputer: Arc<Recomputer>,
    stability: Arc<StabilityFilter>,
    enforcer: InvariantEnforcer,
    guard: GovernanceGuard,
    audit: Arc<AuditLog>,

    refresh_job: JobHandle,
    warmup_job: JobHandle,

    stats: ServeStats,
    recent_decisions: RwLock<Vec<DecisionEnvelope>>,
    recent_errors: RwLock<Vec<ErrorRecord>>,
    start_time: std::time::Instant,
}

impl VerdictService {
    pub fn new(
        config: ServiceConfig,
        provider: Arc<dyn ComputeProvider>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let store: Arc<dyn VerdictStore> =
            Arc::new(InMemoryStore::new(config.cache.clone(), clock.clone()));
        let recomputer = Arc::new(Recomputer::new(
            store.clone(),
            provider,
            clock.clone(),
            &config.compute,
        ));
        let stability = Arc::new(StabilityFilter::new(config.stability.clone()));
        let guard = GovernanceGuard::new(config.governance.clone(), clock).with_rollback_handler(
            Arc::new(StabilityRollback {
                stability: stability.clone(),
            }),
        );

        let refresh_job = JobHandle::new(Arc::new(RefreshJob::new(
            store.clone(),
            recomputer.clone(),
            config.refresh.clone(),
        )));
        let warmup_job = JobHandle::new(Arc::new(WarmupJob::new(
            store.clone(),
            recomputer.clone(),
            config.warmup.clone(),
        )));

        info!(
            watchlist = config.warmup.watchlist.len(),
            max_concurrent = config.compute.max_concurrent,
            audit_records = audit.len(),
            "VerdictService initialised"
        );

        Self {
            enforcer: InvariantEnforcer::new(config.invariants.clone()),
            config,
            store,
            recomputer,
            stability,
            guard,
            audit,
            refresh_job,
            warmup_job,
            stats: ServeStats::default(),
            recent_decisions: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn VerdictStore> {
        &self.store
    }

    pub fn stability(&self) -> &StabilityFilter {
        &self.stability
    }

    pub fn guard(&self) -> &GovernanceGuard {
        &self.guard
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    // ── Serving ─────────────────────────────────────────────────────────

    /// Serve the verdict for `(symbol, horizon)` through every layer.
    pub async fn get_verdict(
        &self,
        symbol: &str,
        horizon: Horizon,
    ) -> Result<ServedVerdict, VerdictError> {
        let key = CacheKey::new(symbol, horizon);
        let (raw, served_from) = self.fetch_raw(&key).await?;

        let stabilized = self.stability.apply(&key, &raw);
        let mode = self.guard.mode(key.symbol());
        let enforced = self
            .enforcer
            .evaluate(&VerdictContext::from_stabilized(&stabilized, mode));

        let signal = PolicySignal {
            confidence: enforced.confidence,
            exposure: enforced.position_size,
            reliability: None,
            entropy: None,
        };
        let policy = apply_policy_to_signal(mode, &signal, &self.guard.config().base_thresholds);

        let envelope = self.build_envelope(&key, served_from, mode, &stabilized, &enforced, &policy);

        if let Err(e) = self.audit.append(
            key.symbol(),
            AuditEvent::Decision {
                decision_id: envelope.id.clone(),
                horizon,
                served_from,
                action: envelope.final_action,
                confidence: envelope.final_confidence,
                position_size: envelope.final_position_size,
                blocking_layer: envelope.blocking_layer.clone(),
            },
        ) {
            warn!(key = %key, error = %e, "failed to audit decision");
            self.push_error_with_code(format!("audit append failed: {e:#}"), Some("AUDIT".into()));
        }
        self.push_decision(envelope.clone());

        debug!(
            key = %key,
            served_from = %served_from,
            action = %envelope.final_action,
            confidence = format!("{:.3}", envelope.final_confidence),
            size = format!("{:.3}", envelope.final_position_size),
            mode = %mode,
            "verdict served"
        );

        Ok(ServedVerdict {
            symbol: key.symbol().to_string(),
            horizon,
            served_from,
            stale: served_from == ServedFrom::Stale,
            action: envelope.final_action,
            confidence: envelope.final_confidence,
            position_size: envelope.final_position_size,
            governance_mode: mode,
            stabilized,
            enforced,
            policy,
            envelope,
        })
    }

    /// Cache lookup with stale-while-revalidate and single-flight fallback.
    async fn fetch_raw(&self, key: &CacheKey) -> Result<(RawVerdict, ServedFrom), VerdictError> {
        let key_str = key.to_string();

        if let Some(value) = self.store.get_fresh(&key_str) {
            self.stats.fresh_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key_str, "cache hit");
            return Ok((value, ServedFrom::Fresh));
        }

        if let Some(handle) = self.store.get_in_flight(&key_str) {
            self.stats.joins.fetch_add(1, Ordering::Relaxed);
            return match handle.await {
                Ok(value) => Ok((value, ServedFrom::Joined)),
                Err(source) => {
                    debug!(key = %key_str, error = %source, "joined recomputation failed");
                    // The shared attempt was this key's upstream call; no retry.
                    match self.store.get_stale_ok(&key_str) {
                        Some(read) if read.stale => {
                            self.stats.stale_serves.fetch_add(1, Ordering::Relaxed);
                            Ok((read.value, ServedFrom::Stale))
                        }
                        Some(read) => {
                            self.stats.fresh_hits.fetch_add(1, Ordering::Relaxed);
                            Ok((read.value, ServedFrom::Fresh))
                        }
                        None => Err(self.unavailable(key_str, source)),
                    }
                }
            };
        }

        if let Some(read) = self.store.get_stale_ok(&key_str) {
            if read.stale {
                self.stats.stale_serves.fetch_add(1, Ordering::Relaxed);
                // Background refresh; dropping the handle leaves it running.
                let _ = self.recomputer.recompute(key);
                debug!(key = %key_str, expired_at = read.expires_at_ms, "serving stale, refresh triggered");
                return Ok((read.value, ServedFrom::Stale));
            }
            // Written by a recomputation that finished since the first lookup.
            self.stats.fresh_hits.fetch_add(1, Ordering::Relaxed);
            return Ok((read.value, ServedFrom::Fresh));
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        match self.recomputer.recompute(key).await {
            Ok(value) => Ok((value, ServedFrom::Recomputed)),
            Err(source) => Err(self.unavailable(key_str, source)),
        }
    }

    fn unavailable(&self, key: String, source: ComputeError) -> VerdictError {
        self.stats.unavailable.fetch_add(1, Ordering::Relaxed);
        warn!(key = %key, error = %source, "verdict unavailable");
        self.push_error_with_code(format!("{key}: {source}"), Some("UNAVAILABLE".into()));
        VerdictError::Unavailable { key, source }
    }

    fn build_envelope(
        &self,
        key: &CacheKey,
        served_from: ServedFrom,
        mode: GovernanceMode,
        stabilized: &StabilizedVerdict,
        enforced: &EnforcedVerdict,
        policy: &PolicyOutcome,
    ) -> DecisionEnvelope {
        let mut env = DecisionEnvelope::pass(key.symbol(), key.horizon(), served_from, enforced.action);
        env.governance_mode = mode;
        env.final_confidence = policy.adjusted_confidence;
        env.final_position_size = policy.adjusted_exposure;
        env.violations = enforced.violations.iter().map(|v| v.id.clone()).collect();

        let meta = &stabilized.meta;
        env.stability_verdict = if meta.replayed {
            "REPLAY"
        } else if meta.first_observation {
            "FIRST"
        } else if meta.shock {
            "SHOCK"
        } else {
            "SMOOTHED"
        }
        .to_string();

        if enforced.forced {
            env.invariant_verdict = "FORCED".to_string();
            let hard: Vec<&str> = enforced
                .violations
                .iter()
                .filter(|v| v.level == ViolationLevel::Hard)
                .map(|v| v.id.as_str())
                .collect();
            env.block("invariants", hard.join(","));
        } else if !enforced.violations.is_empty() {
            env.invariant_verdict = "SOFT_PENALTY".to_string();
        }

        if policy.blocked {
            env.governance_verdict = "BLOCKED".to_string();
            env.block(
                "governance",
                policy.block_reason.clone().unwrap_or_else(|| mode.to_string()),
            );
        } else if policy.adjusted_exposure < enforced.position_size {
            env.governance_verdict = "CAPPED".to_string();
        }

        env
    }

    // ── Governance ──────────────────────────────────────────────────────

    /// Run a governance check and audit anything that changed.
    pub fn check_guard(&self, symbol: &str, options: &GuardCheckOptions) -> GuardCheck {
        let check = self.guard.check(symbol, options);

        if check.transitioned() {
            self.audit_event(
                &check.symbol,
                AuditEvent::ModeTransition {
                    from: check.previous_mode,
                    to: check.mode,
                    score: check.degeneration.score,
                    reasons: check.degeneration.reasons.clone(),
                },
            );
        }
        if check.rollback_triggered {
            self.audit_event(&check.symbol, AuditEvent::Rollback { mode: check.mode });
        }
        if check.override_conflict {
            let requested = self
                .guard
                .state(&check.symbol)
                .and_then(|s| s.mode_override)
                .map(|o| o.mode);
            self.audit_event(
                &check.symbol,
                AuditEvent::OverrideConflict {
                    requested,
                    effective: check.mode,
                },
            );
        }
        check
    }

    /// Pin the governance mode for `symbol`. Returns the effective mode.
    pub fn override_guard_mode(
        &self,
        symbol: &str,
        mode: GovernanceMode,
        reason: &str,
        actor: &str,
    ) -> GovernanceMode {
        let effective = self.guard.override_mode(
            symbol,
            ModeOverride {
                mode,
                reason: reason.to_string(),
                actor: actor.to_string(),
                set_at_ms: 0,
            },
        );
        let symbol = symbol.to_uppercase();
        self.audit_event(
            &symbol,
            AuditEvent::OverrideSet {
                requested: mode,
                effective,
                reason: reason.to_string(),
                actor: actor.to_string(),
            },
        );
        if effective != mode {
            self.audit_event(
                &symbol,
                AuditEvent::OverrideConflict {
                    requested: Some(mode),
                    effective,
                },
            );
        }
        effective
    }

    pub fn clear_guard_override(&self, symbol: &str) -> bool {
        let cleared = self.guard.clear_override(symbol);
        if cleared {
            self.audit_event(&symbol.to_uppercase(), AuditEvent::OverrideCleared);
        }
        cleared
    }

    fn audit_event(&self, symbol: &str, event: AuditEvent) {
        if let Err(e) = self.audit.append(symbol, event) {
            warn!(symbol, error = %e, "failed to append audit record");
            self.push_error_with_code(format!("audit append failed: {e:#}"), Some("AUDIT".into()));
        }
    }

    // ── Jobs ────────────────────────────────────────────────────────────

    pub fn refresh_job(&self) -> &JobHandle {
        &self.refresh_job
    }

    pub fn warmup_job(&self) -> &JobHandle {
        &self.warmup_job
    }

    pub fn start_jobs(&self) {
        self.refresh_job.start();
        self.warmup_job.start();
    }

    pub fn stop_jobs(&self) {
        self.refresh_job.stop();
        self.warmup_job.stop();
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error with an optional machine-readable code. The ring
    /// buffer is capped at [`MAX_RECENT_ERRORS`].
    pub fn push_error_with_code(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord {
            message: msg,
            code,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
    }

    // ── Decision Audit ──────────────────────────────────────────────────

    /// Record a decision envelope. The ring buffer is capped at
    /// [`MAX_RECENT_DECISIONS`].
    fn push_decision(&self, envelope: DecisionEnvelope) {
        let mut decisions = self.recent_decisions.write();
        decisions.push(envelope);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.remove(0);
        }
    }

    /// Most recent decisions, oldest first.
    pub fn recent_decisions(&self, limit: usize) -> Vec<DecisionEnvelope> {
        let decisions = self.recent_decisions.read();
        let skip = decisions.len().saturating_sub(limit);
        decisions[skip..].to_vec()
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            cache: self.store.stats(),
            recompute: self.recomputer.stats(),
            serve: self.stats.snapshot(),
            jobs: vec![self.refresh_job.status(), self.warmup_job.status()],
            audit_records: self.audit.len(),
            stability_states: self.stability.snapshot().len(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}
