// =============================================================================
// Aurora Verdict — serving core for per-symbol trading verdicts
// =============================================================================
//
// Raw verdicts come from an upstream compute service. This crate caches them
// per (symbol, horizon), keeps them warm in the background, smooths them,
// enforces hard and soft invariants, and gates them by governance mode.
// =============================================================================

pub mod audit_log;
pub mod cache;
pub mod clock;
pub mod compute;
pub mod decision_envelope;
pub mod error;
pub mod governance;
pub mod invariants;
pub mod runtime_config;
pub mod scheduler;
pub mod service;
pub mod stability;
pub mod types;

pub use error::{ComputeError, VerdictError};
pub use service::{ServedVerdict, ServiceStatus, VerdictService};
pub use types::{Action, CacheKey, Direction, Horizon, RawVerdict};
