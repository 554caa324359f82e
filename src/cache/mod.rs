// =============================================================================
// Cache Module
// =============================================================================
//
// Serving cache for raw verdicts:
// - Horizon-aware TTL store with an in-flight registry
// - Single-flight recomputation against the upstream compute provider

pub mod single_flight;
pub mod store;

pub use single_flight::{RecomputeSnapshot, Recomputer};
pub use store::{CacheEntry, CacheStats, InFlight, InFlightClaim, InMemoryStore, StaleRead, VerdictStore};
