// =============================================================================
// Error taxonomy for the verdict serving path
// =============================================================================
//
// Upstream failures are cloned into every single-flight waiter, so
// `ComputeError` carries only owned strings. Stale serves are not errors;
// they travel as a flag on the served verdict.
// =============================================================================

use thiserror::Error;

/// Failure of one upstream computation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputeError {
    #[error("upstream compute failed: {0}")]
    Upstream(String),

    #[error("upstream compute timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("upstream payload could not be decoded: {0}")]
    Decode(String),

    #[error("compute task aborted: {0}")]
    Aborted(String),
}

/// Failure surfaced to a verdict consumer.
#[derive(Debug, Clone, Error)]
pub enum VerdictError {
    /// Nothing was ever cached for the key and recomputation failed.
    #[error("verdict unavailable for {key}: {source}")]
    Unavailable {
        key: String,
        #[source]
        source: ComputeError,
    },
}

/// Tamper evidence found while re-validating an audit chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditChainError {
    #[error("audit record {seq} does not link to its predecessor")]
    BrokenLink { seq: u64 },

    #[error("audit record {seq} hash does not match its contents")]
    HashMismatch { seq: u64 },

    #[error("audit sequence jumps from {prev} to {seq}")]
    SequenceGap { prev: u64, seq: u64 },
}
