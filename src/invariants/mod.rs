// =============================================================================
// Invariants Module
// =============================================================================
//
// Safety invariants applied to every stabilised verdict before it is served:
// - Declarative HARD / SOFT rule table
// - Enforcer that forces the safe action or penalises confidence

pub mod enforcer;
pub mod rules;

pub use enforcer::{EnforcedVerdict, InvariantEnforcer, InvariantViolation, RULE_EVALUATION_FAILED};
pub use rules::{default_rules, InvariantRule, VerdictContext, ViolationLevel};
