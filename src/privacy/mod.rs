//! Privacy Budget Tracker and privacy policy boundary.
//!
//! - `budget`: monotonic per-job epsilon accounting
//! - `policy`: when epsilon is charged, and the pluggable update guard

pub mod budget;
pub mod policy;

#[cfg(test)]
mod proptests;

pub use budget::{BudgetError, Consumption, PrivacyBudgetState, PrivacyBudgetTracker};
pub use policy::{NoopGuard, PrivacyGuard, PrivacyMechanism, PrivacyViolation, ProofTokenGuard};
