//! Cohort - Federated Training Orchestration
//!
//! Coordinates training jobs across registered participants (edge devices
//! and organizations), drives synchronous rounds through a framework
//! adapter, and aggregates their model updates under a differential
//! privacy budget.
//!
//! Key principles:
//! - Rounds are sequential per job; jobs run concurrently
//! - At most one aggregation result per (job, round)
//! - A job never exceeds its privacy budget
//! - Every state change is journaled so the engine can recover

pub mod adapter;
pub mod aggregation;
pub mod crypto;
pub mod events;
pub mod identity;
pub mod model;
pub mod orchestrator;
pub mod persistence;
pub mod privacy;
pub mod registry;
pub mod serialization;
pub mod simulation;
pub mod transport;
