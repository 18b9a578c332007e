//! Deterministic planning.
//!
//! Tasks become immutable plans with stable hashes. Planning is pure of wall
//! clock and unseeded randomness: the same task, constraints, capabilities
//! and seed produce the same plan hash on any node, which is the cornerstone
//! of replay verification.

pub mod plan;
pub mod planner;

pub use plan::{Plan, PlanBuilder, PlanStep};
pub use planner::{PlanningConstraints, PlanningResult, PolicyConstrainedPlanner};
