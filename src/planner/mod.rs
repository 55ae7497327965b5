//! Planning and execution.
//!
//! This module compares the desired declaration with the recorded state,
//! orders the resulting changes, and applies them through provider plugins.

mod diff;
mod executor;
mod plan;
mod report;

pub use diff::{FieldChange, PropertyDiff};
pub use executor::{DEFAULT_CONCURRENCY, PlanExecutor};
pub use plan::{ChangeAction, Plan, PlannedChange, Planner};
pub use report::{ResourceResult, ResourceStatus, RunReport, RunStatus, resolve_exports};
