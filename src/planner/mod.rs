//! Planning and execution.
//!
//! This module compares the desired graph with the applied state, turns the
//! differences into an ordered plan, and executes that plan against a
//! provider.

mod diff;
mod executor;
mod plan;

pub use diff::{DiffDetail, DiffEngine, DiffResult, DiffType, KNOWN_AFTER_APPLY, ResourceDiff};
pub use executor::{
    ActionOutcome, DEFAULT_PARALLELISM, ExecutionReport, ExecutorOptions, OutcomeStatus,
    PlanExecutor,
};
pub use plan::{ActionType, Plan, PlannedAction};
