//! Planning and execution.
//!
//! This module compares declared resources with recorded state, compiles
//! the result into an ordered [`Plan`] and executes it.

mod diff;
mod executor;
mod plan;

pub use diff::{DEPENDS_ON, DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use executor::{
    ApplyReport, CancelHandle, ExecutionEngine, ExecutionOptions, FailedStep, SkippedStep,
};
pub use plan::{ActionType, Plan, PlanStep, PlanSummary, ReplacePhase};
