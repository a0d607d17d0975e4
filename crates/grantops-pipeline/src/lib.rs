//! Declarative pipeline engine for grant section operations.
//!
//! A pipeline is a YAML list of steps, each invoking one action (parse,
//! draft, evaluate, report, ...) on one section or on every section. This
//! crate validates definitions into a step graph, evaluates step conditions,
//! schedules ready steps serially or in parallel, retries with backoff,
//! persists resumable execution state, and appends an audit history.

pub mod action;
pub mod actions;
pub mod condition;
pub mod definition;
pub mod duration_serde;
pub mod evaluator;
pub mod events;
pub mod executor;
pub mod graph;
pub mod history;
pub mod project;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod validation;

pub use action::{ActionContext, ActionInterface, ActionRegistry};
pub use actions::{CommandAction, DryRunAction};
pub use condition::{
    check_references, evaluate_condition, parse_condition, ConditionError, ConditionExpr,
    ConditionScope,
};
pub use definition::{PipelineDefinition, PipelineOptions, RetrySpec, StepDef};
pub use evaluator::{Evaluation, Evaluator, SkipDecision};
pub use events::{EventEmitter, PipelineEvent};
pub use executor::{AttemptRecord, StepExecutor, StepReport};
pub use graph::{PipelineGraph, StepId, StepNode};
pub use history::{EntryResult, HistoryEntry, HistoryLog, HistoryStats};
pub use project::ProjectLayout;
pub use retry::RetryPolicy;
pub use scheduler::{CancelHandle, RunReport, Scheduler};
pub use state::{ExecutionState, StateStore, StepCounts, StepRecord};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
