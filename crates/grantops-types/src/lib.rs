//! Shared types, errors, and action outcomes for the GrantOps pipeline engine.
//!
//! This crate provides the foundational types used across the other GrantOps crates:
//! - `GrantOpsError`: unified error taxonomy
//! - `StepStatus` / `RunStatus` / `SectionStatus`: lifecycle enums
//! - `ActionKind` / `TargetRef`: what a step does and to which section
//! - `ActionOutcome`: result returned by the action interface

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// Validation violations
// ---------------------------------------------------------------------------

/// Category of a pipeline definition violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Cycle,
    UnknownReference,
    DuplicateName,
    InvalidCondition,
    InvalidOption,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::Cycle => "cycle",
            ViolationKind::UnknownReference => "unknown_reference",
            ViolationKind::DuplicateName => "duplicate_name",
            ViolationKind::InvalidCondition => "invalid_condition",
            ViolationKind::InvalidOption => "invalid_option",
        }
    }
}

/// One fatal problem found while validating a pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub step: Option<String>,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step {
            Some(step) => write!(f, "[{}] step '{}': {}", self.kind.as_str(), step, self.message),
            None => write!(f, "[{}] {}", self.kind.as_str(), self.message),
        }
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// GrantOpsError
// ---------------------------------------------------------------------------

/// Unified error type for all GrantOps subsystems.
#[derive(Debug, thiserror::Error)]
pub enum GrantOpsError {
    // === Validation ===
    #[error("Pipeline validation failed with {} violation(s): {}", .violations.len(), join_violations(.violations))]
    Validation { violations: Vec<Violation> },

    // === Action ===
    #[error("Action '{action}' failed for step '{step}' on target '{target}': {message}")]
    ActionFailed {
        step: String,
        action: String,
        target: String,
        message: String,
    },

    #[error("Action for step '{step}' on target '{target}' timed out after {timeout_ms}ms")]
    ActionTimeout {
        step: String,
        target: String,
        timeout_ms: u64,
    },

    // === Conflict ===
    #[error("Run '{run_id}' is already active for this project")]
    RunAlreadyActive { run_id: String },

    #[error("Section '{section}' is locked and rejects new versions")]
    SectionLocked { section: String },

    // === Storage ===
    #[error("Storage failure at {path}: {source}")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // === Lookup / lifecycle ===
    #[error("Section '{section}' not found")]
    SectionNotFound { section: String },

    #[error("Section '{section}' has no version {version}")]
    VersionNotFound { section: String, version: u32 },

    #[error("Invalid section id '{section}': use letters, digits, '_' or '-'")]
    InvalidSectionId { section: String },

    #[error("Step '{step}' cannot move from {from} to {to}")]
    InvalidTransition {
        step: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("No active run for this project")]
    NoActiveRun,

    #[error("Run '{run_id}' was started from a different pipeline definition ({reason})")]
    PipelineMismatch { run_id: String, reason: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

impl GrantOpsError {
    /// Wrap an IO failure from a durable write with the path it targeted.
    pub fn storage(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        GrantOpsError::Storage {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Coarse error category used in history records and CLI exit handling.
    pub fn kind(&self) -> &'static str {
        match self {
            GrantOpsError::Validation { .. }
            | GrantOpsError::PipelineMismatch { .. }
            | GrantOpsError::Yaml(_) => "validation",
            GrantOpsError::ActionFailed { .. } | GrantOpsError::ActionTimeout { .. } => "action",
            GrantOpsError::RunAlreadyActive { .. } | GrantOpsError::SectionLocked { .. } => {
                "conflict"
            }
            GrantOpsError::Storage { .. }
            | GrantOpsError::Io(_)
            | GrantOpsError::Json(_) => "storage",
            GrantOpsError::SectionNotFound { .. }
            | GrantOpsError::VersionNotFound { .. }
            | GrantOpsError::NoActiveRun => "not_found",
            GrantOpsError::InvalidSectionId { .. }
            | GrantOpsError::InvalidTransition { .. }
            | GrantOpsError::Other(_) => "internal",
        }
    }

    /// Returns `true` for requests rejected because they clash with current state.
    pub fn is_conflict(&self) -> bool {
        self.kind() == "conflict"
    }

    /// Returns `true` if the error must halt a run instead of failing a single step.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), "storage" | "validation")
            || matches!(self, GrantOpsError::InvalidTransition { .. })
    }
}

/// A convenience alias for `Result<T, GrantOpsError>`.
pub type Result<T> = std::result::Result<T, GrantOpsError>;

// ---------------------------------------------------------------------------
// StepStatus: lifecycle of one step within a run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Skipped,
    Success,
    Failed,
    Aborted,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Skipped => "skipped",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Skipped | StepStatus::Success | StepStatus::Failed | StepStatus::Aborted
        )
    }

    /// Whether `self -> next` is a legal forward transition.
    ///
    /// Terminal statuses never move. `running -> pending` is not listed here:
    /// it only happens when a crashed run is resumed, see
    /// `ExecutionState::recover_interrupted`.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        match self {
            StepStatus::Pending => matches!(
                next,
                StepStatus::Running | StepStatus::Skipped | StepStatus::Aborted
            ),
            StepStatus::Running => matches!(next, StepStatus::Success | StepStatus::Failed),
            _ => false,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = GrantOpsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "skipped" => Ok(StepStatus::Skipped),
            "success" => Ok(StepStatus::Success),
            "failed" => Ok(StepStatus::Failed),
            "aborted" => Ok(StepStatus::Aborted),
            other => Err(GrantOpsError::Other(format!("unknown step status '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// RunStatus: lifecycle of a whole pipeline run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Steps are being scheduled.
    Running,
    /// A failure or cancellation was observed; in-flight steps finish, nothing new starts.
    Aborting,
    /// Nothing can run, but some steps are still pending behind a failure.
    Blocked,
    /// Every step reached a terminal status.
    Completed,
    /// The run stopped early (fail-fast or cancellation).
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Aborting => "aborting",
            RunStatus::Blocked => "blocked",
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
        }
    }

    /// Terminal runs are archived and release the project's run slot.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Aborted)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SectionStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    #[default]
    Draft,
    Review,
    Final,
    Locked,
}

impl SectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionStatus::Draft => "draft",
            SectionStatus::Review => "review",
            SectionStatus::Final => "final",
            SectionStatus::Locked => "locked",
        }
    }

    pub const ALL: [SectionStatus; 4] = [
        SectionStatus::Draft,
        SectionStatus::Review,
        SectionStatus::Final,
        SectionStatus::Locked,
    ];
}

impl fmt::Display for SectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SectionStatus {
    type Err = GrantOpsError;

    fn from_str(s: &str) -> Result<Self> {
        SectionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| GrantOpsError::Other(format!("unknown section status '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// ActionKind / TargetRef
// ---------------------------------------------------------------------------

/// The external action a step invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Parse,
    Draft,
    Evaluate,
    Report,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        ActionKind::Parse,
        ActionKind::Draft,
        ActionKind::Evaluate,
        ActionKind::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Parse => "parse",
            ActionKind::Draft => "draft",
            ActionKind::Evaluate => "evaluate",
            ActionKind::Report => "report",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = GrantOpsError;

    fn from_str(s: &str) -> Result<Self> {
        ActionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| GrantOpsError::Other(format!("unknown action '{s}'")))
    }
}

/// What a step operates on: a single section, or every section (`"all"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum TargetRef {
    Section(String),
    #[default]
    All,
}

impl TargetRef {
    pub fn section(&self) -> Option<&str> {
        match self {
            TargetRef::Section(id) => Some(id),
            TargetRef::All => None,
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetRef::Section(id) => f.write_str(id),
            TargetRef::All => f.write_str("all"),
        }
    }
}

impl From<&str> for TargetRef {
    fn from(s: &str) -> Self {
        if s == "all" {
            TargetRef::All
        } else {
            TargetRef::Section(s.to_string())
        }
    }
}

impl Serialize for TargetRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TargetRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.trim().is_empty() {
            return Err(serde::de::Error::custom("target must not be empty"));
        }
        Ok(TargetRef::from(s.trim()))
    }
}

// ---------------------------------------------------------------------------
// ActionOutcome: result of one action invocation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub artifact: Option<String>,
    pub error: Option<ErrorInfo>,
}

impl ActionOutcome {
    /// A successful outcome that produced no artifact.
    pub fn success() -> Self {
        Self {
            success: true,
            artifact: None,
            error: None,
        }
    }

    /// A successful outcome carrying content for the target section.
    pub fn with_artifact(artifact: impl Into<String>) -> Self {
        Self {
            success: true,
            artifact: Some(artifact.into()),
            error: None,
        }
    }

    /// A failed outcome with the given reason.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            artifact: None,
            error: Some(ErrorInfo {
                message: message.into(),
                code: None,
            }),
        }
    }

    /// The failure message, or a generic one when the collaborator gave none.
    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "action reported failure without details".to_string())
    }
}
