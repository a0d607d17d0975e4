//! Pipeline definition documents as written by users (YAML).
//!
//! These types mirror the document one-to-one and carry no guarantees; a
//! definition becomes runnable only once [`crate::graph::PipelineGraph`]
//! has validated it.

use std::path::Path;
use std::time::Duration;

use grantops_types::{ActionKind, Result, TargetRef};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::duration_serde;

fn default_max_concurrency() -> usize {
    4
}

fn default_backoff() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub options: PipelineOptions,
    #[serde(default)]
    pub steps: Vec<StepDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineOptions {
    /// Fail-fast: the first failed step aborts every pending step.
    #[serde(default)]
    pub stop_on_failure: bool,
    /// Run independent ready steps concurrently.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// A skipped dependency no longer satisfies its dependents.
    #[serde(default)]
    pub strict_dependencies: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            stop_on_failure: false,
            parallel: false,
            max_concurrency: default_max_concurrency(),
            strict_dependencies: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub action: ActionKind,
    #[serde(default)]
    pub target: TargetRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// `None` means "not written": the step then follows the previous one
    /// unless the pipeline is parallel. `Some(vec![])` means no dependencies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(
        default,
        with = "duration_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

impl StepDef {
    /// A minimal step, mostly useful in tests and scaffolding.
    pub fn new(name: impl Into<String>, action: ActionKind, target: impl Into<TargetRef>) -> Self {
        Self {
            name: name.into(),
            description: None,
            action,
            target: target.into(),
            condition: None,
            depends_on: None,
            continue_on_failure: false,
            retry: None,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySpec {
    pub max: u32,
    #[serde(default = "default_backoff", with = "duration_serde")]
    pub backoff: Duration,
}

impl PipelineDefinition {
    pub fn from_yaml(source: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_yaml(&source)
    }

    /// SHA-256 over the canonical JSON form, used to tie a persisted run to
    /// the definition it was started from.
    pub fn fingerprint(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}
