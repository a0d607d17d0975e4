//! Where a project keeps its sections, run state, history and pipelines.

use std::path::{Path, PathBuf};

use grantops_versions::VersionStore;

use crate::history::HistoryLog;
use crate::state::StateStore;

pub const DEFAULT_STATE_DIR: &str = ".grantops";
pub const DEFAULT_PIPELINES_DIR: &str = "pipelines";

/// ```text
/// <root>/pipelines/<name>.yaml
/// <state_dir>/sections/...
/// <state_dir>/state/current.json
/// <state_dir>/state/run.lock
/// <state_dir>/history.jsonl
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    root: PathBuf,
    state_dir: PathBuf,
    pipelines_dir: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            state_dir: root.join(DEFAULT_STATE_DIR),
            pipelines_dir: root.join(DEFAULT_PIPELINES_DIR),
            root,
        }
    }

    /// Relative paths are resolved against the project root.
    pub fn with_state_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.state_dir = self.root.join(dir);
        self
    }

    pub fn with_pipelines_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.pipelines_dir = self.root.join(dir);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn pipelines_dir(&self) -> &Path {
        &self.pipelines_dir
    }

    pub fn sections_dir(&self) -> PathBuf {
        self.state_dir.join("sections")
    }

    pub fn run_state_dir(&self) -> PathBuf {
        self.state_dir.join("state")
    }

    pub fn history_path(&self) -> PathBuf {
        self.state_dir.join("history.jsonl")
    }

    /// A bare name maps to `<pipelines_dir>/<name>.yaml`; anything that looks
    /// like a path is taken relative to the root.
    pub fn pipeline_path(&self, name: &str) -> PathBuf {
        let looks_like_path = name.contains('/')
            || name.contains(std::path::MAIN_SEPARATOR)
            || name.ends_with(".yaml")
            || name.ends_with(".yml");
        if looks_like_path {
            self.root.join(name)
        } else {
            self.pipelines_dir.join(format!("{name}.yaml"))
        }
    }

    pub fn version_store(&self) -> VersionStore {
        VersionStore::new(self.sections_dir())
    }

    pub fn state_store(&self) -> StateStore {
        StateStore::new(self.run_state_dir())
    }

    pub fn history_log(&self) -> HistoryLog {
        HistoryLog::new(self.history_path())
    }
}
