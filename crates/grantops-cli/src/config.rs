//! Project configuration
//!
//! Read from `grantops.yaml` at the project root when present, then
//! overridden by `GRANTOPS_STATE_DIR` and `GRANTOPS_DRY_RUN`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use grantops_pipeline::{ActionRegistry, CommandAction, PipelineGraph, ProjectLayout};
use grantops_types::ActionKind;
use serde::Deserialize;

pub const CONFIG_FILE: &str = "grantops.yaml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    pub state_dir: Option<PathBuf>,
    pub pipelines_dir: Option<PathBuf>,
    #[serde(with = "grantops_pipeline::duration_serde::option")]
    pub default_timeout: Option<Duration>,
    /// Shell command template per action kind.
    pub actions: BTreeMap<ActionKind, String>,
    /// Only settable from the environment.
    #[serde(skip)]
    pub dry_run: bool,
}

impl ProjectConfig {
    pub fn from_yaml(source: &str) -> anyhow::Result<Self> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(source)?)
    }

    /// Load `<root>/grantops.yaml` (defaults if absent) and apply the
    /// process environment.
    pub fn load(root: &Path) -> anyhow::Result<Self> {
        let path = root.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let source = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            Self::from_yaml(&source).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("GRANTOPS_STATE_DIR").filter(|d| !d.is_empty()) {
            self.state_dir = Some(PathBuf::from(dir));
        }
        if let Some(flag) = lookup("GRANTOPS_DRY_RUN") {
            self.dry_run = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
    }

    pub fn layout(&self, root: &Path) -> ProjectLayout {
        let mut layout = ProjectLayout::new(root);
        if let Some(dir) = &self.state_dir {
            layout = layout.with_state_dir(dir);
        }
        if let Some(dir) = &self.pipelines_dir {
            layout = layout.with_pipelines_dir(dir);
        }
        layout
    }

    /// One [`CommandAction`] per configured kind, run from the project root.
    pub fn action_registry(&self, root: &Path) -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        for (kind, template) in &self.actions {
            registry.register(*kind, CommandAction::new(template.clone()).with_workdir(root));
        }
        registry
    }

    /// Action kinds used by `graph` that have no command configured.
    pub fn missing_actions(&self, graph: &PipelineGraph) -> Vec<ActionKind> {
        let mut missing: Vec<ActionKind> = graph
            .nodes()
            .iter()
            .map(|n| n.action)
            .filter(|kind| !self.actions.contains_key(kind))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }
}
