//! Durable execution state for the project's single active run.
//!
//! `current.json` is replaced atomically on every step transition, so a crash
//! leaves the last persisted transition intact. The existence of
//! `current.json` is the project's run slot. Claiming and freeing the slot
//! happen under an exclusive OS lock on `run.lock`, which is never removed, so
//! two starters can not both see the slot empty.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use grantops_types::{ActionKind, GrantOpsError, Result, RunStatus, StepStatus, TargetRef};
use grantops_versions::{write_atomic, FileLock};
use serde::{Deserialize, Serialize};

use crate::definition::PipelineOptions;
use crate::graph::{PipelineGraph, StepId, StepNode};

// ---------------------------------------------------------------------------
// ExecutionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub action: ActionKind,
    pub target: TargetRef,
    pub status: StepStatus,
    /// Action invocations in the current generation.
    pub attempts: u32,
    /// Bumped each time a failed step is re-armed.
    #[serde(default)]
    pub generation: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Version committed by this step, if it produced an artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StepRecord {
    fn pending(node: &StepNode) -> Self {
        Self {
            name: node.name.clone(),
            action: node.action,
            target: node.target.clone(),
            status: StepStatus::Pending,
            attempts: 0,
            generation: 0,
            started_at: None,
            finished_at: None,
            version: None,
            error: None,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepCounts {
    pub pending: usize,
    pub running: usize,
    pub skipped: usize,
    pub success: usize,
    pub failed: usize,
    pub aborted: usize,
}

/// Progress of one run. Steps are stored in declaration order, so a
/// [`StepId`] indexes `steps` directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: String,
    pub pipeline: String,
    pub fingerprint: String,
    pub options: PipelineOptions,
    pub status: RunStatus,
    #[serde(default)]
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepRecord>,
}

impl ExecutionState {
    pub fn new(run_id: impl Into<String>, graph: &PipelineGraph, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            pipeline: graph.name.clone(),
            fingerprint: graph.fingerprint().to_string(),
            options: graph.options.clone(),
            status: RunStatus::Running,
            dry_run,
            started_at: now,
            updated_at: now,
            finished_at: None,
            steps: graph.nodes().iter().map(StepRecord::pending).collect(),
        }
    }

    /// Reject a persisted run that was started from another definition.
    pub fn check_matches(&self, graph: &PipelineGraph) -> Result<()> {
        let mismatch = |reason: String| GrantOpsError::PipelineMismatch {
            run_id: self.run_id.clone(),
            reason,
        };
        if self.fingerprint != graph.fingerprint() {
            return Err(mismatch(format!(
                "definition of '{}' changed since the run started",
                graph.name
            )));
        }
        let names_match = self.steps.len() == graph.len()
            && self
                .steps
                .iter()
                .zip(graph.nodes())
                .all(|(record, node)| record.name == node.name);
        if !names_match {
            return Err(mismatch("step list differs".into()));
        }
        Ok(())
    }

    pub fn step(&self, id: StepId) -> &StepRecord {
        &self.steps[id]
    }

    pub fn find(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn statuses(&self) -> Vec<StepStatus> {
        self.steps.iter().map(|s| s.status).collect()
    }

    pub fn status_map(&self) -> HashMap<String, StepStatus> {
        self.steps
            .iter()
            .map(|s| (s.name.clone(), s.status))
            .collect()
    }

    pub fn counts(&self) -> StepCounts {
        let mut counts = StepCounts::default();
        for step in &self.steps {
            match step.status {
                StepStatus::Pending => counts.pending += 1,
                StepStatus::Running => counts.running += 1,
                StepStatus::Skipped => counts.skipped += 1,
                StepStatus::Success => counts.success += 1,
                StepStatus::Failed => counts.failed += 1,
                StepStatus::Aborted => counts.aborted += 1,
            }
        }
        counts
    }

    /// `true` when every step is terminal.
    pub fn is_settled(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    /// Apply a forward step transition. Terminal statuses never change here.
    pub fn transition(&mut self, id: StepId, to: StepStatus) -> Result<&mut StepRecord> {
        let now = Utc::now();
        self.updated_at = now;
        let record = &mut self.steps[id];
        if !record.status.can_transition_to(to) {
            return Err(GrantOpsError::InvalidTransition {
                step: record.name.clone(),
                from: record.status,
                to,
            });
        }
        record.status = to;
        match to {
            StepStatus::Running => {
                record.started_at = Some(now);
                record.finished_at = None;
            }
            _ => record.finished_at = Some(now),
        }
        Ok(record)
    }

    /// Return steps left `running` by a crashed process to `pending`.
    ///
    /// An interrupted invocation never reported a verdict, so the step is run
    /// again from its first attempt.
    pub fn recover_interrupted(&mut self) -> Vec<StepId> {
        let mut recovered = Vec::new();
        for (id, record) in self.steps.iter_mut().enumerate() {
            if record.status == StepStatus::Running {
                record.status = StepStatus::Pending;
                record.attempts = 0;
                record.started_at = None;
                recovered.push(id);
            }
        }
        if !recovered.is_empty() {
            self.updated_at = Utc::now();
        }
        recovered
    }

    /// Put every failed step back to `pending` under a new generation.
    pub fn rearm_failed(&mut self) -> Vec<StepId> {
        let mut rearmed = Vec::new();
        for (id, record) in self.steps.iter_mut().enumerate() {
            if record.status == StepStatus::Failed {
                record.status = StepStatus::Pending;
                record.generation += 1;
                record.attempts = 0;
                record.started_at = None;
                record.finished_at = None;
                record.error = None;
                rearmed.push(id);
            }
        }
        if !rearmed.is_empty() {
            self.updated_at = Utc::now();
        }
        rearmed
    }

    pub fn finish(&mut self, status: RunStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.finished_at = Some(now);
        }
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Files of the active run under `<state_dir>/state`.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join("current.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join("run.lock")
    }

    fn cancel_path(&self) -> PathBuf {
        self.dir.join("cancel")
    }

    fn archive_path(&self, run_id: &str) -> PathBuf {
        self.dir.join("archive").join(format!("{run_id}.json"))
    }

    /// Load the active run, if any.
    pub async fn load(&self) -> Result<Option<ExecutionState>> {
        read_state(&self.current_path()).await
    }

    /// Atomically replace the persisted state.
    pub async fn save(&self, state: &ExecutionState) -> Result<()> {
        let path = self.current_path();
        write_atomic(&path, &serde_json::to_vec_pretty(state)?).await?;
        tracing::debug!(
            run_id = %state.run_id,
            status = %state.status,
            path = %path.display(),
            "Execution state saved"
        );
        Ok(())
    }

    /// Claim the project's run slot for `state` and persist it.
    ///
    /// Fails with [`GrantOpsError::RunAlreadyActive`] without touching any
    /// file when another run holds the slot.
    pub async fn acquire(&self, state: &ExecutionState) -> Result<()> {
        let _slot = FileLock::exclusive(&self.lock_path()).await?;
        if let Some(active) = self.load().await? {
            return Err(GrantOpsError::RunAlreadyActive {
                run_id: active.run_id,
            });
        }
        self.save(state).await?;
        tracing::info!(run_id = %state.run_id, pipeline = %state.pipeline, "Run slot acquired");
        Ok(())
    }

    /// Archive a finished or abandoned run and free the run slot.
    pub async fn release(&self, state: &ExecutionState) -> Result<PathBuf> {
        let _slot = FileLock::exclusive(&self.lock_path()).await?;
        let archive = self.archive_path(&state.run_id);
        write_atomic(&archive, &serde_json::to_vec_pretty(state)?).await?;
        for path in [self.current_path(), self.cancel_path()] {
            remove_if_exists(&path).await?;
        }
        tracing::info!(
            run_id = %state.run_id,
            status = %state.status,
            archive = %archive.display(),
            "Run archived"
        );
        Ok(archive)
    }

    /// Load an archived run by id.
    pub async fn archived(&self, run_id: &str) -> Result<Option<ExecutionState>> {
        read_state(&self.archive_path(run_id)).await
    }

    /// Ask the active run to stop between ticks. Returns its run id.
    pub async fn request_cancel(&self) -> Result<String> {
        let state = self.load().await?.ok_or(GrantOpsError::NoActiveRun)?;
        write_atomic(&self.cancel_path(), state.run_id.as_bytes()).await?;
        tracing::info!(run_id = %state.run_id, "Cancellation requested");
        Ok(state.run_id)
    }

    pub async fn cancel_requested(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.cancel_path()).await?)
    }

    pub async fn clear_cancel(&self) -> Result<()> {
        remove_if_exists(&self.cancel_path()).await
    }
}

async fn read_state(path: &Path) -> Result<Option<ExecutionState>> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(path).await?;
    Ok(Some(serde_json::from_str(&json)?))
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GrantOpsError::storage(path, e)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> PipelineGraph {
        PipelineGraph::from_yaml(
            "name: p\nsteps:\n  - { name: a, action: draft, target: s }\n  - { name: b, action: draft, target: s }\n",
        )
        .unwrap()
    }

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state"));
        (dir, store)
    }

    #[test]
    fn transitions_are_forward_only() {
        let mut state = ExecutionState::new("r1", &graph(), false);
        state.transition(0, StepStatus::Running).unwrap();
        state.transition(0, StepStatus::Success).unwrap();
        let err = state.transition(0, StepStatus::Running).unwrap_err();
        assert!(matches!(err, GrantOpsError::InvalidTransition { .. }));
        assert!(state.transition(1, StepStatus::Success).is_err());
        state.transition(1, StepStatus::Aborted).unwrap();
        assert!(state.is_settled());
    }

    #[test]
    fn recover_and_rearm() {
        let mut state = ExecutionState::new("r1", &graph(), false);
        state.transition(0, StepStatus::Running).unwrap();
        state.transition(0, StepStatus::Failed).unwrap();
        state.transition(1, StepStatus::Running).unwrap();

        assert_eq!(state.recover_interrupted(), vec![1]);
        assert_eq!(state.step(1).status, StepStatus::Pending);

        assert_eq!(state.rearm_failed(), vec![0]);
        assert_eq!(state.step(0).status, StepStatus::Pending);
        assert_eq!(state.step(0).generation, 1);
        assert_eq!(state.counts().pending, 2);
    }

    #[test]
    fn mismatch_is_detected() {
        let state = ExecutionState::new("r1", &graph(), false);
        let other = PipelineGraph::from_yaml(
            "name: p\nsteps:\n  - { name: a, action: draft, target: s }\n",
        )
        .unwrap();
        let err = state.check_matches(&other).unwrap_err();
        assert!(matches!(err, GrantOpsError::PipelineMismatch { .. }));
        assert!(state.check_matches(&graph()).is_ok());
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let (_dir, store) = store();
        let state = ExecutionState::new("r1", &graph(), true);
        store.save(&state).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn second_acquire_conflicts_without_mutation() {
        let (_dir, store) = store();
        let first = ExecutionState::new("r1", &graph(), false);
        store.acquire(&first).await.unwrap();

        let second = ExecutionState::new("r2", &graph(), false);
        let err = store.acquire(&second).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.load().await.unwrap().unwrap().run_id, "r1");
    }

    #[tokio::test]
    async fn leftover_lock_file_does_not_block_a_start() {
        let (_dir, store) = store();
        tokio::fs::create_dir_all(store.dir()).await.unwrap();
        tokio::fs::write(store.dir().join("run.lock"), "ghost").await.unwrap();

        let state = ExecutionState::new("r1", &graph(), false);
        store.acquire(&state).await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().run_id, "r1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_starters_get_exactly_one_slot() {
        for trial in 0..50 {
            let (_dir, store) = store();
            let mut tasks = tokio::task::JoinSet::new();
            for n in 0..2 {
                let store = store.clone();
                tasks.spawn(async move {
                    let state = ExecutionState::new(format!("r{trial}-{n}"), &graph(), false);
                    store.acquire(&state).await.map(|()| state.run_id)
                });
            }
            let mut winners = Vec::new();
            let mut conflicts = 0;
            while let Some(joined) = tasks.join_next().await {
                match joined.unwrap() {
                    Ok(run_id) => winners.push(run_id),
                    Err(GrantOpsError::RunAlreadyActive { .. }) => conflicts += 1,
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }
            assert_eq!(winners.len(), 1, "trial {trial}");
            assert_eq!(conflicts, 1, "trial {trial}");
            assert_eq!(store.load().await.unwrap().unwrap().run_id, winners[0]);
        }
    }

    #[tokio::test]
    async fn release_archives_and_frees_slot() {
        let (_dir, store) = store();
        let mut state = ExecutionState::new("r1", &graph(), false);
        store.acquire(&state).await.unwrap();
        store.request_cancel().await.unwrap();
        assert!(store.cancel_requested().await.unwrap());

        state.finish(RunStatus::Aborted);
        store.release(&state).await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        assert!(!store.cancel_requested().await.unwrap());
        assert_eq!(
            store.archived("r1").await.unwrap().unwrap().status,
            RunStatus::Aborted
        );

        assert!(store.dir().join("run.lock").exists());
        store
            .acquire(&ExecutionState::new("r2", &graph(), false))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_without_run_is_not_found() {
        let (_dir, store) = store();
        let err = store.request_cancel().await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
