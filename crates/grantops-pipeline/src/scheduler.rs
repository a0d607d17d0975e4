//! Drives a run to completion: evaluate, dispatch, persist, repeat.
//!
//! Every step transition is written to `current.json` before anything else
//! observes it, so a crashed process can be resumed from the last persisted
//! transition. Each completed step is one tick; a run of `n` steps takes at
//! most `n` ticks.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use grantops_types::{GrantOpsError, Result, RunStatus, StepStatus, TargetRef};
use grantops_versions::{SectionSnapshot, VersionStore};
use tokio::task::JoinSet;

use crate::action::ActionInterface;
use crate::actions::DryRunAction;
use crate::evaluator::Evaluator;
use crate::events::{EventEmitter, PipelineEvent};
use crate::executor::{StepExecutor, StepReport};
use crate::graph::{PipelineGraph, StepId};
use crate::history::{EntryResult, HistoryEntry, HistoryLog};
use crate::project::ProjectLayout;
use crate::state::{ExecutionState, StateStore, StepRecord};
use crate::validation::validate_or_raise;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// In-process cancellation. The `cancel` marker file does the same across
/// processes.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub pipeline: String,
    pub status: RunStatus,
    pub steps: Vec<StepRecord>,
    pub ticks: usize,
    pub duration: Duration,
    /// Set once the run has been archived; a blocked run stays active.
    pub archive: Option<PathBuf>,
}

impl RunReport {
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn status_of(&self, name: &str) -> Option<StepStatus> {
        self.step(name).map(|s| s.status)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    state: StateStore,
    history: HistoryLog,
    versions: Arc<VersionStore>,
    actions: Arc<dyn ActionInterface>,
    events: EventEmitter,
    cancel: CancelHandle,
    default_timeout: Option<Duration>,
}

impl Scheduler {
    pub fn new(layout: &ProjectLayout, actions: Arc<dyn ActionInterface>) -> Self {
        Self {
            state: layout.state_store(),
            history: layout.history_log(),
            versions: Arc::new(layout.version_store()),
            actions,
            events: EventEmitter::default(),
            cancel: CancelHandle::new(),
            default_timeout: None,
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Use a handle created elsewhere, e.g. by a signal handler.
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    /// Start a new run of `graph`.
    ///
    /// Fails with [`GrantOpsError::Validation`] or
    /// [`GrantOpsError::RunAlreadyActive`] before any state is written.
    pub async fn start(&self, graph: &PipelineGraph, dry_run: bool) -> Result<RunReport> {
        validate_or_raise(graph)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let state = ExecutionState::new(run_id, graph, dry_run);
        self.state.acquire(&state).await?;
        self.state.clear_cancel().await?;
        self.cancel.reset();

        tracing::info!(
            run_id = %state.run_id,
            pipeline = %graph.name,
            steps = graph.len(),
            dry_run,
            "Run started"
        );
        self.events.emit(PipelineEvent::RunStarted {
            run_id: state.run_id.clone(),
            pipeline: graph.name.clone(),
            step_count: graph.len(),
        });

        self.drive(graph, state).await
    }

    /// Continue the active run from its persisted state.
    ///
    /// Steps found `running` were interrupted and are run again. With
    /// `rearm_failed`, failed steps get another generation of attempts.
    pub async fn resume(&self, graph: &PipelineGraph, rearm_failed: bool) -> Result<RunReport> {
        validate_or_raise(graph)?;

        let mut state = self.state.load().await?.ok_or(GrantOpsError::NoActiveRun)?;
        state.check_matches(graph)?;

        for id in state.recover_interrupted() {
            let record = state.step(id);
            tracing::warn!(run_id = %state.run_id, step = %record.name, "Recovered interrupted step");
            self.record(&state.run_id, record, EntryResult::Recovered, |e| {
                e.detail("interrupted while running")
            })
            .await?;
        }
        if rearm_failed {
            for id in state.rearm_failed() {
                let record = state.step(id);
                tracing::info!(
                    run_id = %state.run_id,
                    step = %record.name,
                    generation = record.generation,
                    "Failed step re-armed"
                );
                self.record(&state.run_id, record, EntryResult::Rearmed, |e| e)
                    .await?;
            }
        }

        self.state.clear_cancel().await?;
        self.cancel.reset();
        if state.status != RunStatus::Aborting {
            state.finish(RunStatus::Running);
        }
        self.state.save(&state).await?;

        let pending = state.counts().pending;
        tracing::info!(run_id = %state.run_id, pending, "Run resumed");
        self.events.emit(PipelineEvent::RunResumed {
            run_id: state.run_id.clone(),
            pending,
        });

        self.drive(graph, state).await
    }

    /// Give up on the active run: abort everything not yet terminal and
    /// archive it. Must not be used while another process is driving it.
    pub async fn abandon(&self) -> Result<ExecutionState> {
        let mut state = self.state.load().await?.ok_or(GrantOpsError::NoActiveRun)?;
        state.recover_interrupted();
        for id in 0..state.steps.len() {
            if state.step(id).status == StepStatus::Pending {
                state.transition(id, StepStatus::Aborted)?;
                self.record(&state.run_id, state.step(id), EntryResult::Aborted, |e| {
                    e.detail("run abandoned")
                })
                .await?;
            }
        }
        state.finish(RunStatus::Aborted);
        self.state.release(&state).await?;
        tracing::info!(run_id = %state.run_id, "Run abandoned");
        Ok(state)
    }

    /// Ask the active run, possibly in another process, to stop.
    pub async fn request_cancel(&self) -> Result<String> {
        self.state.request_cancel().await
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    async fn drive(&self, graph: &PipelineGraph, mut state: ExecutionState) -> Result<RunReport> {
        let started = Instant::now();
        let actions: Arc<dyn ActionInterface> = if state.dry_run {
            Arc::new(DryRunAction)
        } else {
            self.actions.clone()
        };
        let executor = StepExecutor::new(
            actions,
            self.versions.clone(),
            self.history.clone(),
            self.events.clone(),
        )
        .with_default_timeout(self.default_timeout);
        let evaluator = Evaluator::new(graph);
        let capacity = if state.options.parallel {
            state.options.max_concurrency.max(1)
        } else {
            1
        };

        let mut tasks: JoinSet<Result<StepReport>> = JoinSet::new();
        let mut running: HashSet<StepId> = HashSet::new();
        let mut ticks = 0usize;

        loop {
            if state.status == RunStatus::Running && self.cancelled().await? {
                tracing::warn!(run_id = %state.run_id, "Cancellation observed, stopping run");
                state.finish(RunStatus::Aborting);
                self.state.save(&state).await?;
            }

            if state.status == RunStatus::Aborting {
                self.abort_pending(&mut state).await?;
            } else {
                let sections = self.snapshots(graph).await?;
                let evaluation = evaluator.evaluate(&state.statuses(), &sections);

                for skip in evaluation.skipped {
                    let record = state.transition(skip.step, StepStatus::Skipped)?;
                    record.reason = Some(skip.reason.clone());
                    self.state.save(&state).await?;
                    let record = state.step(skip.step);
                    tracing::info!(step = %record.name, reason = %skip.reason, "Step skipped");
                    self.record(&state.run_id, record, EntryResult::Skipped, |e| {
                        e.detail(skip.reason.clone())
                    })
                    .await?;
                    self.events.emit(PipelineEvent::StepSkipped {
                        step: record.name.clone(),
                        reason: skip.reason,
                    });
                }

                for id in evaluation.ready {
                    if running.len() >= capacity {
                        break;
                    }
                    if !can_dispatch(graph, id, &running) {
                        continue;
                    }
                    state.transition(id, StepStatus::Running)?;
                    self.state.save(&state).await?;
                    self.record(&state.run_id, state.step(id), EntryResult::Started, |e| e)
                        .await?;

                    let node = graph.node(id).clone();
                    tracing::info!(
                        step = %node.name,
                        action = %node.action,
                        target = %node.target,
                        "Step started"
                    );
                    self.events.emit(PipelineEvent::StepStarted {
                        step: node.name.clone(),
                        action: node.action.to_string(),
                        target: node.target.to_string(),
                    });

                    let executor = executor.clone();
                    let run_id = state.run_id.clone();
                    let pipeline = state.pipeline.clone();
                    tasks.spawn(async move { executor.execute(&node, &run_id, &pipeline).await });
                    running.insert(id);
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            ticks += 1;
            let report = joined
                .map_err(|e| GrantOpsError::Other(format!("step task failed: {e}")))??;
            running.remove(&report.step);
            self.complete(&mut state, graph, report).await?;
        }

        self.finish(graph, state, ticks, started).await
    }

    async fn complete(
        &self,
        state: &mut ExecutionState,
        graph: &PipelineGraph,
        report: StepReport,
    ) -> Result<()> {
        let record = state.transition(report.step, report.status)?;
        record.attempts = report.attempt_count();
        record.version = report.version;
        record.error = report.error.clone();
        self.state.save(state).await?;

        let record = state.step(report.step);
        let result = match report.status {
            StepStatus::Success => EntryResult::Success,
            _ => EntryResult::Failed,
        };
        tracing::info!(
            step = %record.name,
            status = %report.status,
            attempts = record.attempts,
            duration_ms = report.duration.as_millis() as u64,
            "Step completed"
        );
        self.record(&state.run_id, record, result, |e| {
            let e = e
                .attempt(report.attempt_count())
                .duration_ms(report.duration.as_millis() as u64)
                .version(report.version);
            match &report.error {
                Some(error) => e.detail(error.clone()),
                None => e,
            }
        })
        .await?;
        self.events.emit(PipelineEvent::StepCompleted {
            step: record.name.clone(),
            status: report.status.to_string(),
            attempts: report.attempt_count(),
            duration_ms: report.duration.as_millis() as u64,
        });

        if report.status == StepStatus::Failed
            && graph.options.stop_on_failure
            && state.status == RunStatus::Running
        {
            tracing::warn!(
                run_id = %state.run_id,
                step = %graph.node(report.step).name,
                "Step failed with stop_on_failure set, aborting run"
            );
            state.finish(RunStatus::Aborting);
            self.state.save(state).await?;
        }
        Ok(())
    }

    async fn finish(
        &self,
        graph: &PipelineGraph,
        mut state: ExecutionState,
        ticks: usize,
        started: Instant,
    ) -> Result<RunReport> {
        let status = if state.status == RunStatus::Aborting {
            RunStatus::Aborted
        } else if state.is_settled() {
            RunStatus::Completed
        } else {
            RunStatus::Blocked
        };
        state.finish(status);

        let archive = if status == RunStatus::Blocked {
            let blocked: Vec<&str> = Evaluator::new(graph)
                .blocked_steps(&state.statuses())
                .into_iter()
                .map(|id| graph.node(id).name.as_str())
                .collect();
            tracing::warn!(
                run_id = %state.run_id,
                blocked = ?blocked,
                "Run blocked behind failed steps; resume with re-arm or abandon"
            );
            self.state.save(&state).await?;
            None
        } else {
            Some(self.state.release(&state).await?)
        };

        let duration = started.elapsed();
        let counts = state.counts();
        tracing::info!(
            run_id = %state.run_id,
            status = %status,
            ticks,
            success = counts.success,
            failed = counts.failed,
            skipped = counts.skipped,
            aborted = counts.aborted,
            "Run finished"
        );
        self.events.emit(PipelineEvent::RunFinished {
            run_id: state.run_id.clone(),
            status: status.to_string(),
            duration_ms: duration.as_millis() as u64,
        });

        Ok(RunReport {
            run_id: state.run_id,
            pipeline: state.pipeline,
            status,
            steps: state.steps,
            ticks,
            duration,
            archive,
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn cancelled(&self) -> Result<bool> {
        Ok(self.cancel.is_cancelled() || self.state.cancel_requested().await?)
    }

    async fn abort_pending(&self, state: &mut ExecutionState) -> Result<()> {
        for id in 0..state.steps.len() {
            if state.step(id).status != StepStatus::Pending {
                continue;
            }
            state.transition(id, StepStatus::Aborted)?;
            self.state.save(state).await?;
            let record = state.step(id);
            tracing::info!(step = %record.name, "Step aborted");
            self.record(&state.run_id, record, EntryResult::Aborted, |e| e)
                .await?;
            self.events.emit(PipelineEvent::StepAborted {
                step: record.name.clone(),
            });
        }
        Ok(())
    }

    async fn snapshots(&self, graph: &PipelineGraph) -> Result<HashMap<String, SectionSnapshot>> {
        let mut sections = HashMap::new();
        for id in graph.referenced_sections() {
            let snapshot = self.versions.snapshot(&id).await?;
            sections.insert(id, snapshot);
        }
        Ok(sections)
    }

    async fn record(
        &self,
        run_id: &str,
        record: &StepRecord,
        result: EntryResult,
        build: impl FnOnce(HistoryEntry) -> HistoryEntry,
    ) -> Result<()> {
        let entry = HistoryEntry::new(run_id, &record.name, record.action, &record.target, result);
        self.history.append(&build(entry)).await
    }
}

/// Steps on the same section never overlap, and a step targeting `all` runs
/// alone.
fn can_dispatch(graph: &PipelineGraph, id: StepId, running: &HashSet<StepId>) -> bool {
    let target = &graph.node(id).target;
    running.iter().all(|&other| match (target, &graph.node(other).target) {
        (TargetRef::Section(a), TargetRef::Section(b)) => a != b,
        _ => false,
    })
}
