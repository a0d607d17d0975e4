//! End-to-end tests for the pipeline engine.
//!
//! Each test drives the real scheduler against a temporary project directory:
//! YAML -> graph -> validate -> run -> inspect state, versions and history.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use grantops_pipeline::{
    ActionContext, ActionInterface, CancelHandle, EntryResult, ExecutionState, PipelineEvent,
    PipelineGraph, ProjectLayout, Scheduler,
};
use grantops_types::{
    ActionKind, ActionOutcome, GrantOpsError, Result, RunStatus, StepStatus, TargetRef,
    ViolationKind,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Deterministic stand-in for real actions. Every step succeeds with the
/// artifact `"<step> output\n"` unless told to fail a number of times first.
#[derive(Default)]
struct Script {
    failures: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<String>>,
    /// Per target: (in flight now, most ever in flight).
    overlap: Mutex<HashMap<String, (usize, usize)>>,
    delay: Duration,
}

impl Script {
    fn new() -> Self {
        Self::default()
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing(self, step: &str, times: usize) -> Self {
        self.failures.lock().unwrap().insert(step.to_string(), times);
        self
    }

    fn heal(&self, step: &str) {
        self.failures.lock().unwrap().remove(step);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn max_overlap(&self, target: &str) -> usize {
        self.overlap
            .lock()
            .unwrap()
            .get(target)
            .map(|(_, max)| *max)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ActionInterface for Script {
    async fn invoke(
        &self,
        _action: ActionKind,
        target: &TargetRef,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome> {
        self.calls.lock().unwrap().push(ctx.step.clone());
        {
            let mut overlap = self.overlap.lock().unwrap();
            let entry = overlap.entry(target.to_string()).or_default();
            entry.0 += 1;
            entry.1 = entry.1.max(entry.0);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(entry) = self.overlap.lock().unwrap().get_mut(&target.to_string()) {
            entry.0 -= 1;
        }

        let mut failures = self.failures.lock().unwrap();
        if let Some(left) = failures.get_mut(&ctx.step) {
            if *left > 0 {
                *left -= 1;
                return Ok(ActionOutcome::failure(format!(
                    "{} failed on attempt {}",
                    ctx.step, ctx.attempt
                )));
            }
        }
        Ok(ActionOutcome::with_artifact(format!("{} output\n", ctx.step)))
    }
}

/// Cancels the run from inside its first step.
struct CancelDuringStep(CancelHandle);

#[async_trait]
impl ActionInterface for CancelDuringStep {
    async fn invoke(
        &self,
        _action: ActionKind,
        _target: &TargetRef,
        _ctx: &ActionContext,
    ) -> Result<ActionOutcome> {
        self.0.cancel();
        Ok(ActionOutcome::success())
    }
}

struct Project {
    _dir: tempfile::TempDir,
    layout: ProjectLayout,
}

fn project() -> Project {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = ProjectLayout::new(dir.path());
    Project { _dir: dir, layout }
}

fn graph(yaml: &str) -> PipelineGraph {
    PipelineGraph::from_yaml(yaml).expect("pipeline should be valid")
}

fn statuses(report: &grantops_pipeline::RunReport) -> Vec<(String, StepStatus)> {
    report
        .steps
        .iter()
        .map(|s| (s.name.clone(), s.status))
        .collect()
}

fn named(pairs: &[(&str, StepStatus)]) -> Vec<(String, StepStatus)> {
    pairs.iter().map(|(n, s)| (n.to_string(), *s)).collect()
}

const LINEAR: &str = r#"
name: linear
steps:
  - { name: parse, action: parse, target: all }
  - { name: draft, action: draft, target: narrative }
  - { name: review, action: evaluate, target: narrative }
"#;

// ---------------------------------------------------------------------------
// Basic runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_run_completes_within_step_count_ticks() {
    let p = project();
    let script = Arc::new(Script::new());
    let scheduler = Scheduler::new(&p.layout, script.clone());
    let g = graph(LINEAR);

    let report = scheduler.start(&g, false).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.ticks <= g.len(), "ticks {} > {}", report.ticks, g.len());
    assert_eq!(script.calls(), vec!["parse", "draft", "review"]);
    assert_eq!(report.step("draft").unwrap().version, Some(1));
    assert_eq!(report.step("review").unwrap().version, Some(2));
    assert_eq!(report.step("parse").unwrap().version, None);

    // Slot released and run archived.
    let state = p.layout.state_store();
    assert!(state.load().await.unwrap().is_none());
    let archived = state.archived(&report.run_id).await.unwrap().unwrap();
    assert_eq!(archived.status, RunStatus::Completed);
    assert!(report.archive.is_some());
}

#[tokio::test]
async fn dry_run_creates_no_versions() {
    let p = project();
    let script = Arc::new(Script::new());
    let scheduler = Scheduler::new(&p.layout, script.clone());

    let report = scheduler.start(&graph(LINEAR), true).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Success));
    assert!(script.calls().is_empty());
    assert!(scheduler.versions().list_sections().await.unwrap().is_empty());
}

#[tokio::test]
async fn events_bracket_the_run() {
    let p = project();
    let scheduler = Scheduler::new(&p.layout, Arc::new(Script::new()));
    let mut rx = scheduler.events().subscribe();

    scheduler.start(&graph(LINEAR), false).await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events.first(), Some(PipelineEvent::RunStarted { step_count: 3, .. })));
    assert!(matches!(events.last(), Some(PipelineEvent::RunFinished { status, .. }) if status == "completed"));
    let commits = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::VersionCommitted { .. }))
        .count();
    assert_eq!(commits, 2);
}

// ---------------------------------------------------------------------------
// Versions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parallel_commits_to_one_section_are_serialized_and_gapless() {
    let p = project();
    let script = Arc::new(Script::new().with_delay(Duration::from_millis(20)));
    let scheduler = Scheduler::new(&p.layout, script.clone());
    let g = graph(
        r#"
name: fanout
options: { parallel: true, max_concurrency: 4 }
steps:
  - { name: n1, action: draft, target: narrative }
  - { name: b1, action: draft, target: budget }
  - { name: n2, action: draft, target: narrative }
  - { name: b2, action: draft, target: budget }
  - { name: n3, action: draft, target: narrative }
"#,
    );

    let report = scheduler.start(&g, false).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.ticks <= g.len());

    assert_eq!(script.max_overlap("narrative"), 1);
    assert_eq!(script.max_overlap("budget"), 1);

    let narrative = scheduler.versions().versions("narrative").await.unwrap();
    let numbers: Vec<u32> = narrative.iter().map(|m| m.number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    let producers: Vec<&str> = narrative
        .iter()
        .filter_map(|m| m.producing_step.as_deref())
        .collect();
    assert_eq!(producers, vec!["n1", "n2", "n3"]);

    let budget = scheduler.versions().versions("budget").await.unwrap();
    assert_eq!(budget.iter().map(|m| m.number).collect::<Vec<_>>(), vec![1, 2]);
}

#[tokio::test]
async fn restore_appends_and_keeps_the_original() {
    let p = project();
    let store = p.layout.version_store();
    store.commit("narrative", "first", Some("draft")).await.unwrap();
    store.commit("narrative", "second", Some("draft")).await.unwrap();

    let restored = store.restore("narrative", 1).await.unwrap();
    assert_eq!(restored.number(), 3);
    assert_eq!(restored.content, "first");
    assert_eq!(restored.manifest.restored_from, Some(1));

    store.commit("narrative", "fourth", Some("draft")).await.unwrap();
    assert_eq!(store.get("narrative", 1).await.unwrap().content, "first");
    assert_eq!(store.versions("narrative").await.unwrap().len(), 4);
    assert_eq!(
        store.current("narrative").await.unwrap().unwrap().content,
        "fourth"
    );
}

// ---------------------------------------------------------------------------
// Conditions, skips and failures
// ---------------------------------------------------------------------------

const BUSY_SECTION: &str = r#"
name: busy
steps:
  - { name: d1, action: draft, target: narrative }
  - { name: d2, action: draft, target: narrative }
  - { name: d3, action: draft, target: narrative }
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restores_from_another_store_interleave_without_gaps() {
    let p = project();
    let outside = p.layout.version_store();
    outside.commit("narrative", "seed\n", None).await.unwrap();

    let scheduler = Scheduler::new(
        &p.layout,
        Arc::new(Script::new().with_delay(Duration::from_millis(5))),
    );
    let g = graph(BUSY_SECTION);
    let (report, restored) = tokio::join!(scheduler.start(&g, false), async {
        let mut restored = Vec::new();
        for _ in 0..3 {
            restored.push(outside.restore("narrative", 1).await.unwrap());
        }
        restored
    });
    let report = report.unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    let numbers: Vec<u32> = outside
        .versions("narrative")
        .await
        .unwrap()
        .iter()
        .map(|m| m.number)
        .collect();
    assert_eq!(numbers, (1..=7).collect::<Vec<_>>());
    for v in &restored {
        assert_eq!(outside.get("narrative", v.number()).await.unwrap().content, "seed\n");
    }
    for step in ["d1", "d2", "d3"] {
        let number = report.step(step).unwrap().version.unwrap();
        let version = outside.get("narrative", number).await.unwrap();
        assert_eq!(version.content, format!("{step} output\n"));
    }
}

#[tokio::test]
async fn run_commits_past_crash_leftovers() {
    let p = project();
    let store = p.layout.version_store();
    store.commit("narrative", "v1\n", None).await.unwrap();

    // A crashed commit left content without a manifest, and an older crash
    // left a manifest with no body.
    let versions = store.root().join("narrative").join("versions");
    tokio::fs::write(versions.join("v0003.md"), "partial").await.unwrap();
    tokio::fs::write(versions.join("v0002.json"), "").await.unwrap();

    let scheduler = Scheduler::new(&p.layout, Arc::new(Script::new()));
    let report = scheduler.start(&graph(LINEAR), false).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.step("draft").unwrap().version, Some(3));
    assert_eq!(report.step("review").unwrap().version, Some(4));

    let numbers: Vec<u32> = store
        .versions("narrative")
        .await
        .unwrap()
        .iter()
        .map(|m| m.number)
        .collect();
    assert_eq!(numbers, vec![1, 3, 4]);
    assert_eq!(store.get("narrative", 3).await.unwrap().content, "draft output\n");
    assert_eq!(
        store.current("narrative").await.unwrap().unwrap().content,
        "review output\n"
    );
}

const SKIP_CHAIN: &str = r#"
name: skips
steps:
  - { name: a, action: draft, target: narrative }
  - { name: b, action: evaluate, target: narrative, depends_on: [a], condition: "steps[a].failed" }
  - { name: c, action: report, target: all, depends_on: [b] }
"#;

#[tokio::test]
async fn skipped_step_satisfies_its_dependents() {
    let p = project();
    let scheduler = Scheduler::new(&p.layout, Arc::new(Script::new()));

    let report = scheduler.start(&graph(SKIP_CHAIN), false).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(
        statuses(&report),
        named(&[
            ("a", StepStatus::Success),
            ("b", StepStatus::Skipped),
            ("c", StepStatus::Success),
        ])
    );
    assert!(report
        .step("b")
        .unwrap()
        .reason
        .as_deref()
        .unwrap()
        .contains("steps[a].failed"));

    let history = scheduler.history().read_all().await.unwrap();
    assert!(history
        .iter()
        .any(|e| e.step == "b" && e.result == EntryResult::Skipped));
}

#[tokio::test]
async fn strict_mode_cascades_skips() {
    let p = project();
    let scheduler = Scheduler::new(&p.layout, Arc::new(Script::new()));
    let yaml = SKIP_CHAIN.replace(
        "name: skips",
        "name: skips\noptions: { strict_dependencies: true }",
    );

    let report = scheduler.start(&graph(&yaml), false).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.status_of("c"), Some(StepStatus::Skipped));
    assert_eq!(
        report.step("c").unwrap().reason.as_deref(),
        Some("dependency 'b' was skipped")
    );
}

#[tokio::test]
async fn stop_on_failure_aborts_independent_steps() {
    let p = project();
    let scheduler = Scheduler::new(&p.layout, Arc::new(Script::new().failing("a", usize::MAX)));
    let g = graph(
        r#"
name: failfast
options: { stop_on_failure: true }
steps:
  - { name: a, action: draft, target: narrative, depends_on: [] }
  - { name: b, action: draft, target: budget, depends_on: [] }
"#,
    );

    let report = scheduler.start(&g, false).await.unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(
        statuses(&report),
        named(&[("a", StepStatus::Failed), ("b", StepStatus::Aborted)])
    );
    assert!(p.layout.state_store().load().await.unwrap().is_none());
}

#[tokio::test]
async fn retries_are_recorded_per_attempt() {
    let p = project();
    let scheduler = Scheduler::new(&p.layout, Arc::new(Script::new().failing("draft", 2)));
    let g = graph(
        r#"
name: retry
steps:
  - { name: draft, action: draft, target: narrative, retry: { max: 2, backoff: 10ms } }
"#,
    );

    let report = scheduler.start(&g, false).await.unwrap();

    assert_eq!(report.status_of("draft"), Some(StepStatus::Success));
    assert_eq!(report.step("draft").unwrap().attempts, 3);

    let draft: Vec<(Option<u32>, EntryResult)> = scheduler
        .history()
        .read_all()
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.step == "draft")
        .map(|e| (e.attempt, e.result))
        .collect();
    assert_eq!(
        draft,
        vec![
            (None, EntryResult::Started),
            (Some(1), EntryResult::Retrying),
            (Some(2), EntryResult::Retrying),
            (Some(3), EntryResult::Success),
        ]
    );
}

#[tokio::test]
async fn every_dispatched_step_logs_a_start_before_its_outcome() {
    let p = project();
    let scheduler = Scheduler::new(&p.layout, Arc::new(Script::new()));
    scheduler.start(&graph(LINEAR), false).await.unwrap();

    let history = scheduler.history().read_all().await.unwrap();
    for step in ["parse", "draft", "review"] {
        let results: Vec<EntryResult> = history
            .iter()
            .filter(|e| e.step == step)
            .map(|e| e.result)
            .collect();
        assert_eq!(results, vec![EntryResult::Started, EntryResult::Success], "{step}");
    }
}

#[tokio::test]
async fn step_timeout_fails_the_step() {
    let p = project();
    let scheduler = Scheduler::new(
        &p.layout,
        Arc::new(Script::new().with_delay(Duration::from_secs(30))),
    );
    let g = graph(
        r#"
name: slow
steps:
  - { name: parse, action: parse, target: all, timeout: 20ms }
"#,
    );

    let report = scheduler.start(&g, false).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let parse = report.step("parse").unwrap();
    assert_eq!(parse.status, StepStatus::Failed);
    assert!(parse.error.as_deref().unwrap().contains("timed out"));
}

// ---------------------------------------------------------------------------
// Run slot, validation and lifecycle
// ---------------------------------------------------------------------------

const BLOCKING: &str = r#"
name: blocking
steps:
  - { name: a, action: draft, target: narrative }
  - { name: b, action: evaluate, target: narrative, depends_on: [a] }
"#;

#[tokio::test]
async fn blocked_run_holds_the_slot_until_rearmed() {
    let p = project();
    let script = Arc::new(Script::new().failing("a", usize::MAX));
    let scheduler = Scheduler::new(&p.layout, script.clone());
    let g = graph(BLOCKING);

    let first = scheduler.start(&g, false).await.unwrap();
    assert_eq!(first.status, RunStatus::Blocked);
    assert_eq!(first.status_of("b"), Some(StepStatus::Pending));
    assert!(first.archive.is_none());

    // A second start conflicts and leaves the active run untouched.
    let err = scheduler.start(&g, false).await.unwrap_err();
    assert!(matches!(err, GrantOpsError::RunAlreadyActive { ref run_id } if *run_id == first.run_id));
    let active = p.layout.state_store().load().await.unwrap().unwrap();
    assert_eq!(active.run_id, first.run_id);
    assert_eq!(active.status, RunStatus::Blocked);

    // Without re-arming nothing changes.
    let again = scheduler.resume(&g, false).await.unwrap();
    assert_eq!(again.status, RunStatus::Blocked);

    script.heal("a");
    let finished = scheduler.resume(&g, true).await.unwrap();
    assert_eq!(finished.run_id, first.run_id);
    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(finished.status_of("a"), Some(StepStatus::Success));
    assert_eq!(finished.status_of("b"), Some(StepStatus::Success));
    assert_eq!(finished.step("a").unwrap().generation, 1);

    let history = scheduler.history().read_all().await.unwrap();
    assert!(history
        .iter()
        .any(|e| e.step == "a" && e.result == EntryResult::Rearmed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_starts_on_one_project_admit_one_run() {
    let p = project();
    let g = graph(LINEAR);
    let slow = || Arc::new(Script::new().with_delay(Duration::from_millis(30)));
    let first = Scheduler::new(&p.layout, slow());
    let second = Scheduler::new(&p.layout, slow());

    let (a, b) = tokio::join!(first.start(&g, false), second.start(&g, false));

    let (won, lost) = match (a, b) {
        (Ok(report), Err(err)) | (Err(err), Ok(report)) => (report, err),
        (a, b) => panic!("expected one winner, got {:?} and {:?}", a.is_ok(), b.is_ok()),
    };
    assert_eq!(won.status, RunStatus::Completed);
    assert!(matches!(lost, GrantOpsError::RunAlreadyActive { .. }));

    // Only the winner wrote history or versions.
    let history = p.layout.history_log().read_all().await.unwrap();
    assert!(history.iter().all(|e| e.run_id == won.run_id));
    let numbers: Vec<u32> = p
        .layout
        .version_store()
        .versions("narrative")
        .await
        .unwrap()
        .iter()
        .map(|m| m.number)
        .collect();
    assert_eq!(numbers, vec![1, 2]);
}

#[tokio::test]
async fn abandon_aborts_and_releases() {
    let p = project();
    let scheduler = Scheduler::new(&p.layout, Arc::new(Script::new().failing("a", usize::MAX)));
    let g = graph(BLOCKING);
    let blocked = scheduler.start(&g, false).await.unwrap();
    assert_eq!(blocked.status, RunStatus::Blocked);

    let state = scheduler.abandon().await.unwrap();
    assert_eq!(state.status, RunStatus::Aborted);
    assert_eq!(state.find("b").unwrap().status, StepStatus::Aborted);
    assert!(p.layout.state_store().load().await.unwrap().is_none());

    let err = scheduler.abandon().await.unwrap_err();
    assert!(matches!(err, GrantOpsError::NoActiveRun));
}

#[tokio::test]
async fn invalid_pipeline_reports_every_violation_and_writes_nothing() {
    let p = project();
    let scheduler = Scheduler::new(&p.layout, Arc::new(Script::new()));
    let def = grantops_pipeline::PipelineDefinition::from_yaml(
        r#"
name: broken
steps:
  - { name: a, action: draft, target: narrative, depends_on: [ghost] }
  - { name: a, action: draft, target: narrative }
  - { name: c, action: report, target: all, condition: "section.word_count > 10" }
"#,
    )
    .unwrap();
    let g = PipelineGraph::build(&def).unwrap();

    let err = scheduler.start(&g, false).await.unwrap_err();
    let GrantOpsError::Validation { violations } = err else {
        panic!("expected validation error, got {err:?}");
    };
    let kinds: Vec<ViolationKind> = violations.iter().map(|v| v.kind).collect();
    assert!(kinds.contains(&ViolationKind::DuplicateName));
    assert!(kinds.contains(&ViolationKind::UnknownReference));
    assert!(violations.len() >= 3, "{violations:?}");

    assert!(!p.layout.run_state_dir().join("current.json").exists());
    assert!(!p.layout.history_path().exists());
}

#[tokio::test]
async fn cancellation_stops_between_ticks() {
    let p = project();
    let handle = CancelHandle::new();
    let scheduler = Scheduler::new(&p.layout, Arc::new(CancelDuringStep(handle.clone())))
        .with_cancel_handle(handle);

    let report = scheduler.start(&graph(LINEAR), false).await.unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(
        statuses(&report),
        named(&[
            ("parse", StepStatus::Success),
            ("draft", StepStatus::Aborted),
            ("review", StepStatus::Aborted),
        ])
    );
}

#[tokio::test]
async fn resume_after_crash_matches_uninterrupted_run() {
    let yaml = r#"
name: crash
steps:
  - { name: a, action: draft, target: narrative }
  - { name: b, action: evaluate, target: narrative }
  - { name: c, action: draft, target: narrative }
"#;

    // Reference run.
    let clean = project();
    let clean_report = Scheduler::new(&clean.layout, Arc::new(Script::new()))
        .start(&graph(yaml), false)
        .await
        .unwrap();

    // Crashed run: `a` finished and committed, `b` was mid-flight.
    let crashed = project();
    let g = graph(yaml);
    let store = crashed.layout.version_store();
    store.commit("narrative", "a output\n", Some("a")).await.unwrap();
    let mut state = ExecutionState::new("crashed-run", &g, false);
    state.transition(0, StepStatus::Running).unwrap();
    let a = state.transition(0, StepStatus::Success).unwrap();
    a.attempts = 1;
    a.version = Some(1);
    state.transition(1, StepStatus::Running).unwrap();
    crashed.layout.state_store().acquire(&state).await.unwrap();

    let script = Arc::new(Script::new());
    let scheduler = Scheduler::new(&crashed.layout, script.clone());
    let resumed = scheduler.resume(&g, false).await.unwrap();

    assert_eq!(script.calls(), vec!["b", "c"]);
    assert_eq!(resumed.status, clean_report.status);
    let summary = |r: &grantops_pipeline::RunReport| -> Vec<(String, StepStatus, u32, Option<u32>)> {
        r.steps
            .iter()
            .map(|s| (s.name.clone(), s.status, s.attempts, s.version))
            .collect()
    };
    assert_eq!(summary(&resumed), summary(&clean_report));

    let clean_versions = clean.layout.version_store();
    for n in 1..=3 {
        assert_eq!(
            store.get("narrative", n).await.unwrap().content,
            clean_versions.get("narrative", n).await.unwrap().content
        );
    }

    let history = scheduler.history().read_all().await.unwrap();
    assert!(history
        .iter()
        .any(|e| e.step == "b" && e.result == EntryResult::Recovered));
}

#[tokio::test]
async fn resume_rejects_a_changed_definition() {
    let p = project();
    let scheduler = Scheduler::new(&p.layout, Arc::new(Script::new().failing("a", usize::MAX)));
    scheduler.start(&graph(BLOCKING), false).await.unwrap();

    let changed = BLOCKING.replace("action: evaluate", "action: report");
    let err = scheduler.resume(&graph(&changed), true).await.unwrap_err();
    assert!(matches!(err, GrantOpsError::PipelineMismatch { .. }));
}

#[tokio::test]
async fn cancel_marker_from_another_process_is_observed() {
    let p = project();
    let calls = Arc::new(AtomicUsize::new(0));

    struct MarkerThenSucceed {
        layout: ProjectLayout,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ActionInterface for MarkerThenSucceed {
        async fn invoke(
            &self,
            _action: ActionKind,
            _target: &TargetRef,
            _ctx: &ActionContext,
        ) -> Result<ActionOutcome> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.layout.state_store().request_cancel().await?;
            }
            Ok(ActionOutcome::success())
        }
    }

    let scheduler = Scheduler::new(
        &p.layout,
        Arc::new(MarkerThenSucceed {
            layout: p.layout.clone(),
            calls: calls.clone(),
        }),
    );
    let report = scheduler.start(&graph(LINEAR), false).await.unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!p.layout.run_state_dir().join("cancel").exists());
}
