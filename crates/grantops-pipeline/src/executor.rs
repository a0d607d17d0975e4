//! Runs one step to a verdict: invoke its action under the step timeout,
//! retry with backoff, then commit any artifact to the target section.

use std::sync::Arc;
use std::time::{Duration, Instant};

use grantops_types::{ActionOutcome, GrantOpsError, Result, StepStatus};
use grantops_versions::VersionStore;

use crate::action::{ActionContext, ActionInterface};
use crate::events::{EventEmitter, PipelineEvent};
use crate::graph::{StepId, StepNode};
use crate::history::{EntryResult, HistoryEntry, HistoryLog};
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// 1-based.
    pub attempt: u32,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Verdict of one step execution. `status` is always `Success` or `Failed`.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: StepId,
    pub status: StepStatus,
    pub attempts: Vec<AttemptRecord>,
    pub version: Option<u32>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl StepReport {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Cheap to clone; one clone is moved into each spawned step task.
#[derive(Clone)]
pub struct StepExecutor {
    actions: Arc<dyn ActionInterface>,
    versions: Arc<VersionStore>,
    history: HistoryLog,
    events: EventEmitter,
    default_timeout: Option<Duration>,
}

impl StepExecutor {
    pub fn new(
        actions: Arc<dyn ActionInterface>,
        versions: Arc<VersionStore>,
        history: HistoryLog,
        events: EventEmitter,
    ) -> Self {
        Self {
            actions,
            versions,
            history,
            events,
            default_timeout: None,
        }
    }

    /// Timeout for steps that do not declare their own.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    async fn context(
        &self,
        node: &StepNode,
        run_id: &str,
        pipeline: &str,
        attempt: u32,
    ) -> Result<ActionContext> {
        let (section, current_content) = match node.target.section() {
            Some(id) => {
                let snapshot = self.versions.snapshot(id).await?;
                let content = self.versions.current(id).await?.map(|v| v.content);
                (Some(snapshot), content)
            }
            None => (None, None),
        };
        Ok(ActionContext {
            run_id: run_id.to_string(),
            pipeline: pipeline.to_string(),
            step: node.name.clone(),
            attempt,
            section,
            current_content,
        })
    }

    async fn invoke(&self, node: &StepNode, ctx: &ActionContext) -> Result<ActionOutcome> {
        let call = self.actions.invoke(node.action, &node.target, ctx);
        match node.timeout.or(self.default_timeout) {
            Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                Err(GrantOpsError::ActionTimeout {
                    step: node.name.clone(),
                    target: node.target.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                })
            }),
            None => call.await,
        }
    }

    /// Execute `node` until it succeeds or runs out of attempts.
    ///
    /// Action errors and failed outcomes only fail the attempt. `Err` is
    /// returned for storage problems, which leave the run resumable.
    pub async fn execute(&self, node: &StepNode, run_id: &str, pipeline: &str) -> Result<StepReport> {
        let policy = RetryPolicy::from_spec(node.retry.as_ref());
        let started = Instant::now();
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        for attempt in 1..=policy.max_attempts() {
            let ctx = self.context(node, run_id, pipeline, attempt).await?;
            let attempt_started = Instant::now();
            let result = self.invoke(node, &ctx).await;
            let elapsed = attempt_started.elapsed();

            let error = match result {
                Ok(outcome) if outcome.success => {
                    attempts.push(AttemptRecord {
                        attempt,
                        error: None,
                        duration: elapsed,
                    });
                    return self
                        .publish(node, outcome.artifact, attempts, started)
                        .await;
                }
                Ok(outcome) => outcome.error_message(),
                Err(e) => e.to_string(),
            };
            attempts.push(AttemptRecord {
                attempt,
                error: Some(error.clone()),
                duration: elapsed,
            });

            if attempt < policy.max_attempts() {
                let delay = policy.delay_for_retry(attempt - 1);
                tracing::warn!(
                    step = %node.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Step attempt failed, retrying"
                );
                self.history
                    .append(
                        &HistoryEntry::new(run_id, &node.name, node.action, &node.target, EntryResult::Retrying)
                            .attempt(attempt)
                            .duration_ms(elapsed.as_millis() as u64)
                            .detail(error.clone()),
                    )
                    .await?;
                self.events.emit(PipelineEvent::StepRetrying {
                    step: node.name.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    error,
                });
                tokio::time::sleep(delay).await;
            }
        }

        let error = attempts.last().and_then(|a| a.error.clone());
        tracing::warn!(
            step = %node.name,
            attempts = attempts.len(),
            error = error.as_deref().unwrap_or_default(),
            "Step failed"
        );
        Ok(StepReport {
            step: node.id,
            status: StepStatus::Failed,
            attempts,
            version: None,
            error,
            duration: started.elapsed(),
        })
    }

    /// Commit the artifact of a successful attempt.
    ///
    /// A rejected commit fails the step without further retries.
    async fn publish(
        &self,
        node: &StepNode,
        artifact: Option<String>,
        mut attempts: Vec<AttemptRecord>,
        started: Instant,
    ) -> Result<StepReport> {
        let mut report = StepReport {
            step: node.id,
            status: StepStatus::Success,
            attempts: Vec::new(),
            version: None,
            error: None,
            duration: Duration::ZERO,
        };

        match (artifact, node.target.section()) {
            (Some(content), Some(section)) => {
                match self.versions.commit(section, &content, Some(&node.name)).await {
                    Ok(version) => {
                        report.version = Some(version.number());
                        self.events.emit(PipelineEvent::VersionCommitted {
                            step: node.name.clone(),
                            section: section.to_string(),
                            version: version.number(),
                        });
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::warn!(step = %node.name, section, error = %e, "Artifact rejected");
                        let message = e.to_string();
                        if let Some(last) = attempts.last_mut() {
                            last.error = Some(message.clone());
                        }
                        report.status = StepStatus::Failed;
                        report.error = Some(message);
                    }
                }
            }
            (Some(_), None) => {
                tracing::warn!(step = %node.name, "Artifact for target 'all' ignored");
            }
            (None, _) => {}
        }

        report.attempts = attempts;
        report.duration = started.elapsed();
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
