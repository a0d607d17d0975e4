//! Run progress notifications.
//!
//! The scheduler and executor publish [`PipelineEvent`]s on a broadcast
//! channel; the CLI prints them and tests assert on them. Nothing reads them
//! back to make a scheduling decision.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineEvent {
    RunStarted {
        run_id: String,
        pipeline: String,
        step_count: usize,
    },
    RunResumed {
        run_id: String,
        pending: usize,
    },
    RunFinished {
        run_id: String,
        status: String,
        duration_ms: u64,
    },
    StepStarted {
        step: String,
        action: String,
        target: String,
    },
    StepRetrying {
        step: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StepCompleted {
        step: String,
        status: String,
        attempts: u32,
        duration_ms: u64,
    },
    StepSkipped {
        step: String,
        reason: String,
    },
    StepAborted {
        step: String,
    },
    VersionCommitted {
        step: String,
        section: String,
        version: u32,
    },
}

impl PipelineEvent {
    /// Step the event concerns, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            PipelineEvent::StepStarted { step, .. }
            | PipelineEvent::StepRetrying { step, .. }
            | PipelineEvent::StepCompleted { step, .. }
            | PipelineEvent::StepSkipped { step, .. }
            | PipelineEvent::StepAborted { step }
            | PipelineEvent::VersionCommitted { step, .. } => Some(step),
            PipelineEvent::RunStarted { .. }
            | PipelineEvent::RunResumed { .. }
            | PipelineEvent::RunFinished { .. } => None,
        }
    }
}

/// Cloneable publishing side of the event channel.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// Slow subscribers lag once `buffer` events are queued for them.
    pub fn new(buffer: usize) -> Self {
        Self {
            tx: broadcast::channel(buffer).0,
        }
    }

    /// Publish to whoever is listening; a send with no receivers is not an
    /// error.
    pub fn emit(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("pipeline event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
