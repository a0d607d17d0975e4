//! Append-only audit trail of every operation, one JSON object per line.
//!
//! Nothing in the engine reads the log back to make decisions; it exists for
//! reporting and post-hoc debugging.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use grantops_types::{ActionKind, GrantOpsError, Result, TargetRef};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryResult {
    /// A step was dispatched. Carries no attempt number.
    Started,
    Success,
    Failed,
    /// A failed attempt that will be retried.
    Retrying,
    Skipped,
    Aborted,
    /// A failed step put back to pending for another generation.
    Rearmed,
    /// A step found running after a crash, put back to pending.
    Recovered,
}

impl EntryResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryResult::Started => "started",
            EntryResult::Success => "success",
            EntryResult::Failed => "failed",
            EntryResult::Retrying => "retrying",
            EntryResult::Skipped => "skipped",
            EntryResult::Aborted => "aborted",
            EntryResult::Rearmed => "rearmed",
            EntryResult::Recovered => "recovered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub step: String,
    pub action: ActionKind,
    pub target: TargetRef,
    pub result: EntryResult,
    pub duration_ms: u64,
    /// 1-based attempt number for entries that record an action invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HistoryEntry {
    pub fn new(
        run_id: &str,
        step: &str,
        action: ActionKind,
        target: &TargetRef,
        result: EntryResult,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            step: step.to_string(),
            action,
            target: target.clone(),
            result,
            duration_ms: 0,
            attempt: None,
            version: None,
            detail: None,
        }
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn version(mut self, version: Option<u32>) -> Self {
        self.version = version;
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActionStats {
    /// Dispatches, counted once per step start rather than per attempt.
    pub started: usize,
    pub invocations: usize,
    pub success: usize,
    pub failed: usize,
    pub retrying: usize,
    pub skipped: usize,
    pub aborted: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub entries: usize,
    pub runs: usize,
    /// Entries that record an action invocation.
    pub attempts: usize,
    pub total_duration_ms: u64,
    pub by_action: BTreeMap<String, ActionStats>,
}

#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &HistoryEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GrantOpsError::storage(parent, e))?;
        }
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| GrantOpsError::storage(&self.path, e))?;
        file.write_all(&line)
            .await
            .map_err(|e| GrantOpsError::storage(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| GrantOpsError::storage(&self.path, e))?;
        Ok(())
    }

    /// Every entry in append order. A torn final line from a crash is skipped.
    pub async fn read_all(&self) -> Result<Vec<HistoryEntry>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        let text = tokio::fs::read_to_string(&self.path).await?;
        let mut entries = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), line = n + 1, error = %e, "Skipping unreadable history line");
                }
            }
        }
        Ok(entries)
    }

    /// The last `limit` entries, oldest first.
    pub async fn tail(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let mut entries = self.read_all().await?;
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }

    pub async fn stats(&self) -> Result<HistoryStats> {
        let entries = self.read_all().await?;
        let mut stats = HistoryStats {
            entries: entries.len(),
            ..HistoryStats::default()
        };
        let mut runs = HashSet::new();
        for entry in &entries {
            runs.insert(entry.run_id.as_str());
            stats.total_duration_ms += entry.duration_ms;
            let action = stats
                .by_action
                .entry(entry.action.as_str().to_string())
                .or_default();
            action.duration_ms += entry.duration_ms;
            if entry.attempt.is_some() {
                stats.attempts += 1;
                action.invocations += 1;
            }
            match entry.result {
                EntryResult::Started => action.started += 1,
                EntryResult::Success => action.success += 1,
                EntryResult::Failed => action.failed += 1,
                EntryResult::Retrying => action.retrying += 1,
                EntryResult::Skipped => action.skipped += 1,
                EntryResult::Aborted => action.aborted += 1,
                EntryResult::Rearmed | EntryResult::Recovered => {}
            }
        }
        stats.runs = runs.len();
        Ok(stats)
    }
}
