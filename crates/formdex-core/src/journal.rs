//! Run journal: an append-only record of what the driver did.
//!
//! - `RunJournal`: backend-agnostic async trait
//! - `FsRunJournal`: one JSON-lines file per run under `<root>/journal/`
//! - `RunRecorder`: binds a journal to one run and numbers its events
//!
//! An in-memory implementation lives in [`crate::fakes`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::config::SourceType;
use crate::error::{FormdexError, Result};

/// Unique identifier of a driver run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kinds of journal entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    ActionPlanned,
    StageStarted,
    StageFinished,
    StageFailed,
    Retry,
    RunFinished,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunStarted => "run_started",
            EventKind::ActionPlanned => "action_planned",
            EventKind::StageStarted => "stage_started",
            EventKind::StageFinished => "stage_finished",
            EventKind::StageFailed => "stage_failed",
            EventKind::Retry => "retry",
            EventKind::RunFinished => "run_finished",
        }
    }
}

/// Metadata captured when a run starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    pub project: Option<String>,
    pub source_type: SourceType,
    /// SHA-256 of the configuration at start.
    pub config_digest: String,
    pub num_variations: u32,
}

/// A single journal line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    pub run_id: RunId,
    /// Monotonic within a run, starting at 0 for `run_started`.
    pub seq: u64,
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Summary written when a run ends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub total_events: u64,
    pub duration_ms: u64,
    pub success: bool,
    /// Human-readable outcome ("done", "give_up", error message, ...).
    pub outcome: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// Reconstructed view of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub metadata: RunMetadata,
    pub status: RunStatus,
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Append-only run journal.
///
/// Guarantees:
/// - Entries are ordered by `seq` within a run.
/// - A finished run accepts no further entries.
#[async_trait]
pub trait RunJournal: Send + Sync {
    async fn start_run(&self, metadata: RunMetadata) -> Result<RunId>;

    async fn append(&self, run_id: &RunId, entry: JournalEntry) -> Result<()>;

    async fn finish_run(&self, run_id: &RunId, summary: RunSummary) -> Result<()>;

    async fn events(&self, run_id: &RunId) -> Result<Vec<JournalEntry>>;

    /// All runs, oldest first.
    async fn list_runs(&self) -> Result<Vec<RunRecord>>;
}

/// Rebuild a [`RunRecord`] from a run's entries.
pub fn record_from_entries(entries: &[JournalEntry]) -> Result<RunRecord> {
    let first = entries
        .first()
        .filter(|e| e.kind == EventKind::RunStarted)
        .ok_or_else(|| FormdexError::Journal("run has no run_started entry".to_string()))?;
    let metadata: RunMetadata = serde_json::from_value(first.payload.clone())?;

    let finished = entries
        .iter()
        .rev()
        .find(|e| e.kind == EventKind::RunFinished);
    let (status, summary, completed_at) = match finished {
        Some(entry) => {
            let summary: RunSummary = serde_json::from_value(entry.payload.clone())?;
            let status = if summary.success {
                RunStatus::Completed
            } else {
                RunStatus::Failed
            };
            (status, Some(summary), Some(entry.timestamp))
        }
        None => (RunStatus::Running, None, None),
    };

    Ok(RunRecord {
        run_id: first.run_id.clone(),
        metadata,
        status,
        summary,
        created_at: first.timestamp,
        completed_at,
    })
}

/// Filesystem journal: `<dir>/<run_id>.jsonl`.
pub struct FsRunJournal {
    dir: PathBuf,
    finished: Mutex<HashSet<String>>,
}

impl FsRunJournal {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            finished: Mutex::new(HashSet::new()),
        }
    }

    fn run_path(&self, run_id: &RunId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", run_id.0))
    }

    async fn write_line(&self, run_id: &RunId, entry: &JournalEntry) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_path(run_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    fn is_finished(&self, run_id: &RunId) -> bool {
        self.finished
            .lock()
            .map(|set| set.contains(&run_id.0))
            .unwrap_or(false)
    }
}

#[async_trait]
impl RunJournal for FsRunJournal {
    async fn start_run(&self, metadata: RunMetadata) -> Result<RunId> {
        let run_id = RunId::new();
        let entry = JournalEntry {
            run_id: run_id.clone(),
            seq: 0,
            kind: EventKind::RunStarted,
            payload: serde_json::to_value(&metadata)?,
            timestamp: Utc::now(),
        };
        self.write_line(&run_id, &entry).await?;
        Ok(run_id)
    }

    async fn append(&self, run_id: &RunId, entry: JournalEntry) -> Result<()> {
        if self.is_finished(run_id) {
            return Err(FormdexError::Journal(format!(
                "run {} is already finished",
                run_id
            )));
        }
        if !self.run_path(run_id).is_file() {
            return Err(FormdexError::Journal(format!("run not found: {}", run_id)));
        }
        self.write_line(run_id, &entry).await
    }

    async fn finish_run(&self, run_id: &RunId, summary: RunSummary) -> Result<()> {
        let entry = JournalEntry {
            run_id: run_id.clone(),
            seq: summary.total_events,
            kind: EventKind::RunFinished,
            payload: serde_json::to_value(&summary)?,
            timestamp: Utc::now(),
        };
        self.append(run_id, entry).await?;
        if let Ok(mut set) = self.finished.lock() {
            set.insert(run_id.0.clone());
        }
        Ok(())
    }

    async fn events(&self, run_id: &RunId) -> Result<Vec<JournalEntry>> {
        let content = match tokio::fs::read_to_string(self.run_path(run_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FormdexError::Journal(format!("run not found: {}", run_id)));
            }
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(FormdexError::from))
            .collect()
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let entries = self.events(&RunId(stem.to_string())).await?;
            records.push(record_from_entries(&entries)?);
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

/// Records events for one run with monotonically increasing sequence numbers.
pub struct RunRecorder {
    journal: Arc<dyn RunJournal>,
    run_id: RunId,
    next_seq: u64,
}

impl RunRecorder {
    /// Start a new run and return a recorder bound to it.
    pub async fn start(journal: Arc<dyn RunJournal>, metadata: RunMetadata) -> Result<Self> {
        let project = metadata.project.clone().unwrap_or_default();
        let run_id = journal.start_run(metadata).await?;
        crate::obs::emit_run_started(&run_id.0, &project);
        Ok(Self {
            journal,
            run_id,
            next_seq: 1,
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Events recorded so far, including `run_started`.
    pub fn total_events(&self) -> u64 {
        self.next_seq
    }

    pub async fn record(&mut self, kind: EventKind, payload: Value) -> Result<()> {
        let entry = JournalEntry {
            run_id: self.run_id.clone(),
            seq: self.next_seq,
            kind,
            payload,
            timestamp: Utc::now(),
        };
        self.journal.append(&self.run_id, entry).await?;
        self.next_seq += 1;
        Ok(())
    }

    /// Finalize the run.
    pub async fn finish(self, duration_ms: u64, success: bool, outcome: String) -> Result<()> {
        let summary = RunSummary {
            total_events: self.next_seq,
            duration_ms,
            success,
            outcome,
        };
        crate::obs::emit_run_finished(&self.run_id.0, duration_ms, summary.total_events, success);
        self.journal.finish_run(&self.run_id, summary).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata() -> RunMetadata {
        RunMetadata {
            project: Some("ud100-form".to_string()),
            source_type: SourceType::Form,
            config_digest: "abc123".to_string(),
            num_variations: 100,
        }
    }

    #[tokio::test]
    async fn test_fs_journal_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let journal: Arc<dyn RunJournal> = Arc::new(FsRunJournal::new(dir.path()));

        let mut recorder = RunRecorder::start(journal.clone(), metadata()).await.unwrap();
        recorder
            .record(EventKind::StageStarted, json!({ "stage": "collect_form" }))
            .await
            .unwrap();
        recorder
            .record(EventKind::StageFinished, json!({ "stage": "collect_form", "exit_code": 0 }))
            .await
            .unwrap();
        let run_id = recorder.run_id().clone();
        recorder.finish(42, true, "done".to_string()).await.unwrap();

        let events = journal.events(&run_id).await.unwrap();
        assert_eq!(events.len(), 4);
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        assert_eq!(events[3].kind, EventKind::RunFinished);

        let runs = journal.list_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(runs[0].metadata, metadata());
        assert_eq!(runs[0].summary.as_ref().unwrap().duration_ms, 42);
    }

    #[tokio::test]
    async fn test_append_after_finish_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let journal = FsRunJournal::new(dir.path());
        let run_id = journal.start_run(metadata()).await.unwrap();
        journal
            .finish_run(
                &run_id,
                RunSummary {
                    total_events: 1,
                    duration_ms: 0,
                    success: false,
                    outcome: "stage 'train' failed".to_string(),
                },
            )
            .await
            .unwrap();

        let entry = JournalEntry {
            run_id: run_id.clone(),
            seq: 2,
            kind: EventKind::StageStarted,
            payload: json!({}),
            timestamp: Utc::now(),
        };
        assert!(journal.append(&run_id, entry).await.is_err());

        let runs = journal.list_runs().await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let dir = tempfile::tempdir().unwrap();
        let journal = FsRunJournal::new(dir.path().join("journal"));
        assert!(journal.list_runs().await.unwrap().is_empty());
        assert!(journal.events(&RunId::new()).await.is_err());
    }
}
