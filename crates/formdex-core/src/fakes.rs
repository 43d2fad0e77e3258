//! In-memory fakes for the probe and journal traits (testing only).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{FormdexError, Result};
use crate::eval::EvalReport;
use crate::journal::{
    record_from_entries, EventKind, JournalEntry, RunId, RunJournal, RunMetadata, RunRecord,
    RunSummary,
};
use crate::probe::{Artifact, ArtifactProbe, ProbeSnapshot};

// ---------------------------------------------------------------------------
// StaticProbe
// ---------------------------------------------------------------------------

/// Probe that reports a fixed snapshot, replaceable between calls.
#[derive(Debug, Default)]
pub struct StaticProbe {
    snapshot: Mutex<ProbeSnapshot>,
}

impl StaticProbe {
    pub fn new(snapshot: ProbeSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn set(&self, snapshot: ProbeSnapshot) {
        *self.snapshot.lock().unwrap() = snapshot;
    }

    fn current(&self) -> ProbeSnapshot {
        self.snapshot.lock().unwrap().clone()
    }
}

impl ArtifactProbe for StaticProbe {
    fn is_present(&self, artifact: Artifact) -> Result<bool> {
        Ok(self.current().is_present(artifact))
    }

    fn eval_report(&self) -> Result<Option<EvalReport>> {
        Ok(self.current().eval_report)
    }

    fn completed_iterations(&self) -> Result<u32> {
        Ok(self.current().completed_iterations)
    }
}

// ---------------------------------------------------------------------------
// MemoryRunJournal
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunState {
    entries: Vec<JournalEntry>,
    finished: bool,
}

/// In-memory journal backed by a `HashMap<RunId, RunState>`.
#[derive(Debug, Default)]
pub struct MemoryRunJournal {
    runs: Mutex<HashMap<String, RunState>>,
}

impl MemoryRunJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunJournal for MemoryRunJournal {
    async fn start_run(&self, metadata: RunMetadata) -> Result<RunId> {
        let run_id = RunId::new();
        let entry = JournalEntry {
            run_id: run_id.clone(),
            seq: 0,
            kind: EventKind::RunStarted,
            payload: serde_json::to_value(&metadata)?,
            timestamp: Utc::now(),
        };
        let mut runs = self.runs.lock().unwrap();
        runs.insert(
            run_id.0.clone(),
            RunState {
                entries: vec![entry],
                finished: false,
            },
        );
        Ok(run_id)
    }

    async fn append(&self, run_id: &RunId, entry: JournalEntry) -> Result<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| FormdexError::Journal(format!("run not found: {}", run_id)))?;
        if state.finished {
            return Err(FormdexError::Journal(format!(
                "run {} is already finished",
                run_id
            )));
        }
        state.entries.push(entry);
        Ok(())
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
        let mut runs = self.runs.lock().unwrap();
        if let Some(state) = runs.get_mut(&run_id.0) {
            state.finished = true;
        }
        Ok(())
    }

    async fn events(&self, run_id: &RunId) -> Result<Vec<JournalEntry>> {
        let runs = self.runs.lock().unwrap();
        runs.get(&run_id.0)
            .map(|state| state.entries.clone())
            .ok_or_else(|| FormdexError::Journal(format!("run not found: {}", run_id)))
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap();
        let mut records = runs
            .values()
            .map(|state| record_from_entries(&state.entries))
            .collect::<Result<Vec<_>>>()?;
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceType;
    use crate::journal::RunStatus;

    #[test]
    fn test_static_probe_reflects_updates() {
        let probe = StaticProbe::new(ProbeSnapshot::default());
        assert!(!probe.is_present(Artifact::Frames).unwrap());
        probe.set(ProbeSnapshot {
            frames: true,
            ..ProbeSnapshot::default()
        });
        assert!(probe.is_present(Artifact::Frames).unwrap());
        assert!(probe.eval_report().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_journal_lifecycle() {
        let journal = MemoryRunJournal::new();
        let run_id = journal
            .start_run(RunMetadata {
                project: None,
                source_type: SourceType::Video,
                config_digest: "d".to_string(),
                num_variations: 10,
            })
            .await
            .unwrap();

        let runs = journal.list_runs().await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Running);

        journal
            .finish_run(
                &run_id,
                RunSummary {
                    total_events: 1,
                    duration_ms: 5,
                    success: true,
                    outcome: "done".to_string(),
                },
            )
            .await
            .unwrap();
        let runs = journal.list_runs().await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(journal.events(&run_id).await.unwrap().len(), 2);
    }
}
