//! Labeling worker pool.
//!
//! One `label` invocation from the sequencer's point of view, N worker
//! processes underneath. Unlabeled frames are split round-robin into
//! disjoint shards; each worker receives the path of its shard list.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use formdex_core::{FormdexError, Result};
use futures::future::join_all;
use tracing::{debug, info};

use crate::runner::{StageResult, StageRunner};
use crate::stage::StageConfig;

pub const ENV_WORKER_INDEX: &str = "FORMDEX_WORKER_INDEX";
pub const ENV_WORKER_COUNT: &str = "FORMDEX_WORKER_COUNT";
pub const ENV_SHARD_FILE: &str = "FORMDEX_SHARD_FILE";

/// Split `frames` round-robin over at most `workers` shards.
///
/// No shard is empty, every frame lands in exactly one shard.
pub fn plan_shards(frames: &[PathBuf], workers: usize) -> Vec<Vec<PathBuf>> {
    let count = workers.max(1).min(frames.len());
    let mut shards = vec![Vec::new(); count];
    for (i, frame) in frames.iter().enumerate() {
        shards[i % count].push(frame.clone());
    }
    shards
}

/// Result of one pool run.
#[derive(Debug, Clone)]
pub struct PoolOutcome {
    /// Per-worker results, ordered by worker index.
    pub workers: Vec<StageResult>,

    /// Frames handed out.
    pub frames: usize,

    pub duration_ms: u64,
}

impl PoolOutcome {
    pub fn first_failure(&self) -> Option<&StageResult> {
        self.workers.iter().find(|w| !w.passed())
    }

    /// Collapse into a single `label` result.
    pub fn into_stage_result(self, stage_name: &str) -> StageResult {
        let failure = self.first_failure().cloned();
        let stderr = self
            .workers
            .iter()
            .filter(|w| !w.stderr.is_empty())
            .map(|w| format!("[{}] {}", w.stage_name, w.stderr.trim_end()))
            .collect::<Vec<_>>()
            .join("\n");
        let stdout = self
            .workers
            .iter()
            .filter(|w| !w.stdout.is_empty())
            .map(|w| format!("[{}] {}", w.stage_name, w.stdout.trim_end()))
            .collect::<Vec<_>>()
            .join("\n");
        StageResult {
            stage_name: stage_name.to_string(),
            exit_code: failure.as_ref().map(|f| f.exit_code).unwrap_or(0),
            stdout,
            stderr,
            duration_ms: self.duration_ms,
            success: failure.is_none(),
        }
    }
}

/// Fans the labeling stage out over `workers` concurrent processes.
pub struct LabelPool {
    runner: Arc<dyn StageRunner>,
    workers: usize,
}

impl LabelPool {
    pub fn new(runner: Arc<dyn StageRunner>, workers: u32) -> Self {
        Self {
            runner,
            workers: workers.max(1) as usize,
        }
    }

    /// Label `frames`, writing shard lists under `shards_dir`.
    ///
    /// All workers are awaited even when one fails early. A worker that
    /// cannot be started fails the whole pool once the others are done.
    pub async fn run(
        &self,
        base: &StageConfig,
        frames: &[PathBuf],
        shards_dir: &Path,
    ) -> Result<PoolOutcome> {
        let start = Instant::now();
        let shards = plan_shards(frames, self.workers);
        info!(
            stage = %base.name,
            frames = frames.len(),
            workers = shards.len(),
            "Dispatching labeling workers"
        );

        reset_shards_dir(shards_dir).await?;

        let mut configs = Vec::with_capacity(shards.len());
        for (index, shard) in shards.iter().enumerate() {
            let shard_file = shards_dir.join(format!("worker-{}.txt", index));
            let mut body = shard
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join("\n");
            body.push('\n');
            tokio::fs::write(&shard_file, body).await?;
            debug!(worker = index, frames = shard.len(), shard = %shard_file.display(), "Shard written");

            configs.push(
                base.clone()
                    .with_name(format!("{}#{}", base.name, index))
                    .with_env(ENV_WORKER_INDEX, index)
                    .with_env(ENV_WORKER_COUNT, shards.len())
                    .with_env(ENV_SHARD_FILE, shard_file.display()),
            );
        }

        let results = join_all(configs.iter().map(|c| self.runner.execute(c))).await;
        let workers = results.into_iter().collect::<Result<Vec<_>>>()?;

        Ok(PoolOutcome {
            workers,
            frames: frames.len(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

async fn reset_shards_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(FormdexError::Io(e)),
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use formdex_core::Stage;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn frames(n: usize) -> Vec<PathBuf> {
        (0..n)
            .map(|i| PathBuf::from(format!("frames/var{:03}.jpg", i)))
            .collect()
    }

    /// Records each worker's shard contents; fails the worker whose index is
    /// in `failing`.
    struct ShardRecorder {
        seen: Mutex<Vec<(String, Vec<String>)>>,
        failing: Option<usize>,
    }

    #[async_trait]
    impl StageRunner for ShardRecorder {
        async fn execute(&self, config: &StageConfig) -> Result<StageResult> {
            let shard_file = config.env_var(ENV_SHARD_FILE).unwrap().to_string();
            let index: usize = config.env_var(ENV_WORKER_INDEX).unwrap().parse().unwrap();
            let lines = std::fs::read_to_string(&shard_file)
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect();
            self.seen
                .lock()
                .unwrap()
                .push((config.name.clone(), lines));
            let exit_code = if self.failing == Some(index) { 2 } else { 0 };
            Ok(StageResult {
                stage_name: config.name.clone(),
                exit_code,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 1,
                success: exit_code == 0,
            })
        }
    }

    #[test]
    fn test_plan_shards_disjoint_and_complete() {
        let all = frames(10);
        let shards = plan_shards(&all, 3);
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0].len(), 4);
        assert_eq!(shards[1].len(), 3);

        let mut seen = HashSet::new();
        for frame in shards.iter().flatten() {
            assert!(seen.insert(frame.clone()), "frame in two shards");
        }
        assert_eq!(seen.len(), all.len());
    }

    #[test]
    fn test_plan_shards_never_empty() {
        assert_eq!(plan_shards(&frames(2), 8).len(), 2);
        assert!(plan_shards(&[], 4).is_empty());
        assert_eq!(plan_shards(&frames(5), 0).len(), 1);
    }

    #[tokio::test]
    async fn test_pool_runs_every_shard() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ShardRecorder {
            seen: Mutex::new(Vec::new()),
            failing: None,
        });
        let pool = LabelPool::new(runner.clone(), 3);
        let base = StageConfig::custom(Stage::Label, vec!["label".to_string()], 0);

        let outcome = pool
            .run(&base, &frames(7), &dir.path().join("label_shards"))
            .await
            .unwrap();
        assert_eq!(outcome.workers.len(), 3);
        assert!(outcome.first_failure().is_none());

        let seen = runner.seen.lock().unwrap();
        let total: usize = seen.iter().map(|(_, lines)| lines.len()).sum();
        assert_eq!(total, 7);
        let names: HashSet<&str> = seen.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains("label#0") && names.contains("label#2"));
    }

    #[tokio::test]
    async fn test_pool_reports_failing_worker() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ShardRecorder {
            seen: Mutex::new(Vec::new()),
            failing: Some(1),
        });
        let pool = LabelPool::new(runner, 2);
        let base = StageConfig::custom(Stage::Label, vec!["label".to_string()], 0);

        let outcome = pool
            .run(&base, &frames(4), &dir.path().join("label_shards"))
            .await
            .unwrap();
        let failure = outcome.first_failure().unwrap();
        assert_eq!(failure.stage_name, "label#1");

        let merged = outcome.into_stage_result("label");
        assert!(!merged.passed());
        assert_eq!(merged.exit_code, 2);
    }

    #[tokio::test]
    async fn test_stale_shards_removed() {
        let dir = tempfile::tempdir().unwrap();
        let shards_dir = dir.path().join("label_shards");
        std::fs::create_dir_all(&shards_dir).unwrap();
        std::fs::write(shards_dir.join("worker-7.txt"), "old\n").unwrap();

        let runner = Arc::new(ShardRecorder {
            seen: Mutex::new(Vec::new()),
            failing: None,
        });
        let base = StageConfig::custom(Stage::Label, vec!["label".to_string()], 0);
        LabelPool::new(runner, 1)
            .run(&base, &frames(2), &shards_dir)
            .await
            .unwrap();

        assert!(!shards_dir.join("worker-7.txt").exists());
        assert!(shards_dir.join("worker-0.txt").exists());
    }
}
