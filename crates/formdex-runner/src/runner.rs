//! Stage execution.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use formdex_core::{FormdexError, Result};
use serde::Serialize;
use tokio::process::Command;

use crate::stage::StageConfig;

/// Result of a stage execution.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    /// Stage name.
    pub stage_name: String,

    /// Exit code (0 = success, -1 = killed by a signal).
    pub exit_code: i32,

    /// Captured stdout, empty when output is inherited.
    pub stdout: String,

    /// Captured stderr, empty when output is inherited.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether execution succeeded.
    pub success: bool,
}

impl StageResult {
    /// Whether this stage passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }
}

/// Launches one stage and waits for it to finish.
///
/// A non-zero exit is a normal `Ok` result; `Err` is reserved for stages that
/// could not be started or ran past their timeout.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn execute(&self, config: &StageConfig) -> Result<StageResult>;
}

/// Runs stages as child processes.
pub struct ProcessRunner {
    working_dir: PathBuf,
    capture_output: bool,
}

impl ProcessRunner {
    /// Runner whose children inherit stdout/stderr.
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            capture_output: false,
        }
    }

    /// Capture child output into the [`StageResult`] instead of inheriting it.
    pub fn capturing(mut self) -> Self {
        self.capture_output = true;
        self
    }
}

#[async_trait]
impl StageRunner for ProcessRunner {
    async fn execute(&self, config: &StageConfig) -> Result<StageResult> {
        let start = Instant::now();

        let Some((exe, args)) = config.command.split_first() else {
            return Err(FormdexError::StageSpawn {
                stage: config.name.clone(),
                reason: "empty command".to_string(),
            });
        };

        let mut command = Command::new(exe);
        command
            .args(args)
            .current_dir(&self.working_dir)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if self.capture_output {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }

        let child = command.spawn().map_err(|e| FormdexError::StageSpawn {
            stage: config.name.clone(),
            reason: format!("{}: {}", exe, e),
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = if config.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(config.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| FormdexError::StageTimeout {
                stage: config.name.clone(),
                timeout_secs: config.timeout_secs,
            })??
        } else {
            child.wait_with_output().await?
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);

        Ok(StageResult {
            stage_name: config.name.clone(),
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms,
            success: output.status.success(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formdex_core::Stage;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_stage_result_passed() {
        let result = StageResult {
            stage_name: "train".to_string(),
            exit_code: 0,
            stdout: "".to_string(),
            stderr: "".to_string(),
            duration_ms: 100,
            success: true,
        };
        assert!(result.passed());
    }

    #[test]
    fn test_stage_result_failed() {
        let result = StageResult {
            stage_name: "train".to_string(),
            exit_code: 1,
            stdout: "".to_string(),
            stderr: "CUDA out of memory".to_string(),
            duration_ms: 100,
            success: false,
        };
        assert!(!result.passed());
    }

    #[tokio::test]
    async fn test_execute_passes_environment_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let config = StageConfig::custom(
            Stage::Augment,
            sh("echo \"$FORMDEX_STAGE $FORMDEX_NUM_VARIATIONS\"; pwd"),
            60,
        )
        .with_env("FORMDEX_NUM_VARIATIONS", 150);

        let runner = ProcessRunner::new(dir.path()).capturing();
        let result = runner.execute(&config).await.expect("execute failed");
        assert!(result.passed());
        assert!(result.stdout.contains("augment 150"));
        let cwd = dir.path().canonicalize().unwrap();
        assert!(result.stdout.contains(cwd.to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let dir = tempfile::tempdir().unwrap();
        let config = StageConfig::custom(Stage::Train, sh("exit 3"), 60);

        let result = ProcessRunner::new(dir.path())
            .capturing()
            .execute(&config)
            .await
            .expect("execute failed");
        assert!(!result.passed());
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = StageConfig::custom(
            Stage::Evaluate,
            vec!["formdex-no-such-binary".to_string()],
            0,
        );

        let err = ProcessRunner::new(dir.path())
            .execute(&config)
            .await
            .unwrap_err();
        assert!(matches!(err, FormdexError::StageSpawn { ref stage, .. } if stage == "evaluate"));
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = StageConfig::custom(Stage::Train, Vec::new(), 0);
        let err = ProcessRunner::new(dir.path())
            .execute(&config)
            .await
            .unwrap_err();
        assert!(matches!(err, FormdexError::StageSpawn { .. }));
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let config = StageConfig::custom(Stage::Train, sh("sleep 5"), 1);

        let err = ProcessRunner::new(dir.path())
            .capturing()
            .execute(&config)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FormdexError::StageTimeout {
                timeout_secs: 1,
                ..
            }
        ));
    }
}
