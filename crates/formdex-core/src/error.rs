//! Error taxonomy for the FormDex pipeline.

use std::path::PathBuf;

/// Errors raised while loading or validating `config.json`.
///
/// All of these are fatal: the sequencer refuses to pick a stage until the
/// configuration is fixed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing required config field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("form_label_mode {label_mode} is not available for source_type {source_type}")]
    IllegalLabelMode {
        source_type: String,
        label_mode: String,
    },
}

/// FormDex pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum FormdexError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("stage '{stage}' failed with exit code {exit_code}")]
    StageFailed { stage: String, exit_code: i32 },

    #[error("stage '{stage}' could not be started: {reason}")]
    StageSpawn { stage: String, reason: String },

    #[error("stage '{stage}' timed out after {timeout_secs} seconds")]
    StageTimeout { stage: String, timeout_secs: u64 },

    #[error("stage '{stage}' exited successfully but produced no {artifact}")]
    MissingArtifact { stage: String, artifact: String },

    #[error("stage '{stage}' succeeded but the pipeline did not advance")]
    NoProgress { stage: String },

    #[error("invalid evaluation report {path}: {reason}")]
    InvalidEvalReport { path: PathBuf, reason: String },

    #[error("target not met after {iterations} iteration(s): {metric:.3} < {target:.3}")]
    RetryLimitReached {
        iterations: u32,
        metric: f64,
        target: f64,
    },

    #[error("journal error: {0}")]
    Journal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FormdexError {
    /// Name of the stage this error is attributed to, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            FormdexError::StageFailed { stage, .. }
            | FormdexError::StageSpawn { stage, .. }
            | FormdexError::StageTimeout { stage, .. }
            | FormdexError::MissingArtifact { stage, .. }
            | FormdexError::NoProgress { stage } => Some(stage),
            _ => None,
        }
    }
}

/// Result type for FormDex operations.
pub type Result<T> = std::result::Result<T, FormdexError>;
