//! Stage commands and their launch configuration.

use std::path::PathBuf;

use formdex_core::{PipelineConfig, Stage};
use serde::{Deserialize, Serialize};

/// Directory, relative to the project base, holding the stage scripts.
pub const SKILLS_DIR: &str = ".agents/skills";

pub const ENV_CONFIG: &str = "FORMDEX_CONFIG";
pub const ENV_OUTPUT_DIR: &str = "FORMDEX_OUTPUT_DIR";
pub const ENV_STAGE: &str = "FORMDEX_STAGE";
pub const ENV_NUM_VARIATIONS: &str = "FORMDEX_NUM_VARIATIONS";
pub const ENV_ITERATION: &str = "FORMDEX_ITERATION";
pub const ENV_VISION_AGENT: &str = "FORMDEX_VISION_AGENT";
pub const ENV_LABEL_MODE: &str = "FORMDEX_LABEL_MODE";

/// Built-in command for a stage: `uv run .agents/skills/<skill>/scripts/<script>.py`.
pub fn default_command(stage: Stage) -> Vec<String> {
    let (skill, script) = match stage {
        Stage::CollectForm => ("collect", "collect_form"),
        Stage::CollectVideo => ("collect", "collect_video"),
        Stage::ExtractFrames => ("collect", "extract_frames"),
        Stage::Label => ("label", "run"),
        Stage::Augment => ("augment", "run"),
        Stage::Train => ("train", "run"),
        Stage::Evaluate => ("eval", "run"),
    };
    vec![
        "uv".to_string(),
        "run".to_string(),
        format!("{}/{}/scripts/{}.py", SKILLS_DIR, skill, script),
    ]
}

/// Run-scoped values handed to every stage through its environment.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Absolute path of `config.json`.
    pub config_path: PathBuf,

    /// Output root of the project.
    pub output_dir: PathBuf,

    /// 1-based iteration the stage belongs to.
    pub iteration: u32,
}

/// Launch configuration for one stage process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub stage: Stage,

    /// Name used in logs, journal entries and errors. Pool workers get
    /// `label#<i>`.
    pub name: String,

    /// Command to execute (first element is executable).
    pub command: Vec<String>,

    /// Timeout in seconds, 0 = wait forever.
    pub timeout_secs: u64,

    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl StageConfig {
    /// Build the configuration for `stage`, honouring a command override
    /// from `config.stages`.
    pub fn for_stage(stage: Stage, config: &PipelineConfig, context: &StageContext) -> Self {
        let command = config
            .stage_command(stage.name())
            .map(<[String]>::to_vec)
            .unwrap_or_else(|| default_command(stage));

        let mut stage_config = Self::custom(stage, command, config.stage_timeout_secs)
            .with_env(ENV_CONFIG, context.config_path.display())
            .with_env(ENV_OUTPUT_DIR, context.output_dir.display())
            .with_env(ENV_NUM_VARIATIONS, config.num_variations)
            .with_env(ENV_ITERATION, context.iteration)
            .with_env(ENV_VISION_AGENT, &config.vision_agent);
        if let Ok(mode) = config.label_mode() {
            stage_config = stage_config.with_env(ENV_LABEL_MODE, mode);
        }
        stage_config
    }

    /// A stage with an explicit command and no extra environment beyond
    /// `FORMDEX_STAGE`.
    pub fn custom(stage: Stage, command: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            stage,
            name: stage.name().to_string(),
            command,
            timeout_secs,
            env: vec![(ENV_STAGE.to_string(), stage.name().to_string())],
        }
    }

    /// Add or replace an environment variable.
    pub fn with_env(mut self, key: &str, value: impl std::fmt::Display) -> Self {
        let value = value.to_string();
        match self.env.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.env.push((key.to_string(), value)),
        }
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}
