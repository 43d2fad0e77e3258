//! Pipeline configuration (`config.json`).
//!
//! The configuration document is shared with the external stage scripts, so
//! keys this crate does not understand are kept in [`PipelineConfig::extra`]
//! and written back untouched on save.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::{ConfigError, FormdexError, Result};

/// Default file name of the configuration document.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Which pipeline variant a project runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Media-capture pipeline: raw video in, frames extracted.
    #[serde(alias = "capture")]
    Video,

    /// Document pipeline: a PDF form is filled and rendered.
    #[serde(alias = "document", alias = "pdf")]
    Form,
}

impl SourceType {
    pub fn name(&self) -> &'static str {
        match self {
            SourceType::Video => "video",
            SourceType::Form => "form",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How frames get their labels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LabelMode {
    /// Labels are derived from form field geometry by the capture stage.
    Programmatic,

    /// Labels are produced by vision-model workers.
    #[serde(alias = "vision-variants", alias = "vision_variants")]
    Vision,
}

impl LabelMode {
    pub fn name(&self) -> &'static str {
        match self {
            LabelMode::Programmatic => "programmatic",
            LabelMode::Vision => "vision",
        }
    }

    /// Whether this mode is legal for the given pipeline variant.
    pub fn allowed_for(&self, source_type: SourceType) -> bool {
        !matches!(
            (source_type, self),
            (SourceType::Video, LabelMode::Programmatic)
        )
    }
}

impl std::fmt::Display for LabelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn default_target_map() -> f64 {
    0.75
}

fn default_num_variations() -> u32 {
    100
}

fn default_variation_increment() -> u32 {
    50
}

fn default_num_agents() -> u32 {
    1
}

fn default_vision_agent() -> String {
    "codex".to_string()
}

fn default_max_iterations() -> u32 {
    5
}

/// Typed view over `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Project identifier; output goes to `runs/<project>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    /// Output root used when `project` is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<SourceType>,

    /// Explicit labeling strategy. Defaults depend on the source type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_label_mode: Option<LabelMode>,

    /// Primary metric (mAP@0.5) threshold.
    #[serde(default = "default_target_map")]
    pub target_map: f64,

    /// Synthetic inputs generated by the capture stage.
    #[serde(default = "default_num_variations")]
    pub num_variations: u32,

    /// Added to `num_variations` on every retry.
    #[serde(default = "default_variation_increment")]
    pub variation_increment: u32,

    /// Labeling worker count.
    #[serde(default = "default_num_agents")]
    pub num_agents: u32,

    /// Vision client named by the `label_mode` key the stage scripts read.
    #[serde(rename = "label_mode", default = "default_vision_agent")]
    pub vision_agent: String,

    /// Iteration cap; 0 means unbounded.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Per-stage timeout; 0 means none.
    #[serde(default)]
    pub stage_timeout_secs: u64,

    /// Require completion markers for artifact presence.
    #[serde(default)]
    pub completion_markers: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_source: Option<String>,

    #[serde(default)]
    pub classes: Vec<String>,

    /// Command overrides keyed by stage name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stages: BTreeMap<String, Vec<String>>,

    /// Keys owned by the external scripts (imgsz, epochs, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            project: None,
            output_dir: None,
            source_type: None,
            form_label_mode: None,
            target_map: default_target_map(),
            num_variations: default_num_variations(),
            variation_increment: default_variation_increment(),
            num_agents: default_num_agents(),
            vision_agent: default_vision_agent(),
            max_iterations: default_max_iterations(),
            stage_timeout_secs: 0,
            completion_markers: false,
            form_url: None,
            video_source: None,
            classes: Vec::new(),
            stages: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

impl PipelineConfig {
    /// Create a configuration for the given variant with all defaults.
    pub fn new(source_type: SourceType) -> Self {
        Self {
            source_type: Some(source_type),
            ..Self::default()
        }
    }

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(path.to_path_buf()).into());
            }
            Err(e) => return Err(e.into()),
        };
        let config = Self::parse(path, &content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating. `path` is only used for error messages.
    pub fn parse(path: &Path, content: &str) -> std::result::Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check presence, ranges and the source/label combination.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let source_type = self.source_type()?;
        self.label_mode()?;

        if !(self.target_map > 0.0 && self.target_map <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "target_map",
                reason: format!("{} is outside (0, 1]", self.target_map),
            });
        }
        if self.num_variations == 0 {
            return Err(ConfigError::InvalidValue {
                field: "num_variations",
                reason: "must be a positive integer".to_string(),
            });
        }
        if self.num_agents == 0 {
            return Err(ConfigError::InvalidValue {
                field: "num_agents",
                reason: "must be a positive integer".to_string(),
            });
        }
        if let Some(project) = &self.project {
            if project.trim().is_empty() || project.contains(['/', '\\']) || project == ".." {
                return Err(ConfigError::InvalidValue {
                    field: "project",
                    reason: format!("'{}' is not a usable directory name", project),
                });
            }
        }
        if source_type == SourceType::Form
            && self.form_url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            return Err(ConfigError::MissingField("form_url"));
        }
        for (name, command) in &self.stages {
            if command.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "stages",
                    reason: format!("command for stage '{}' is empty", name),
                });
            }
        }
        Ok(())
    }

    pub fn source_type(&self) -> std::result::Result<SourceType, ConfigError> {
        self.source_type.ok_or(ConfigError::MissingField("source_type"))
    }

    /// Effective label mode: explicit value, or the variant's default.
    pub fn label_mode(&self) -> std::result::Result<LabelMode, ConfigError> {
        let source_type = self.source_type()?;
        let mode = self.form_label_mode.unwrap_or(match source_type {
            SourceType::Form => LabelMode::Programmatic,
            SourceType::Video => LabelMode::Vision,
        });
        if !mode.allowed_for(source_type) {
            return Err(ConfigError::IllegalLabelMode {
                source_type: source_type.to_string(),
                label_mode: mode.to_string(),
            });
        }
        Ok(mode)
    }

    /// Variation count to use after a retry. Always strictly larger.
    pub fn next_variation_count(&self) -> std::result::Result<u32, ConfigError> {
        self.num_variations
            .checked_add(self.variation_increment.max(1))
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "num_variations",
                reason: "cannot be increased any further".to_string(),
            })
    }

    /// Command override for a stage, if configured.
    pub fn stage_command(&self, stage_name: &str) -> Option<&[String]> {
        self.stages.get(stage_name).map(Vec::as_slice)
    }

    /// SHA-256 of the serialized configuration.
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Write the configuration atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::env::current_dir()?,
        };
        fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(path)
            .map_err(|e| FormdexError::Io(e.error))?;
        Ok(())
    }
}
