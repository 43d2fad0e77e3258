//! Conventional on-disk layout of a project output directory.
//!
//! ```text
//! <root>/form_template.pdf      raw input (form)
//! <root>/raw/                   raw input (video)
//! <root>/frames/                frames + sidecar .txt labels
//! <root>/augmented/
//! <root>/weights/best.pt
//! <root>/eval_report.json
//! <root>/history/iteration-N/
//! <root>/label_shards/
//! <root>/journal/
//! <root>/.markers/
//! ```

use std::path::{Path, PathBuf};

use crate::config::PipelineConfig;

/// Output root used when neither `project` nor `output_dir` is configured.
pub const DEFAULT_OUTPUT_DIR: &str = "output";

pub const FRAME_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];
pub const LABEL_EXTENSION: &str = "txt";
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm"];

const ITERATION_PREFIX: &str = "iteration-";

/// Resolved paths for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    base: PathBuf,
    root: PathBuf,
}

impl ProjectLayout {
    /// Resolve the output root relative to `base` (the directory holding
    /// `config.json`): `runs/<project>`, else `output_dir`, else `output`.
    pub fn resolve(base: impl AsRef<Path>, config: &PipelineConfig) -> Self {
        let base = base.as_ref().to_path_buf();
        let root = match (&config.project, &config.output_dir) {
            (Some(project), _) => base.join("runs").join(project),
            (None, Some(dir)) => base.join(dir),
            (None, None) => base.join(DEFAULT_OUTPUT_DIR),
        };
        Self { base, root }
    }

    /// Layout with an explicit root.
    pub fn with_root(base: impl AsRef<Path>, root: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Directory external stages run in.
    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn form_template(&self) -> PathBuf {
        self.root.join("form_template.pdf")
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.root.join("frames")
    }

    pub fn augmented_dir(&self) -> PathBuf {
        self.root.join("augmented")
    }

    pub fn weights_dir(&self) -> PathBuf {
        self.root.join("weights")
    }

    pub fn best_weights(&self) -> PathBuf {
        self.weights_dir().join("best.pt")
    }

    pub fn eval_report(&self) -> PathBuf {
        self.root.join("eval_report.json")
    }

    pub fn classes_file(&self) -> PathBuf {
        self.root.join("classes.txt")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }

    /// Archive directory for a finished iteration (1-based).
    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        self.history_dir()
            .join(format!("{}{}", ITERATION_PREFIX, iteration))
    }

    /// Record of the retry transition that produced an archive.
    pub fn save_point_file(&self, iteration: u32) -> PathBuf {
        self.iteration_dir(iteration).join("save_point.json")
    }

    pub fn shards_dir(&self) -> PathBuf {
        self.root.join("label_shards")
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.root.join("journal")
    }

    pub fn markers_dir(&self) -> PathBuf {
        self.root.join(".markers")
    }

    /// Parse `iteration-N` directory names.
    pub fn parse_iteration_dir(name: &str) -> Option<u32> {
        name.strip_prefix(ITERATION_PREFIX)?.parse().ok()
    }
}

/// Case-insensitive extension check.
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}
