//! Artifact probes over the project output directory.
//!
//! Presence is the only state signal the sequencer consumes. A directory
//! counts as present when it exists and holds at least one file with the
//! expected extension; an empty directory is the same as a missing one.
//! With completion markers enabled the artifact's marker must exist too.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{PipelineConfig, SourceType};
use crate::error::Result;
use crate::eval::EvalReport;
use crate::layout::{
    has_extension, ProjectLayout, FRAME_EXTENSIONS, LABEL_EXTENSION, VIDEO_EXTENSIONS,
};

/// Artifacts the sequencer observes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Artifact {
    RawInput,
    Frames,
    Labels,
    Augmented,
    Weights,
    EvalReport,
}

impl Artifact {
    pub const ALL: [Artifact; 6] = [
        Artifact::RawInput,
        Artifact::Frames,
        Artifact::Labels,
        Artifact::Augmented,
        Artifact::Weights,
        Artifact::EvalReport,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Artifact::RawInput => "raw_input",
            Artifact::Frames => "frames",
            Artifact::Labels => "labels",
            Artifact::Augmented => "augmented",
            Artifact::Weights => "weights",
            Artifact::EvalReport => "eval_report",
        }
    }
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Injectable presence checks.
pub trait ArtifactProbe: Send + Sync {
    /// Whether the artifact is present.
    fn is_present(&self, artifact: Artifact) -> Result<bool>;

    /// The evaluation report, if present. Fails on an unreadable report.
    fn eval_report(&self) -> Result<Option<EvalReport>>;

    /// Number of iterations archived by earlier retries.
    fn completed_iterations(&self) -> Result<u32>;
}

/// One consistent reading of every probe.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ProbeSnapshot {
    pub raw_input: bool,
    pub frames: bool,
    pub labels: bool,
    pub augmented: bool,
    pub weights: bool,
    pub eval_report: Option<EvalReport>,
    pub completed_iterations: u32,
}

impl ProbeSnapshot {
    pub fn capture(probe: &dyn ArtifactProbe) -> Result<Self> {
        Ok(Self {
            raw_input: probe.is_present(Artifact::RawInput)?,
            frames: probe.is_present(Artifact::Frames)?,
            labels: probe.is_present(Artifact::Labels)?,
            augmented: probe.is_present(Artifact::Augmented)?,
            weights: probe.is_present(Artifact::Weights)?,
            eval_report: probe.eval_report()?,
            completed_iterations: probe.completed_iterations()?,
        })
    }

    pub fn is_present(&self, artifact: Artifact) -> bool {
        match artifact {
            Artifact::RawInput => self.raw_input,
            Artifact::Frames => self.frames,
            Artifact::Labels => self.labels,
            Artifact::Augmented => self.augmented,
            Artifact::Weights => self.weights,
            Artifact::EvalReport => self.eval_report.is_some(),
        }
    }
}

/// Filesystem-backed probe for one project layout.
#[derive(Debug, Clone)]
pub struct FsArtifactProbe {
    layout: ProjectLayout,
    source_type: SourceType,
    require_markers: bool,
}

impl FsArtifactProbe {
    pub fn new(layout: ProjectLayout, config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            layout,
            source_type: config.source_type()?,
            require_markers: config.completion_markers,
        })
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    /// Frame images, sorted by path.
    pub fn list_frames(&self) -> Result<Vec<PathBuf>> {
        list_files(&self.layout.frames_dir(), |p| has_extension(p, FRAME_EXTENSIONS))
    }

    /// Frames that have no sidecar label yet.
    pub fn unlabeled_frames(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .list_frames()?
            .into_iter()
            .filter(|frame| !frame.with_extension(LABEL_EXTENSION).is_file())
            .collect())
    }

    fn raw_present(&self) -> Result<bool> {
        match self.source_type {
            SourceType::Form => {
                let template = self.layout.form_template();
                Ok(template.is_file() && fs::metadata(&template)?.len() > 0)
            }
            SourceType::Video => {
                dir_has_file(&self.layout.raw_dir(), |p| has_extension(p, VIDEO_EXTENSIONS))
            }
        }
    }

    fn present_on_disk(&self, artifact: Artifact) -> Result<bool> {
        match artifact {
            Artifact::RawInput => self.raw_present(),
            Artifact::Frames => {
                dir_has_file(&self.layout.frames_dir(), |p| has_extension(p, FRAME_EXTENSIONS))
            }
            Artifact::Labels => dir_has_file(&self.layout.frames_dir(), |p| {
                has_extension(p, &[LABEL_EXTENSION])
            }),
            Artifact::Augmented => dir_has_file(&self.layout.augmented_dir(), |p| {
                has_extension(p, FRAME_EXTENSIONS)
            }),
            Artifact::Weights => {
                let weights = self.layout.best_weights();
                Ok(weights.is_file() && fs::metadata(&weights)?.len() > 0)
            }
            Artifact::EvalReport => Ok(self.layout.eval_report().is_file()),
        }
    }
}

impl ArtifactProbe for FsArtifactProbe {
    fn is_present(&self, artifact: Artifact) -> Result<bool> {
        if !self.present_on_disk(artifact)? {
            return Ok(false);
        }
        if self.require_markers {
            return Ok(marker_path(&self.layout, artifact).is_file());
        }
        Ok(true)
    }

    fn eval_report(&self) -> Result<Option<EvalReport>> {
        if !self.is_present(Artifact::EvalReport)? {
            return Ok(None);
        }
        EvalReport::load(&self.layout.eval_report()).map(Some)
    }

    fn completed_iterations(&self) -> Result<u32> {
        let entries = match fs::read_dir(self.layout.history_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut completed = 0;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(n) = entry
                .file_name()
                .to_str()
                .and_then(ProjectLayout::parse_iteration_dir)
            {
                completed = completed.max(n);
            }
        }
        Ok(completed)
    }
}

/// Path of an artifact's completion marker.
pub fn marker_path(layout: &ProjectLayout, artifact: Artifact) -> PathBuf {
    layout
        .markers_dir()
        .join(format!("{}.complete", artifact.name()))
}

/// Record that the producing stage finished cleanly.
pub fn mark_complete(layout: &ProjectLayout, artifact: Artifact) -> Result<()> {
    fs::create_dir_all(layout.markers_dir())?;
    fs::write(marker_path(layout, artifact), b"")?;
    Ok(())
}

/// Remove a marker. No-op if absent.
pub fn clear_marker(layout: &ProjectLayout, artifact: Artifact) -> Result<()> {
    match fs::remove_file(marker_path(layout, artifact)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn dir_has_file(dir: &Path, matches: impl Fn(&Path) -> bool) -> Result<bool> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && matches(&path) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn list_files(dir: &Path, matches: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && matches(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(source_type: SourceType) -> (tempfile::TempDir, FsArtifactProbe) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::new(source_type);
        config.form_url = Some("https://example.com/form.pdf".to_string());
        let layout = ProjectLayout::with_root(dir.path(), dir.path().join("out"));
        let probe = FsArtifactProbe::new(layout, &config).unwrap();
        (dir, probe)
    }

    fn touch(path: PathBuf, body: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn test_missing_layout_reports_nothing() {
        let (_dir, probe) = setup(SourceType::Form);
        let snapshot = ProbeSnapshot::capture(&probe).unwrap();
        assert_eq!(snapshot, ProbeSnapshot::default());
    }

    #[test]
    fn test_empty_dir_equals_missing() {
        let (_dir, probe) = setup(SourceType::Video);
        fs::create_dir_all(probe.layout().frames_dir()).unwrap();
        fs::create_dir_all(probe.layout().raw_dir()).unwrap();
        assert!(!probe.is_present(Artifact::Frames).unwrap());
        assert!(!probe.is_present(Artifact::RawInput).unwrap());
    }

    #[test]
    fn test_wrong_extension_not_counted() {
        let (_dir, probe) = setup(SourceType::Video);
        touch(probe.layout().frames_dir().join("notes.md"), b"x");
        touch(probe.layout().raw_dir().join("clip.txt"), b"x");
        assert!(!probe.is_present(Artifact::Frames).unwrap());
        assert!(!probe.is_present(Artifact::Labels).unwrap());
        assert!(!probe.is_present(Artifact::RawInput).unwrap());

        touch(probe.layout().raw_dir().join("clip.MP4"), b"x");
        assert!(probe.is_present(Artifact::RawInput).unwrap());
    }

    #[test]
    fn test_frames_and_labels() {
        let (_dir, probe) = setup(SourceType::Form);
        let frames = probe.layout().frames_dir();
        for i in 0..3 {
            touch(frames.join(format!("var{:03}_p0.jpg", i)), b"img");
        }
        touch(frames.join("var000_p0.txt"), b"0 0.5 0.5 0.1 0.1");

        assert!(probe.is_present(Artifact::Frames).unwrap());
        assert!(probe.is_present(Artifact::Labels).unwrap());
        assert_eq!(probe.list_frames().unwrap().len(), 3);
        assert_eq!(probe.unlabeled_frames().unwrap().len(), 2);
    }

    #[test]
    fn test_empty_template_is_absent() {
        let (_dir, probe) = setup(SourceType::Form);
        touch(probe.layout().form_template(), b"");
        assert!(!probe.is_present(Artifact::RawInput).unwrap());
        touch(probe.layout().form_template(), b"%PDF-1.7");
        assert!(probe.is_present(Artifact::RawInput).unwrap());
    }

    #[test]
    fn test_weights_require_best_checkpoint() {
        let (_dir, probe) = setup(SourceType::Form);
        touch(probe.layout().weights_dir().join("last.pt"), b"w");
        assert!(!probe.is_present(Artifact::Weights).unwrap());
        touch(probe.layout().best_weights(), b"w");
        assert!(probe.is_present(Artifact::Weights).unwrap());
    }

    #[test]
    fn test_completed_iterations_from_history() {
        let (_dir, probe) = setup(SourceType::Form);
        assert_eq!(probe.completed_iterations().unwrap(), 0);
        fs::create_dir_all(probe.layout().iteration_dir(1)).unwrap();
        fs::create_dir_all(probe.layout().iteration_dir(2)).unwrap();
        fs::create_dir_all(probe.layout().history_dir().join("scratch")).unwrap();
        assert_eq!(probe.completed_iterations().unwrap(), 2);
    }

    #[test]
    fn test_markers_gate_presence() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::new(SourceType::Video);
        config.completion_markers = true;
        let layout = ProjectLayout::with_root(dir.path(), dir.path().join("out"));
        let probe = FsArtifactProbe::new(layout.clone(), &config).unwrap();

        touch(layout.frames_dir().join("f1.jpg"), b"img");
        assert!(!probe.is_present(Artifact::Frames).unwrap());

        mark_complete(&layout, Artifact::Frames).unwrap();
        assert!(probe.is_present(Artifact::Frames).unwrap());

        clear_marker(&layout, Artifact::Frames).unwrap();
        clear_marker(&layout, Artifact::Frames).unwrap();
        assert!(!probe.is_present(Artifact::Frames).unwrap());
    }

    #[test]
    fn test_corrupt_eval_report_surfaces() {
        let (_dir, probe) = setup(SourceType::Form);
        touch(probe.layout().eval_report(), b"not json");
        assert!(probe.is_present(Artifact::EvalReport).unwrap());
        assert!(probe.eval_report().is_err());
    }
}
