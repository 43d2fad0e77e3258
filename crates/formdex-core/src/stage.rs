//! Pipeline stages known to the sequencer.

use serde::{Deserialize, Serialize};

use crate::config::LabelMode;
use crate::probe::Artifact;

/// One externally implemented pipeline step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Download the form, fill variations, render frames (and labels in
    /// programmatic mode).
    CollectForm,

    /// Fetch or record raw video.
    CollectVideo,

    /// Sample frames out of the raw video.
    ExtractFrames,

    /// Vision-model labeling, fanned out over workers.
    Label,

    Augment,

    Train,

    Evaluate,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::CollectForm,
        Stage::CollectVideo,
        Stage::ExtractFrames,
        Stage::Label,
        Stage::Augment,
        Stage::Train,
        Stage::Evaluate,
    ];

    /// Stable stage name, also the key for command overrides.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::CollectForm => "collect_form",
            Stage::CollectVideo => "collect_video",
            Stage::ExtractFrames => "extract_frames",
            Stage::Label => "label",
            Stage::Augment => "augment",
            Stage::Train => "train",
            Stage::Evaluate => "evaluate",
        }
    }

    pub fn from_name(name: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| s.name() == name)
    }

    /// Artifacts this stage is responsible for writing.
    pub fn produces(&self, label_mode: LabelMode) -> Vec<Artifact> {
        match self {
            Stage::CollectForm => match label_mode {
                LabelMode::Programmatic => {
                    vec![Artifact::RawInput, Artifact::Frames, Artifact::Labels]
                }
                LabelMode::Vision => vec![Artifact::RawInput, Artifact::Frames],
            },
            Stage::CollectVideo => vec![Artifact::RawInput],
            Stage::ExtractFrames => vec![Artifact::Frames],
            Stage::Label => vec![Artifact::Labels],
            Stage::Augment => vec![Artifact::Augmented],
            Stage::Train => vec![Artifact::Weights],
            Stage::Evaluate => vec![Artifact::EvalReport],
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
