//! Stage sequencing.
//!
//! The sequencer is stateless: every call recomputes a [`PipelineState`] from
//! a fresh [`ProbeSnapshot`] and maps it to exactly one [`NextAction`]. The
//! only input that changes between otherwise identical calls is the
//! configuration's variation count, and that only moves on a retry.

use serde::Serialize;

use crate::config::{LabelMode, PipelineConfig, SourceType};
use crate::error::Result;
use crate::eval::EvalReport;
use crate::probe::{ArtifactProbe, ProbeSnapshot};
use crate::stage::Stage;

/// Where the pipeline stands, derived from the probes.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    NeedCapture,
    NeedFrames,
    NeedLabels,
    NeedTraining,
    NeedEval,
    Done,
    Retry,
}

impl PipelineState {
    pub fn from_probes(snapshot: &ProbeSnapshot) -> Self {
        if !snapshot.raw_input {
            return PipelineState::NeedCapture;
        }
        if !snapshot.frames {
            return PipelineState::NeedFrames;
        }
        if !snapshot.labels {
            return PipelineState::NeedLabels;
        }
        if !snapshot.weights {
            return PipelineState::NeedTraining;
        }
        match &snapshot.eval_report {
            None => PipelineState::NeedEval,
            Some(report) if report.meets_target => PipelineState::Done,
            Some(_) => PipelineState::Retry,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::NeedCapture => "need_capture",
            PipelineState::NeedFrames => "need_frames",
            PipelineState::NeedLabels => "need_labels",
            PipelineState::NeedTraining => "need_training",
            PipelineState::NeedEval => "need_eval",
            PipelineState::Done => "done",
            PipelineState::Retry => "retry",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What the driver should do next.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NextAction {
    /// Run the stages in order, each to completion before the next.
    Run {
        state: PipelineState,
        stages: Vec<Stage>,
    },

    /// Target missed: raise the variation count, then run `refresh` in
    /// order. `refresh` starts with `capture`.
    Retry {
        iteration: u32,
        from_variations: u32,
        to_variations: u32,
        capture: Stage,
        refresh: Vec<Stage>,
        report: EvalReport,
    },

    /// Target met.
    Done { report: EvalReport },

    /// Target missed and the iteration cap is reached.
    GiveUp { iterations: u32, report: EvalReport },
}

impl NextAction {
    /// Stages the action will launch.
    pub fn stages(&self) -> Vec<Stage> {
        match self {
            NextAction::Run { stages, .. } => stages.clone(),
            NextAction::Retry { refresh, .. } => refresh.clone(),
            NextAction::Done { .. } | NextAction::GiveUp { .. } => Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NextAction::Done { .. } | NextAction::GiveUp { .. })
    }
}

impl std::fmt::Display for NextAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NextAction::Run { state, stages } => {
                let names: Vec<&str> = stages.iter().map(Stage::name).collect();
                write!(f, "{}: run {}", state, names.join(" -> "))
            }
            NextAction::Retry {
                iteration,
                from_variations,
                to_variations,
                refresh,
                report,
                ..
            } => {
                let names: Vec<&str> = refresh.iter().map(Stage::name).collect();
                write!(
                    f,
                    "retry after iteration {} (mAP50 {:.3} < {:.3}): num_variations {} -> {}, run {}",
                    iteration,
                    report.map50,
                    report.target_map,
                    from_variations,
                    to_variations,
                    names.join(" -> ")
                )
            }
            NextAction::Done { report } => write!(
                f,
                "done: mAP50 {:.3} meets target {:.3}",
                report.map50, report.target_map
            ),
            NextAction::GiveUp { iterations, report } => write!(
                f,
                "give up after {} iteration(s): mAP50 {:.3} < {:.3}",
                iterations, report.map50, report.target_map
            ),
        }
    }
}

/// Maps probe results to the next action.
pub struct Sequencer;

impl Sequencer {
    /// Probe and plan in one call.
    pub fn next_action(config: &PipelineConfig, probe: &dyn ArtifactProbe) -> Result<NextAction> {
        let source_type = config.source_type()?;
        config.label_mode()?;
        let snapshot = ProbeSnapshot::capture(probe)?;
        Self::plan(config, source_type, &snapshot)
    }

    /// Pure next-action selection.
    ///
    /// `source_type` is passed separately because the variant is fixed for
    /// the whole run, even if the configuration file is edited mid-run.
    pub fn plan(
        config: &PipelineConfig,
        source_type: SourceType,
        snapshot: &ProbeSnapshot,
    ) -> Result<NextAction> {
        let label_mode = config.label_mode()?;
        let state = PipelineState::from_probes(snapshot);

        let action = match state {
            PipelineState::NeedCapture => NextAction::Run {
                state,
                stages: vec![capture_stage(source_type)],
            },
            PipelineState::NeedFrames => NextAction::Run {
                state,
                stages: vec![frame_stage(source_type)],
            },
            PipelineState::NeedLabels => NextAction::Run {
                state,
                stages: vec![label_stage(source_type, label_mode)],
            },
            PipelineState::NeedTraining => NextAction::Run {
                state,
                stages: vec![Stage::Augment, Stage::Train],
            },
            PipelineState::NeedEval => NextAction::Run {
                state,
                stages: vec![Stage::Evaluate],
            },
            PipelineState::Done | PipelineState::Retry => {
                let report = match snapshot.eval_report.clone() {
                    Some(report) => report,
                    None => {
                        return Ok(NextAction::Run {
                            state: PipelineState::NeedEval,
                            stages: vec![Stage::Evaluate],
                        })
                    }
                };
                let iteration = snapshot.completed_iterations + 1;
                if report.meets_target {
                    NextAction::Done { report }
                } else if config.max_iterations > 0 && iteration >= config.max_iterations {
                    NextAction::GiveUp {
                        iterations: iteration,
                        report,
                    }
                } else {
                    NextAction::Retry {
                        iteration,
                        from_variations: config.num_variations,
                        to_variations: config.next_variation_count()?,
                        capture: capture_stage(source_type),
                        refresh: refresh_stages(source_type, label_mode),
                        report,
                    }
                }
            }
        };
        Ok(action)
    }
}

/// Stage that produces the raw input.
pub fn capture_stage(source_type: SourceType) -> Stage {
    match source_type {
        SourceType::Form => Stage::CollectForm,
        SourceType::Video => Stage::CollectVideo,
    }
}

/// Stage that produces frames from the raw input.
pub fn frame_stage(source_type: SourceType) -> Stage {
    match source_type {
        SourceType::Form => Stage::CollectForm,
        SourceType::Video => Stage::ExtractFrames,
    }
}

/// Stages that regenerate inputs after a retry: capture, frames, labels,
/// each once.
///
/// Existing frames and labels stay on disk, so labeling only covers the
/// frames the new capture added.
pub fn refresh_stages(source_type: SourceType, label_mode: LabelMode) -> Vec<Stage> {
    let mut stages = Vec::with_capacity(3);
    for stage in [
        capture_stage(source_type),
        frame_stage(source_type),
        label_stage(source_type, label_mode),
    ] {
        if !stages.contains(&stage) {
            stages.push(stage);
        }
    }
    stages
}

/// Labeling runner for a (variant, mode) pair.
///
/// Programmatic form labels come out of the capture stage itself, so the
/// capture stage is re-run rather than a separate labeler.
pub fn label_stage(source_type: SourceType, label_mode: LabelMode) -> Stage {
    match (source_type, label_mode) {
        (SourceType::Form, LabelMode::Programmatic) => Stage::CollectForm,
        _ => Stage::Label,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::StaticProbe;

    fn form_config(label_mode: LabelMode) -> PipelineConfig {
        let mut config = PipelineConfig::new(SourceType::Form);
        config.form_url = Some("https://example.com/ud100.pdf".to_string());
        config.form_label_mode = Some(label_mode);
        config
    }

    fn video_config() -> PipelineConfig {
        PipelineConfig::new(SourceType::Video)
    }

    fn plan(config: &PipelineConfig, snapshot: &ProbeSnapshot) -> NextAction {
        Sequencer::plan(config, config.source_type().unwrap(), snapshot).expect("plan")
    }

    fn labeled() -> ProbeSnapshot {
        ProbeSnapshot {
            raw_input: true,
            frames: true,
            labels: true,
            ..ProbeSnapshot::default()
        }
    }

    #[test]
    fn test_state_order() {
        let mut snapshot = ProbeSnapshot::default();
        assert_eq!(PipelineState::from_probes(&snapshot), PipelineState::NeedCapture);
        snapshot.raw_input = true;
        assert_eq!(PipelineState::from_probes(&snapshot), PipelineState::NeedFrames);
        snapshot.frames = true;
        assert_eq!(PipelineState::from_probes(&snapshot), PipelineState::NeedLabels);
        snapshot.labels = true;
        assert_eq!(PipelineState::from_probes(&snapshot), PipelineState::NeedTraining);
        snapshot.weights = true;
        assert_eq!(PipelineState::from_probes(&snapshot), PipelineState::NeedEval);
        snapshot.eval_report = Some(EvalReport::new(0.5, 0.2, 0.5, 0.5, 0.75));
        assert_eq!(PipelineState::from_probes(&snapshot), PipelineState::Retry);
        snapshot.eval_report = Some(EvalReport::new(0.9, 0.6, 0.9, 0.9, 0.75));
        assert_eq!(PipelineState::from_probes(&snapshot), PipelineState::Done);
    }

    #[test]
    fn test_video_pipeline_stages() {
        let config = video_config();
        let mut snapshot = ProbeSnapshot::default();
        assert_eq!(plan(&config, &snapshot).stages(), vec![Stage::CollectVideo]);
        snapshot.raw_input = true;
        assert_eq!(plan(&config, &snapshot).stages(), vec![Stage::ExtractFrames]);
        snapshot.frames = true;
        assert_eq!(plan(&config, &snapshot).stages(), vec![Stage::Label]);
    }

    #[test]
    fn test_form_vision_uses_label_pool() {
        let config = form_config(LabelMode::Vision);
        let snapshot = ProbeSnapshot {
            raw_input: true,
            frames: true,
            ..ProbeSnapshot::default()
        };
        assert_eq!(plan(&config, &snapshot).stages(), vec![Stage::Label]);
    }

    #[test]
    fn test_variant_exclusivity() {
        let form = form_config(LabelMode::Programmatic);
        let form_vision = form_config(LabelMode::Vision);
        let video = video_config();

        // Every combination of the five presence flags.
        for bits in 0u8..32 {
            let mut snapshot = ProbeSnapshot {
                raw_input: bits & 1 != 0,
                frames: bits & 2 != 0,
                labels: bits & 4 != 0,
                weights: bits & 8 != 0,
                ..ProbeSnapshot::default()
            };
            if bits & 16 != 0 {
                snapshot.eval_report = Some(EvalReport::new(0.5, 0.3, 0.5, 0.5, 0.75));
            }

            for config in [&form, &form_vision] {
                let stages = plan(config, &snapshot).stages();
                assert!(!stages.contains(&Stage::CollectVideo));
                assert!(!stages.contains(&Stage::ExtractFrames));
            }
            let stages = plan(&video, &snapshot).stages();
            assert!(!stages.contains(&Stage::CollectForm));
        }
    }

    #[test]
    fn test_plan_is_idempotent() {
        let config = form_config(LabelMode::Programmatic);
        let probe = StaticProbe::new(labeled());
        let first = Sequencer::next_action(&config, &probe).unwrap();
        for _ in 0..5 {
            assert_eq!(Sequencer::next_action(&config, &probe).unwrap(), first);
        }
    }

    #[test]
    fn test_retry_strictly_increases_variations() {
        let mut config = form_config(LabelMode::Programmatic);
        config.max_iterations = 0;
        config.variation_increment = 0;
        let snapshot = ProbeSnapshot {
            weights: true,
            eval_report: Some(EvalReport::new(0.6, 0.3, 0.6, 0.6, 0.75)),
            ..labeled()
        };

        let mut last = config.num_variations;
        for _ in 0..10 {
            match plan(&config, &snapshot) {
                NextAction::Retry {
                    from_variations,
                    to_variations,
                    ..
                } => {
                    assert_eq!(from_variations, last);
                    assert!(to_variations > from_variations);
                    config.num_variations = to_variations;
                    last = to_variations;
                }
                other => panic!("expected retry, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_refresh_stages_per_variant() {
        assert_eq!(
            refresh_stages(SourceType::Form, LabelMode::Programmatic),
            vec![Stage::CollectForm]
        );
        assert_eq!(
            refresh_stages(SourceType::Form, LabelMode::Vision),
            vec![Stage::CollectForm, Stage::Label]
        );
        assert_eq!(
            refresh_stages(SourceType::Video, LabelMode::Vision),
            vec![Stage::CollectVideo, Stage::ExtractFrames, Stage::Label]
        );
    }

    #[test]
    fn test_done_only_with_passing_report() {
        let config = video_config();
        for bits in 0u8..16 {
            let snapshot = ProbeSnapshot {
                raw_input: bits & 1 != 0,
                frames: bits & 2 != 0,
                labels: bits & 4 != 0,
                weights: bits & 8 != 0,
                ..ProbeSnapshot::default()
            };
            assert!(!matches!(plan(&config, &snapshot), NextAction::Done { .. }));
        }
    }

    #[test]
    fn test_give_up_at_iteration_cap() {
        let mut config = video_config();
        config.max_iterations = 3;
        let mut snapshot = ProbeSnapshot {
            weights: true,
            eval_report: Some(EvalReport::new(0.6, 0.3, 0.6, 0.6, 0.75)),
            ..labeled()
        };

        snapshot.completed_iterations = 1;
        assert!(matches!(
            plan(&config, &snapshot),
            NextAction::Retry { iteration: 2, .. }
        ));

        snapshot.completed_iterations = 2;
        assert!(matches!(
            plan(&config, &snapshot),
            NextAction::GiveUp { iterations: 3, .. }
        ));
    }

    #[test]
    fn test_illegal_label_mode_selects_nothing() {
        let mut config = video_config();
        config.form_label_mode = Some(LabelMode::Programmatic);
        let probe = StaticProbe::new(ProbeSnapshot::default());
        assert!(Sequencer::next_action(&config, &probe).is_err());
    }

    #[test]
    fn test_display_names_stages() {
        let action = NextAction::Run {
            state: PipelineState::NeedTraining,
            stages: vec![Stage::Augment, Stage::Train],
        };
        assert_eq!(action.to_string(), "need_training: run augment -> train");
    }
}
