//! Pipeline driver: probe, plan, act, repeat.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use formdex_core::obs::{self, RunSpan};
use formdex_core::{
    clear_marker, mark_complete, Artifact, ArtifactProbe, EvalReport, EventKind, FormdexError,
    FsArtifactProbe, FsRunJournal, LabelMode, NextAction, PipelineConfig, PipelineState,
    ProbeSnapshot, ProjectLayout, Result, RunJournal, RunMetadata, RunRecorder, Sequencer,
    SourceType, Stage,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::pool::LabelPool;
use crate::runner::{StageResult, StageRunner};
use crate::stage::{StageConfig, StageContext};

/// Knobs for a single `run` call.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stop after one probe → plan → act cycle.
    pub once: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// The evaluation report meets the target.
    Done,
    /// `once` was set and the single step completed.
    Stepped,
}

/// Result of a driver run that did not fail.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub run_id: String,
    pub status: PipelineStatus,

    /// Stages that ran, in order.
    pub stages: Vec<StageResult>,

    /// Retry transitions taken during this run.
    pub retries: u32,

    /// Final report when `status` is `Done`.
    pub report: Option<EvalReport>,

    pub duration_ms: u64,
}

impl PipelineOutcome {
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

/// Written into the archive before anything is moved, so an interrupted
/// save point can be finished without raising the variation count twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct SavePoint {
    iteration: u32,
    from_variations: u32,
    to_variations: u32,
}

/// What the previous step did, for no-progress detection.
struct LastStep {
    state: PipelineState,
    completed_iterations: u32,
    stage: Stage,
}

/// Drives the external stages until the target metric is met.
pub struct Pipeline {
    config_path: PathBuf,
    config: PipelineConfig,
    source_type: SourceType,
    label_mode: LabelMode,
    layout: ProjectLayout,
    probe: FsArtifactProbe,
    runner: Arc<dyn StageRunner>,
    journal: Arc<dyn RunJournal>,
}

impl Pipeline {
    /// Build a driver for an already loaded configuration.
    ///
    /// The project base is the directory holding `config_path`.
    pub fn new(
        config_path: impl AsRef<Path>,
        config: PipelineConfig,
        runner: Arc<dyn StageRunner>,
        journal: Arc<dyn RunJournal>,
    ) -> Result<Self> {
        config.validate()?;
        let config_path = absolute(config_path.as_ref())?;
        let layout = ProjectLayout::resolve(base_dir(&config_path), &config);
        let probe = FsArtifactProbe::new(layout.clone(), &config)?;
        Ok(Self {
            source_type: config.source_type()?,
            label_mode: config.label_mode()?,
            config_path,
            config,
            layout,
            probe,
            runner,
            journal,
        })
    }

    /// Load `config_path` and journal to `<root>/journal/`.
    pub fn open(config_path: impl AsRef<Path>, runner: Arc<dyn StageRunner>) -> Result<Self> {
        let config_path = absolute(config_path.as_ref())?;
        let config = PipelineConfig::load(&config_path)?;
        let layout = ProjectLayout::resolve(base_dir(&config_path), &config);
        let journal: Arc<dyn RunJournal> = Arc::new(FsRunJournal::new(layout.journal_dir()));
        Self::new(config_path, config, runner, journal)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Override the iteration cap for this driver only; never persisted.
    pub fn set_max_iterations(&mut self, max_iterations: u32) {
        self.config.max_iterations = max_iterations;
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    /// Current probes, without side effects.
    pub fn snapshot(&self) -> Result<ProbeSnapshot> {
        ProbeSnapshot::capture(&self.probe)
    }

    /// What `run` would do next, without doing it.
    pub fn next_action(&self) -> Result<NextAction> {
        Sequencer::plan(&self.config, self.source_type, &self.snapshot()?)
    }

    /// Run until Done, failure, no progress or the iteration cap.
    ///
    /// The journal run is always finalised, successful or not.
    pub async fn run(&mut self, options: &RunOptions) -> Result<PipelineOutcome> {
        let start = Instant::now();
        let metadata = RunMetadata {
            project: self.config.project.clone(),
            source_type: self.source_type,
            config_digest: self.config.digest()?,
            num_variations: self.config.num_variations,
        };
        let mut recorder = RunRecorder::start(self.journal.clone(), metadata).await?;
        let run_id = recorder.run_id().to_string();
        let _span = RunSpan::enter(&run_id);

        let mut outcome = PipelineOutcome {
            run_id,
            status: PipelineStatus::Stepped,
            stages: Vec::new(),
            retries: 0,
            report: None,
            duration_ms: 0,
        };
        let result = self.drive(&mut recorder, options, &mut outcome).await;
        outcome.duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                let label = match outcome.status {
                    PipelineStatus::Done => "done",
                    PipelineStatus::Stepped => "stepped",
                };
                recorder
                    .finish(outcome.duration_ms, true, label.to_string())
                    .await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(finish_err) = recorder
                    .finish(outcome.duration_ms, false, e.to_string())
                    .await
                {
                    warn!(error = %finish_err, "Failed to finalise run journal");
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &mut self,
        recorder: &mut RunRecorder,
        options: &RunOptions,
        outcome: &mut PipelineOutcome,
    ) -> Result<()> {
        let mut last: Option<LastStep> = None;
        self.resume_save_point()?;

        loop {
            let snapshot = self.snapshot()?;
            let state = PipelineState::from_probes(&snapshot);

            if let Some(prev) = last.take() {
                if prev.state == state && prev.completed_iterations == snapshot.completed_iterations
                {
                    return Err(FormdexError::NoProgress {
                        stage: prev.stage.name().to_string(),
                    });
                }
            }

            let report_consistent = snapshot.eval_report.as_ref().map(EvalReport::is_consistent);
            if let (Some(report), Some(false)) = (&snapshot.eval_report, report_consistent) {
                obs::emit_report_inconsistent(report.map50, report.target_map, report.meets_target);
            }

            let action = Sequencer::plan(&self.config, self.source_type, &snapshot)?;
            let iteration = snapshot.completed_iterations + 1;
            obs::emit_action_planned(iteration, state.name(), self.config.num_variations);
            recorder
                .record(
                    EventKind::ActionPlanned,
                    json!({
                        "iteration": iteration,
                        "state": state,
                        "action": &action,
                        "report_consistent": report_consistent,
                    }),
                )
                .await?;

            let last_stage = match action {
                NextAction::Done { report } => {
                    obs::emit_done(report.map50, report.target_map);
                    outcome.status = PipelineStatus::Done;
                    outcome.report = Some(report);
                    return Ok(());
                }
                NextAction::GiveUp { iterations, report } => {
                    return Err(FormdexError::RetryLimitReached {
                        iterations,
                        metric: report.map50,
                        target: report.target_map,
                    });
                }
                NextAction::Retry {
                    iteration,
                    from_variations,
                    to_variations,
                    refresh,
                    report,
                    ..
                } => {
                    self.save_point(SavePoint {
                        iteration,
                        from_variations,
                        to_variations,
                    })?;
                    obs::emit_retry(
                        iteration,
                        report.map50,
                        report.target_map,
                        from_variations,
                        to_variations,
                    );
                    recorder
                        .record(
                            EventKind::Retry,
                            json!({
                                "iteration": iteration,
                                "map50": report.map50,
                                "target_map": report.target_map,
                                "from_variations": from_variations,
                                "to_variations": to_variations,
                                "archived_to": self.layout.iteration_dir(iteration),
                            }),
                        )
                        .await?;
                    outcome.retries += 1;

                    let mut ran = None;
                    for stage in refresh {
                        self.run_stage(stage, iteration + 1, recorder, outcome)
                            .await?;
                        ran = Some(stage);
                    }
                    match ran {
                        Some(stage) => stage,
                        None => return Ok(()),
                    }
                }
                NextAction::Run { stages, .. } => {
                    let mut ran = None;
                    for stage in stages {
                        if stage == Stage::Train && !self.probe.is_present(Artifact::Augmented)? {
                            return Err(FormdexError::MissingArtifact {
                                stage: Stage::Augment.name().to_string(),
                                artifact: Artifact::Augmented.name().to_string(),
                            });
                        }
                        self.run_stage(stage, iteration, recorder, outcome).await?;
                        ran = Some(stage);
                    }
                    match ran {
                        Some(stage) => stage,
                        None => return Ok(()),
                    }
                }
            };

            last = Some(LastStep {
                state,
                completed_iterations: snapshot.completed_iterations,
                stage: last_stage,
            });

            if options.once {
                return Ok(());
            }
        }
    }

    /// Launch one stage, bracketed by journal entries and completion markers.
    async fn run_stage(
        &self,
        stage: Stage,
        iteration: u32,
        recorder: &mut RunRecorder,
        outcome: &mut PipelineOutcome,
    ) -> Result<()> {
        let produced = stage.produces(self.label_mode);
        if self.config.completion_markers {
            for artifact in &produced {
                clear_marker(&self.layout, *artifact)?;
            }
        }

        let context = StageContext {
            config_path: self.config_path.clone(),
            output_dir: self.layout.root().to_path_buf(),
            iteration,
        };
        let stage_config = StageConfig::for_stage(stage, &self.config, &context);

        obs::emit_stage_started(&stage_config.name, &stage_config.command);
        recorder
            .record(
                EventKind::StageStarted,
                json!({
                    "stage": &stage_config.name,
                    "command": &stage_config.command,
                    "iteration": iteration,
                    "num_variations": self.config.num_variations,
                }),
            )
            .await?;

        let executed = if stage == Stage::Label {
            self.run_label_pool(&stage_config).await
        } else {
            self.runner
                .execute(&stage_config)
                .await
                .map(|result| (result, None))
        };

        let (result, failed_worker) = match executed {
            Ok(executed) => executed,
            Err(e) => {
                obs::emit_stage_failed(&stage_config.name, &e);
                recorder
                    .record(
                        EventKind::StageFailed,
                        json!({
                            "stage": &stage_config.name,
                            "exit_code": -1,
                            "error": e.to_string(),
                        }),
                    )
                    .await?;
                return Err(e);
            }
        };

        if !result.passed() {
            let err = FormdexError::StageFailed {
                stage: failed_worker.unwrap_or_else(|| stage_config.name.clone()),
                exit_code: result.exit_code,
            };
            obs::emit_stage_failed(&stage_config.name, &err);
            recorder
                .record(
                    EventKind::StageFailed,
                    json!({
                        "stage": &stage_config.name,
                        "exit_code": result.exit_code,
                        "stderr": &result.stderr,
                        "duration_ms": result.duration_ms,
                        "error": err.to_string(),
                    }),
                )
                .await?;
            return Err(err);
        }

        obs::emit_stage_finished(&stage_config.name, result.exit_code, result.duration_ms);
        recorder
            .record(
                EventKind::StageFinished,
                json!({
                    "stage": &stage_config.name,
                    "exit_code": result.exit_code,
                    "duration_ms": result.duration_ms,
                }),
            )
            .await?;

        if self.config.completion_markers {
            for artifact in &produced {
                mark_complete(&self.layout, *artifact)?;
            }
        }
        outcome.stages.push(result);
        Ok(())
    }

    /// Returns the merged result and, on failure, the first failing worker.
    async fn run_label_pool(
        &self,
        stage_config: &StageConfig,
    ) -> Result<(StageResult, Option<String>)> {
        let frames = self.probe.unlabeled_frames()?;
        let pool = LabelPool::new(self.runner.clone(), self.config.num_agents);
        let pool_outcome = pool
            .run(stage_config, &frames, &self.layout.shards_dir())
            .await?;
        let failed_worker = pool_outcome.first_failure().map(|w| w.stage_name.clone());
        Ok((
            pool_outcome.into_stage_result(&stage_config.name),
            failed_worker,
        ))
    }

    /// Retry save point: record the transition, move the iteration's
    /// evaluation outputs into `history/iteration-<n>/`, then persist the
    /// raised variation count.
    ///
    /// Frames and labels stay in place so labeling can accumulate.
    fn save_point(&mut self, save_point: SavePoint) -> Result<()> {
        let archive = self.layout.iteration_dir(save_point.iteration);
        fs::create_dir_all(&archive)?;
        let record = self.layout.save_point_file(save_point.iteration);
        let staging = archive.join("save_point.json.tmp");
        fs::write(&staging, serde_json::to_vec_pretty(&save_point)?)?;
        fs::rename(&staging, &record)?;

        self.finish_save_point(&save_point)?;

        info!(
            iteration = save_point.iteration,
            num_variations = save_point.to_variations,
            archive = %archive.display(),
            "Iteration archived"
        );
        Ok(())
    }

    /// Archive moves and config write. Safe to repeat.
    fn finish_save_point(&mut self, save_point: &SavePoint) -> Result<()> {
        let archive = self.layout.iteration_dir(save_point.iteration);
        // The report goes last: its presence in the archive marks the moves done.
        let moves = [
            (self.layout.weights_dir(), archive.join("weights")),
            (self.layout.augmented_dir(), archive.join("augmented")),
            (self.layout.eval_report(), archive.join("eval_report.json")),
        ];
        for (from, to) in moves {
            if to.exists() {
                continue;
            }
            match fs::rename(&from, &to) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        for artifact in [Artifact::EvalReport, Artifact::Weights, Artifact::Augmented] {
            clear_marker(&self.layout, artifact)?;
        }

        // Re-read so keys written by the stage scripts since start survive.
        let mut on_disk = PipelineConfig::load(&self.config_path)?;
        if on_disk.num_variations == save_point.from_variations {
            on_disk.num_variations = save_point.to_variations;
            on_disk.save(&self.config_path)?;
        }
        self.config.num_variations = on_disk.num_variations;
        Ok(())
    }

    /// Finish a save point a previous process started but did not complete.
    fn resume_save_point(&mut self) -> Result<()> {
        let latest = self.probe.completed_iterations()?;
        if latest == 0 {
            return Ok(());
        }
        let record = self.layout.save_point_file(latest);
        let content = match fs::read(&record) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let save_point: SavePoint = serde_json::from_slice(&content)?;
        let archived = self
            .layout
            .iteration_dir(latest)
            .join("eval_report.json")
            .exists();
        let persisted = PipelineConfig::load(&self.config_path)?.num_variations
            != save_point.from_variations;
        if archived && persisted {
            return Ok(());
        }

        warn!(
            iteration = save_point.iteration,
            num_variations = save_point.to_variations,
            "Finishing interrupted save point"
        );
        self.finish_save_point(&save_point)
    }
}

/// Directory holding the configuration file.
pub fn base_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
