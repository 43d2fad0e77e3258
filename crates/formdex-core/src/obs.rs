//! Structured lifecycle events for pipeline runs.
//!
//! - `RunSpan` RAII guard tags everything inside a run with its `run_id`
//! - `emit_*` helpers log the key transitions at `info!`
//!
//! Filter with `RUST_LOG`; pass `--json` to the CLI for JSON lines.

use tracing::info;

/// RAII guard that enters a run-scoped span for the duration of a run.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        let span = tracing::info_span!("formdex.run", run_id = %run_id);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_run_started(run_id: &str, project: &str) {
    info!(event = "run.started", run_id = %run_id, project = %project);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, total_events: u64, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        total_events = total_events,
        success = success,
    );
}

pub fn emit_action_planned(iteration: u32, state: &str, num_variations: u32) {
    info!(
        event = "pipeline.action_planned",
        iteration = iteration,
        state = %state,
        num_variations = num_variations,
    );
}

pub fn emit_stage_started(stage: &str, command: &[String]) {
    info!(event = "stage.started", stage = %stage, command = %command.join(" "));
}

pub fn emit_stage_finished(stage: &str, exit_code: i32, duration_ms: u64) {
    info!(
        event = "stage.finished",
        stage = %stage,
        exit_code = exit_code,
        duration_ms = duration_ms,
    );
}

/// Stage failure (warning level).
pub fn emit_stage_failed(stage: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "stage.failed", stage = %stage, error = %error);
}

pub fn emit_retry(iteration: u32, map50: f64, target: f64, from: u32, to: u32) {
    info!(
        event = "pipeline.retry",
        iteration = iteration,
        map50 = map50,
        target = target,
        from_variations = from,
        to_variations = to,
    );
}

pub fn emit_done(map50: f64, target: f64) {
    info!(event = "pipeline.done", map50 = map50, target = target);
}

/// Evaluator flag disagrees with its own metric (warning level).
pub fn emit_report_inconsistent(map50: f64, target: f64, meets_target: bool) {
    tracing::warn!(
        event = "eval.inconsistent",
        map50 = map50,
        target = target,
        meets_target = meets_target,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _span = RunSpan::enter("test-run-id");
        emit_stage_started("train", &["uv".to_string(), "run".to_string()]);
    }
}
