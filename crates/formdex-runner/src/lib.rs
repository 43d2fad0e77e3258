//! FormDex runner
//!
//! Executes the stages chosen by the sequencer:
//! - `stage`: per-stage command, timeout and environment
//! - `runner`: the `StageRunner` seam and its child-process implementation
//! - `pool`: labeling fan-out over disjoint frame shards
//! - `pipeline`: the probe → plan → act loop with retry save points

pub mod pipeline;
pub mod pool;
pub mod runner;
pub mod stage;

pub use pipeline::{base_dir, Pipeline, PipelineOutcome, PipelineStatus, RunOptions};
pub use pool::{plan_shards, LabelPool, PoolOutcome};
pub use runner::{ProcessRunner, StageResult, StageRunner};
pub use stage::{default_command, StageConfig, StageContext};
