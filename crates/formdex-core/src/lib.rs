//! FormDex core
//!
//! Decides which pipeline stage runs next:
//! - `config`: the `config.json` document shared with the stage scripts
//! - `probe`: presence checks over the project output directory
//! - `sequencer`: stateless probe → next-action selection
//! - `journal`: append-only record of driver runs

pub mod config;
pub mod error;
pub mod eval;
pub mod fakes;
pub mod journal;
pub mod layout;
pub mod obs;
pub mod probe;
pub mod sequencer;
pub mod stage;
pub mod telemetry;

pub use config::{LabelMode, PipelineConfig, SourceType, CONFIG_FILE_NAME};
pub use error::{ConfigError, FormdexError, Result};
pub use eval::EvalReport;
pub use journal::{
    EventKind, FsRunJournal, JournalEntry, RunId, RunJournal, RunMetadata, RunRecord,
    RunRecorder, RunStatus, RunSummary,
};
pub use layout::ProjectLayout;
pub use probe::{clear_marker, mark_complete, Artifact, ArtifactProbe, FsArtifactProbe, ProbeSnapshot};
pub use sequencer::{NextAction, PipelineState, Sequencer};
pub use stage::Stage;
pub use telemetry::init_tracing;
