//! FormDex - stage sequencer CLI
//!
//! The `formdex` command drives the detection pipeline for one project.
//!
//! ## Commands
//!
//! - `init`: write a default `config.json`
//! - `status`: show artifact probes and the current pipeline state
//! - `next`: print the next action without running it
//! - `run`: run stages until the target metric is met
//! - `log`: show the journal of a previous run

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use formdex_core::{
    Artifact, FsArtifactProbe, FsRunJournal, LabelMode, PipelineConfig, PipelineState,
    ProbeSnapshot, ProjectLayout, RunId, RunJournal, RunStatus, Sequencer, SourceType,
    CONFIG_FILE_NAME,
};
use formdex_runner::{base_dir, Pipeline, PipelineStatus, ProcessRunner, RunOptions};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "formdex")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Stage sequencer for the FormDex detection pipeline", long_about = None)]
struct Cli {
    /// Path to the project configuration
    #[arg(short, long, global = true, default_value = CONFIG_FILE_NAME, env = "FORMDEX_CONFIG")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Pipeline variant: form (document) or video (capture)
        #[arg(long, value_parser = parse_enum::<SourceType>)]
        source_type: SourceType,

        /// Project name; outputs go to runs/<project>
        #[arg(short, long)]
        project: Option<String>,

        /// PDF source (required for form projects)
        #[arg(long)]
        form_url: Option<String>,

        /// Video source handed to the capture stage
        #[arg(long)]
        video_source: Option<String>,

        /// Labeling strategy: programmatic or vision
        #[arg(long, value_parser = parse_enum::<LabelMode>)]
        label_mode: Option<LabelMode>,

        /// Vision client used by labeling workers (default: codex)
        #[arg(long)]
        vision_agent: Option<String>,

        /// Number of labeling workers
        #[arg(long)]
        num_agents: Option<u32>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show artifact probes and the current state
    Status,

    /// Print the next action without running it
    Next,

    /// Run stages until the target is met
    Run {
        /// Run a single step and stop
        #[arg(long)]
        once: bool,

        /// Override the iteration cap for this invocation (0 = unbounded)
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Capture stage output instead of streaming it
        #[arg(long)]
        quiet_stages: bool,
    },

    /// Show the journal of a run
    Log {
        /// Run ID (default: most recent run)
        #[arg(long)]
        run: Option<String>,

        /// List runs instead of showing events
        #[arg(long)]
        list: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    formdex_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Init {
            source_type,
            project,
            form_url,
            video_source,
            label_mode,
            vision_agent,
            num_agents,
            force,
        } => {
            let mut config = PipelineConfig::new(source_type);
            config.project = project;
            config.form_url = form_url;
            config.video_source = video_source;
            config.form_label_mode = label_mode;
            if let Some(vision_agent) = vision_agent {
                config.vision_agent = vision_agent;
            }
            if let Some(num_agents) = num_agents {
                config.num_agents = num_agents;
            }
            cmd_init(&cli.config, config, force)
        }
        Commands::Status => cmd_status(&cli.config),
        Commands::Next => cmd_next(&cli.config),
        Commands::Run {
            once,
            max_iterations,
            quiet_stages,
        } => cmd_run(&cli.config, once, max_iterations, quiet_stages).await,
        Commands::Log { run, list } => cmd_log(&cli.config, run.as_deref(), list).await,
    }
}

/// Parse a config enum from its serialized name or alias.
fn parse_enum<T: DeserializeOwned>(value: &str) -> std::result::Result<T, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("unsupported value '{}'", value))
}

fn load_project(config_path: &Path) -> Result<(PipelineConfig, ProjectLayout)> {
    let config = PipelineConfig::load(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let layout = ProjectLayout::resolve(base_dir(config_path), &config);
    Ok((config, layout))
}

/// Write a fresh configuration file
fn cmd_init(config_path: &Path, config: PipelineConfig, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    config
        .validate()
        .context("Refusing to write an invalid configuration")?;
    config.save(config_path)?;

    let layout = ProjectLayout::resolve(base_dir(config_path), &config);
    info!(config = %config_path.display(), "Configuration written");
    println!("Initialized FormDex project at {}", config_path.display());
    println!("Source type: {}", config.source_type()?);
    println!("Label mode:  {}", config.label_mode()?);
    println!("Output root: {}", layout.root().display());
    Ok(())
}

fn render_status(config: &PipelineConfig, snapshot: &ProbeSnapshot) -> Result<String> {
    let mut out = String::new();
    out.push_str(&format!(
        "Source type: {} ({})\n",
        config.source_type()?,
        config.label_mode()?
    ));
    out.push_str(&format!("Variations:  {}\n", config.num_variations));
    out.push_str(&format!(
        "Iterations:  {} completed\n",
        snapshot.completed_iterations
    ));
    out.push('\n');
    for artifact in Artifact::ALL {
        let mark = if snapshot.is_present(artifact) { "✓" } else { "✗" };
        out.push_str(&format!("  {} {}\n", mark, artifact));
    }
    if let Some(report) = &snapshot.eval_report {
        out.push_str(&format!(
            "\nmAP50 {:.3} (target {:.3}), mAP50-95 {:.3}, precision {:.3}, recall {:.3}\n",
            report.map50, report.target_map, report.map50_95, report.precision, report.recall
        ));
    }
    out.push_str(&format!(
        "\nState: {}\n",
        PipelineState::from_probes(snapshot)
    ));
    Ok(out)
}

/// Show probes and state
fn cmd_status(config_path: &Path) -> Result<()> {
    let (config, layout) = load_project(config_path)?;
    println!("Project root: {}", layout.root().display());
    let probe = FsArtifactProbe::new(layout, &config)?;
    let snapshot = ProbeSnapshot::capture(&probe)?;
    print!("{}", render_status(&config, &snapshot)?);
    Ok(())
}

/// Print the next action
fn cmd_next(config_path: &Path) -> Result<()> {
    let (config, layout) = load_project(config_path)?;
    let probe = FsArtifactProbe::new(layout, &config)?;
    let action = Sequencer::next_action(&config, &probe)?;
    println!("{}", action);
    Ok(())
}

/// Drive the pipeline
async fn cmd_run(
    config_path: &Path,
    once: bool,
    max_iterations: Option<u32>,
    quiet_stages: bool,
) -> Result<()> {
    let mut runner = ProcessRunner::new(base_dir(config_path));
    if quiet_stages {
        runner = runner.capturing();
    }
    let mut pipeline = Pipeline::open(config_path, Arc::new(runner))
        .with_context(|| format!("Failed to open project {}", config_path.display()))?;
    if let Some(max_iterations) = max_iterations {
        pipeline.set_max_iterations(max_iterations);
    }

    println!("Running pipeline for {}", pipeline.layout().root().display());
    println!(
        "Target mAP50: {:.3}, variations: {}",
        pipeline.config().target_map,
        pipeline.config().num_variations
    );
    println!();

    let outcome = pipeline
        .run(&RunOptions { once })
        .await
        .context("Pipeline stopped")?;

    println!("Run ID: {}", outcome.run_id);
    for stage in &outcome.stages {
        let status = if stage.passed() { "✓" } else { "✗" };
        println!(
            "  {} {} ({}ms, exit code: {})",
            status, stage.stage_name, stage.duration_ms, stage.exit_code
        );
    }
    println!();

    match outcome.status {
        PipelineStatus::Done => {
            if let Some(report) = &outcome.report {
                println!(
                    "✓ Target met: mAP50 {:.3} >= {:.3} after {} retr{}",
                    report.map50,
                    report.target_map,
                    outcome.retries,
                    if outcome.retries == 1 { "y" } else { "ies" }
                );
            }
        }
        PipelineStatus::Stepped => {
            println!("Stepped. Next: {}", pipeline.next_action()?);
        }
    }
    Ok(())
}

/// Print the events of a run
async fn cmd_log(config_path: &Path, run: Option<&str>, list: bool) -> Result<()> {
    let (_, layout) = load_project(config_path)?;
    let journal = FsRunJournal::new(layout.journal_dir());
    let runs = journal.list_runs().await?;

    if list {
        if runs.is_empty() {
            println!("No runs recorded.");
        }
        for record in &runs {
            let status = match record.status {
                RunStatus::Running => "running",
                RunStatus::Completed => "completed",
                RunStatus::Failed => "failed",
            };
            let outcome = record
                .summary
                .as_ref()
                .map(|s| s.outcome.as_str())
                .unwrap_or("-");
            println!(
                "{}  {}  {:<9}  {}",
                record.created_at.format("%Y-%m-%d %H:%M:%S"),
                record.run_id,
                status,
                outcome
            );
        }
        return Ok(());
    }

    let run_id = match run {
        Some(id) => RunId(id.to_string()),
        None => runs
            .last()
            .map(|r| r.run_id.clone())
            .context("No runs recorded")?,
    };
    let events = journal.events(&run_id).await?;

    println!("Run {}", run_id);
    for event in &events {
        println!(
            "{:>4}  {}  {:<15}  {}",
            event.seq,
            event.timestamp.format("%H:%M:%S%.3f"),
            event.kind.as_str(),
            event.payload
        );
    }
    Ok(())
}
