//! CLI binary for running GrantOps pipelines and inspecting sections.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use grantops_pipeline::{
    ActionInterface, PipelineDefinition, PipelineEvent, PipelineGraph, ProjectLayout, RunReport,
    Scheduler, Severity,
};
use grantops_types::{GrantOpsError, RunStatus, SectionStatus, StepStatus};

use crate::config::ProjectConfig;

#[derive(Parser)]
#[command(name = "grantops", version, about = "Declarative pipelines for grant sections")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Project root (default: current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline definition
    Validate {
        /// Pipeline name under the pipelines directory, or a path to a YAML file
        pipeline: String,
    },

    /// Show the steps and dependencies of a pipeline
    Info { pipeline: String },

    /// Start a new run
    Run {
        pipeline: String,

        /// Report success for every step without invoking actions
        #[arg(long)]
        dry_run: bool,
    },

    /// Continue the active run
    Resume {
        pipeline: String,

        /// Give failed steps another round of attempts
        #[arg(long)]
        rearm_failed: bool,
    },

    /// Show the active run
    Status,

    /// Ask the active run to stop after its in-flight steps
    Cancel,

    /// Abort and archive the active run
    Abandon,

    /// Show the audit history
    History {
        /// Aggregate per action instead of listing entries
        #[arg(long)]
        stats: bool,

        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// List sections
    Sections,

    /// List the versions of a section
    Versions { section: String },

    /// Print a section's content
    Show {
        section: String,

        /// Version number (default: current)
        #[arg(long)]
        version: Option<u32>,
    },

    /// Line diff between two versions of a section
    Diff { section: String, from: u32, to: u32 },

    /// Make an older version current again, as a new version
    Restore { section: String, version: u32 },

    /// Reject further versions of a section
    Lock { section: String },

    /// Allow new versions of a locked section again
    Unlock { section: String },

    /// Set a section's status (draft, review, final, locked)
    Promote { section: String, status: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing; RUST_LOG wins over --verbose.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = dispatch(cli).await;
    if let Err(err) = &result {
        tracing::error!(error = %err, "Command failed");
        if let Some(GrantOpsError::Validation { violations }) = err.downcast_ref::<GrantOpsError>() {
            for violation in violations {
                eprintln!("  {violation}");
            }
        }
    }
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let root = cli.project;
    let config = ProjectConfig::load(&root)?;
    let layout = config.layout(&root);

    match cli.command {
        Commands::Validate { pipeline } => cmd_validate(&layout, &pipeline),
        Commands::Info { pipeline } => cmd_info(&layout, &pipeline),
        Commands::Run { pipeline, dry_run } => {
            cmd_run(&config, &layout, &pipeline, dry_run || config.dry_run).await
        }
        Commands::Resume {
            pipeline,
            rearm_failed,
        } => cmd_resume(&config, &layout, &pipeline, rearm_failed).await,
        Commands::Status => cmd_status(&layout).await,
        Commands::Cancel => {
            let run_id = layout.state_store().request_cancel().await?;
            println!("Cancellation requested for run {run_id}");
            Ok(())
        }
        Commands::Abandon => {
            let scheduler = Scheduler::new(&layout, Arc::new(config.action_registry(&root)));
            let state = scheduler.abandon().await?;
            println!("Run {} abandoned", state.run_id);
            Ok(())
        }
        Commands::History { stats, limit } => cmd_history(&layout, stats, limit).await,
        Commands::Sections => cmd_sections(&layout).await,
        Commands::Versions { section } => cmd_versions(&layout, &section).await,
        Commands::Show { section, version } => cmd_show(&layout, &section, version).await,
        Commands::Diff { section, from, to } => {
            let diff = layout.version_store().diff(&section, from, to).await?;
            println!(
                "{} v{} -> v{}: +{} -{}",
                diff.section, diff.from, diff.to, diff.added, diff.removed
            );
            print!("{}", diff.text);
            Ok(())
        }
        Commands::Restore { section, version } => {
            let restored = layout.version_store().restore(&section, version).await?;
            println!(
                "Restored {} v{} as {}",
                section,
                version,
                restored.label()
            );
            Ok(())
        }
        Commands::Lock { section } => set_status(&layout, &section, SectionStatus::Locked).await,
        Commands::Unlock { section } => set_status(&layout, &section, SectionStatus::Draft).await,
        Commands::Promote { section, status } => {
            let status: SectionStatus = status.parse()?;
            set_status(&layout, &section, status).await
        }
    }
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

fn load_definition(layout: &ProjectLayout, name: &str) -> anyhow::Result<PipelineDefinition> {
    let path = layout.pipeline_path(name);
    if !path.exists() {
        anyhow::bail!("Pipeline '{}' not found at {}", name, path.display());
    }
    Ok(PipelineDefinition::load(&path)?)
}

fn load_pipeline(layout: &ProjectLayout, name: &str) -> anyhow::Result<PipelineGraph> {
    Ok(PipelineGraph::from_definition(&load_definition(layout, name)?)?)
}

fn cmd_validate(layout: &ProjectLayout, name: &str) -> anyhow::Result<()> {
    let graph = PipelineGraph::build(&load_definition(layout, name)?)?;
    let diagnostics = grantops_pipeline::validate(&graph);

    if diagnostics.is_empty() {
        println!("Pipeline '{}' is valid ({} steps)", graph.name, graph.len());
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
        };
        match &diag.step {
            Some(step) => println!("[{}] {} ({}): {}", severity, diag.rule, step, diag.message),
            None => println!("[{}] {}: {}", severity, diag.rule, diag.message),
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(layout: &ProjectLayout, name: &str) -> anyhow::Result<()> {
    let graph = load_pipeline(layout, name)?;

    println!("Pipeline: {}", graph.name);
    if let Some(description) = &graph.description {
        println!("Description: {}", description);
    }
    let options = &graph.options;
    println!(
        "Options: parallel={} max_concurrency={} stop_on_failure={} strict_dependencies={}",
        options.parallel, options.max_concurrency, options.stop_on_failure, options.strict_dependencies
    );
    println!("Fingerprint: {}", &graph.fingerprint()[..12.min(graph.fingerprint().len())]);

    println!("\nSteps:");
    for node in graph.nodes() {
        let deps: Vec<&str> = node
            .deps
            .iter()
            .map(|&d| graph.node(d).name.as_str())
            .collect();
        println!("  {} [{} {}]", node.name, node.action, node.target);
        if !deps.is_empty() {
            println!("      depends on: {}", deps.join(", "));
        }
        if let Some(condition) = &node.condition_source {
            println!("      when: {}", condition);
        }
        if let Some(retry) = &node.retry {
            println!("      retry: {} (backoff {:?})", retry.max, retry.backoff);
        }
    }

    let sections = graph.referenced_sections();
    if !sections.is_empty() {
        let list: Vec<&str> = sections.iter().map(String::as_str).collect();
        println!("\nSections: {}", list.join(", "));
    }
    Ok(())
}

fn scheduler(config: &ProjectConfig, layout: &ProjectLayout) -> Scheduler {
    let actions: Arc<dyn ActionInterface> = Arc::new(config.action_registry(layout.root()));
    let scheduler =
        Scheduler::new(layout, actions).with_default_timeout(config.default_timeout);

    // Ctrl-C stops the run between ticks; in-flight steps still finish.
    let cancel = scheduler.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, stopping after in-flight steps...");
            cancel.cancel();
        }
    });

    let mut events = scheduler.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    scheduler
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::StepStarted { step, action, target } => {
            println!("  -> {step} ({action} {target})")
        }
        PipelineEvent::StepRetrying {
            step,
            attempt,
            delay_ms,
            error,
        } => println!("  !! {step} attempt {attempt} failed: {error} (retry in {delay_ms}ms)"),
        PipelineEvent::StepCompleted {
            step,
            status,
            attempts,
            duration_ms,
        } => println!("  <- {step} {status} after {attempts} attempt(s), {duration_ms}ms"),
        PipelineEvent::StepSkipped { step, reason } => println!("  -- {step} skipped: {reason}"),
        PipelineEvent::StepAborted { step } => println!("  xx {step} aborted"),
        PipelineEvent::VersionCommitted {
            section, version, ..
        } => println!("     {section} v{version} committed"),
        PipelineEvent::RunStarted { .. }
        | PipelineEvent::RunResumed { .. }
        | PipelineEvent::RunFinished { .. } => {}
    }
}

fn ensure_actions(config: &ProjectConfig, graph: &PipelineGraph, dry_run: bool) -> anyhow::Result<()> {
    let missing = config.missing_actions(graph);
    if !dry_run && !missing.is_empty() {
        let names: Vec<&str> = missing.iter().map(|k| k.as_str()).collect();
        anyhow::bail!(
            "No command configured in {} for action(s): {}",
            config::CONFIG_FILE,
            names.join(", ")
        );
    }
    Ok(())
}

async fn cmd_run(
    config: &ProjectConfig,
    layout: &ProjectLayout,
    name: &str,
    dry_run: bool,
) -> anyhow::Result<()> {
    let graph = load_pipeline(layout, name)?;
    ensure_actions(config, &graph, dry_run)?;

    println!("Running pipeline: {} ({} steps)", graph.name, graph.len());
    if dry_run {
        println!("(dry run mode -- no actions executed, no versions created)");
    }

    let report = scheduler(config, layout).start(&graph, dry_run).await?;
    finish_run(&report)
}

async fn cmd_resume(
    config: &ProjectConfig,
    layout: &ProjectLayout,
    name: &str,
    rearm_failed: bool,
) -> anyhow::Result<()> {
    let graph = load_pipeline(layout, name)?;
    let active = layout
        .state_store()
        .load()
        .await?
        .ok_or(GrantOpsError::NoActiveRun)?;
    ensure_actions(config, &graph, active.dry_run)?;

    println!("Resuming run {} of {}", active.run_id, graph.name);
    let report = scheduler(config, layout).resume(&graph, rearm_failed).await?;
    finish_run(&report)
}

fn finish_run(report: &RunReport) -> anyhow::Result<()> {
    let failed = report
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Failed)
        .count();

    println!(
        "\nRun {} {} in {:.1}s ({} ticks)",
        report.run_id,
        report.status,
        report.duration.as_secs_f64(),
        report.ticks
    );
    for step in &report.steps {
        let detail = step
            .error
            .as_deref()
            .or(step.reason.as_deref())
            .unwrap_or_default();
        println!("  {:<24} {:<8} {}", step.name, step.status, detail);
    }

    match report.status {
        RunStatus::Blocked => {
            println!("\nRun is blocked behind failed steps. Fix the cause and `grantops resume --rearm-failed`, or `grantops abandon`.");
            std::process::exit(1);
        }
        RunStatus::Aborted => std::process::exit(1),
        _ if failed > 0 => std::process::exit(1),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

async fn cmd_status(layout: &ProjectLayout) -> anyhow::Result<()> {
    let Some(state) = layout.state_store().load().await? else {
        println!("No active run");
        return Ok(());
    };

    println!("Run: {}", state.run_id);
    println!("Pipeline: {}", state.pipeline);
    println!("Status: {}{}", state.status, if state.dry_run { " (dry run)" } else { "" });
    println!("Started: {}", state.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Updated: {}", state.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if layout.state_store().cancel_requested().await? {
        println!("Cancellation requested");
    }

    let counts = state.counts();
    println!(
        "Steps: {} pending, {} running, {} success, {} failed, {} skipped, {} aborted",
        counts.pending, counts.running, counts.success, counts.failed, counts.skipped, counts.aborted
    );
    for step in &state.steps {
        let version = step.version.map(|v| format!("v{v}")).unwrap_or_default();
        let detail = step
            .error
            .as_deref()
            .or(step.reason.as_deref())
            .unwrap_or_default();
        println!(
            "  {:<24} {:<8} attempts={} {} {}",
            step.name, step.status, step.attempts, version, detail
        );
    }
    Ok(())
}

async fn cmd_history(layout: &ProjectLayout, stats: bool, limit: usize) -> anyhow::Result<()> {
    let log = layout.history_log();

    if stats {
        let stats = log.stats().await?;
        println!(
            "{} entries, {} runs, {} attempts, {:.1}s total",
            stats.entries,
            stats.runs,
            stats.attempts,
            stats.total_duration_ms as f64 / 1000.0
        );
        for (action, s) in &stats.by_action {
            println!(
                "  {:<10} started={} invocations={} success={} failed={} retrying={} skipped={} aborted={} {}ms",
                action, s.started, s.invocations, s.success, s.failed, s.retrying, s.skipped, s.aborted, s.duration_ms
            );
        }
        return Ok(());
    }

    for entry in log.tail(limit).await? {
        let attempt = entry.attempt.map(|a| format!("#{a}")).unwrap_or_default();
        let version = entry.version.map(|v| format!("v{v}")).unwrap_or_default();
        println!(
            "{} {} {:<20} {:<8} {:<12} {:<9} {:>3} {:>5} {}ms {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            &entry.run_id[..8.min(entry.run_id.len())],
            entry.step,
            entry.action,
            entry.target,
            entry.result.as_str(),
            attempt,
            version,
            entry.duration_ms,
            entry.detail.as_deref().unwrap_or_default()
        );
    }
    Ok(())
}

async fn cmd_sections(layout: &ProjectLayout) -> anyhow::Result<()> {
    let store = layout.version_store();
    let sections = store.list_sections().await?;
    if sections.is_empty() {
        println!("No sections yet");
        return Ok(());
    }
    for section in sections {
        let snapshot = store.snapshot(&section.id).await?;
        println!(
            "  {:<24} {:<7} v{:<4} {} words",
            section.id, section.status, section.current_version, snapshot.word_count
        );
    }
    Ok(())
}

async fn cmd_versions(layout: &ProjectLayout, section: &str) -> anyhow::Result<()> {
    let store = layout.version_store();
    let current = store
        .section(section)
        .await?
        .ok_or_else(|| GrantOpsError::SectionNotFound {
            section: section.to_string(),
        })?
        .current_version;

    for manifest in store.versions(section).await? {
        let marker = if manifest.number == current { "*" } else { " " };
        let origin = match (manifest.restored_from, &manifest.producing_step) {
            (Some(from), _) => format!("restored from v{from}"),
            (None, Some(step)) => format!("step {step}"),
            (None, None) => String::new(),
        };
        println!(
            "{} v{:<4} {} {:>6} words  {}  {}",
            marker,
            manifest.number,
            manifest.timestamp.format("%Y-%m-%d %H:%M:%S"),
            manifest.word_count,
            &manifest.content_hash[..12.min(manifest.content_hash.len())],
            origin
        );
    }
    Ok(())
}

async fn cmd_show(layout: &ProjectLayout, section: &str, version: Option<u32>) -> anyhow::Result<()> {
    let store = layout.version_store();
    let version = match version {
        Some(n) => store.get(section, n).await?,
        None => store
            .current(section)
            .await?
            .ok_or_else(|| GrantOpsError::SectionNotFound {
                section: section.to_string(),
            })?,
    };
    print!("{}", version.content);
    Ok(())
}

async fn set_status(layout: &ProjectLayout, section: &str, status: SectionStatus) -> anyhow::Result<()> {
    let updated = layout.version_store().set_status(section, status).await?;
    println!("{} is now {}", updated.id, updated.status);
    Ok(())
}
