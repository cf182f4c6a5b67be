//! triage CLI - one-shot diagnostics report, fixes, and a watch loop.
//!
//! ```text
//! triage [check]         refresh everything, print summary + hotspots
//! triage errors ...      filtered, flattened diagnostics
//! triage fix [--max N]   apply available quick fixes
//! triage health          session and cache health
//! triage watch           re-analyze on change until Ctrl-C
//! ```

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use triage_engine::{
    DiagnosticsEngine, FsWorkspace, RefreshScope, TriageConfig, Workspace, config::config_path,
};
use triage_types::{Category, DiagnosticFilter, DiagnosticSet, Severity, SnapshotVersion};

#[derive(Parser, Debug)]
#[command(
    name = "triage",
    about = "Unified diagnostics across language servers, linters and built-in analyzers",
    version
)]
struct Cli {
    /// Workspace root (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    root: PathBuf,

    /// Config file (defaults to <root>/.triage.toml, then ~/.triage/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze every file and print a summary with hotspots
    Check {
        #[arg(long, default_value_t = 10)]
        hotspots: usize,
    },
    /// List diagnostics matching the filters
    Errors(FilterArgs),
    /// Apply quick fixes for diagnostics matching the filters
    Fix {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, default_value_t = 20)]
        max: usize,
        /// Only show what would change
        #[arg(long)]
        dry_run: bool,
    },
    /// Session state, cache hit rate and queue depth
    Health,
    /// Re-analyze files as they change until interrupted
    Watch {
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
}

#[derive(Args, Debug, Default)]
struct FilterArgs {
    /// Only files under these paths (repeatable)
    #[arg(long = "path")]
    paths: Vec<PathBuf>,
    #[arg(long, value_parser = parse_severity)]
    min_severity: Option<Severity>,
    /// Only these categories (repeatable)
    #[arg(long = "category", value_parser = parse_category)]
    categories: Vec<Category>,
    /// Only diagnostics produced within this many seconds
    #[arg(long)]
    within_secs: Option<u64>,
}

impl FilterArgs {
    fn to_filter(&self) -> DiagnosticFilter {
        let mut filter = DiagnosticFilter::all();
        for path in &self.paths {
            filter = filter.path(path);
        }
        if let Some(severity) = self.min_severity {
            filter = filter.min_severity(severity);
        }
        for category in &self.categories {
            filter = filter.category(*category);
        }
        if let Some(secs) = self.within_secs {
            filter = filter.within(Duration::from_secs(secs));
        }
        filter
    }
}

fn parse_severity(value: &str) -> Result<Severity, String> {
    Severity::from_label(value).ok_or_else(|| format!("unknown severity `{value}`"))
}

fn parse_category(value: &str) -> Result<Category, String> {
    Category::from_label(value).ok_or_else(|| format!("unknown category `{value}`"))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::try_new("warn").expect("warn filter is valid"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Reports go to stdout; logs never do.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    // ~/.triage/logs/triage.log
    config_path()
        .as_deref()
        .and_then(Path::parent)
        .map(|dir| dir.join("logs").join("triage.log"))
        .into_iter()
        .collect()
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("workspace root {} not found", cli.root.display()))?;
    let (config, config_file) = TriageConfig::load(cli.config.as_deref(), &root)
        .with_context(|| "failed to load configuration")?;
    match &config_file {
        Some(path) => tracing::info!(path = %path.display(), "Loaded config"),
        None => tracing::info!("No config file found; using defaults"),
    }

    let workspace: Arc<dyn Workspace> = Arc::new(FsWorkspace::new(&root));
    let engine = DiagnosticsEngine::builder(workspace).config(config).build();

    let outcome = run(&engine, &cli).await;
    engine.shutdown().await;
    outcome
}

/// Fails (exit 1) when `check` finds errors.
async fn run(engine: &DiagnosticsEngine, cli: &Cli) -> Result<ExitCode> {
    match cli.command.as_ref().unwrap_or(&Command::Check { hotspots: 10 }) {
        Command::Check { hotspots } => {
            let collection = engine.refresh(RefreshScope::All).await?;
            let summary = collection.summary();
            let hot = collection.hotspots(*hotspots);
            if cli.json {
                print_json(&serde_json::json!({ "summary": summary, "hotspots": hot }))?;
            } else {
                println!(
                    "{} errors, {} warnings, {} info, {} hints in {} files ({} with errors)",
                    summary.total_errors,
                    summary.total_warnings,
                    summary.total_info,
                    summary.total_hints,
                    collection.files().len(),
                    summary.files_with_errors
                );
                for file in &hot {
                    println!(
                        "  {:>4} errors {:>4} total  {}",
                        file.errors,
                        file.total,
                        file.path.display()
                    );
                }
                for set in collection.files() {
                    print_degraded(set);
                }
            }
            if summary.total_errors > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Errors(args) => {
            let errors = engine.errors(&args.to_filter()).await?;
            if cli.json {
                print_json(&errors)?;
            } else {
                for diag in &errors {
                    println!("{}", diag.display_line());
                }
            }
        }
        Command::Fix {
            filter,
            max,
            dry_run,
        } => {
            if *dry_run {
                let fixable = engine.errors(&filter.to_filter().fixable_only()).await?;
                for diag in fixable.iter().take(*max) {
                    let preview = engine.preview_fix(diag.id())?;
                    if cli.json {
                        print_json(&preview)?;
                    } else {
                        println!("{}: {}", preview.file_path.display(), preview.title);
                        print!("{}", preview.diff);
                    }
                }
                return Ok(ExitCode::SUCCESS);
            }
            let results = engine.resolve_errors(&filter.to_filter(), *max).await?;
            if cli.json {
                print_json(&results)?;
            } else {
                let applied = results.iter().filter(|r| r.success).count();
                for result in results.iter().filter(|r| !r.success) {
                    if let Some(err) = &result.error {
                        eprintln!("skipped {}: {err}", result.diagnostic_id);
                    }
                }
                println!("applied {applied} of {} fixes", results.len());
            }
        }
        Command::Health => {
            let report = engine.health_check();
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "cache: {} entries, hit rate {:.0}%",
                    report.cache.entries,
                    report.cache_hit_rate * 100.0
                );
                for source in &report.sources {
                    println!("source {} ({}, {})", source.name, source.kind.label(), source.language);
                }
                for session in &report.sessions {
                    let state = session.state.map_or("not started", |s| s.label());
                    println!(
                        "session {}: {state}, {} restarts",
                        session.language, session.restart_count
                    );
                }
            }
        }
        Command::Watch { interval_ms } => {
            watch(engine, Duration::from_millis(*interval_ms), cli.json).await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_degraded(set: &DiagnosticSet) {
    for (source, reason) in set.degraded_sources() {
        eprintln!(
            "warning: {} skipped for {}: {reason}",
            source,
            set.file_path().display()
        );
    }
}

/// Poll the workspace and feed content changes to the scheduler.
async fn watch(engine: &DiagnosticsEngine, interval: Duration, json: bool) -> Result<()> {
    if interval.is_zero() {
        bail!("--interval-ms must be positive");
    }
    engine.refresh(RefreshScope::All).await?;
    let _subscription = engine.subscribe(move |set: Arc<DiagnosticSet>| {
        if json {
            if let Ok(line) = serde_json::to_string(&*set) {
                println!("{line}");
            }
            return;
        }
        println!(
            "{}: {} errors, {} warnings",
            set.file_path().display(),
            set.count(Severity::Error),
            set.count(Severity::Warning)
        );
    });
    engine.start_watching();

    let workspace = Arc::clone(engine.workspace());
    let mut known = versions(workspace.as_ref());
    let mut ticker = tokio::time::interval(interval);
    let mut interrupt = std::pin::pin!(tokio::signal::ctrl_c());
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut interrupt => {
                tracing::info!("Interrupted; stopping watch");
                return Ok(());
            }
        }
        let current = versions(workspace.as_ref());
        for (path, version) in &current {
            if known.get(path) != Some(version) {
                engine.notify_changed(path.clone());
            }
        }
        for path in known.keys().filter(|p| !current.contains_key(*p)) {
            engine.notify_deleted(path).await;
        }
        known = current;
    }
}

fn versions(workspace: &dyn Workspace) -> HashMap<PathBuf, SnapshotVersion> {
    let files = match workspace.list_files() {
        Ok(files) => files,
        Err(e) => {
            tracing::warn!("Failed to list workspace files: {e}");
            return HashMap::new();
        }
    };
    files
        .into_iter()
        .filter_map(|path| {
            let version = workspace.read_file(&path).ok()?.version;
            Some((path, version))
        })
        .collect()
}
