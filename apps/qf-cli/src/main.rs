mod logging;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand};
use qf_app::{
    AppError, AppResult, CalcEvent, CalcSummary, LifecycleManager, ManagerBuilder, ManagerConfig,
    Monitor, summarize,
};
use qf_core::{
    AnalysisRequest, Artifacts, BackendKind, CalcState, Calculation, Catalog, WorkflowType,
};
use qf_exec::{CommandRemoteService, LogStream, RemoteBackend};
use qf_settings::Settings;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Parser)]
#[command(name = "quantics-flow")]
#[command(about = "QuanticsFlow - Quantics calculation orchestration", long_about = None)]
struct Cli {
    /// Base directory for settings, records and runs
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Suppress log output
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new calculation
    Create {
        name: String,
        /// Quantics input file (.inp)
        inp: PathBuf,
        /// Operator file (.op)
        op: PathBuf,
        /// MCTDH, vMCG or DD-vMCG (defaults to the configured workflow)
        #[arg(long)]
        workflow: Option<WorkflowType>,
        /// DB folder, required for DD-vMCG
        #[arg(long)]
        db_folder: Option<PathBuf>,
        /// local or remote (defaults to the configured execution mode)
        #[arg(long)]
        backend: Option<BackendKind>,
    },
    /// Submit a calculation and follow it to completion
    Run {
        name: String,
        /// Return after submission (remote calculations only)
        #[arg(long)]
        detach: bool,
    },
    /// Stop a submitted or running calculation
    Cancel { name: String },
    /// Show one calculation, or all of them
    Status { name: Option<String> },
    /// List calculations
    List {
        /// Only calculations in this state
        #[arg(long)]
        state: Option<CalcState>,
    },
    /// Run analysis tools on a finished calculation
    Analyze {
        name: String,
        /// Tool commands, e.g. "rdcheck etot"
        tools: Vec<String>,
        /// Run the workflow's default analysis set
        #[arg(long, conflicts_with = "tools")]
        defaults: bool,
    },
    /// Remove a calculation that is not active
    Delete {
        name: String,
        /// Also delete the working directory
        #[arg(long)]
        purge: bool,
    },
    /// Monitor remote calculations until none is active
    Watch,
    /// Show workflows, required artifacts and analysis tools
    Catalog,
    /// Inspect or initialise settings
    #[command(subcommand)]
    Settings(SettingsCommands),
}

#[derive(Subcommand)]
enum SettingsCommands {
    /// Print the effective settings
    Show,
    /// Write default settings to the base directory
    Init {
        /// Overwrite an existing settings file
        #[arg(long)]
        force: bool,
    },
    /// Import settings from a YAML, JSON or GUI config file
    Import { path: PathBuf },
}

struct Context {
    base: PathBuf,
    settings: Settings,
}

impl Context {
    fn load(explicit: Option<&Path>) -> AppResult<Self> {
        let home = qf_settings::resolve_base_directory(explicit, None);
        let settings = qf_settings::load_or_default(&qf_settings::settings_path(&home))?;
        let base = qf_settings::resolve_base_directory(
            explicit,
            settings.orchestrator.base_directory.as_deref(),
        );
        debug!(base = %base.display(), "using base directory");
        Ok(Self { base, settings })
    }

    fn catalog(&self) -> Catalog {
        let analysis = &self.settings.analysis;
        Catalog::with_rdgpop_defaults(&analysis.rdgpop_nz, &analysis.rdgpop_dof)
    }

    /// Manager for commands that change calculations; reconciles orphaned local runs.
    fn manager(&self) -> AppResult<LifecycleManager> {
        self.builder().build()
    }

    /// Manager for commands that only read records.
    fn reader(&self) -> AppResult<LifecycleManager> {
        self.builder().recover_orphans(false).build()
    }

    fn builder(&self) -> ManagerBuilder {
        let config = ManagerConfig::from_settings(&self.settings, &self.base);
        let remote = config.remote.clone();
        let mut builder = LifecycleManager::builder(config, Arc::new(self.catalog()));
        if let Some(bridge) = &self.settings.remote.bridge {
            let service = CommandRemoteService::new(bridge.clone(), self.base.join("descriptors"));
            builder = builder.backend(Arc::new(RemoteBackend::new(Arc::new(service), remote)));
        }
        builder
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logging::setup_logging(cli.verbose, cli.quiet, cli.log_file.as_deref()) {
        eprintln!("Error: cannot open log file: {err}");
        return ExitCode::FAILURE;
    }

    match dispatch(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

/// `Ok(false)` when the command completed but the calculation did not succeed.
async fn dispatch(cli: Cli) -> AppResult<bool> {
    let ctx = Context::load(cli.base_dir.as_deref())?;

    match cli.command {
        Commands::Create {
            name,
            inp,
            op,
            workflow,
            db_folder,
            backend,
        } => cmd_create(&ctx, &name, inp, op, workflow, db_folder, backend),
        Commands::Run { name, detach } => cmd_run(&ctx, &name, detach).await,
        Commands::Cancel { name } => cmd_cancel(&ctx, &name).await,
        Commands::Status { name } => cmd_status(&ctx, name.as_deref()),
        Commands::List { state } => cmd_list(&ctx, state),
        Commands::Analyze {
            name,
            tools,
            defaults,
        } => cmd_analyze(&ctx, &name, &tools, defaults).await,
        Commands::Delete { name, purge } => cmd_delete(&ctx, &name, purge).await,
        Commands::Watch => cmd_watch(&ctx).await,
        Commands::Catalog => cmd_catalog(&ctx),
        Commands::Settings(cmd) => cmd_settings(&ctx, cmd),
    }
}

fn cmd_create(
    ctx: &Context,
    name: &str,
    inp: PathBuf,
    op: PathBuf,
    workflow: Option<WorkflowType>,
    db_folder: Option<PathBuf>,
    backend: Option<BackendKind>,
) -> AppResult<bool> {
    let workflow = workflow.unwrap_or(ctx.settings.calculation.workflow_type);
    let backend = backend.unwrap_or(ctx.settings.calculation.execution_mode);
    let mut artifacts = Artifacts::new(inp, op);
    artifacts.db_folder = db_folder;

    let calc = ctx.manager()?.create(name, workflow, artifacts, backend)?;
    println!("✓ Created {} ({}, {})", calc.name, calc.workflow_type, calc.backend);
    println!("  Working directory: {}", calc.working_directory.display());
    Ok(true)
}

async fn cmd_run(ctx: &Context, name: &str, detach: bool) -> AppResult<bool> {
    let manager = ctx.manager()?;
    let calc = manager.status(name)?;
    let mut events = manager.subscribe();

    let monitor = match calc.backend {
        BackendKind::Remote if detach => None,
        BackendKind::Remote => Some(Monitor::spawn(manager.clone())),
        BackendKind::Local => {
            if detach {
                warn!("local calculations stop with this process; --detach ignored");
            }
            None
        }
    };

    let handle = manager.run(name).await?;
    println!("Submitted {name} to {} backend (job {})", calc.backend, handle.token);
    if calc.backend == BackendKind::Remote && detach {
        println!("Detached; follow it with `quantics-flow watch`");
        return Ok(true);
    }

    let result = tokio::select! {
        result = follow(&manager, &mut events, name) => result,
        () = interrupted() => match calc.backend {
            // The solver runs in its own process group; stop it with us.
            BackendKind::Local => {
                eprintln!("Interrupted; stopping {name}");
                manager.cancel(name).await
            }
            BackendKind::Remote => {
                eprintln!("Interrupted; {name} keeps running remotely, follow it with `quantics-flow watch`");
                manager.status(name)
            }
        },
    };
    if let Some(monitor) = monitor {
        monitor.shutdown().await;
    }
    let calc = result?;
    print_outcome(&calc);
    Ok(calc.state == CalcState::Finished)
}

/// Resolves on Ctrl-C; never, when the handler cannot be installed.
async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for Ctrl-C: {err}");
        std::future::pending::<()>().await;
    }
}

/// Print log lines and state changes of `name` until it is terminal.
///
/// `events` must be subscribed before the calculation was submitted.
async fn follow(
    manager: &LifecycleManager,
    events: &mut broadcast::Receiver<CalcEvent>,
    name: &str,
) -> AppResult<Calculation> {
    loop {
        match events.recv().await {
            Ok(event) if event.name() != name => {}
            Ok(CalcEvent::Log { line, .. }) => match line.stream {
                LogStream::Stdout => println!("  | {}", line.text),
                LogStream::Stderr => eprintln!("  ! {}", line.text),
            },
            Ok(CalcEvent::StateChanged { change, .. }) => {
                println!("  {} -> {}", change.from, change.to);
                if change.to.is_terminal() {
                    return manager.status(name);
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "output fell behind; some lines were not shown");
                let calc = manager.status(name)?;
                if calc.state.is_terminal() {
                    return Ok(calc);
                }
            }
            Err(broadcast::error::RecvError::Closed) => return manager.status(name),
        }
    }
}

fn print_outcome(calc: &Calculation) {
    match calc.state {
        CalcState::Finished => {
            println!("✓ {} finished", calc.name);
            if let Some(output) = &calc.output {
                println!("  Output: {}", output.directory.display());
                if !output.files.is_empty() {
                    println!("  Files: {}", output.files.join(", "));
                }
                if let Some(energy) = output.total_energy {
                    println!("  Total energy: {energy}");
                }
                if let Some(time) = output.final_time {
                    println!("  Final time: {time}");
                }
                if let Some(converged) = output.converged {
                    println!("  Converged: {converged}");
                }
            }
        }
        state => {
            println!("✗ {} is {state}", calc.name);
            if let Some(error) = &calc.error {
                println!("  {:?} error: {}", error.kind, error.message);
            }
        }
    }
}

async fn cmd_cancel(ctx: &Context, name: &str) -> AppResult<bool> {
    let calc = ctx.manager()?.cancel(name).await?;
    println!("✓ {} is {}", calc.name, calc.state);
    if let Some(error) = &calc.cancel_error {
        println!("  Warning: the job may still be running: {}", error.message);
    }
    Ok(true)
}

fn cmd_status(ctx: &Context, name: Option<&str>) -> AppResult<bool> {
    let manager = ctx.reader()?;
    let Some(name) = name else {
        print_table(&summarize(&manager.list(), None));
        return Ok(true);
    };

    let calc = manager.status(name)?;
    println!("Calculation: {}", calc.name);
    println!("  Workflow: {}", calc.workflow_type);
    println!("  Backend: {}", calc.backend);
    println!("  State: {}", calc.state);
    println!("  Working directory: {}", calc.working_directory.display());
    for (kind, path) in calc.artifacts.iter() {
        println!("  {kind}: {}", path.display());
    }
    println!("  Created: {}", calc.created_at.to_rfc3339());
    if let Some(at) = calc.started_at {
        println!("  Started: {}", at.to_rfc3339());
    }
    if let Some(at) = calc.finished_at {
        println!("  Finished: {}", at.to_rfc3339());
    }
    if let Some(handle) = &calc.handle {
        println!("  Job: {}", handle.token);
    }
    if calc.state.is_terminal() {
        print_outcome(&calc);
    }
    if !calc.analysis_results.is_empty() {
        println!("  Analysis results:");
        for outcome in &calc.analysis_results {
            let mark = if outcome.success { "✓" } else { "✗" };
            let request = AnalysisRequest {
                tool: outcome.tool.clone(),
                params: outcome.params.clone(),
            };
            println!("    {mark} {}", request.command_line());
        }
    }
    Ok(true)
}

fn cmd_list(ctx: &Context, state: Option<CalcState>) -> AppResult<bool> {
    let summaries = summarize(&ctx.reader()?.list(), state);
    if summaries.is_empty() {
        println!("No calculations found");
    } else {
        print_table(&summaries);
    }
    Ok(true)
}

fn print_table(summaries: &[CalcSummary]) {
    println!(
        "{:<24} {:<8} {:<7} {:<10} {:<20} {:<20}",
        "NAME", "WORKFLOW", "BACKEND", "STATE", "STARTED", "FINISHED"
    );
    let stamp = |at: Option<DateTime<Utc>>| {
        at.map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string())
    };
    for s in summaries {
        println!(
            "{:<24} {:<8} {:<7} {:<10} {:<20} {:<20}",
            s.name,
            s.workflow.as_str(),
            s.backend.to_string(),
            s.state.as_str(),
            stamp(s.started_at),
            stamp(s.finished_at),
        );
    }
}

async fn cmd_analyze(ctx: &Context, name: &str, tools: &[String], defaults: bool) -> AppResult<bool> {
    let commands: &[String] = if defaults {
        &[]
    } else if tools.is_empty() {
        &ctx.settings.analysis.tools
    } else {
        tools
    };
    let requests = commands
        .iter()
        .map(|c| AnalysisRequest::parse(c))
        .collect::<Result<Vec<_>, _>>()?;

    let outcomes = ctx.manager()?.run_analysis(name, requests).await?;
    let mut all_ok = true;
    for outcome in &outcomes {
        let request = AnalysisRequest {
            tool: outcome.tool.clone(),
            params: outcome.params.clone(),
        };
        if outcome.success {
            println!("✓ {}", request.command_line());
            for artifact in &outcome.artifacts {
                println!("  Saved: {}", artifact.display());
            }
        } else {
            all_ok = false;
            println!("✗ {}", request.command_line());
            if let Some(error) = &outcome.error {
                println!("  {error}");
            }
        }
    }
    Ok(all_ok)
}

async fn cmd_delete(ctx: &Context, name: &str, purge: bool) -> AppResult<bool> {
    let calc = ctx.manager()?.delete(name, purge).await?;
    println!("✓ Deleted {}", calc.name);
    if purge {
        println!("  Removed {}", calc.working_directory.display());
    }
    Ok(true)
}

async fn cmd_watch(ctx: &Context) -> AppResult<bool> {
    let manager = ctx.manager()?;
    if !manager.has_backend(BackendKind::Remote) {
        return Err(AppError::BackendUnavailable(BackendKind::Remote));
    }
    let mut events = manager.subscribe();
    let monitor = Monitor::spawn(manager.clone());

    let mut all_ok = true;
    while !manager.active_remote().is_empty() {
        match events.recv().await {
            Ok(CalcEvent::StateChanged { name, change }) => {
                println!("{name}: {} -> {}", change.from, change.to);
                if change.to.is_terminal() && change.to != CalcState::Finished {
                    all_ok = false;
                }
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    monitor.shutdown().await;
    println!("No active remote calculations");
    Ok(all_ok)
}

fn cmd_catalog(ctx: &Context) -> AppResult<bool> {
    let catalog = ctx.catalog();
    for (workflow, entry) in &catalog.workflows {
        println!("{workflow}");
        let required: Vec<String> = entry.required_artifacts.iter().map(|k| k.to_string()).collect();
        println!("  Requires: {}", required.join(", "));
        let tools: Vec<String> = entry.allowed_tools.iter().map(|t| t.to_string()).collect();
        println!("  Tools: {}", tools.join(", "));
        let defaults: Vec<String> = entry.default_analysis.iter().map(|r| r.command_line()).collect();
        println!("  Default analysis: {}", defaults.join("; "));
    }
    Ok(true)
}

fn cmd_settings(ctx: &Context, cmd: SettingsCommands) -> AppResult<bool> {
    let path = qf_settings::settings_path(&ctx.base);
    match cmd {
        SettingsCommands::Show => {
            let text = serde_yaml::to_string(&ctx.settings).map_err(|e| AppError::Settings(e.to_string()))?;
            println!("# {}", path.display());
            print!("{text}");
        }
        SettingsCommands::Init { force } => {
            if path.exists() && !force {
                println!("Settings already exist at {} (use --force to overwrite)", path.display());
                return Ok(false);
            }
            qf_settings::save(&path, &Settings::default())?;
            println!("✓ Wrote {}", path.display());
        }
        SettingsCommands::Import { path: source } => {
            let settings = qf_settings::load(&source)?;
            qf_settings::save(&path, &settings)?;
            println!("✓ Imported {} into {}", source.display(), path.display());
        }
    }
    Ok(true)
}
