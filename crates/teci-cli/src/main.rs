//! teci - TE CI run orchestration CLI
//!
//! ## Commands
//!
//! - `run`: Check out, execute, archive and notify for one job definition
//! - `resolve`: Show the repository URL and revision each component resolves to
//! - `revisions`: Inspect, export or fetch `all.rev` revision snapshots
//! - `meta`: Emit a `meta_data.json` document from a revision snapshot

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn, Level};

use teci_core::{
    collect_run_metas, resolve_params, ArtifactStore, BuildSelector, Component, FsArtifactStore,
    GitCheckout, MetadataDocument, Metas, PostOutcome, ProcessTrigger, Resolver, RevisionStore,
    RunContext, RunIdentity, RunResult, SendmailMailer, Vars, PARAMS_FILE, REVISIONS_FILE,
};
use teci_pipeline::{
    ArchiveOutcome, FileLocks, LocalLocks, LockManager, Orchestrator, PipelineConfig, RunReport,
    RunStatistics, Services, StageRecord, TriggeredRun,
};

#[derive(Parser)]
#[command(name = "teci")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Checkout, run, archive and notify orchestration for TE test runs", long_about = None)]
struct Cli {
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
    /// Run a job definition end to end
    Run(RunArgs),

    /// Show what each component resolves to for the given parameters
    Resolve {
        /// Components to resolve
        #[arg(required = true)]
        components: Vec<String>,

        /// Run parameter (repeatable)
        #[arg(short, long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// Revision snapshot whose entries seed the run context
        #[arg(long)]
        revisions: Option<PathBuf>,

        /// Invoking user, substituted for __USER__ in URLs
        #[arg(long, env = "TECI_USER")]
        user: Option<String>,
    },

    /// Inspect revision snapshots
    Revisions {
        #[command(subcommand)]
        action: RevisionsAction,
    },

    /// Emit a metadata document
    Meta {
        /// Revision snapshot to take `_REV` / `_BRANCH` metas from
        #[arg(long, default_value = REVISIONS_FILE)]
        revisions: PathBuf,

        /// Fixed meta (repeatable)
        #[arg(long = "meta", value_parser = parse_key_val)]
        metas: Vec<(String, String)>,

        /// Meta filled from the environment (repeatable)
        #[arg(long = "lookup")]
        lookups: Vec<String>,

        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Job definition (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Job name (default: `job` from the definition, else the file stem)
    #[arg(long)]
    job: Option<String>,

    /// Build number (default: one past the last archived build)
    #[arg(long, env = "TECI_BUILD")]
    build: Option<u64>,

    /// Build display name (default: #<build>)
    #[arg(long)]
    display_name: Option<String>,

    /// Run parameter (repeatable)
    #[arg(short, long = "param", value_parser = parse_key_val)]
    params: Vec<(String, String)>,

    /// Workspace directory
    #[arg(short, long, env = "TECI_WORKSPACE", default_value = ".")]
    workspace: PathBuf,

    /// Artifact store root
    #[arg(long, env = "TECI_ARTIFACTS", default_value = ".teci/artifacts")]
    artifacts: PathBuf,

    /// Directory holding `<job>.toml` definitions of downstream jobs
    /// (default: the directory of --config)
    #[arg(long, env = "TECI_JOBS_DIR")]
    jobs_dir: Option<PathBuf>,

    /// Root of the workspaces of triggered jobs, each run in <root>/<job>
    /// (default: the parent of --workspace)
    #[arg(long, env = "TECI_JOBS_WORKSPACE")]
    jobs_workspace: Option<PathBuf>,

    /// Lock directory shared by concurrent runs (default: <artifacts>/locks)
    #[arg(long, env = "TECI_LOCKS_DIR")]
    locks_dir: Option<PathBuf>,

    /// Hold locks in this process only
    #[arg(long, conflicts_with = "locks_dir")]
    local_locks: bool,

    /// Invoking user, substituted for __USER__
    #[arg(long, env = "TECI_USER")]
    user: Option<String>,

    /// Run URL shown in notifications
    #[arg(long, env = "TECI_URL")]
    url: Option<String>,

    /// Host name shown in notifications
    #[arg(long, env = "TECI_HOST")]
    host: Option<String>,

    /// Mail transfer program, invoked as `<program> -t`
    #[arg(long, env = "TECI_SENDMAIL", default_value = "sendmail")]
    sendmail: String,

    /// Sender used when the job definition sets none
    #[arg(long, env = "TECI_MAIL_FROM", default_value = "teci@localhost")]
    mail_from: String,

    /// Write the run report as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Subcommand)]
enum RevisionsAction {
    /// Print every entry of a snapshot
    Show {
        /// Snapshot file
        #[arg(default_value = REVISIONS_FILE)]
        file: PathBuf,

        /// Only this component
        #[arg(long)]
        component: Option<String>,
    },

    /// Print entries as shell `export` lines
    Export {
        /// Snapshot file
        #[arg(default_value = REVISIONS_FILE)]
        file: PathBuf,

        /// Only this component
        #[arg(long)]
        component: Option<String>,

        /// Also export keys already set in the environment
        #[arg(long)]
        force: bool,
    },

    /// Fetch the snapshot archived by a job
    Fetch {
        /// Job name
        job: String,

        /// Build number (default: last successful)
        #[arg(long)]
        build: Option<u64>,

        /// Artifact store root
        #[arg(long, env = "TECI_ARTIFACTS", default_value = ".teci/artifacts")]
        artifacts: PathBuf,

        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
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
    teci_core::init_tracing(cli.json, level);

    // The only read of the process environment.
    let env: Vars = std::env::vars().collect();

    match cli.command {
        Commands::Run(args) => cmd_run(args, env).await,
        Commands::Resolve {
            components,
            params,
            revisions,
            user,
        } => cmd_resolve(&components, params, revisions.as_deref(), user, env),
        Commands::Revisions { action } => match action {
            RevisionsAction::Show { file, component } => {
                cmd_revisions_show(&file, component.as_deref())
            }
            RevisionsAction::Export {
                file,
                component,
                force,
            } => cmd_revisions_export(&file, component.as_deref(), force, &env),
            RevisionsAction::Fetch {
                job,
                build,
                artifacts,
                output,
            } => cmd_revisions_fetch(&artifacts, &job, build, output.as_deref()).await,
        },
        Commands::Meta {
            revisions,
            metas,
            lookups,
            output,
        } => cmd_meta(&revisions, metas, &lookups, output.as_deref(), &env),
    }
}

/// Parse a `KEY=VALUE` argument.
fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
    if key.is_empty() {
        return Err(format!("empty key in {s:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn job_name(args: &RunArgs, config: &PipelineConfig) -> Result<String> {
    args.job
        .clone()
        .or_else(|| config.job.clone())
        .or_else(|| {
            args.config
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
        })
        .context("Cannot determine job name; pass --job")
}

/// Parameters of the previous build, for sticky parameters. Falls back to
/// the last successful build; anything unreadable counts as no parameters.
async fn previous_params(artifacts: &dyn ArtifactStore, job: &str, build: u64) -> Vars {
    let mut selectors = Vec::new();
    if build > 1 {
        selectors.push(BuildSelector::Build(build - 1));
    }
    selectors.push(BuildSelector::LastSuccessful);

    for selector in selectors {
        let fetched = artifacts.fetch(job, PARAMS_FILE, selector).await;
        match fetched {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(params) => return params,
                Err(e) => debug!(job = %job, ?selector, error = %e, "unreadable previous params"),
            },
            Err(e) => debug!(job = %job, ?selector, error = %e, "no previous params"),
        }
    }
    Vars::new()
}

async fn cmd_run(args: RunArgs, env: Vars) -> Result<()> {
    let config = PipelineConfig::from_file(&args.config)?;
    let job = job_name(&args, &config)?;

    let artifacts = Arc::new(
        FsArtifactStore::new(&args.artifacts)
            .with_context(|| format!("Failed to open artifact store {:?}", args.artifacts))?,
    );
    let build = match args.build {
        Some(build) => build,
        None => artifacts.next_build(&job)?,
    };

    std::fs::create_dir_all(&args.workspace)
        .with_context(|| format!("Failed to create workspace {:?}", args.workspace))?;
    let workspace = args.workspace.canonicalize()?;

    let supplied: Vars = args.params.iter().cloned().collect();
    let previous = previous_params(artifacts.as_ref(), &job, build).await;
    let params = resolve_params(&config.params, &supplied, &previous);

    let user = args.user.clone().or_else(|| env.get("USER").cloned());
    let host = args
        .host
        .clone()
        .or_else(|| env.get("HOSTNAME").cloned())
        .unwrap_or_else(|| "localhost".to_string());

    let mut identity = RunIdentity::new(job.clone(), build, workspace.clone());
    identity.display_name = args.display_name.clone();
    identity.url = args.url.clone();
    identity.host = host;

    let jobs_dir = match &args.jobs_dir {
        Some(dir) => dir.clone(),
        None => args
            .config
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    let jobs_workspace = match &args.jobs_workspace {
        Some(dir) => dir.clone(),
        None => workspace
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| workspace.clone()),
    };
    let program = std::env::current_exe().context("Cannot locate the teci executable")?;

    let locks: Arc<dyn LockManager> = if args.local_locks {
        Arc::new(LocalLocks::new())
    } else {
        let dir = args
            .locks_dir
            .clone()
            .unwrap_or_else(|| args.artifacts.join("locks"));
        Arc::new(FileLocks::new(dir))
    };

    let services = Services {
        checkout: Arc::new(GitCheckout::new()),
        artifacts,
        mailer: Arc::new(SendmailMailer::new(&args.sendmail, &args.mail_from)),
        trigger: Arc::new(ProcessTrigger::new(program, jobs_dir, jobs_workspace)),
        locks,
        nodes: Arc::new(config.nodes.clone()),
    };

    println!("Running job {} {}", job, identity.display_name());
    println!("Configuration: {}", config.configuration);
    println!("Workspace: {:?}", workspace);
    println!();

    let orchestrator = Orchestrator::new(config, services);
    let (report, fatal) = match orchestrator
        .run_until(identity, RunContext::new(params, env, user), shutdown_signal())
        .await
    {
        Ok(report) => (report, None),
        Err(aborted) => (*aborted.report, Some(aborted.error)),
    };

    print_report(&report);

    if let Some(path) = &args.report {
        write_report(path, &job, build, &report)?;
    }

    if let Some(error) = fatal {
        return Err(error.context("Run aborted"));
    }
    if !report.result.is_success() {
        anyhow::bail!("Run finished with result {}", report.result);
    }
    Ok(())
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Ctrl-C received; aborting run"),
        _ = terminate => info!("SIGTERM received; aborting run"),
    }
}

fn write_report(path: &Path, job: &str, build: u64, report: &RunReport) -> Result<()> {
    let summary = ReportSummary::new(job, build, report);
    std::fs::write(path, serde_json::to_string_pretty(&summary)?)
        .with_context(|| format!("Failed to write report to {:?}", path))
}

fn print_report(report: &RunReport) {
    println!("Run ID: {}", report.run_id);
    let status = if report.result.is_success() {
        "✓"
    } else {
        "✗"
    };
    println!("Result: {} {}", status, report.result);
    println!("Duration: {}ms", report.duration_ms);
    println!();

    for record in &report.stages {
        let status = if record.ok { "✓" } else { "✗" };
        match &record.detail {
            Some(detail) => println!("  {} {} ({})", status, record.stage, detail),
            None => println!("  {} {}", status, record.stage),
        }
    }
    if let Some(action) = &report.action {
        println!();
        println!(
            "Action {}: exit code {} ({}ms)",
            action.stage_name, action.exit_code, action.duration_ms
        );
    }

    if !report.revisions.is_empty() {
        println!();
        println!("Revisions:");
        for (component, key, value) in report.revisions.iter() {
            println!("  {:<10} {}={}", component, key, value);
        }
    }

    for run in &report.triggered {
        let outcome = match (&run.outcome, &run.error) {
            (Some(outcome), _) => format!("{:?}", outcome),
            (None, Some(error)) => format!("failed: {}", error),
            (None, None) => "not started".to_string(),
        };
        println!("Triggered {}: {}", run.job, outcome);
    }

    let failed = report.failed_stages();
    println!();
    println!(
        "Summary: {}/{} stages ok",
        report.stages.len() - failed.len(),
        report.stages.len()
    );
}

/// JSON form of a run report.
#[derive(Serialize)]
struct ReportSummary<'a> {
    job: &'a str,
    build: u64,
    run_id: &'a str,
    result: RunResult,
    duration_ms: u64,
    stages: &'a [StageRecord],
    statistics: Option<&'a RunStatistics>,
    revisions: &'a RevisionStore,
    metadata: Option<&'a MetadataDocument>,
    params: &'a Vars,
    archive: Option<&'a ArchiveOutcome>,
    triggered: &'a [TriggeredRun],
    notification: Option<&'static str>,
    error: Option<&'a str>,
}

impl<'a> ReportSummary<'a> {
    fn new(job: &'a str, build: u64, report: &'a RunReport) -> Self {
        Self {
            job,
            build,
            run_id: &report.run_id,
            result: report.result,
            duration_ms: report.duration_ms,
            stages: &report.stages,
            statistics: report.statistics.as_ref(),
            revisions: &report.revisions,
            metadata: report.metadata.as_ref(),
            params: &report.params,
            archive: report.archive.as_ref(),
            triggered: &report.triggered,
            notification: report.notification.map(|outcome| match outcome {
                PostOutcome::Sent => "sent",
                PostOutcome::Skipped => "skipped",
            }),
            error: report.error.as_deref(),
        }
    }
}

fn cmd_resolve(
    components: &[String],
    params: Vec<(String, String)>,
    revisions: Option<&Path>,
    user: Option<String>,
    env: Vars,
) -> Result<()> {
    let user = user.or_else(|| env.get("USER").cloned());
    let mut ctx = RunContext::new(params.into_iter().collect(), env, user);
    if let Some(path) = revisions {
        let store = RevisionStore::load(path);
        let written = store.export_to(&mut ctx.context, false, None, None);
        debug!(path = %path.display(), written, "seeded context from snapshot");
    }

    let resolver = Resolver::new(&ctx);
    for name in components {
        let component = Component::new(name.as_str())?;
        let url = resolver
            .resolve_url(&component, None)
            .unwrap_or_else(|| "(no url)".to_string());
        let revision = resolver.resolve_revision(&component, None);
        println!("{:<10} {} {}", component.as_str(), url, revision);
    }
    Ok(())
}

fn cmd_revisions_show(file: &Path, component: Option<&str>) -> Result<()> {
    let store = RevisionStore::load(file);
    if store.is_empty() {
        println!("No revisions in {:?}", file);
        return Ok(());
    }
    for (name, key, value) in store.iter() {
        if component.is_some_and(|c| c != name) {
            continue;
        }
        println!("{:<10} {}={}", name, key, value);
    }
    Ok(())
}

/// Shell `export` lines for the entries of `store` that `export_to` would
/// write into `env`.
fn export_lines(
    store: &RevisionStore,
    component: Option<&str>,
    force: bool,
    env: &Vars,
) -> Vec<String> {
    let mut sink = env.clone();
    store.export_to(&mut sink, force, component, None);

    let mut lines = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    for (name, key, _) in store.iter() {
        if component.is_some_and(|c| c != name) || !seen.insert(key) {
            continue;
        }
        if let Some(value) = sink.get(key).filter(|v| env.get(key) != Some(*v)) {
            lines.push(format!("export {}={}", key, shell_quote(value)));
        }
    }
    lines
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn cmd_revisions_export(
    file: &Path,
    component: Option<&str>,
    force: bool,
    env: &Vars,
) -> Result<()> {
    let store = RevisionStore::load(file);
    for line in export_lines(&store, component, force, env) {
        println!("{}", line);
    }
    Ok(())
}

async fn cmd_revisions_fetch(
    artifacts: &Path,
    job: &str,
    build: Option<u64>,
    output: Option<&Path>,
) -> Result<()> {
    let store = FsArtifactStore::new(artifacts)
        .with_context(|| format!("Failed to open artifact store {:?}", artifacts))?;
    let selector = build.map_or(BuildSelector::LastSuccessful, BuildSelector::Build);
    let bytes = store
        .fetch(job, REVISIONS_FILE, selector)
        .await
        .with_context(|| format!("No revision snapshot for {} ({:?})", job, selector))?;

    match output {
        Some(path) => {
            std::fs::write(path, &bytes)
                .with_context(|| format!("Failed to write to {:?}", path))?;
            println!("Revisions written to {:?}", path);
        }
        None => println!("{}", String::from_utf8_lossy(&bytes)),
    }
    Ok(())
}

/// Metas for `meta`: revision metas, then fixed metas, then lookups.
fn collect_metas(
    store: &RevisionStore,
    metas: Vec<(String, String)>,
    lookups: &[String],
) -> Metas {
    let fixed = metas.into_iter().map(|(key, value)| (key, Some(value)));
    let lookups = lookups.iter().map(|key| (key.clone(), None));
    collect_run_metas(store, Metas::new(), fixed.chain(lookups))
}

fn cmd_meta(
    revisions: &Path,
    metas: Vec<(String, String)>,
    lookups: &[String],
    output: Option<&Path>,
    env: &Vars,
) -> Result<()> {
    let store = RevisionStore::load(revisions);
    let doc = MetadataDocument::emit(&collect_metas(&store, metas, lookups), &[env]);

    match output {
        Some(path) => {
            doc.write(path)
                .with_context(|| format!("Failed to write to {:?}", path))?;
            println!("{} metas written to {:?}", doc.metas.len(), path);
        }
        None => println!("{}", doc.to_json()?),
    }
    Ok(())
}
