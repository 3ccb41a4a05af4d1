use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wikimove_core::backlinks::BatchReport;
use wikimove_core::config::{WikiConfig, load_config};
use wikimove_core::engine::{EngineSettings, MoveEngine, RedirectFixReport, RunReport};
use wikimove_core::error::Issue;
use wikimove_core::jobs::{JOB_REGISTRY, Job, JobKind, load_job, namespace_id};
use wikimove_core::local::LocalSite;
use wikimove_core::mediawiki::MediaWikiClient;
use wikimove_core::registry::ActionKind;
use wikimove_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, RuntimeStatus, init_layout,
    normalize_for_display, resolve_paths,
};
use wikimove_core::site::{BacklinkKind, WikiRead, WikiWrite};
use wikimove_core::state::RunState;
use wikimove_core::title::{NamespaceTable, Title};

#[derive(Debug, Parser)]
#[command(
    name = "wikimove",
    version,
    about = "Bulk page moves and link rewriting for MediaWiki sites"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Log at debug level (RUST_LOG wins when set)")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    #[command(about = "List the registered job kinds")]
    Jobs,
    #[command(about = "Resolve a job file and print the decisions without writing")]
    Plan(PlanArgs),
    #[command(about = "Execute a job file")]
    Run(RunArgs),
    Redirects(RedirectsArgs),
    Index(IndexArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite existing config and sample job files")]
    force: bool,
    #[arg(long, help = "Skip writing .wikimove/config.toml")]
    no_config: bool,
    #[arg(long, help = "Skip writing jobs/example-move.toml")]
    no_sample_job: bool,
}

#[derive(Debug, Args)]
struct PlanArgs {
    job: PathBuf,
    #[arg(long, help = "Plan against the local mirror instead of the live wiki")]
    local: bool,
    #[arg(long, help = "Print the plan as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct RunArgs {
    job: PathBuf,
    #[arg(long, help = "Continue an interrupted run from its saved state")]
    resume: bool,
    #[arg(long, help = "Compute every edit and print diffs without saving")]
    dry_run: bool,
    #[arg(long, help = "Run against the local mirror instead of the live wiki")]
    local: bool,
    #[arg(long, help = "Print the run report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct RedirectsArgs {
    #[command(subcommand)]
    command: RedirectsSubcommand,
}

#[derive(Debug, Subcommand)]
enum RedirectsSubcommand {
    #[command(about = "Point double redirects at the end of their chain")]
    Fix {
        #[arg(long)]
        local: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(
            short = 'n',
            long = "namespace",
            value_name = "NAMESPACE",
            help = "Namespace to scan (repeatable; defaults to [engine].redirect_namespaces)"
        )]
        namespaces: Vec<String>,
    },
}

#[derive(Debug, Args)]
struct IndexArgs {
    #[command(subcommand)]
    command: IndexSubcommand,
}

#[derive(Debug, Subcommand)]
enum IndexSubcommand {
    Rebuild,
    Backlinks { title: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Jobs) => run_jobs(),
        Some(Commands::Plan(args)) => run_plan(&runtime, args),
        Some(Commands::Run(args)) => run_job(&runtime, args),
        Some(Commands::Redirects(RedirectsArgs { command })) => match command {
            RedirectsSubcommand::Fix {
                local,
                dry_run,
                namespaces,
            } => run_redirects_fix(&runtime, local, dry_run, &namespaces),
        },
        Some(Commands::Index(IndexArgs { command })) => match command {
            IndexSubcommand::Rebuild => run_index_rebuild(&runtime),
            IndexSubcommand::Backlinks { title } => run_index_backlinks(&runtime, &title),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Installs the stderr subscriber; returns false when one was already installed.
fn init_tracing(verbose: bool) -> bool {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    match tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
    {
        Ok(()) => true,
        Err(error) => {
            eprintln!("logging not initialized: {error}");
            false
        }
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            sample_job: !args.no_sample_job,
            force: args.force,
        },
    )?;

    println!("Initialized wikimove runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("wiki_content: {}", normalize_path(&paths.wiki_content_dir));
    println!("jobs_dir: {}", normalize_path(&paths.jobs_dir));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", format_flag(report.wrote_config));
    println!("wrote_sample_job: {}", format_flag(report.wrote_sample_job));
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_jobs() -> Result<()> {
    println!("jobs");
    println!("jobs.count: {}", JOB_REGISTRY.len());
    for descriptor in JOB_REGISTRY {
        println!("jobs.kind: {} ({})", descriptor.id, descriptor.description);
    }
    Ok(())
}

fn run_plan(runtime: &RuntimeOptions, args: PlanArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let namespaces = config.namespace_table();
    let job = load_job(&args.job, &namespaces)?;
    let settings = engine_settings(&config, &namespaces, &job, true)?;
    let engine = MoveEngine::new(&namespaces, settings);

    if job.kind == JobKind::FixDoubleRedirects {
        bail!(
            "{} jobs have no plan; use `wikimove run --dry-run {}`",
            job.kind.as_str(),
            normalize_path(&args.job)
        );
    }
    let mut site = open_site(&paths, &config, args.local)?;
    let plan = engine.plan(site.as_mut(), &job)?;

    if args.json {
        let payload = serde_json::json!({
            "job": job.id,
            "kind": job.kind.as_str(),
            "replacements": plan.registry.values().collect::<Vec<_>>(),
            "issues": plan.issues,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("plan");
    println!("job: {} ({})", job.id, job.kind.as_str());
    println!("site: {}", site_label(args.local));
    println!("replacements.count: {}", plan.registry.len());
    for action in [
        ActionKind::Move,
        ActionKind::EditOnly,
        ActionKind::CustomMove,
        ActionKind::Skip,
    ] {
        println!("replacements.{}: {}", action.as_str(), plan.count(action));
    }
    for entry in plan.registry.values() {
        println!(
            "replacement: {} -> {} [{}] {}",
            entry.from,
            entry.to,
            entry.action.map_or("unresolved", ActionKind::as_str),
            entry.reason.as_deref().unwrap_or_default()
        );
    }
    print_issues(&plan.issues);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_job(runtime: &RuntimeOptions, args: RunArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let namespaces = config.namespace_table();
    let job = load_job(&args.job, &namespaces)?;
    let settings = engine_settings(&config, &namespaces, &job, args.dry_run)?;
    let engine = MoveEngine::new(&namespaces, settings);
    let mut site = open_site(&paths, &config, args.local)?;

    if job.kind == JobKind::FixDoubleRedirects {
        let scanned = if job.redirect_namespaces.is_empty() {
            config.engine.redirect_namespaces.clone()
        } else {
            job.redirect_namespaces.clone()
        };
        let report = engine.fix_double_redirects(site.as_mut(), &scanned)?;
        return print_redirect_fix(runtime, &paths, &report, args.dry_run, args.json);
    }

    // A dry run reads earlier state without discarding it.
    let mut state = RunState::open(&paths.state_dir, &job.id, args.resume || args.dry_run)?;
    info!(job = %job.id, kind = job.kind.as_str(), dry_run = args.dry_run, "starting run");
    let report = engine.run(site.as_mut(), &job, &mut state)?;

    if args.json {
        let payload = serde_json::json!({
            "job": report.job_id,
            "dry_run": report.dry_run,
            "cancelled": report.cancelled,
            "moved": report.moved,
            "replacements": report.registry.values().collect::<Vec<_>>(),
            "rewrite": batch_summary(&report.rewrite),
            "follow_ups": report
                .follow_ups
                .iter()
                .map(|(name, batch)| serde_json::json!({ "name": name, "pages": batch_summary(batch) }))
                .collect::<Vec<_>>(),
            "issues": report.all_issues(),
            "report_path": report.report_path.as_deref().map(normalize_path),
            "requests": report.requests,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    print_run_report(&report, args.local, &state);
    print_diagnostics(runtime, &paths);
    if report.cancelled {
        bail!("run cancelled; continue with `wikimove run --resume {}`", normalize_path(&args.job));
    }
    Ok(())
}

fn run_redirects_fix(
    runtime: &RuntimeOptions,
    local: bool,
    dry_run: bool,
    namespaces: &[String],
) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let table = config.namespace_table();
    let scanned = if namespaces.is_empty() {
        config.engine.redirect_namespaces.clone()
    } else {
        namespaces
            .iter()
            .map(|value| namespace_id(value, &table))
            .collect::<Result<Vec<_>, _>>()?
    };
    let settings = EngineSettings::from_config(&config, &table)?.with_dry_run(dry_run);
    let engine = MoveEngine::new(&table, settings);
    let mut site = open_site(&paths, &config, local)?;
    let report = engine.fix_double_redirects(site.as_mut(), &scanned)?;
    print_redirect_fix(runtime, &paths, &report, dry_run, false)
}

fn run_index_rebuild(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    RuntimeStatus::inspect(&paths).require_local_mirror(&paths)?;
    let config = load_config(&paths.config_path)?;

    let mut site = LocalSite::open(
        &paths.wiki_content_dir,
        &paths.db_path,
        config.namespace_table(),
    )?;
    let report = site.rebuild_index()?;

    println!("index rebuild");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("db_path: {}", report.db_path);
    println!("indexed_pages: {}", report.pages);
    println!("indexed_links: {}", report.links);
    println!("indexed_redirects: {}", report.redirects);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_index_backlinks(runtime: &RuntimeOptions, title: &str) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let normalized_title = title.trim();

    println!("index backlinks");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("target: {normalized_title}");
    if normalized_title.is_empty() {
        bail!("index backlinks requires a non-empty title");
    }
    if !paths.db_path.exists() {
        println!("index.storage: <not built> (run `wikimove index rebuild`)");
        print_diagnostics(runtime, &paths);
        return Ok(());
    }

    let config = load_config(&paths.config_path)?;
    let namespaces = config.namespace_table();
    let target = Title::parse(normalized_title, &namespaces)
        .with_context(|| format!("invalid title `{normalized_title}`"))?;
    let mut site = LocalSite::open(&paths.wiki_content_dir, &paths.db_path, namespaces)?;
    for kind in [
        BacklinkKind::Link,
        BacklinkKind::Transclusion,
        BacklinkKind::FileUsage,
        BacklinkKind::Redirect,
    ] {
        let sources = site.backlinks(&target, &[kind])?;
        println!("backlinks.{}.count: {}", kind.as_str(), sources.len());
        for source in sources {
            println!("backlinks.{}: {source}", kind.as_str());
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn engine_settings(
    config: &WikiConfig,
    namespaces: &NamespaceTable,
    job: &Job,
    dry_run: bool,
) -> Result<EngineSettings> {
    let mut settings = EngineSettings::from_config(config, namespaces)?.with_dry_run(dry_run);
    if let Some(summary) = &job.summary {
        settings.summary = summary.clone();
        settings.move_options.reason = summary.clone();
    }
    if let Some(minor) = job.minor {
        settings.minor = minor;
    }
    Ok(settings)
}

fn open_site(paths: &ResolvedPaths, config: &WikiConfig, local: bool) -> Result<Box<dyn WikiWrite>> {
    if local {
        RuntimeStatus::inspect(paths).require_local_mirror(paths)?;
        let mut site = LocalSite::open(
            &paths.wiki_content_dir,
            &paths.db_path,
            config.namespace_table(),
        )?;
        site.ensure_index()?;
        return Ok(Box::new(site));
    }

    let mut client = MediaWikiClient::from_config(config)?;
    match config.bot_credentials() {
        Some((user, pass)) => {
            client
                .login(&user, &pass)
                .with_context(|| format!("failed to log in as {user}"))?;
            info!(user = %user, "logged in");
        }
        None => warn!("WIKI_BOT_USER/WIKI_BOT_PASS not set; editing anonymously"),
    }
    Ok(Box::new(client))
}

fn print_run_report(report: &RunReport, local: bool, state: &RunState) {
    println!("run");
    println!("job: {}", report.job_id);
    println!("site: {}", site_label(local));
    println!("dry_run: {}", format_flag(report.dry_run));
    println!("replacements.count: {}", report.registry.len());
    println!("moved.count: {}", report.moved.len());
    for title in &report.moved {
        if let Some(entry) = report.registry.get(title) {
            println!("moved: {} -> {}", entry.from, entry.to);
        }
    }
    print_batch("rewrite", &report.rewrite);
    for (name, batch) in &report.follow_ups {
        print_batch(name, batch);
    }
    println!("state.dir: {}", normalize_path(state.dir()));
    println!("state.rewritten_pages: {}", state.rewritten_count());
    match &report.report_path {
        Some(path) => println!("report_path: {}", normalize_path(path)),
        None => println!("report_path: <none>"),
    }
    println!("requests: {}", report.requests);
    println!("cancelled: {}", format_flag(report.cancelled));
    print_issues(&report.all_issues());
    if report.dry_run {
        print_diffs(&report.diffs);
        if let Some(text) = &report.report {
            println!("\n[report]\n{text}");
        }
    }
}

fn print_redirect_fix(
    runtime: &RuntimeOptions,
    paths: &ResolvedPaths,
    report: &RedirectFixReport,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    if json {
        let payload = serde_json::json!({
            "dry_run": dry_run,
            "scanned": report.scanned,
            "double_redirects": report.double_redirects,
            "pages": batch_summary(&report.batch),
            "issues": report.issues,
            "requests": report.requests,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("redirects fix");
    println!("dry_run: {}", format_flag(dry_run));
    println!("redirects.scanned: {}", report.scanned);
    println!("redirects.double: {}", report.double_redirects);
    print_batch("retarget", &report.batch);
    println!("requests: {}", report.requests);
    print_issues(&report.issues);
    if dry_run {
        print_diffs(&report.diffs);
    }
    print_diagnostics(runtime, paths);
    Ok(())
}

fn print_batch(prefix: &str, batch: &BatchReport) {
    println!("{prefix}.pages: {}", batch.results.len());
    for label in ["saved", "would_save", "unchanged", "missing", "failed"] {
        let count = batch.count(label);
        if count > 0 {
            println!("{prefix}.{label}: {count}");
        }
    }
    if batch.cancelled {
        println!("{prefix}.cancelled: yes");
    }
}

fn batch_summary(batch: &BatchReport) -> serde_json::Value {
    serde_json::json!({
        "pages": batch.results.len(),
        "saved": batch.count("saved"),
        "would_save": batch.count("would_save"),
        "unchanged": batch.count("unchanged"),
        "missing": batch.count("missing"),
        "failed": batch.count("failed"),
        "cancelled": batch.cancelled,
    })
}

fn print_issues(issues: &[Issue]) {
    println!("issues.count: {}", issues.len());
    for issue in issues {
        println!("issue: {issue}");
    }
}

fn print_diffs(diffs: &[(Title, String)]) {
    for (title, diff) in diffs {
        println!("\n[diff] {title}\n{diff}");
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
        for warning in RuntimeStatus::inspect(paths).warnings {
            println!("warning: {warning}");
        }
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists()
        && let Err(error) = dotenvy::from_path_override(&project_env)
    {
        warn!(path = %normalize_path(&project_env), "ignoring unreadable .env: {error}");
    }

    resolve_paths(&context, &overrides)
}

fn site_label(local: bool) -> &'static str {
    if local { "local mirror" } else { "live wiki" }
}

fn normalize_path(path: &Path) -> String {
    normalize_for_display(path)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn second_tracing_init_is_reported() {
        init_tracing(false);
        assert!(!init_tracing(true));
    }
}
