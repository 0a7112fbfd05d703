use std::fmt::Display;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{CommandFactory, Parser};
use clap_complete::generate;
use colored::Colorize;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use patchline_core::{
    discover, Config, DiscoveryOptions, NpmRegistry, PatchlineError, PathEnv, PluginSpec,
    Reconciler, Result, SnapshotStore, Status, SyncAction, UpgradeOutcome, UpgradeRequest,
};

mod args;
use args::{upgrade_mode, Cli, Commands, ConfigAction, PathArgs, Shell};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let base_dir = resolve_base_dir(cli.base_dir);
    debug!(base_dir = %base_dir.display(), "resolved settings directory");

    let result = match cli.command {
        Some(Commands::Config { action }) => handle_config(action, &base_dir),
        Some(Commands::Completions { shell }) => {
            handle_completions(shell);
            Ok(())
        }
        Some(command) => Context::load(&base_dir, cli.paths, cli.quiet)
            .and_then(|ctx| dispatch(&ctx, command)),
        None => {
            Cli::command().print_help().ok();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "[ERROR]".red().bold(), e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn dispatch(ctx: &Context, command: Commands) -> Result<()> {
    match command {
        Commands::List => handle_list(ctx),
        Commands::Outdated => handle_outdated(ctx),
        Commands::Sync { dry_run } => handle_sync(ctx, dry_run),
        Commands::Upgrade {
            name,
            all,
            to,
            major,
            minor,
            patch,
        } => handle_upgrade(
            ctx,
            UpgradeRequest {
                name,
                all,
                target: to,
                mode: upgrade_mode(major, minor, patch),
            },
        ),
        Commands::Rollback { name } => handle_rollback(ctx, &name),
        Commands::Snapshot => handle_snapshot(ctx),
        Commands::History { name } => handle_history(ctx, name.as_deref()),
        Commands::Config { .. } | Commands::Completions { .. } => Ok(()),
    }
}

/// `RUST_LOG` wins; otherwise -v gives debug, -q gives error, default warn.
fn init_tracing(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();
}

fn resolve_base_dir(cli_base: Option<PathBuf>) -> PathBuf {
    if let Some(base) = cli_base {
        return base;
    }

    if let Some(base) = std::env::var_os("PATCHLINE_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(base);
    }

    dirs::config_dir()
        .map(|d| d.join("patchline"))
        .unwrap_or_else(|| PathBuf::from(".patchline"))
}

/// Resolved inputs for one invocation.
struct Context {
    env: PathEnv,
    settings: Config,
    paths: PathArgs,
    quiet: bool,
}

impl Context {
    fn load(base_dir: &Path, paths: PathArgs, quiet: bool) -> Result<Self> {
        Ok(Self {
            env: PathEnv::from_process(),
            settings: Config::load(base_dir)?,
            paths,
            quiet,
        })
    }

    fn note(&self, message: impl Display) {
        if !self.quiet {
            eprintln!("{} {}", "Warning:".yellow(), message);
        }
    }

    fn offline(&self) -> bool {
        self.paths.offline || self.settings.registry.offline
    }

    fn discover(&self) -> Result<Vec<PluginSpec>> {
        let opts = DiscoveryOptions {
            project_root: self.paths.project.clone(),
            global_config: self.paths.global_config.clone(),
            local_dirs: self.paths.local_dirs.clone(),
            ..DiscoveryOptions::default()
        }
        .with_env_overrides(&self.env);
        discover(&opts, &self.env)
    }

    /// Existing cache directory, or `None` with a warning.
    fn cache_dir(&self) -> Option<PathBuf> {
        let override_dir = self
            .paths
            .cache_dir
            .clone()
            .or_else(|| self.settings.paths.cache_dir.clone());
        let (found, candidates) = self.env.resolve_cache_dir(override_dir.as_deref());

        match found {
            Some(dir) if dir.is_dir() => {
                debug!(cache_dir = %dir.display(), "using cache directory");
                Some(dir)
            }
            Some(dir) => {
                self.note(format!("cache directory not found: {}", dir.display()));
                None
            }
            None => {
                if !candidates.is_empty() {
                    let checked: Vec<String> =
                        candidates.iter().map(|c| c.display().to_string()).collect();
                    self.note(format!(
                        "cache directory not found. Checked: {}",
                        checked.join(", ")
                    ));
                }
                None
            }
        }
    }

    fn snapshot_store(&self) -> Result<SnapshotStore> {
        let override_dir = self
            .paths
            .snapshot_dir
            .clone()
            .or_else(|| self.settings.paths.snapshot_dir.clone());
        let (found, _) = self.env.resolve_snapshot_dir(override_dir.as_deref());
        let dir = found.ok_or_else(|| PatchlineError::InvalidInput {
            message: "snapshot directory not found; pass --snapshot-dir".to_string(),
        })?;
        debug!(snapshot_dir = %dir.display(), "using snapshot directory");
        Ok(SnapshotStore::new(dir))
    }

    fn registry(&self) -> Result<NpmRegistry> {
        NpmRegistry::new(
            &self.settings.registry.url,
            Duration::from_secs(self.settings.registry.timeout_secs),
        )
    }
}

fn paint_status(status: Status, cell: String) -> String {
    match status {
        Status::Ok => cell.green().to_string(),
        Status::Missing => cell.red().to_string(),
        Status::Mismatch | Status::Outdated => cell.yellow().to_string(),
        Status::Unmanaged | Status::Unknown => cell.dimmed().to_string(),
    }
}

/// Aligned table. Cells are padded before coloring so escapes do not skew widths.
fn print_table(headers: &[&str], rows: &[(Status, Vec<String>)], status_col: usize) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for (_, cells) in rows {
        for (i, cell) in cells.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let header: Vec<String> = headers
        .iter()
        .zip(&widths)
        .map(|(h, w)| format!("{:<w$}", h, w = w))
        .collect();
    println!("{}", header.join("  ").trim_end().bold());

    for (status, cells) in rows {
        let line: Vec<String> = cells
            .iter()
            .zip(&widths)
            .enumerate()
            .map(|(i, (cell, w))| {
                let padded = format!("{:<w$}", cell, w = w);
                if i == status_col {
                    paint_status(*status, padded)
                } else {
                    padded
                }
            })
            .collect();
        println!("{}", line.join("  "));
    }
}

fn comments_note(ctx: &Context) {
    if !ctx.quiet {
        println!(
            "{}",
            "Note: comments in rewritten config files are not preserved.".dimmed()
        );
    }
}

fn handle_list(ctx: &Context) -> Result<()> {
    let specs = ctx.discover()?;
    let cache_dir = ctx.cache_dir();
    let no_cache = cache_dir.is_none();
    let reconciler = Reconciler::new(cache_dir, ctx.snapshot_store()?);
    let reports = reconciler.list(&specs)?;

    if reports.is_empty() {
        println!("No plugins declared.");
        return Ok(());
    }

    let rows: Vec<(Status, Vec<String>)> = reports
        .iter()
        .map(|r| {
            (
                r.status,
                vec![
                    r.name.clone(),
                    r.declared.clone(),
                    r.installed.clone(),
                    r.status.to_string(),
                    r.source.to_string(),
                ],
            )
        })
        .collect();
    print_table(
        &["NAME", "DECLARED", "INSTALLED", "STATUS", "SOURCE"],
        &rows,
        3,
    );

    if !ctx.quiet {
        if no_cache {
            println!();
            println!("Cache directory not found; installed versions show as missing.");
        }
        if reports.iter().any(|r| r.status == Status::Unmanaged) {
            println!();
            println!("Local plugins are unmanaged.");
        }
    }
    Ok(())
}

fn handle_outdated(ctx: &Context) -> Result<()> {
    if ctx.offline() {
        return Err(PatchlineError::InvalidInput {
            message: "outdated requires registry access; remove --offline".to_string(),
        });
    }

    let specs = ctx.discover()?;
    let registry = ctx.registry()?;
    let reconciler =
        Reconciler::new(ctx.cache_dir(), ctx.snapshot_store()?).with_fetcher(&registry);
    let report = reconciler.outdated(&specs)?;

    for (name, err) in &report.failures {
        ctx.note(format!("failed to fetch {}: {}", name, err));
    }

    if report.rows.is_empty() {
        println!("No registry plugins found.");
    } else {
        let rows: Vec<(Status, Vec<String>)> = report
            .rows
            .iter()
            .map(|r| {
                (
                    r.status,
                    vec![
                        r.name.clone(),
                        r.declared.clone(),
                        r.installed.clone(),
                        r.latest.clone().unwrap_or_default(),
                        r.status.to_string(),
                        r.source.to_string(),
                    ],
                )
            })
            .collect();
        print_table(
            &["NAME", "DECLARED", "INSTALLED", "LATEST", "STATUS", "SOURCE"],
            &rows,
            4,
        );
    }

    if report.local_count > 0 && !ctx.quiet {
        println!();
        println!("Note: local plugins are unmanaged and excluded from outdated checks.");
    }
    Ok(())
}

fn handle_sync(ctx: &Context, dry_run: bool) -> Result<()> {
    let specs = ctx.discover()?;
    let reconciler = Reconciler::new(ctx.cache_dir(), ctx.snapshot_store()?);
    let plan = reconciler.sync_plan(&specs)?;

    let rows: Vec<(Status, Vec<String>)> = plan
        .rows
        .iter()
        .map(|r| {
            (
                r.status,
                vec![
                    r.name.clone(),
                    r.declared.clone(),
                    r.installed.clone(),
                    r.status.to_string(),
                    r.action.to_string(),
                    r.source.to_string(),
                ],
            )
        })
        .collect();
    print_table(
        &["NAME", "DECLARED", "INSTALLED", "STATUS", "ACTION", "SOURCE"],
        &rows,
        3,
    );
    println!();

    let mut first_failure = None;
    if plan.refresh_targets.is_empty() {
        println!("Cache already matches pinned config.");
    } else if dry_run {
        let refresh = plan
            .rows
            .iter()
            .filter(|r| r.action == SyncAction::Refresh)
            .count();
        println!("{} {} row(s) would be refreshed.", "(dry run)".yellow(), refresh);
    } else {
        let summary = reconciler.sync(&plan)?;
        if summary.refreshed > 0 {
            println!(
                "{} {} plugin(s). Run OpenCode to reinstall.",
                "Refreshed".green(),
                summary.refreshed
            );
        }
        if summary.not_cached > 0 {
            println!(
                "No cache entry found for {} plugin(s); OpenCode will install on next run.",
                summary.not_cached
            );
        }
        for (name, err) in summary.failures {
            eprintln!("  {} {}: {}", "Failed".red(), name, err);
            first_failure.get_or_insert(err);
        }
    }

    if !ctx.quiet {
        if plan.skipped_unpinned > 0 {
            println!("Skipped {} unpinned plugin(s).", plan.skipped_unpinned);
        }
        if plan.local_count > 0 {
            println!("Local plugins are unmanaged and were skipped.");
        }
    }

    match first_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn handle_upgrade(ctx: &Context, request: UpgradeRequest) -> Result<()> {
    if request.target.is_none() && ctx.offline() {
        return Err(PatchlineError::InvalidInput {
            message: "upgrade requires registry access; provide --to or remove --offline"
                .to_string(),
        });
    }

    let specs = ctx.discover()?;
    let registry = match request.target {
        Some(_) => None,
        None => Some(ctx.registry()?),
    };
    let mut reconciler = Reconciler::new(ctx.cache_dir(), ctx.snapshot_store()?);
    if let Some(registry) = &registry {
        reconciler = reconciler.with_fetcher(registry);
    }

    let report = reconciler.upgrade(&specs, &request)?;
    let upgraded = report.upgraded();
    let satisfied = report.already_satisfied();

    let mut first_failure = None;
    for result in report.results {
        let path = result.target.config_path.display().to_string();
        match result.outcome {
            UpgradeOutcome::Upgraded { from, to, .. } => {
                println!(
                    "{} {} -> {} {}",
                    "Upgraded".green(),
                    from,
                    to.cyan(),
                    format!("({})", path).dimmed()
                );
            }
            UpgradeOutcome::AlreadySatisfied { spec } => {
                println!("{} {}", "Already on".dimmed(), spec);
            }
            UpgradeOutcome::Failed(err) => {
                eprintln!("  {} {}: {}", "Failed".red(), result.target.name, err);
                first_failure.get_or_insert(err);
            }
        }
    }

    println!();
    if upgraded > 0 {
        println!("Updated {} plugin(s). Run OpenCode to reinstall.", upgraded);
        comments_note(ctx);
    } else if satisfied > 0 && first_failure.is_none() {
        println!("All plugins already match the target versions.");
    } else {
        println!("No plugins upgraded.");
    }
    if upgraded > 0 && satisfied > 0 {
        println!("{} plugin(s) already matched the target.", satisfied);
    }

    match first_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn handle_rollback(ctx: &Context, name: &str) -> Result<()> {
    let reconciler = Reconciler::new(ctx.cache_dir(), ctx.snapshot_store()?);
    let outcome = reconciler.rollback(name)?;

    println!(
        "{} {} to {} (was {})",
        "Restored".green(),
        outcome.plugin.cyan(),
        outcome.restored_spec,
        outcome.replaced_spec.dimmed()
    );
    println!("  Config: {}", outcome.config_path.display());
    println!("Run OpenCode to reinstall.");
    comments_note(ctx);
    Ok(())
}

fn handle_snapshot(ctx: &Context) -> Result<()> {
    let specs = ctx.discover()?;
    let store = ctx.snapshot_store()?;
    let dir = store.dir().to_path_buf();
    let reconciler = Reconciler::new(ctx.cache_dir(), store);
    let summary = reconciler.snapshot_all(&specs)?;

    if summary.saved == 0 && summary.failures.is_empty() {
        println!("No registry plugins found to snapshot.");
    } else if summary.saved > 0 {
        println!(
            "{} {} snapshot(s) to {}.",
            "Saved".green(),
            summary.saved,
            dir.display()
        );
    }
    if summary.local_count > 0 && !ctx.quiet {
        println!("Local plugins are unmanaged and were skipped.");
    }

    let mut first_failure = None;
    for (name, err) in summary.failures {
        eprintln!("  {} {}: {}", "Failed".red(), name, err);
        first_failure.get_or_insert(err);
    }
    match first_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn handle_history(ctx: &Context, name: Option<&str>) -> Result<()> {
    let reconciler = Reconciler::new(None, ctx.snapshot_store()?);
    let store = reconciler.store();

    let Some(name) = name else {
        let plugins = store.plugins()?;
        if plugins.is_empty() {
            println!("No snapshots found in {}.", store.dir().display());
            return Ok(());
        }
        println!();
        println!("Plugins with history:");
        for plugin in plugins {
            let count = store.list(&plugin)?.len();
            println!("  {} ({} entries)", plugin.cyan(), count);
        }
        return Ok(());
    };

    let entries = reconciler.history(name)?;
    if entries.is_empty() {
        println!("No snapshots found for '{}'.", name);
        println!();
        println!("Create one with: patchline snapshot");
        return Ok(());
    }

    println!();
    println!("History for {}:", name.cyan());
    println!();
    for entry in entries {
        println!(
            "  {} {:<8} {} (installed: {}, {})",
            entry.display_time(),
            entry.reason.to_string().yellow(),
            entry.previous_spec,
            entry.previous_installed,
            entry.source
        );
        if let Some(path) = &entry.config_path {
            println!("    {}", path.display().to_string().dimmed());
        }
    }
    Ok(())
}

fn handle_config(action: ConfigAction, base_dir: &Path) -> Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load(base_dir)?;
            match config.get(&key) {
                Some(value) => {
                    println!("{}", value);
                }
                None => {
                    return Err(PatchlineError::ConfigKeyNotFound { key });
                }
            }
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load(base_dir)?;
            config.set(&key, &value)?;
            config.save(base_dir)?;
            println!("{} {} = {}", "Set:".green(), key, value);
        }
        ConfigAction::List => {
            let config = Config::load(base_dir)?;
            println!();
            for (key, value) in config.list() {
                println!("{} = {}", key.cyan(), value);
            }
            println!();
        }
        ConfigAction::Path => {
            println!("{}", Config::path(base_dir).display());
        }
        ConfigAction::Init => {
            let path = Config::init(base_dir)?;
            println!("{} {}", "Initialized:".green(), path.display());
        }
    }

    Ok(())
}

fn handle_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let shell = match shell {
        Shell::Bash => clap_complete::Shell::Bash,
        Shell::Zsh => clap_complete::Shell::Zsh,
        Shell::Fish => clap_complete::Shell::Fish,
        Shell::PowerShell => clap_complete::Shell::PowerShell,
        Shell::Elvish => clap_complete::Shell::Elvish,
    };
    generate(shell, &mut cmd, "patchline", &mut io::stdout());
}
