//! Command-line interface.
//!
//! `kiln cook` runs one batch build, `kiln serve` keeps a session open
//! and cooks as requests arrive, `kiln init` scaffolds a project. Item
//! arguments may be plain names or glob patterns expanded against the
//! source tree. Touching `.kiln-cancel` in the project root cancels a
//! running build.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use glob::glob;
use tracing_subscriber::EnvFilter;

use crate::cancel::CancelWatcher;
use crate::collab::Collaborators;
use crate::config::{default_config, load_config, ConfigError, KilnConfig, CONFIG_FILENAME};
use crate::distrib::{channel_fabric, spawn_local_workers};
use crate::error::CookError;
use crate::item::instigator::Instigator;
use crate::item::record::{ItemId, Urgency};
use crate::profile::ProfileId;
use crate::request::BuildRequest;
use crate::session::{CookSession, SessionMode};

pub(crate) const EXIT_SUCCESS: u8 = 0;
pub(crate) const EXIT_ERROR: u8 = 1;
pub(crate) const EXIT_INVALID_ARGS: u8 = 2;

/// Kiln - incremental content cooker for multi-profile asset builds
#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Kiln - cook content items into per-profile artifacts")]
#[command(version)]
pub struct Cli {
    /// Explicit config file (default: search upward for kiln.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose progress output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Cook items once and exit
    Cook {
        /// Item names or glob patterns (default: every item under src)
        items: Vec<String>,

        /// Restrict to specific profiles (default: all enabled)
        #[arg(short, long)]
        profile: Vec<String>,

        /// Ignore previous results and rebuild everything
        #[arg(long)]
        force: bool,

        /// Cook at blocking urgency
        #[arg(long)]
        blocking: bool,

        /// Cap concurrent preloads and per-class async compiles
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Override the worker count from config
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Keep a session open and cook items as requests arrive
    Serve {
        /// Items to cook immediately on startup
        items: Vec<String>,

        /// Restrict to specific profiles (default: all enabled)
        #[arg(short, long)]
        profile: Vec<String>,

        /// Ignore previous results and rebuild everything
        #[arg(long)]
        force: bool,

        /// Cap concurrent preloads and per-class async compiles
        #[arg(short, long)]
        jobs: Option<usize>,
    },
    /// Write a starter kiln.toml and content directory
    Init {
        /// Project directory (default: current directory)
        path: Option<PathBuf>,
    },
}

/// CLI entry point.
pub fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Cook { items, profile, force, blocking, jobs, workers } => run_cook(
            cli.config.as_deref(),
            &items,
            &profile,
            force,
            blocking,
            jobs,
            workers,
            cli.verbose,
        ),
        Commands::Serve { items, profile, force, jobs } => {
            run_serve(cli.config.as_deref(), &items, &profile, force, jobs, cli.verbose)
        }
        Commands::Init { path } => run_init(path.as_deref()),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_cook(
    config_path: Option<&Path>,
    items: &[String],
    profiles: &[String],
    force: bool,
    blocking: bool,
    jobs: Option<usize>,
    workers: Option<usize>,
    verbose: bool,
) -> ExitCode {
    let (mut config, root) = match load_or_default(config_path, verbose) {
        Ok(found) => found,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::from(EXIT_ERROR);
        }
    };
    apply_jobs(&mut config, jobs);
    if let Some(workers) = workers {
        config.distribution.workers = workers;
    }

    let src_root = root.join(&config.project.src);
    if !src_root.is_dir() {
        eprintln!("error: source directory not found: {}", src_root.display());
        return ExitCode::from(EXIT_ERROR);
    }
    let requests = match expand_items(&src_root, items) {
        Ok(requests) => requests,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::from(EXIT_INVALID_ARGS);
        }
    };
    if requests.is_empty() {
        println!("nothing to cook");
        return ExitCode::from(EXIT_SUCCESS);
    }

    let collab = Collaborators::filesystem(&src_root);
    let mut session = match CookSession::with_options(
        config.clone(),
        root.clone(),
        collab,
        SessionMode::Batch,
        force,
    ) {
        Ok(session) => session,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::from(EXIT_ERROR);
        }
    };
    let profile_ids = match resolve_profiles(&session, profiles) {
        Ok(ids) => ids,
        Err(name) => {
            eprintln!("error: unknown profile '{}'", name);
            return ExitCode::from(EXIT_INVALID_ARGS);
        }
    };

    let mut worker_handles = Vec::new();
    if config.distribution.workers > 0 {
        let (fabric, links) = channel_fabric(config.distribution.workers);
        session.attach_director(Box::new(fabric));
        worker_handles = spawn_local_workers(&config, &root, links);
    }

    let urgency = if blocking { Urgency::Blocking } else { Urgency::Normal };
    let count = requests.len();
    for id in requests {
        session.submit(
            BuildRequest::new(id, Instigator::command_line())
                .with_profiles(profile_ids.clone())
                .with_urgency(urgency),
        );
    }

    if verbose || atty::is(atty::Stream::Stdout) {
        println!("cooking {} item request(s)...", count);
    }
    let watcher = CancelWatcher::watch(&root).ok();
    session.run_to_completion(&|| watcher.as_ref().map_or(false, CancelWatcher::requested));
    if let Some(watcher) = &watcher {
        if watcher.requested() {
            watcher.acknowledge();
        }
    }

    let report = match session.finish() {
        Ok(report) => report,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::from(EXIT_ERROR);
        }
    };
    for handle in worker_handles {
        let _ = handle.join();
    }
    println!("{}", report);
    if report.is_success() {
        ExitCode::from(EXIT_SUCCESS)
    } else {
        ExitCode::from(EXIT_ERROR)
    }
}

fn run_serve(
    config_path: Option<&Path>,
    items: &[String],
    profiles: &[String],
    force: bool,
    jobs: Option<usize>,
    verbose: bool,
) -> ExitCode {
    let (mut config, root) = match load_or_default(config_path, verbose) {
        Ok(found) => found,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::from(EXIT_ERROR);
        }
    };
    apply_jobs(&mut config, jobs);

    let src_root = root.join(&config.project.src);
    if !src_root.is_dir() {
        eprintln!("error: source directory not found: {}", src_root.display());
        return ExitCode::from(EXIT_ERROR);
    }
    let requests = match expand_items(&src_root, items) {
        Ok(requests) => requests,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::from(EXIT_INVALID_ARGS);
        }
    };

    let collab = Collaborators::filesystem(&src_root);
    let mut session = match CookSession::with_options(
        config,
        root.clone(),
        collab,
        SessionMode::Serve,
        force,
    ) {
        Ok(session) => session,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::from(EXIT_ERROR);
        }
    };
    let profile_ids = match resolve_profiles(&session, profiles) {
        Ok(ids) => ids,
        Err(name) => {
            eprintln!("error: unknown profile '{}'", name);
            return ExitCode::from(EXIT_INVALID_ARGS);
        }
    };
    for id in requests {
        session.submit(
            BuildRequest::new(id, Instigator::command_line()).with_profiles(profile_ids.clone()),
        );
    }

    let watcher = match CancelWatcher::watch(&root) {
        Ok(watcher) => watcher,
        Err(err) => {
            eprintln!("error: cannot watch for cancel file: {}", err);
            return ExitCode::from(EXIT_ERROR);
        }
    };
    println!(
        "serving; touch {} to stop",
        root.join(crate::cancel::CANCEL_FILENAME).display()
    );
    session.run_serve(&|| watcher.requested());
    watcher.acknowledge();

    match session.finish() {
        Ok(report) => {
            println!("{}", report);
            ExitCode::from(EXIT_SUCCESS)
        }
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn run_init(path: Option<&Path>) -> ExitCode {
    let root = path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    match init_project(&root) {
        Ok(()) => {
            println!("initialized kiln project at {}", root.display());
            ExitCode::from(EXIT_SUCCESS)
        }
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::from(EXIT_ERROR)
        }
    }
}

/// Write a starter config and source directory.
pub fn init_project(root: &Path) -> Result<(), CookError> {
    std::fs::create_dir_all(root)?;
    let config_path = root.join(CONFIG_FILENAME);
    if config_path.exists() {
        return Err(CookError::Session(format!("{} already exists", config_path.display())));
    }
    let config = default_config();
    let text = toml::to_string_pretty(&config).map_err(|e| CookError::Session(e.to_string()))?;
    std::fs::write(&config_path, text)?;
    std::fs::create_dir_all(root.join(&config.project.src))?;
    Ok(())
}

fn load_or_default(
    config_path: Option<&Path>,
    verbose: bool,
) -> Result<(KilnConfig, PathBuf), CookError> {
    match config_path {
        Some(path) => Ok(load_config(Some(path), Path::new("."))?),
        None => {
            let cwd = std::env::current_dir()?;
            match load_config(None, &cwd) {
                Ok(found) => Ok(found),
                Err(ConfigError::NotFound(_)) => {
                    if verbose {
                        println!("no {} found, using defaults", CONFIG_FILENAME);
                    }
                    Ok((default_config(), cwd))
                }
                Err(err) => Err(err.into()),
            }
        }
    }
}

fn apply_jobs(config: &mut KilnConfig, jobs: Option<usize>) {
    if let Some(jobs) = jobs {
        let jobs = jobs.max(1);
        config.scheduler.max_concurrent_preloads = jobs;
        config.scheduler.max_async_cache_per_class = jobs;
    }
}

fn resolve_profiles(session: &CookSession, names: &[String]) -> Result<Vec<ProfileId>, String> {
    let mut ids = Vec::with_capacity(names.len());
    for name in names {
        match session.find_profile(name) {
            Some(id) => ids.push(id),
            None => return Err(name.clone()),
        }
    }
    Ok(ids)
}

/// Expand item arguments against the source tree. Plain names pass
/// through; glob patterns match `.item` sources under `src_root`. With
/// no arguments, every item under the source tree is requested.
pub fn expand_items(src_root: &Path, patterns: &[String]) -> Result<Vec<ItemId>, String> {
    let everything = vec!["**/*".to_string()];
    let patterns = if patterns.is_empty() { &everything } else { patterns };

    let mut ids: Vec<ItemId> = Vec::new();
    let mut push = |ids: &mut Vec<ItemId>, id: ItemId| {
        if !ids.contains(&id) {
            ids.push(id);
        }
    };
    for pattern in patterns {
        let is_glob = pattern.chars().any(|c| matches!(c, '*' | '?' | '['));
        if is_glob {
            let full = format!("{}/{}.item", src_root.display(), pattern);
            let paths = glob(&full).map_err(|e| format!("bad pattern '{}': {}", pattern, e))?;
            for path in paths.filter_map(Result::ok) {
                if let Some(id) = item_id_for(src_root, &path) {
                    push(&mut ids, id);
                }
            }
        } else {
            push(&mut ids, ItemId::new(pattern.as_str()));
        }
    }
    Ok(ids)
}

fn item_id_for(src_root: &Path, path: &Path) -> Option<ItemId> {
    let rel = path.strip_prefix(src_root).ok()?;
    let rel = rel.to_string_lossy();
    rel.strip_suffix(".item").map(ItemId::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_expand_plain_names() {
        let temp = TempDir::new().unwrap();
        let ids = expand_items(temp.path(), &["chars/hero".to_string()]).unwrap();
        assert_eq!(ids, vec![ItemId::new("chars/hero")]);
    }

    #[test]
    fn test_expand_glob() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("chars")).unwrap();
        fs::write(temp.path().join("chars/hero.item"), "").unwrap();
        fs::write(temp.path().join("chars/villain.item"), "").unwrap();
        fs::write(temp.path().join("readme.txt"), "").unwrap();

        let mut ids = expand_items(temp.path(), &["chars/*".to_string()]).unwrap();
        ids.sort();
        assert_eq!(ids, vec![ItemId::new("chars/hero"), ItemId::new("chars/villain")]);
    }

    #[test]
    fn test_expand_default_takes_everything() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("a/b")).unwrap();
        fs::write(temp.path().join("top.item"), "").unwrap();
        fs::write(temp.path().join("a/b/deep.item"), "").unwrap();

        let mut ids = expand_items(temp.path(), &[]).unwrap();
        ids.sort();
        assert_eq!(ids, vec![ItemId::new("a/b/deep"), ItemId::new("top")]);
    }

    #[test]
    fn test_expand_dedups() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.item"), "").unwrap();
        let ids =
            expand_items(temp.path(), &["a".to_string(), "*".to_string()]).unwrap();
        assert_eq!(ids, vec![ItemId::new("a")]);
    }

    #[test]
    fn test_init_project_writes_config_and_src() {
        let temp = TempDir::new().unwrap();
        init_project(temp.path()).unwrap();
        assert!(temp.path().join(CONFIG_FILENAME).exists());
        assert!(temp.path().join("content").is_dir());
        // refuses to clobber
        assert!(init_project(temp.path()).is_err());
    }

    #[test]
    fn test_cli_parses_cook_command() {
        let cli = Cli::parse_from([
            "kiln", "cook", "chars/*", "--profile", "desktop", "--force", "--jobs", "4",
        ]);
        match cli.command {
            Commands::Cook { items, profile, force, jobs, .. } => {
                assert_eq!(items, vec!["chars/*".to_string()]);
                assert_eq!(profile, vec!["desktop".to_string()]);
                assert!(force);
                assert_eq!(jobs, Some(4));
            }
            _ => panic!("expected cook command"),
        }
    }
}
