//! # datapile CLI entry point
//!
//! Thin wrapper over [`datapile::Workspace`]. Every command prints a JSON
//! report on stdout; logs go to stderr and are controlled by `RUST_LOG`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use datapile::remote::BatchOptions;
use datapile::workspace::{find_root, PathResult};
use datapile::{DirCache, Scope, Workspace};

/// Content-addressed versioning for large files.
///
/// Tracked files are replaced in version control by small pointer files. The
/// bytes live in a local cache and are shared through remotes.
#[derive(Parser, Debug)]
#[command(name = "datapile", version, about)]
struct Cli {
    /// Workspace root. Defaults to the closest ancestor containing `.datapile`.
    #[arg(short = 'C', long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a workspace in the root directory.
    Init,
    #[command(flatten)]
    Workspace(WorkspaceCommand),
}

#[derive(Subcommand, Debug)]
enum WorkspaceCommand {
    /// Track files, or record their new content.
    Add {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Restore files to the content their pointers name. Defaults to every
    /// tracked file.
    Checkout { paths: Vec<PathBuf> },
    /// Upload the content of every tracked file to a remote.
    Push(TransferArgs),
    /// Download tracked content from a remote and check it out.
    Pull(TransferArgs),
    /// Download tracked content into the cache only.
    Fetch(TransferArgs),
    /// Delete cache objects no tracked file refers to.
    Gc,
    /// Compare files against their pointers. Defaults to every tracked file.
    Status { paths: Vec<PathBuf> },
    /// Re-hash every cache object and quarantine corrupted ones.
    Verify,
    /// Stop tracking files. The files themselves are kept.
    Untrack {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Manage remotes.
    #[command(subcommand)]
    Remote(RemoteCommand),
}

#[derive(Args, Debug)]
struct TransferArgs {
    /// Remote to use instead of the default.
    #[arg(short, long)]
    remote: Option<String>,
    /// Number of concurrent transfers.
    #[arg(short, long)]
    jobs: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum RemoteCommand {
    /// Add or replace a remote.
    Add {
        name: String,
        url: String,
        /// Make this the default remote.
        #[arg(short, long)]
        default: bool,
    },
    /// Set the default remote.
    Default { name: String },
    /// Remove a remote.
    Remove { name: String },
    /// List remotes.
    List,
}

fn emit<T: Serialize>(value: &T, ok: bool) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn emit_paths<T: Serialize>(results: &[PathResult<T>]) -> Result<ExitCode> {
    emit(&results, results.iter().all(|r| r.result.is_ok()))
}

fn open(root: Option<PathBuf>, cwd: &Path) -> Result<Workspace<DirCache>> {
    let root = match root {
        Some(root) => root,
        None => find_root(cwd)
            .context("not inside a datapile workspace, run `datapile init` first")?,
    };
    Workspace::open(&root).with_context(|| format!("opening workspace at {}", root.display()))
}

fn batch_options(ws: &Workspace<DirCache>, args: &TransferArgs) -> BatchOptions {
    BatchOptions::with_jobs(args.jobs.unwrap_or_else(|| ws.config().jobs()))
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cwd = std::env::current_dir()
        .and_then(std::fs::canonicalize)
        .context("reading the current directory")?;

    match cli.command {
        Commands::Init => {
            let root = cli.root.unwrap_or_else(|| cwd.clone());
            let ws: Workspace<DirCache> = Workspace::init(&root)
                .with_context(|| format!("initializing workspace at {}", root.display()))?;
            emit(&json!({ "root": ws.root() }), true)
        }
        Commands::Workspace(command) => run(&open(cli.root, &cwd)?, command, &cwd),
    }
}

/// Pairs each path as the user spelled it with its location. No paths means
/// every tracked path.
fn targets(
    ws: &Workspace<DirCache>,
    paths: Vec<PathBuf>,
    cwd: &Path,
) -> Result<Vec<(PathBuf, PathBuf)>> {
    if paths.is_empty() {
        return Ok(ws
            .tracked()?
            .into_iter()
            .map(|rel| (rel.clone(), ws.root().join(rel)))
            .collect());
    }
    Ok(paths
        .into_iter()
        .map(|path| (path.clone(), cwd.join(path)))
        .collect())
}

fn run(ws: &Workspace<DirCache>, command: WorkspaceCommand, cwd: &Path) -> Result<ExitCode> {
    let each = |paths: Vec<PathBuf>| targets(ws, paths, cwd);
    match command {
        WorkspaceCommand::Add { paths } => {
            let results: Vec<_> = each(paths)?
                .into_iter()
                .map(|(path, full)| PathResult {
                    result: ws.add(full),
                    path,
                })
                .collect();
            emit_paths(&results)
        }
        WorkspaceCommand::Checkout { paths } => {
            let results: Vec<_> = each(paths)?
                .into_iter()
                .map(|(path, full)| PathResult {
                    result: ws.checkout(full),
                    path,
                })
                .collect();
            emit_paths(&results)
        }
        WorkspaceCommand::Status { paths } => {
            let results: Vec<_> = each(paths)?
                .into_iter()
                .map(|(path, full)| PathResult {
                    result: ws.status(full),
                    path,
                })
                .collect();
            emit_paths(&results)
        }
        WorkspaceCommand::Untrack { paths } => {
            let results: Vec<_> = each(paths)?
                .into_iter()
                .map(|(path, full)| PathResult {
                    result: ws.untrack(full),
                    path,
                })
                .collect();
            emit_paths(&results)
        }
        WorkspaceCommand::Push(args) => {
            let options = batch_options(ws, &args);
            let report = ws.push_with(Scope::Worktree, args.remote.as_deref(), &options)?;
            emit(&report, report.ok())
        }
        WorkspaceCommand::Fetch(args) => {
            let options = batch_options(ws, &args);
            let report = ws.fetch_with(Scope::Worktree, args.remote.as_deref(), &options)?;
            emit(&report, report.ok())
        }
        WorkspaceCommand::Pull(args) => {
            let options = batch_options(ws, &args);
            let report = ws.pull_with(Scope::Worktree, args.remote.as_deref(), &options)?;
            emit(&report, report.ok())
        }
        WorkspaceCommand::Gc => {
            let removed = ws.gc(Scope::Worktree)?;
            emit(&json!({ "removed": removed }), true)
        }
        WorkspaceCommand::Verify => {
            let corrupted = ws.verify()?;
            emit(&json!({ "corrupted": corrupted }), corrupted.is_empty())
        }
        WorkspaceCommand::Remote(command) => match command {
            RemoteCommand::Add { name, url, default } => {
                ws.add_remote(&name, &url, default)?;
                emit(&json!({ "added": name, "default": default }), true)
            }
            RemoteCommand::Default { name } => {
                ws.set_default_remote(&name)?;
                emit(&json!({ "default": name }), true)
            }
            RemoteCommand::Remove { name } => {
                ws.remove_remote(&name)?;
                emit(&json!({ "removed": name }), true)
            }
            RemoteCommand::List => {
                let (remotes, default) = ws.remotes();
                emit(&json!({ "remotes": remotes, "default": default }), true)
            }
        },
    }
}
