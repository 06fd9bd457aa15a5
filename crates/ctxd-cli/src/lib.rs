//! Command-line interface for ctxd.

pub mod commands;
pub mod logging;
pub mod mcp;
pub mod output;
pub mod workspace;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ctxd_index::SearchMode;

use crate::commands::SearchOptions;
use crate::workspace::Workspace;

#[derive(Parser, Debug)]
#[command(name = "ctxd")]
#[command(about = "Local incremental semantic code search")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create .ctxd/ with a default configuration
    Init {
        /// Project root (defaults to the current directory)
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Index a file or directory
    Index {
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Re-index files even when unchanged
        #[arg(short, long)]
        force: bool,

        /// Branch to tag chunks with (auto-detected if not given)
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Search the index
    Search {
        query: String,

        /// Maximum number of results
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Only paths containing this substring
        #[arg(short, long)]
        file: Option<String>,

        /// Only chunks tagged with this branch
        #[arg(short, long)]
        branch: Option<String>,

        /// File extension (repeatable)
        #[arg(short, long = "ext")]
        ext: Vec<String>,

        /// Directory prefix (repeatable)
        #[arg(short, long = "dir")]
        dir: Vec<String>,

        /// Chunk type such as function or class (repeatable)
        #[arg(short = 't', long = "type")]
        chunk_type: Vec<String>,

        /// Language (repeatable)
        #[arg(short, long = "lang")]
        lang: Vec<String>,

        /// vector, fts or hybrid (defaults to search.mode)
        #[arg(short, long, value_parser = parse_mode)]
        mode: Option<SearchMode>,

        /// Keep overlapping results from the same file
        #[arg(long)]
        no_dedup: bool,

        /// Show surrounding source lines
        #[arg(long)]
        expand: bool,
    },

    /// Show index statistics
    Status,

    /// Delete the index
    Clean {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Serve the index to MCP clients over stdio
    Serve {
        /// Project root (defaults to the nearest directory holding .ctxd/)
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Print the version
    Version,
}

fn parse_mode(s: &str) -> Result<SearchMode, String> {
    s.parse::<SearchMode>().map_err(|e| e.to_string())
}

/// Nearest directory at or above `start` that holds `.ctxd/`.
fn find_project(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(ctxd_config::STATE_DIR).is_dir())
        .map(Path::to_path_buf)
}

/// Directory holding `.ctxd/` for a command.
///
/// An existing project above the target (or the working directory) wins.
/// Otherwise indexing a directory roots the project there, and indexing a
/// file roots it at the working directory when the file lies under it.
/// Chunk paths are always stored relative to this root.
fn project_root(command: &Commands, cwd: &Path) -> Result<PathBuf> {
    let cwd = cwd
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", cwd.display()))?;
    let root = match command {
        Commands::Init { path: Some(path) } => cwd.join(path),
        Commands::Init { path: None } => cwd,
        Commands::Index { path, .. } => {
            let target = cwd
                .join(path)
                .canonicalize()
                .with_context(|| format!("Path does not exist: {}", path.display()))?;
            let start = if target.is_dir() {
                target.clone()
            } else {
                target.parent().map(Path::to_path_buf).unwrap_or_else(|| cwd.clone())
            };
            match find_project(&start) {
                Some(root) => root,
                None if target.is_dir() => target,
                None if target.starts_with(&cwd) => cwd,
                None => start,
            }
        }
        Commands::Serve { path: Some(path) } => cwd.join(path),
        _ => find_project(&cwd).unwrap_or(cwd),
    };
    root.canonicalize()
        .with_context(|| format!("Failed to resolve project root {}", root.display()))
}

/// Entry point used by the `ctxd` binary.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("ctxd {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let root = project_root(&cli.command, &cwd)?;
    let workspace = Workspace::load(&root, cli.debug)?;
    logging::init_logging(cli.debug, &workspace.config.logging, &root)?;

    match cli.command {
        Commands::Init { .. } => commands::init(&root),
        Commands::Index { path, force, branch } => {
            let target = cwd
                .join(&path)
                .canonicalize()
                .with_context(|| format!("Failed to resolve {}", path.display()))?;
            commands::index(&workspace, &target, force, branch).await
        }
        Commands::Search {
            query,
            limit,
            file,
            branch,
            ext,
            dir,
            chunk_type,
            lang,
            mode,
            no_dedup,
            expand,
        } => {
            let options = SearchOptions {
                limit,
                mode,
                file,
                branch,
                extensions: ext,
                directories: dir,
                chunk_types: chunk_type,
                languages: lang,
                no_dedup,
                expand,
            };
            commands::search(&workspace, &query, &options).await
        }
        Commands::Status => commands::status(&workspace).await,
        Commands::Clean { yes } => commands::clean(&workspace, yes).await,
        Commands::Serve { .. } => mcp::serve(workspace).await,
        Commands::Version => Ok(()),
    }
}
