//! Command handlers.

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use ctxd_config::{init_project, InitOutcome};
use ctxd_index::enhancer::{deduplicate, expand_context, rerank_by_recency};
use ctxd_index::{
    ChunkStore, EmbeddingProvider, IndexStats, Indexer, ProgressCallback, SearchEngine, SearchFilter, SearchMode,
    SearchQuery, SearchResult,
};
use tracing::{debug, info};

use crate::output;
use crate::workspace::Workspace;

/// Options of the `search` command.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub mode: Option<SearchMode>,
    pub file: Option<String>,
    pub branch: Option<String>,
    pub extensions: Vec<String>,
    pub directories: Vec<String>,
    pub chunk_types: Vec<String>,
    pub languages: Vec<String>,
    pub no_dedup: bool,
    pub expand: bool,
}

impl SearchOptions {
    pub fn filter(&self) -> SearchFilter {
        let mut filter = SearchFilter::new()
            .with_extensions(self.extensions.iter().map(|e| normalize_extension(e)).collect())
            .with_directories(self.directories.clone())
            .with_chunk_types(self.chunk_types.iter().map(|t| t.to_ascii_lowercase()).collect())
            .with_languages(self.languages.iter().map(|l| l.to_ascii_lowercase()).collect());
        if let Some(file) = &self.file {
            filter = filter.with_file(file.clone());
        }
        if let Some(branch) = &self.branch {
            filter = filter.with_branch(branch.clone());
        }
        filter
    }
}

/// `py` and `.py` both mean `.py`.
fn normalize_extension(ext: &str) -> String {
    if ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{}", ext)
    }
}

pub fn init(root: &Path) -> Result<()> {
    match init_project(root).context("Failed to initialise project")? {
        InitOutcome::Created(path) => {
            println!("Initialized ctxd at {}", root.display());
            println!("Created config at {}", path.display());
            println!();
            println!("Next steps:");
            println!("  1. Run `ctxd index` to index your codebase");
            println!("  2. Run `ctxd search <query>` to search your code");
        }
        InitOutcome::AlreadyInitialized(dir) => {
            println!("ctxd already initialized at {}", dir.display());
        }
    }
    Ok(())
}

pub async fn index(workspace: &Workspace, target: &Path, force: bool, branch: Option<String>) -> Result<()> {
    let embedder = workspace.embedder()?;
    let (bar, callback) = output::progress_bar();
    let result = run_index(workspace, embedder, target, force, branch, Some(callback)).await;
    bar.finish_and_clear();

    let stats = result?;
    println!("Indexing complete!");
    println!();
    print!("{}", output::format_stats(&stats));
    Ok(())
}

/// Index `target` into the workspace store, with paths relative to the
/// workspace root.
pub async fn run_index(
    workspace: &Workspace,
    embedder: Arc<dyn EmbeddingProvider>,
    target: &Path,
    force: bool,
    branch: Option<String>,
    progress: Option<ProgressCallback>,
) -> Result<IndexStats> {
    let indexer = Indexer::new(workspace.indexer_config(), embedder, Arc::clone(&workspace.store));
    info!("Indexing {:?} into {:?}", target, workspace.index_dir());
    indexer
        .index_path_under(&workspace.root, target, force, branch, progress)
        .await
}

pub async fn search(workspace: &Workspace, query: &str, options: &SearchOptions) -> Result<()> {
    if !workspace.has_index() {
        anyhow::bail!("No index found. Run `ctxd index` first.");
    }
    let results = run_search(workspace, query, options).await?;
    output::print_results(&results);
    Ok(())
}

/// Search, de-duplicate, re-rank, trim, and optionally expand.
pub async fn run_search(workspace: &Workspace, query: &str, options: &SearchOptions) -> Result<Vec<SearchResult>> {
    run_search_with(workspace, None, query, options).await
}

/// [`run_search`] with an already constructed embedder. Without one, a
/// provider is created from the configuration when the mode needs vectors.
pub async fn run_search_with(
    workspace: &Workspace,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    query: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    let settings = &workspace.config.search;
    let mode = match options.mode {
        Some(mode) => mode,
        None => workspace.default_mode()?,
    };
    let limit = options.limit.unwrap_or(settings.default_limit);
    let dedup = settings.deduplicate && !options.no_dedup;
    let fetch = if dedup { limit.saturating_mul(2) } else { limit };

    let mut request = SearchQuery::text(query)
        .with_mode(mode)
        .with_limit(fetch)
        .with_filter(options.filter());
    if mode.needs_vector() {
        let embedder = match embedder {
            Some(embedder) => embedder,
            None => workspace.embedder()?,
        };
        let vector = embedder.embed(query).await.context("Failed to embed query")?;
        request = request.with_vector(vector);
    }

    let engine = SearchEngine::new(Arc::clone(&workspace.store), workspace.search_config());
    let mut results = engine.search(&request).await?;
    debug!("{} raw results for {:?} ({} mode)", results.len(), query, mode);

    if dedup {
        results = deduplicate(results, settings.overlap_threshold);
    }
    results = rerank_by_recency(results, settings.recency_weight);
    results.truncate(limit);

    if options.expand || settings.expand_context {
        results = expand_context(
            results,
            settings.context_lines_before,
            settings.context_lines_after,
            &workspace.root,
        );
    }
    Ok(results)
}

pub async fn status(workspace: &Workspace) -> Result<()> {
    if !workspace.has_index() {
        println!("No index found. Run `ctxd index` to create one.");
        return Ok(());
    }
    let stats = workspace.store.get_stats().await.context("Failed to read index")?;
    println!("Index: {}", workspace.index_dir().display());
    print!("{}", output::format_stats(&stats));
    Ok(())
}

pub async fn clean(workspace: &Workspace, yes: bool) -> Result<()> {
    if !workspace.has_index() {
        println!("No index found at {}", workspace.index_dir().display());
        return Ok(());
    }
    if !yes && !confirm(&format!("Delete the index at {}?", workspace.index_dir().display()))? {
        println!("Aborted.");
        return Ok(());
    }

    workspace.store.clear_all().await.context("Failed to clear index")?;
    println!("Index cleared.");
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
