//! Main indexer orchestrator.
//!
//! The Indexer walks a path, decides per file whether its content changed,
//! chunks and embeds what did, and keeps the chunk store in step with the
//! working tree (including removal of files deleted from disk).

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::change::{compute_file_hash, find_deleted_files, should_reindex};
use crate::chunker::paragraph::{DEFAULT_CHUNK_OVERLAP, DEFAULT_MAX_CHUNK_SIZE};
use crate::chunker::{detect_language, ChunkerSet, RawChunk};
use crate::discovery::{read_text_lossy, relative_path, DiscoveryConfig, FileCheck, FileDiscovery};
use crate::embeddings::{retry, EmbeddingError, EmbeddingProvider, RetryPolicy};
use crate::git::{GitCli, GitInfoProvider};
use crate::progress::{format_duration, ProgressCallback, ProgressReporter};
use crate::store::{Chunk, ChunkStore, IndexStats};

/// Worker count used when none is configured: available CPUs, at most 8.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

/// Configuration for the indexer.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Upper bound on words per paragraph chunk
    pub max_chunk_size: usize,
    /// Words shared between consecutive split chunks
    pub chunk_overlap: usize,
    /// Chunks per embedding call
    pub batch_size: usize,
    /// Process files concurrently when more than one was discovered
    pub parallel: bool,
    pub max_workers: usize,
    /// Defer embedding to a shared queue in concurrent mode
    pub batch_embedding: bool,
    /// Remove chunks of files that disappeared from disk
    pub cleanup_deleted: bool,
    /// Tag chunks with the detected git branch
    pub git_enabled: bool,
    /// Retry policy for batch embedding
    pub retry: RetryPolicy,
    pub discovery: DiscoveryConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            batch_size: 32,
            parallel: true,
            max_workers: default_workers(),
            batch_embedding: true,
            cleanup_deleted: true,
            git_enabled: true,
            retry: RetryPolicy::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// Why a file produced no new chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    TooLarge,
    NotText,
    Unchanged,
    NoChunks,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TooLarge => "too large",
            Self::NotText => "not text",
            Self::Unchanged => "unchanged",
            Self::NoChunks => "no chunks",
        })
    }
}

/// Result of processing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// Chunks produced (stored, or queued for batch embedding)
    Indexed(usize),
    Skipped(SkipReason),
    Error(String),
}

/// Counters for one indexing run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub files_indexed: usize,
    pub files_skipped: usize,
    /// Failed files plus dropped embedding batches
    pub errors: usize,
    pub chunks_added: usize,
    pub chunks_removed: usize,
    pub processing_time: Duration,
    pub total_time: Duration,
}

impl RunSummary {
    fn record(&mut self, outcome: &FileOutcome) {
        match outcome {
            FileOutcome::Indexed(_) => self.files_indexed += 1,
            FileOutcome::Skipped(_) => self.files_skipped += 1,
            FileOutcome::Error(_) => self.errors += 1,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files indexed, {} skipped, {} errors, {} chunks added, {} chunks cleaned up ({} processing, {} total)",
            self.files_indexed,
            self.files_skipped,
            self.errors,
            self.chunks_added,
            self.chunks_removed,
            format_duration(self.processing_time.as_secs_f64()),
            format_duration(self.total_time.as_secs_f64()),
        )
    }
}

/// State shared by the workers of one run.
struct Run<'a> {
    base: &'a Path,
    force: bool,
    branch: Option<String>,
    /// Embed through the shared queue instead of per file
    deferred: bool,
    queue: Mutex<Vec<Chunk>>,
    stored: AtomicUsize,
    failed_batches: AtomicUsize,
    /// Paths with at least one chunk in a dropped batch
    failed_paths: Mutex<HashSet<String>>,
}

/// Main indexer that orchestrates codebase indexing.
pub struct Indexer<E: EmbeddingProvider + ?Sized, S: ChunkStore + ?Sized> {
    config: IndexerConfig,
    embedder: Arc<E>,
    store: Arc<S>,
    git: Arc<dyn GitInfoProvider>,
    chunkers: Arc<ChunkerSet>,
    discovery: Arc<FileDiscovery>,
}

impl<E: EmbeddingProvider + ?Sized, S: ChunkStore + ?Sized> Indexer<E, S> {
    /// Create a new indexer using the `git` binary for branch detection.
    pub fn new(config: IndexerConfig, embedder: Arc<E>, store: Arc<S>) -> Self {
        let chunkers = Arc::new(ChunkerSet::new(config.max_chunk_size, config.chunk_overlap));
        let discovery = Arc::new(FileDiscovery::new(config.discovery.clone()));
        Self {
            config,
            embedder,
            store,
            git: Arc::new(GitCli::new()),
            chunkers,
            discovery,
        }
    }

    /// Replace the git info provider.
    pub fn with_git(mut self, git: Arc<dyn GitInfoProvider>) -> Self {
        self.git = git;
        self
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Index a file or directory and return the store's statistics.
    ///
    /// Unchanged files are skipped unless `force` is set. Chunks are tagged
    /// with `branch`, or the detected git branch when none is given.
    /// Per-file and per-batch failures are logged and counted; only store
    /// failures outside a single file abort the run.
    pub async fn index_path(
        &self,
        path: &Path,
        force: bool,
        branch: Option<String>,
        progress: Option<ProgressCallback>,
    ) -> Result<IndexStats> {
        let base = if path.is_file() {
            path.parent().map(Path::to_path_buf).unwrap_or_default()
        } else {
            path.to_path_buf()
        };
        self.index_path_under(&base, path, force, branch, progress).await
    }

    /// Index `path`, storing chunk paths relative to `base`.
    ///
    /// `path` must be `base` or lie inside it. When `path` is a
    /// subdirectory, deleted-file cleanup only considers paths under it.
    pub async fn index_path_under(
        &self,
        base: &Path,
        path: &Path,
        force: bool,
        branch: Option<String>,
        progress: Option<ProgressCallback>,
    ) -> Result<IndexStats> {
        let started = Instant::now();
        if !path.exists() {
            anyhow::bail!("Path does not exist: {:?}", path);
        }
        if !path.starts_with(base) {
            anyhow::bail!("{:?} is outside the project root {:?}", path, base);
        }
        let base = base.to_path_buf();

        let single_file = path.is_file();
        let files = if single_file {
            vec![path.to_path_buf()]
        } else {
            self.discovery
                .discover(path)
                .with_context(|| format!("Failed to discover files under {:?}", path))?
        };
        info!("Found {} files to index under {:?}", files.len(), path);

        let branch = match branch {
            Some(branch) => Some(branch),
            None if self.config.git_enabled => self.git.current_branch(path).await,
            None => None,
        };
        if let Some(branch) = &branch {
            info!("Indexing branch: {}", branch);
        }

        // Table and model are initialised once, before any worker starts.
        self.store.ensure_table().await.context("Failed to open chunk table")?;

        let concurrent = self.config.parallel && files.len() > 1;
        let deferred = concurrent && self.config.batch_embedding;
        if deferred {
            self.embedder
                .warm_up()
                .await
                .context("Failed to load embedding model")?;
            debug!("Pre-loaded embedding model: {}", self.embedder.model_name());
        }

        let workers = if concurrent { self.config.max_workers.max(1) } else { 1 };
        let run = Run {
            base: &base,
            force,
            branch,
            deferred,
            queue: Mutex::new(Vec::new()),
            stored: AtomicUsize::new(0),
            failed_batches: AtomicUsize::new(0),
            failed_paths: Mutex::new(HashSet::new()),
        };

        let mut summary = RunSummary::default();
        let mut reporter = ProgressReporter::new(files.len(), progress);
        let processing_start = Instant::now();
        {
            let run = &run;
            let tasks: Vec<futures::future::BoxFuture<'_, (&PathBuf, FileOutcome)>> = files
                .iter()
                .map(|file| -> futures::future::BoxFuture<'_, (&PathBuf, FileOutcome)> {
                    Box::pin(async move { (file, self.process_file(run, file).await) })
                })
                .collect();
            let mut outcomes = stream::iter(tasks).buffer_unordered(workers);

            while let Some((file, outcome)) = outcomes.next().await {
                summary.record(&outcome);
                reporter.update(&relative_path(file, &base));
            }
        }
        summary.processing_time = processing_start.elapsed();

        if deferred {
            let remaining = std::mem::take(&mut *run.queue.lock().await);
            if !remaining.is_empty() {
                let flush_start = Instant::now();
                let flushed = self.store_batch(&run, remaining).await;
                info!(
                    "Flushed {} remaining chunks from embedding queue ({:.2}s)",
                    flushed,
                    flush_start.elapsed().as_secs_f64()
                );
            }
        }

        let failed_paths = std::mem::take(&mut *run.failed_paths.lock().await);
        if !failed_paths.is_empty() {
            self.purge_partial_files(&failed_paths).await;
        }

        if self.config.cleanup_deleted && !single_file {
            let scope = relative_path(path, &base);
            summary.chunks_removed = self
                .cleanup_deleted(&base, &scope, &files, run.branch.as_deref())
                .await;
        } else {
            debug!("Deleted file cleanup skipped");
        }

        self.store.flush().await.context("Failed to persist chunk table")?;

        summary.chunks_added = run.stored.load(Ordering::SeqCst);
        summary.errors += run.failed_batches.load(Ordering::SeqCst);
        summary.total_time = started.elapsed();
        info!("Indexing complete: {}", summary);
        if reporter.total() > 0 {
            debug!("{}", reporter.summary());
        }

        self.store.get_stats().await.context("Failed to read index statistics")
    }

    async fn process_file(&self, run: &Run<'_>, path: &Path) -> FileOutcome {
        match self.try_process_file(run, path).await {
            Ok(outcome) => {
                if let FileOutcome::Skipped(reason) = &outcome {
                    debug!("Skipping {:?}: {}", path, reason);
                }
                outcome
            }
            Err(e) => {
                error!("Failed to index {:?}: {:#}", path, e);
                FileOutcome::Error(format!("{:#}", e))
            }
        }
    }

    async fn try_process_file(&self, run: &Run<'_>, path: &Path) -> Result<FileOutcome> {
        let rel_path = relative_path(path, run.base);
        let language = detect_language(path);

        let discovery = Arc::clone(&self.discovery);
        let owned = path.to_path_buf();
        let checked = tokio::task::spawn_blocking(move || -> Result<std::result::Result<String, SkipReason>> {
            match discovery.check_file(&owned) {
                FileCheck::Indexable => {}
                FileCheck::TooLarge(_) => return Ok(Err(SkipReason::TooLarge)),
                FileCheck::NotText => return Ok(Err(SkipReason::NotText)),
                FileCheck::Unreadable(reason) => anyhow::bail!("cannot read file: {}", reason),
            }
            compute_file_hash(&owned).map(Ok).context("Failed to hash file")
        })
        .await??;

        let file_hash = match checked {
            Ok(hash) => hash,
            Err(reason) => return Ok(FileOutcome::Skipped(reason)),
        };

        let stored_hash = self
            .store
            .get_file_hash(&rel_path)
            .await
            .context("Failed to look up stored hash")?;
        if !should_reindex(run.force, stored_hash.as_deref(), &file_hash) {
            return Ok(FileOutcome::Skipped(SkipReason::Unchanged));
        }

        let chunkers = Arc::clone(&self.chunkers);
        let owned = path.to_path_buf();
        let chunk_path = rel_path.clone();
        let raw: Vec<RawChunk> = tokio::task::spawn_blocking(move || -> Result<Vec<RawChunk>> {
            let content = read_text_lossy(&owned).context("Failed to read file")?;
            if content.trim().is_empty() {
                return Ok(Vec::new());
            }
            Ok(chunkers.chunk(language, &content, &chunk_path))
        })
        .await??;

        // Old chunks go first so the path never holds two generations.
        let removed = self
            .store
            .delete_by_path(&rel_path)
            .await
            .context("Failed to delete stale chunks")?;
        if removed > 0 {
            debug!("Removed {} stale chunks for {}", removed, rel_path);
        }

        if raw.is_empty() {
            return Ok(FileOutcome::Skipped(SkipReason::NoChunks));
        }

        let indexed_at = unix_timestamp();
        let records: Vec<Chunk> = raw
            .into_iter()
            .map(|(text, meta)| Chunk {
                vector: Vec::new(),
                text,
                path: rel_path.clone(),
                start_line: meta.start_line,
                end_line: meta.end_line,
                chunk_type: meta.chunk_type,
                name: meta.name,
                language: language.to_string(),
                file_hash: file_hash.clone(),
                indexed_at,
                branch: run.branch.clone(),
            })
            .collect();
        let count = records.len();

        if run.deferred {
            self.enqueue(run, records).await;
            debug!("Queued {} chunks from {} for batch embedding", count, rel_path);
        } else {
            let stored = self.embed_and_store(records).await?;
            run.stored.fetch_add(stored, Ordering::SeqCst);
            debug!("Indexed {}: {} chunks", rel_path, stored);
        }

        Ok(FileOutcome::Indexed(count))
    }

    /// Append to the shared queue; drain and embed once it reaches the batch
    /// size. The embedding call runs after the lock is released.
    async fn enqueue(&self, run: &Run<'_>, records: Vec<Chunk>) {
        let ready = {
            let mut queue = run.queue.lock().await;
            queue.extend(records);
            if queue.len() >= self.config.batch_size.max(1) {
                std::mem::take(&mut *queue)
            } else {
                Vec::new()
            }
        };

        if !ready.is_empty() {
            self.store_batch(run, ready).await;
        }
    }

    /// Embed and store one queued batch. A failure drops the batch and marks
    /// its files for removal once the queue has drained.
    async fn store_batch(&self, run: &Run<'_>, batch: Vec<Chunk>) -> usize {
        let size = batch.len();
        let paths: HashSet<String> = batch.iter().map(|c| c.path.clone()).collect();
        match self.embed_and_store(batch).await {
            Ok(stored) => {
                run.stored.fetch_add(stored, Ordering::SeqCst);
                debug!("Embedded and stored batch of {} chunks", stored);
                stored
            }
            Err(e) => {
                run.failed_batches.fetch_add(1, Ordering::SeqCst);
                error!("Dropping batch of {} chunks: {:#}", size, e);
                run.failed_paths.lock().await.extend(paths);
                0
            }
        }
    }

    /// Remove every stored chunk of files that lost part of their chunks to a
    /// failed batch. With no chunks left the file has no stored hash, so the
    /// next run indexes it again.
    async fn purge_partial_files(&self, paths: &HashSet<String>) {
        for path in paths {
            match self.store.delete_by_path(path).await {
                Ok(removed) => warn!(
                    "Removed {} chunks of partially indexed {}; it will be re-indexed next run",
                    removed, path
                ),
                Err(e) => error!("Failed to remove partially indexed {}: {:#}", path, e),
            }
        }
    }

    async fn embed_and_store(&self, mut chunks: Vec<Chunk>) -> Result<usize> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let batch_size = self.config.batch_size;

        let vectors = retry(
            || self.embedder.embed_many(&texts, batch_size),
            self.config.retry,
            EmbeddingError::is_retryable,
        )
        .await
        .context("Failed to embed chunks")?;

        if vectors.len() != chunks.len() {
            anyhow::bail!("Expected {} embeddings, got {}", chunks.len(), vectors.len());
        }
        for (chunk, vector) in chunks.iter_mut().zip(vectors) {
            chunk.vector = vector;
        }

        self.store.add_chunks(chunks).await.context("Failed to store chunks")
    }

    /// Delete chunks of previously indexed paths under `scope` (relative to
    /// `base`, empty for the whole tree) not seen in this run. Failures are
    /// logged and reported as zero removals.
    async fn cleanup_deleted(&self, base: &Path, scope: &str, files: &[PathBuf], branch: Option<&str>) -> usize {
        let indexed = match branch {
            Some(branch) => self.store.get_indexed_files_by_branch(branch).await,
            None => self.store.get_indexed_files().await,
        };
        let indexed = match indexed {
            Ok(indexed) => indexed,
            Err(e) => {
                error!("Failed to cleanup deleted files: {}", e);
                return 0;
            }
        };

        let indexed: HashSet<String> = if scope.is_empty() {
            indexed
        } else {
            let prefix = format!("{}/", scope);
            indexed.into_iter().filter(|p| p.starts_with(&prefix)).collect()
        };

        let discovered: HashSet<String> = files.iter().map(|f| relative_path(f, base)).collect();
        let deleted = find_deleted_files(&indexed, &discovered);
        if deleted.is_empty() {
            debug!("No deleted files to clean up");
            return 0;
        }

        let mut removed = 0;
        for path in &deleted {
            match self.store.delete_by_path(path).await {
                Ok(count) => {
                    removed += count;
                    if count > 0 {
                        info!("Cleaned up {} chunks for deleted file: {}", count, path);
                    }
                }
                Err(e) => warn!("Failed to remove chunks for deleted file {}: {}", path, e),
            }
        }
        removed
    }
}

fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
