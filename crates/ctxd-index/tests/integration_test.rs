//! Integration tests for the ctxd-index crate.
//!
//! These tests drive the indexer, store and search engine together over
//! real temporary directory trees, with offline embeddings.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;

use ctxd_index::embeddings::{EmbeddingError, HashEmbeddings, RetryPolicy};
use ctxd_index::enhancer::{deduplicate, expand_context, DEFAULT_OVERLAP_THRESHOLD};
use ctxd_index::git::StaticGitInfo;
use ctxd_index::{
    ChunkStore, ChunkType, EmbeddingProvider, FileDiscovery, Indexer, IndexerConfig, LocalStore, SearchConfig,
    SearchEngine, SearchQuery,
};

const DIMS: usize = 64;

fn config() -> IndexerConfig {
    IndexerConfig {
        git_enabled: false,
        retry: RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(1),
        },
        ..Default::default()
    }
}

fn hash_indexer(store_dir: &Path, config: IndexerConfig) -> Indexer<HashEmbeddings, LocalStore> {
    Indexer::new(config, Arc::new(HashEmbeddings::new(DIMS)), Arc::new(LocalStore::new(store_dir)))
        .with_git(Arc::new(StaticGitInfo::default()))
}

fn write_functions(dir: &Path, names: &[&str]) {
    for name in names {
        fs::write(
            dir.join(format!("{}.py", name)),
            format!("def {}():\n    return 1\n", name),
        )
        .unwrap();
    }
}

/// Counts embedding calls on top of feature hashing.
struct CountingEmbedder {
    inner: HashEmbeddings,
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.inner.embed(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed_batch(texts).await
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn model_name(&self) -> &str {
        "counting"
    }
}

/// Always fails with a retryable error.
struct FailingEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::NetworkError("connection refused".to_string()))
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EmbeddingError::NetworkError("connection refused".to_string()))
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn model_name(&self) -> &str {
        "failing"
    }
}

/// Rejects any batch holding a text that contains `poison`.
struct PoisonEmbedder {
    inner: HashEmbeddings,
}

#[async_trait]
impl EmbeddingProvider for PoisonEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.contains("poison") {
            return Err(EmbeddingError::InvalidResponse("poisoned input".to_string()));
        }
        self.inner.embed(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.iter().any(|t| t.contains("poison")) {
            return Err(EmbeddingError::InvalidResponse("poisoned input".to_string()));
        }
        self.inner.embed_batch(texts).await
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn model_name(&self) -> &str {
        "poison"
    }
}

/// Ignored files are never discovered, and a chunk's own embedding finds it.
#[tokio::test]
async fn test_gitignore_and_self_similarity() {
    let project = tempdir().unwrap();
    let store_dir = tempdir().unwrap();
    fs::write(project.path().join("a.py"), "def foo():\n    return 42\n").unwrap();
    fs::write(project.path().join("b.py"), "def bar():\n    return 0\n").unwrap();
    fs::write(project.path().join(".gitignore"), "b.py\n").unwrap();

    let discovered = FileDiscovery::default().discover(project.path()).unwrap();
    let sources: Vec<_> = discovered
        .iter()
        .filter(|p| p.extension().is_some_and(|e| e == "py"))
        .collect();
    assert_eq!(sources.len(), 1);
    assert!(sources[0].ends_with("a.py"));

    let indexer = hash_indexer(store_dir.path(), config());
    indexer.index_path(project.path(), false, None, None).await.unwrap();

    let store = Arc::clone(indexer.store());
    let files = store.get_indexed_files().await.unwrap();
    assert!(files.contains("a.py"));
    assert!(!files.contains("b.py"));

    let hits = store.keyword_search("foo", None, 5).await.unwrap();
    let (foo_chunk, _) = hits.into_iter().find(|(c, _)| c.path == "a.py").unwrap();
    assert_eq!(foo_chunk.chunk_type, ChunkType::Function);
    assert_eq!(foo_chunk.name.as_deref(), Some("foo"));

    let engine = SearchEngine::new(store, SearchConfig::default());
    let results = engine
        .search(&SearchQuery::vector(foo_chunk.vector.clone()).with_limit(3))
        .await
        .unwrap();
    assert_eq!(results[0].chunk.path, "a.py");
    assert!((results[0].score - 1.0).abs() < 1e-4);
}

#[tokio::test]
async fn test_markdown_single_section() {
    let project = tempdir().unwrap();
    let store_dir = tempdir().unwrap();
    fs::write(project.path().join("doc.md"), "# Title\n\nHello").unwrap();

    let indexer = hash_indexer(store_dir.path(), config());
    let stats = indexer.index_path(project.path(), false, None, None).await.unwrap();
    assert_eq!(stats.total_chunks, 1);
    assert_eq!(stats.languages.get("markdown"), Some(&1));

    let hits = indexer.store().keyword_search("hello", None, 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    let chunk = &hits[0].0;
    assert_eq!(chunk.chunk_type, ChunkType::Section);
    assert_eq!(chunk.name.as_deref(), Some("Title"));
    assert!(chunk.text.contains("Hello"));
}

#[tokio::test]
async fn test_reindex_unchanged_and_forced() {
    let project = tempdir().unwrap();
    let store_dir = tempdir().unwrap();
    write_functions(project.path(), &["alpha", "beta", "gamma"]);
    fs::write(project.path().join("notes.txt"), "first paragraph\n\nsecond paragraph\n").unwrap();

    let indexer = hash_indexer(store_dir.path(), config());
    let first = indexer.index_path(project.path(), false, None, None).await.unwrap();
    assert!(first.total_chunks >= 4);

    let unchanged = indexer.index_path(project.path(), false, None, None).await.unwrap();
    assert_eq!(unchanged.total_chunks, first.total_chunks);

    let forced = indexer.index_path(project.path(), true, None, None).await.unwrap();
    assert_eq!(forced.total_chunks, first.total_chunks);
    assert_eq!(forced.total_files, first.total_files);
}

#[tokio::test]
async fn test_modified_file_is_replaced() {
    let project = tempdir().unwrap();
    let store_dir = tempdir().unwrap();
    let file = project.path().join("m.py");
    fs::write(&file, "def old_name():\n    return 1\n").unwrap();

    let indexer = hash_indexer(store_dir.path(), config());
    indexer.index_path(project.path(), false, None, None).await.unwrap();
    let before = indexer.store().get_file_hash("m.py").await.unwrap();

    fs::write(&file, "def new_name():\n    return 2\n\n\ndef other():\n    return 3\n").unwrap();
    indexer.index_path(project.path(), false, None, None).await.unwrap();

    assert_eq!(indexer.store().count().await.unwrap(), 2);
    assert_ne!(indexer.store().get_file_hash("m.py").await.unwrap(), before);
    assert!(indexer
        .store()
        .keyword_search("old_name", None, 5)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_deleted_file_cleanup_enabled() {
    let project = tempdir().unwrap();
    let store_dir = tempdir().unwrap();
    write_functions(project.path(), &["keep", "gone"]);

    let indexer = hash_indexer(store_dir.path(), config());
    indexer.index_path(project.path(), false, None, None).await.unwrap();
    assert!(indexer.store().get_indexed_files().await.unwrap().contains("gone.py"));

    fs::remove_file(project.path().join("gone.py")).unwrap();
    indexer.index_path(project.path(), false, None, None).await.unwrap();

    let files = indexer.store().get_indexed_files().await.unwrap();
    assert!(files.contains("keep.py"));
    assert!(!files.contains("gone.py"));
}

#[tokio::test]
async fn test_deleted_file_cleanup_disabled() {
    let project = tempdir().unwrap();
    let store_dir = tempdir().unwrap();
    write_functions(project.path(), &["keep", "gone"]);

    let config = IndexerConfig {
        cleanup_deleted: false,
        ..config()
    };
    let indexer = hash_indexer(store_dir.path(), config);
    indexer.index_path(project.path(), false, None, None).await.unwrap();

    fs::remove_file(project.path().join("gone.py")).unwrap();
    indexer.index_path(project.path(), false, None, None).await.unwrap();

    assert!(indexer.store().get_indexed_files().await.unwrap().contains("gone.py"));
}

#[tokio::test]
async fn test_branch_scoped_cleanup_leaves_other_branches() {
    let project = tempdir().unwrap();
    let store_dir = tempdir().unwrap();
    write_functions(project.path(), &["shared"]);

    let indexer = hash_indexer(store_dir.path(), config());
    indexer
        .index_path(project.path(), false, Some("main".to_string()), None)
        .await
        .unwrap();

    let other = tempdir().unwrap();
    write_functions(other.path(), &["feature_only"]);
    let other_indexer = Indexer::new(
        config(),
        Arc::new(HashEmbeddings::new(DIMS)),
        Arc::clone(indexer.store()),
    )
    .with_git(Arc::new(StaticGitInfo::default()));
    other_indexer
        .index_path(other.path(), false, Some("feature".to_string()), None)
        .await
        .unwrap();

    let files = indexer.store().get_indexed_files().await.unwrap();
    assert!(files.contains("shared.py"));
    assert!(files.contains("feature_only.py"));
}

#[tokio::test]
async fn test_deferred_batches_amortize_embedding_calls() {
    let project = tempdir().unwrap();
    let store_dir = tempdir().unwrap();
    write_functions(project.path(), &["a", "b", "c", "d", "e"]);

    let embedder = Arc::new(CountingEmbedder {
        inner: HashEmbeddings::new(DIMS),
        calls: AtomicUsize::new(0),
    });
    let config = IndexerConfig {
        batch_size: 2,
        max_workers: 4,
        ..config()
    };
    let indexer = Indexer::new(config, Arc::clone(&embedder), Arc::new(LocalStore::new(store_dir.path())))
        .with_git(Arc::new(StaticGitInfo::default()));

    let stats = indexer.index_path(project.path(), false, None, None).await.unwrap();
    assert_eq!(stats.total_chunks, 5);
    // Two full batches of two, then the final flush of one.
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_serial_mode_embeds_per_file() {
    let project = tempdir().unwrap();
    let store_dir = tempdir().unwrap();
    write_functions(project.path(), &["a", "b", "c"]);

    let embedder = Arc::new(CountingEmbedder {
        inner: HashEmbeddings::new(DIMS),
        calls: AtomicUsize::new(0),
    });
    let config = IndexerConfig {
        parallel: false,
        ..config()
    };
    let indexer = Indexer::new(config, Arc::clone(&embedder), Arc::new(LocalStore::new(store_dir.path())))
        .with_git(Arc::new(StaticGitInfo::default()));

    let stats = indexer.index_path(project.path(), false, None, None).await.unwrap();
    assert_eq!(stats.total_chunks, 3);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_embedding_failure_does_not_abort_run() {
    let project = tempdir().unwrap();
    let store_dir = tempdir().unwrap();
    write_functions(project.path(), &["a", "b", "c"]);

    let embedder = Arc::new(FailingEmbedder {
        calls: AtomicUsize::new(0),
    });
    let indexer = Indexer::new(config(), Arc::clone(&embedder), Arc::new(LocalStore::new(store_dir.path())))
        .with_git(Arc::new(StaticGitInfo::default()));

    let stats = indexer.index_path(project.path(), false, None, None).await.unwrap();
    assert_eq!(stats.total_chunks, 0);
    // One batch, retried once.
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
}

/// A file that lost chunks to a failed batch keeps nothing in the store, so
/// the next run sees no stored hash and indexes it again.
#[tokio::test]
async fn test_failed_batch_leaves_file_repairable() {
    let project = tempdir().unwrap();
    let store_dir = tempdir().unwrap();
    write_functions(project.path(), &["a", "b", "c"]);
    fs::write(
        project.path().join("multi.py"),
        "def first():\n    return 1\n\n\ndef second():\n    return \"poison\"\n\n\ndef third():\n    return 3\n",
    )
    .unwrap();

    let config = IndexerConfig {
        batch_size: 2,
        max_workers: 4,
        ..config()
    };
    let poisoned = Indexer::new(
        config.clone(),
        Arc::new(PoisonEmbedder {
            inner: HashEmbeddings::new(DIMS),
        }),
        Arc::new(LocalStore::new(store_dir.path())),
    )
    .with_git(Arc::new(StaticGitInfo::default()));
    poisoned.index_path(project.path(), false, None, None).await.unwrap();

    let store = poisoned.store();
    assert!(!store.get_indexed_files().await.unwrap().contains("multi.py"));
    assert_eq!(store.get_file_hash("multi.py").await.unwrap(), None);

    // Same content, healthy embedder.
    let healthy = hash_indexer(store_dir.path(), config);
    healthy.index_path(project.path(), false, None, None).await.unwrap();

    let files = healthy.store().get_indexed_files().await.unwrap();
    assert!(files.contains("multi.py"));
    for name in ["a.py", "b.py", "c.py"] {
        assert!(files.contains(name), "{} missing", name);
    }
}

#[tokio::test]
async fn test_index_persists_across_reopen() {
    let project = tempdir().unwrap();
    let store_dir = tempdir().unwrap();
    write_functions(project.path(), &["persisted"]);

    let indexer = hash_indexer(store_dir.path(), config());
    indexer.index_path(project.path(), false, None, None).await.unwrap();

    let reopened = LocalStore::new(store_dir.path());
    assert_eq!(reopened.count().await.unwrap(), 1);
    let hits = reopened.keyword_search("persisted", None, 5).await.unwrap();
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn test_search_then_enhance() {
    let project = tempdir().unwrap();
    let store_dir = tempdir().unwrap();
    fs::write(
        project.path().join("calc.py"),
        "def add(a, b):\n    return a + b\n\n\ndef subtract(a, b):\n    return a - b\n",
    )
    .unwrap();

    let embedder = Arc::new(HashEmbeddings::new(DIMS));
    let indexer = Indexer::new(config(), Arc::clone(&embedder), Arc::new(LocalStore::new(store_dir.path())))
        .with_git(Arc::new(StaticGitInfo::default()));
    indexer.index_path(project.path(), false, None, None).await.unwrap();

    let engine = SearchEngine::new(Arc::clone(indexer.store()), SearchConfig::default());
    let vector = embedder.embed("subtract").await.unwrap();
    let query = SearchQuery::text("subtract").with_vector(vector).with_min_score(0.0);
    let results = engine.search(&query).await.unwrap();
    assert!(!results.is_empty());
    assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.score)));
    assert_eq!(results[0].chunk.name.as_deref(), Some("subtract"));

    let results = deduplicate(results, DEFAULT_OVERLAP_THRESHOLD);
    let expanded = expand_context(results, 10, 10, project.path());
    assert_eq!(expanded[0].chunk.start_line, 1);
    assert!(expanded[0].chunk.text.contains("def add"));
}
