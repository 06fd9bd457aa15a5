//! A project's configuration and the index components built from it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ctxd_config::Config;
use ctxd_index::embeddings::RetryPolicy;
use ctxd_index::{
    create_provider, embedding_fingerprint, DiscoveryConfig, EmbeddingProvider, EmbeddingSettings, IndexerConfig, LocalStore, ProviderKind,
    SearchConfig, SearchMode,
};

use crate::logging;

/// Project root, its configuration, and the shared chunk store.
pub struct Workspace {
    pub root: PathBuf,
    pub config: Config,
    pub store: Arc<LocalStore>,
}

impl Workspace {
    /// Load configuration for `root`. Warnings raised while loading are
    /// written through a temporary stderr subscriber.
    pub fn load(root: &Path, debug: bool) -> Result<Self> {
        let config = tracing::subscriber::with_default(logging::bootstrap_subscriber(debug), || Config::load(root))
            .with_context(|| format!("Failed to load configuration for {:?}", root))?;
        Ok(Self::with_config(root, config))
    }

    /// The store refuses to open a table built with a different embedding
    /// provider, model or dimension than `config` names.
    pub fn with_config(root: &Path, config: Config) -> Self {
        let mut store = LocalStore::new(ctxd_config::index_dir(root));
        if let Some(fingerprint) = fingerprint(&config) {
            store = store.with_embedding(fingerprint);
        }
        let store = Arc::new(store);
        Self {
            root: root.to_path_buf(),
            config,
            store,
        }
    }

    pub fn index_dir(&self) -> PathBuf {
        ctxd_config::index_dir(&self.root)
    }

    pub fn has_index(&self) -> bool {
        self.store.table_path().exists()
    }

    pub fn embedder(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        create_provider(&embedding_settings(&self.config)?).context("Failed to create embedding provider")
    }

    pub fn indexer_config(&self) -> IndexerConfig {
        indexer_config(&self.config)
    }

    pub fn search_config(&self) -> SearchConfig {
        search_config(&self.config)
    }

    pub fn default_mode(&self) -> Result<SearchMode> {
        Ok(self.config.search.mode.parse::<SearchMode>()?)
    }
}

/// Embedding fingerprint for `config`; `None` when the provider name is
/// invalid, which [`Workspace::embedder`] reports on use.
pub fn fingerprint(config: &Config) -> Option<String> {
    let kind = config.embeddings.provider.parse::<ProviderKind>().ok()?;
    Some(embedding_fingerprint(
        kind,
        &config.embeddings.model,
        config.embeddings.dimensions,
    ))
}

pub fn embedding_settings(config: &Config) -> Result<EmbeddingSettings> {
    let embeddings = &config.embeddings;
    Ok(EmbeddingSettings {
        provider: embeddings.provider.parse::<ProviderKind>()?,
        model: embeddings.model.clone(),
        dimensions: embeddings.dimensions,
        endpoint: embeddings.endpoint.clone(),
        api_key: embeddings.resolved_api_key()?,
        cache_dir: None,
    })
}

pub fn indexer_config(config: &Config) -> IndexerConfig {
    IndexerConfig {
        max_chunk_size: config.indexer.max_chunk_size,
        chunk_overlap: config.indexer.chunk_overlap,
        batch_size: config.embeddings.batch_size,
        parallel: config.performance.parallel_enabled,
        max_workers: config.performance.workers(),
        batch_embedding: config.performance.batch_embedding,
        cleanup_deleted: config.git.cleanup_deleted,
        git_enabled: config.git.enabled,
        retry: RetryPolicy {
            max_attempts: config.embeddings.max_attempts,
            delay: Duration::from_millis(config.embeddings.retry_delay_ms),
        },
        discovery: DiscoveryConfig {
            exclude: config.indexer.exclude.clone(),
            max_file_size: config.indexer.max_file_size,
            nested_gitignore: config.git.nested_gitignore,
            max_depth: config.indexer.max_depth,
        },
    }
}

pub fn search_config(config: &Config) -> SearchConfig {
    SearchConfig {
        default_limit: config.search.default_limit,
        min_score: config.search.min_score,
        fts_min_score: config.search.fts_min_score,
        fts_weight: config.search.fts_weight,
        cache_size: config.search.cache_size,
    }
}
