//! Mode-dispatching search over a chunk store.
//!
//! A query carries a vector, text, or both. The mode is either given or
//! inferred (both present means hybrid, vector only means vector, text only
//! means keyword). Scores are mode specific:
//! - vector: `1 / (1 + distance)`, in `(0, 1]`
//! - fts: the store's raw BM25 score, unbounded
//! - hybrid: fused reciprocal-rank score, in `[0, 1]`

pub mod cache;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::embeddings::EmbeddingError;
use crate::store::{Chunk, ChunkStore, SearchFilter, StoreError};

pub use cache::LruCache;

/// Vector components included in the cache key.
const CACHE_VECTOR_PREFIX: usize = 5;

/// Errors returned by [`SearchEngine::search`].
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Invalid search arguments: {0}")]
    InvalidArguments(String),

    #[error("Hybrid search is unavailable and no query vector was supplied")]
    HybridUnavailable,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
}

/// Retrieval strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Vector,
    Fts,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Fts => "fts",
            Self::Hybrid => "hybrid",
        }
    }

    /// Whether the query text must be embedded for this mode.
    pub fn needs_vector(&self) -> bool {
        matches!(self, Self::Vector | Self::Hybrid)
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vector" => Ok(Self::Vector),
            "fts" | "keyword" => Ok(Self::Fts),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(SearchError::InvalidArguments(format!(
                "invalid search mode '{}', use 'vector', 'fts', or 'hybrid'",
                other
            ))),
        }
    }
}

/// A chunk paired with its relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub score: f32,
}

impl fmt::Display for SearchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{} (score: {:.3}) {}",
            self.chunk.path, self.chunk.start_line, self.chunk.end_line, self.score, self.chunk.chunk_type
        )?;
        if let Some(name) = &self.chunk.name {
            write!(f, ": {}", name)?;
        }
        Ok(())
    }
}

/// Engine-wide defaults.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub default_limit: usize,
    /// Results scoring strictly below this are dropped
    pub min_score: f32,
    /// Overrides `min_score` in keyword mode, whose scores are unbounded
    pub fts_min_score: Option<f32>,
    /// Keyword share of hybrid fusion
    pub fts_weight: f32,
    /// LRU capacity; 0 disables caching
    pub cache_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            min_score: 0.3,
            fts_min_score: None,
            fts_weight: 0.5,
            cache_size: 100,
        }
    }
}

/// One search request.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub vector: Option<Vec<f32>>,
    pub text: Option<String>,
    pub mode: Option<SearchMode>,
    /// Falls back to the engine's default limit
    pub limit: Option<usize>,
    /// Falls back to the engine's threshold for the resolved mode
    pub min_score: Option<f32>,
    /// Falls back to the engine's fusion weight
    pub fts_weight: Option<f32>,
    pub filter: SearchFilter,
}

impl SearchQuery {
    pub fn vector(vector: Vec<f32>) -> Self {
        Self {
            vector: Some(vector),
            ..Default::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Explicit mode, else inferred from which inputs are present.
    pub fn resolve_mode(&self) -> Result<SearchMode, SearchError> {
        let mode = match (self.mode, &self.vector, &self.text) {
            (Some(mode), _, _) => mode,
            (None, Some(_), Some(_)) => SearchMode::Hybrid,
            (None, Some(_), None) => SearchMode::Vector,
            (None, None, Some(_)) => SearchMode::Fts,
            (None, None, None) => {
                return Err(SearchError::InvalidArguments(
                    "either query text or a query vector must be provided".to_string(),
                ))
            }
        };

        match mode {
            SearchMode::Vector if self.vector.is_none() => Err(SearchError::InvalidArguments(
                "a query vector is required for vector mode".to_string(),
            )),
            SearchMode::Fts | SearchMode::Hybrid if self.text.is_none() => Err(SearchError::InvalidArguments(
                format!("query text is required for {} mode", mode),
            )),
            _ => Ok(mode),
        }
    }
}

struct CacheState {
    entries: LruCache<String, Vec<SearchResult>>,
    generation: u64,
}

/// Search front end over a [`ChunkStore`], with an optional result cache
/// that is discarded whenever the store changes.
pub struct SearchEngine<S: ChunkStore + ?Sized> {
    store: Arc<S>,
    config: SearchConfig,
    cache: Mutex<CacheState>,
}

impl<S: ChunkStore + ?Sized> SearchEngine<S> {
    pub fn new(store: Arc<S>, config: SearchConfig) -> Self {
        let generation = store.generation();
        let cache = CacheState {
            entries: LruCache::new(config.cache_size),
            generation,
        };
        Self {
            store,
            config,
            cache: Mutex::new(cache),
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Drop every cached result.
    pub fn invalidate_all(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.entries.clear();
        debug!("Search cache cleared");
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    /// Run a query and return results ranked best first.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, SearchError> {
        let mode = query.resolve_mode()?;
        let limit = query.limit.unwrap_or(self.config.default_limit);
        let fts_weight = query.fts_weight.unwrap_or(self.config.fts_weight).clamp(0.0, 1.0);
        let min_score = query.min_score.unwrap_or(match mode {
            SearchMode::Fts => self.config.fts_min_score.unwrap_or(self.config.min_score),
            _ => self.config.min_score,
        });

        let key = (self.config.cache_size > 0).then(|| cache_key(query, mode, limit, min_score, fts_weight));
        if let Some(key) = &key {
            if let Some(hit) = self.cache_get(key) {
                debug!("Search cache hit for key={}...", &key[..8]);
                return Ok(hit);
            }
        }
        let generation = self.store.generation();

        let mut results = self.execute(query, mode, limit, fts_weight).await?;
        results.retain(|r| r.score >= min_score);
        debug!("Search (mode={}) returned {} results", mode, results.len());

        if let Some(key) = key {
            self.cache_put(key, results.clone(), generation);
        }
        Ok(results)
    }

    async fn execute(
        &self,
        query: &SearchQuery,
        mode: SearchMode,
        limit: usize,
        fts_weight: f32,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let predicate = query.filter.to_predicate();
        if let Some(p) = &predicate {
            debug!("Search filter: {}", p);
        }
        let filter = predicate.as_ref();
        let text = query.text.as_deref().unwrap_or_default();

        match mode {
            SearchMode::Vector => {
                let vector = query.vector.as_deref().unwrap_or_default();
                self.vector_results(vector, filter, limit).await
            }
            SearchMode::Fts => match self.store.keyword_search(text, filter, limit).await {
                Ok(hits) => Ok(hits
                    .into_iter()
                    .map(|(chunk, score)| SearchResult { chunk, score })
                    .collect()),
                Err(StoreError::Unsupported(reason)) => {
                    warn!("Keyword search not available ({}), returning no results", reason);
                    Ok(Vec::new())
                }
                Err(e) => Err(e.into()),
            },
            SearchMode::Hybrid => {
                let Some(vector) = query.vector.as_deref() else {
                    return Err(SearchError::HybridUnavailable);
                };
                match self.store.hybrid_search(text, vector, filter, limit, fts_weight).await {
                    Ok(hits) => Ok(hits
                        .into_iter()
                        .map(|(chunk, score)| SearchResult { chunk, score })
                        .collect()),
                    Err(StoreError::Unsupported(reason)) => {
                        warn!("Hybrid search not available ({}), falling back to vector search", reason);
                        self.vector_results(vector, filter, limit).await
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn vector_results(
        &self,
        vector: &[f32],
        filter: Option<&crate::store::Predicate>,
        limit: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let hits = self.store.vector_search(vector, filter, limit).await?;
        Ok(hits
            .into_iter()
            .map(|(chunk, distance)| SearchResult {
                chunk,
                score: distance_to_score(distance),
            })
            .collect())
    }

    fn cache_get(&self, key: &str) -> Option<Vec<SearchResult>> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.store.generation();
        if cache.generation != current {
            cache.entries.clear();
            cache.generation = current;
            return None;
        }
        cache.entries.get(&key.to_string())
    }

    fn cache_put(&self, key: String, results: Vec<SearchResult>, generation: u64) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        // The store changed while the query ran.
        if generation != self.store.generation() {
            return;
        }
        if cache.generation != generation {
            cache.entries.clear();
            cache.generation = generation;
        }
        cache.entries.put(key, results);
    }
}

/// Map a distance to a similarity in `(0, 1]`. Monotonically decreasing,
/// not a cosine similarity.
pub fn distance_to_score(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

fn cache_key(query: &SearchQuery, mode: SearchMode, limit: usize, min_score: f32, fts_weight: f32) -> String {
    let mut parts = vec![
        format!("mode={}", mode),
        format!("limit={}", limit),
        format!("text={}", query.text.as_deref().unwrap_or_default()),
    ];
    if let Some(vector) = &query.vector {
        let prefix: Vec<f32> = vector.iter().take(CACHE_VECTOR_PREFIX).copied().collect();
        parts.push(format!("vector_prefix={:?}", prefix));
    }
    parts.push(format!("min_score={}", min_score));
    parts.push(format!("fts_weight={}", fts_weight));
    parts.extend(query.filter.cache_parts());

    hex::encode(Sha256::digest(parts.join("|").as_bytes()))
}
