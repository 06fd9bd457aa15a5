//! Chunk storage: the record type, the store contract, and the bundled
//! local implementation.

pub mod bm25;
pub mod filter;
pub mod local;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunker::ChunkType;

pub use bm25::BM25Index;
pub use filter::{like_match, Column, Predicate, SearchFilter};
pub use local::LocalStore;

/// RRF smoothing constant used by hybrid search.
pub const RRF_K: f32 = 60.0;

/// Errors raised by a chunk store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to (de)serialize table: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Table does not exist: {0}")]
    TableMissing(String),

    #[error("Table is corrupt: {0}")]
    Corrupt(String),

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Operation not supported by this store: {0}")]
    Unsupported(String),

    #[error("Index was built with embeddings '{stored}' but '{expected}' is configured; run `ctxd clean` and re-index")]
    EmbeddingMismatch { stored: String, expected: String },
}

/// One indexed chunk with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub vector: Vec<f32>,
    pub text: String,
    /// Path relative to the index root, `/`-separated
    pub path: String,
    /// 1-indexed, inclusive
    pub start_line: usize,
    /// 1-indexed, inclusive
    pub end_line: usize,
    pub chunk_type: ChunkType,
    pub name: Option<String>,
    pub language: String,
    /// SHA-256 of the source file when it was chunked
    pub file_hash: String,
    /// Seconds since the Unix epoch
    pub indexed_at: f64,
    pub branch: Option<String>,
}

/// Aggregate statistics, recomputed from the table on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_files: usize,
    pub total_chunks: usize,
    /// Sum of chunk text lengths in bytes
    pub total_size_bytes: u64,
    pub languages: BTreeMap<String, usize>,
    pub last_indexed: Option<f64>,
}

impl IndexStats {
    /// Compute statistics over a set of chunks.
    pub fn from_chunks<'a, I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = &'a Chunk>,
    {
        let mut stats = Self::default();
        let mut paths = HashSet::new();

        for chunk in chunks {
            stats.total_chunks += 1;
            stats.total_size_bytes += chunk.text.len() as u64;
            *stats.languages.entry(chunk.language.clone()).or_insert(0) += 1;
            paths.insert(chunk.path.as_str());
            stats.last_indexed = Some(match stats.last_indexed {
                Some(t) => t.max(chunk.indexed_at),
                None => chunk.indexed_at,
            });
        }

        stats.total_files = paths.len();
        stats
    }

    /// Languages sorted by chunk count, most frequent first.
    pub fn languages_by_count(&self) -> Vec<(&str, usize)> {
        let mut langs: Vec<(&str, usize)> = self.languages.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        langs.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        langs
    }
}

impl fmt::Display for IndexStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total files: {}", self.total_files)?;
        writeln!(f, "Total chunks: {}", self.total_chunks)?;
        write!(f, "Index size: {:.2} MB", self.total_size_bytes as f64 / 1024.0 / 1024.0)?;
        if !self.languages.is_empty() {
            write!(f, "\nLanguages:")?;
            for (lang, count) in self.languages_by_count() {
                write!(f, "\n  {}: {}", lang, count)?;
            }
        }
        Ok(())
    }
}

/// A table of chunk records.
///
/// Scores returned by the search methods depend on the method:
/// `vector_search` returns a distance (lower is closer), `keyword_search`
/// the backend's native relevance (higher is better), and `hybrid_search`
/// a fused score in `[0, 1]`.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Create the table if missing, otherwise open it. Safe to call
    /// concurrently and repeatedly.
    async fn ensure_table(&self) -> Result<(), StoreError>;

    /// Insert chunks, returning how many were added.
    async fn add_chunks(&self, chunks: Vec<Chunk>) -> Result<usize, StoreError>;

    /// Delete every row matching `predicate`, returning the count removed.
    async fn delete_where(&self, predicate: &Predicate) -> Result<usize, StoreError>;

    async fn delete_by_path(&self, path: &str) -> Result<usize, StoreError> {
        self.delete_where(&Predicate::eq(Column::Path, path)).await
    }

    async fn delete_by_branch(&self, branch: &str) -> Result<usize, StoreError> {
        self.delete_where(&Predicate::eq(Column::Branch, branch)).await
    }

    /// Nearest neighbours of `vector` by distance.
    async fn vector_search(
        &self,
        vector: &[f32],
        filter: Option<&Predicate>,
        limit: usize,
    ) -> Result<Vec<(Chunk, f32)>, StoreError>;

    /// Keyword ranking of `text`. Returns [`StoreError::Unsupported`] when
    /// the backend has no keyword index.
    async fn keyword_search(
        &self,
        text: &str,
        filter: Option<&Predicate>,
        limit: usize,
    ) -> Result<Vec<(Chunk, f32)>, StoreError>;

    /// Fused vector and keyword ranking. `fts_weight` in `[0, 1]` is the
    /// keyword share of the fusion.
    async fn hybrid_search(
        &self,
        text: &str,
        vector: &[f32],
        filter: Option<&Predicate>,
        limit: usize,
        fts_weight: f32,
    ) -> Result<Vec<(Chunk, f32)>, StoreError>;

    /// Distinct paths across all branches.
    async fn get_indexed_files(&self) -> Result<HashSet<String>, StoreError>;

    /// Distinct paths of chunks tagged with `branch`.
    async fn get_indexed_files_by_branch(&self, branch: &str) -> Result<HashSet<String>, StoreError>;

    /// Stored content hash for `path`, if any chunk exists for it.
    async fn get_file_hash(&self, path: &str) -> Result<Option<String>, StoreError>;

    async fn get_stats(&self) -> Result<IndexStats, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;

    /// Drop the table and everything in it.
    async fn clear_all(&self) -> Result<(), StoreError>;

    /// Persist pending changes.
    async fn flush(&self) -> Result<(), StoreError>;

    /// Counter bumped on every mutation that changed the table.
    fn generation(&self) -> u64;
}

/// Weighted reciprocal rank fusion of two rankings.
///
/// Each list contributes `weight / (k + rank + 1)` per id, with ranks
/// starting at 0. The result is sorted by fused score, descending.
pub fn reciprocal_rank_fusion<I>(
    vector_results: &[(I, f32)],
    keyword_results: &[(I, f32)],
    k: f32,
    vector_weight: f32,
    keyword_weight: f32,
) -> Vec<(I, f32)>
where
    I: Clone + Eq + Hash + Ord,
{
    let mut scores: HashMap<I, f32> = HashMap::new();

    for (rank, (id, _)) in vector_results.iter().enumerate() {
        *scores.entry(id.clone()).or_default() += vector_weight / (k + rank as f32 + 1.0);
    }

    for (rank, (id, _)) in keyword_results.iter().enumerate() {
        *scores.entry(id.clone()).or_default() += keyword_weight / (k + rank as f32 + 1.0);
    }

    let mut results: Vec<(I, f32)> = scores.into_iter().collect();
    results.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(path: &str, language: &str, text: &str, indexed_at: f64) -> Chunk {
        Chunk {
            vector: vec![],
            text: text.to_string(),
            path: path.to_string(),
            start_line: 1,
            end_line: 1,
            chunk_type: ChunkType::Block,
            name: None,
            language: language.to_string(),
            file_hash: String::new(),
            indexed_at,
            branch: None,
        }
    }

    #[test]
    fn test_stats_from_chunks() {
        let chunks = vec![
            chunk("a.py", "python", "abcd", 10.0),
            chunk("a.py", "python", "ef", 30.0),
            chunk("b.rs", "rust", "g", 20.0),
        ];
        let stats = IndexStats::from_chunks(&chunks);

        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.total_chunks, 3);
        assert_eq!(stats.total_size_bytes, 7);
        assert_eq!(stats.languages.get("python"), Some(&2));
        assert_eq!(stats.last_indexed, Some(30.0));
        assert_eq!(stats.languages_by_count()[0], ("python", 2));
    }

    #[test]
    fn test_stats_empty() {
        let stats = IndexStats::from_chunks(Vec::<Chunk>::new().iter());
        assert_eq!(stats, IndexStats::default());
        assert!(stats.to_string().contains("Total chunks: 0"));
    }

    #[test]
    fn test_rrf_fusion_prefers_shared_ids() {
        let vector = vec![(1u64, 0.9), (2, 0.8), (3, 0.7)];
        let keyword = vec![(2u64, 5.0), (1, 4.0), (4, 3.0)];

        let fused = reciprocal_rank_fusion(&vector, &keyword, 60.0, 0.5, 0.5);
        let top_two: Vec<u64> = fused.iter().take(2).map(|(id, _)| *id).collect();
        assert!(top_two.contains(&1) && top_two.contains(&2));
        assert_eq!(fused.len(), 4);
    }

    #[test]
    fn test_rrf_single_source_keeps_order() {
        let vector = vec![(7u64, 0.9), (3, 0.8)];
        let fused = reciprocal_rank_fusion(&vector, &[], 60.0, 1.0, 0.0);
        assert_eq!(fused.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![7, 3]);
    }

    #[test]
    fn test_rrf_weights_and_k() {
        let vector = vec![(1u64, 0.9)];
        let keyword = vec![(2u64, 5.0)];
        let equal = reciprocal_rank_fusion(&vector, &keyword, 60.0, 0.5, 0.5);
        assert!((equal[0].1 - equal[1].1).abs() < f32::EPSILON);

        let ranked = vec![(1u64, 0.9), (2, 0.8)];
        let low_k = reciprocal_rank_fusion(&ranked, &[], 10.0, 1.0, 0.0);
        let high_k = reciprocal_rank_fusion(&ranked, &[], 100.0, 1.0, 0.0);
        assert!(low_k[0].1 - low_k[1].1 > high_k[0].1 - high_k[1].1);
    }

    #[test]
    fn test_rrf_empty_inputs() {
        let fused: Vec<(u64, f32)> = reciprocal_rank_fusion(&[], &[], 60.0, 0.5, 0.5);
        assert!(fused.is_empty());
    }
}
