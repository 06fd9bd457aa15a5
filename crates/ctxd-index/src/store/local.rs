//! Local, file-backed chunk table.
//!
//! Rows live in memory and are persisted as a single JSON table file under
//! the index directory. A BM25 index over chunk text is rebuilt on open and
//! kept in step with every insert and delete.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use super::{
    reciprocal_rank_fusion, BM25Index, Chunk, ChunkStore, IndexStats, Predicate, StoreError, RRF_K,
};

/// Default table name.
pub const DEFAULT_TABLE: &str = "chunks";

const TABLE_FORMAT_VERSION: u32 = 1;

/// Candidate multiplier for each side of a hybrid query.
const HYBRID_FETCH_FACTOR: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Row {
    id: u64,
    #[serde(flatten)]
    chunk: Chunk,
}

#[derive(Debug, Serialize, Deserialize)]
struct TableFile {
    version: u32,
    /// Embedding fingerprint the vectors were produced with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    embedding: Option<String>,
    next_id: u64,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct Table {
    rows: Vec<Row>,
    next_id: u64,
    embedding: Option<String>,
    bm25: BM25Index,
    dirty: bool,
}

impl Table {
    fn empty(embedding: Option<String>) -> Self {
        Self {
            embedding,
            ..Self::default()
        }
    }

    fn from_file(file: TableFile) -> Self {
        let mut bm25 = BM25Index::new();
        for row in &file.rows {
            bm25.add_document(row.id, &row.chunk.text);
        }
        let next_id = file
            .rows
            .iter()
            .map(|r| r.id + 1)
            .max()
            .unwrap_or(0)
            .max(file.next_id);

        Self {
            rows: file.rows,
            next_id,
            embedding: file.embedding,
            bm25,
            dirty: false,
        }
    }

    fn dimensions(&self) -> Option<usize> {
        self.rows.first().map(|r| r.chunk.vector.len())
    }

    fn matching<'a>(&'a self, filter: Option<&'a Predicate>) -> impl Iterator<Item = &'a Row> + 'a {
        self.rows
            .iter()
            .filter(move |row| filter.map(|p| p.matches(&row.chunk)).unwrap_or(true))
    }

    fn check_dimensions(&self, actual: usize) -> Result<(), StoreError> {
        match self.dimensions() {
            Some(expected) if expected != actual => Err(StoreError::DimensionMismatch { expected, actual }),
            _ => Ok(()),
        }
    }

    /// Rows matching `filter` ranked by squared L2 distance to `vector`.
    fn rank_by_distance(&self, vector: &[f32], filter: Option<&Predicate>, limit: usize) -> Vec<(u64, f32)> {
        let mut ranked: Vec<(u64, f32)> = self
            .matching(filter)
            .map(|row| (row.id, squared_l2(vector, &row.chunk.vector)))
            .collect();
        ranked.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        ranked.truncate(limit);
        ranked
    }

    fn rank_by_keywords(&self, text: &str, filter: Option<&Predicate>, limit: usize) -> Vec<(u64, f32)> {
        let allowed: Option<HashSet<u64>> = filter.map(|_| self.matching(filter).map(|r| r.id).collect());
        self.bm25
            .search_filtered(text, limit, |id| allowed.as_ref().map(|a| a.contains(&id)).unwrap_or(true))
            .into_iter()
            .map(|(id, score)| (id, score as f32))
            .collect()
    }

    fn resolve(&self, ranked: Vec<(u64, f32)>) -> Vec<(Chunk, f32)> {
        let by_id: HashMap<u64, &Chunk> = self.rows.iter().map(|r| (r.id, &r.chunk)).collect();
        ranked
            .into_iter()
            .filter_map(|(id, score)| by_id.get(&id).map(|c| ((*c).clone(), score)))
            .collect()
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Chunk table persisted as JSON in the index directory.
pub struct LocalStore {
    dir: PathBuf,
    table_name: String,
    table: OnceCell<RwLock<Table>>,
    generation: AtomicU64,
    embedding: Option<String>,
}

impl LocalStore {
    /// Store rooted at `dir` (typically `<project>/.ctxd/index`). Nothing is
    /// read or created until the table is first used.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_table(dir, DEFAULT_TABLE)
    }

    pub fn with_table(dir: impl Into<PathBuf>, table_name: &str) -> Self {
        Self {
            dir: dir.into(),
            table_name: table_name.to_string(),
            table: OnceCell::new(),
            generation: AtomicU64::new(0),
            embedding: None,
        }
    }

    /// Require the table to hold vectors from `fingerprint`. Opening a
    /// non-empty table recorded under another fingerprint fails with
    /// [`StoreError::EmbeddingMismatch`].
    pub fn with_embedding(mut self, fingerprint: impl Into<String>) -> Self {
        self.embedding = Some(fingerprint.into());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the persisted table file.
    pub fn table_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.table_name))
    }

    async fn table(&self) -> Result<&RwLock<Table>, StoreError> {
        self.table
            .get_or_try_init(|| async {
                let table = self.open_or_create().await?;
                Ok::<_, StoreError>(RwLock::new(table))
            })
            .await
    }

    async fn open_or_create(&self) -> Result<Table, StoreError> {
        let path = self.table_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let file: TableFile = serde_json::from_str(&content)
                    .map_err(|e| StoreError::Corrupt(format!("{:?}: {}", path, e)))?;
                if file.version != TABLE_FORMAT_VERSION {
                    return Err(StoreError::Corrupt(format!(
                        "{:?}: unsupported table version {}",
                        path, file.version
                    )));
                }
                if let (Some(stored), Some(expected)) = (&file.embedding, &self.embedding) {
                    if stored != expected && !file.rows.is_empty() {
                        return Err(StoreError::EmbeddingMismatch {
                            stored: stored.clone(),
                            expected: expected.clone(),
                        });
                    }
                }
                info!("Opened table '{}' with {} rows", self.table_name, file.rows.len());
                let mut table = Table::from_file(file);
                if let Some(expected) = &self.embedding {
                    if table.embedding.as_ref() != Some(expected) {
                        table.embedding = Some(expected.clone());
                        table.dirty = true;
                    }
                }
                Ok(table)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Creating table '{}' at {:?}", self.table_name, path);
                Ok(Table::empty(self.embedding.clone()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChunkStore for LocalStore {
    async fn ensure_table(&self) -> Result<(), StoreError> {
        self.table().await.map(|_| ())
    }

    async fn add_chunks(&self, chunks: Vec<Chunk>) -> Result<usize, StoreError> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let mut table = self.table().await?.write().await;
        let expected = table.dimensions().unwrap_or(chunks[0].vector.len());
        if let Some(bad) = chunks.iter().find(|c| c.vector.len() != expected) {
            return Err(StoreError::DimensionMismatch {
                expected,
                actual: bad.vector.len(),
            });
        }

        let added = chunks.len();
        for chunk in chunks {
            let id = table.next_id;
            table.next_id += 1;
            table.bm25.add_document(id, &chunk.text);
            table.rows.push(Row { id, chunk });
        }
        table.dirty = true;
        drop(table);

        self.bump_generation();
        debug!("Added {} chunks to {}", added, self.table_name);
        Ok(added)
    }

    async fn delete_where(&self, predicate: &Predicate) -> Result<usize, StoreError> {
        let mut table = self.table().await?.write().await;
        let removed: Vec<u64> = table
            .rows
            .iter()
            .filter(|r| predicate.matches(&r.chunk))
            .map(|r| r.id)
            .collect();

        if removed.is_empty() {
            return Ok(0);
        }

        table.rows.retain(|r| !predicate.matches(&r.chunk));
        for id in &removed {
            table.bm25.remove_document(*id);
        }
        table.dirty = true;
        drop(table);

        self.bump_generation();
        debug!("Deleted {} chunks where {}", removed.len(), predicate);
        Ok(removed.len())
    }

    async fn vector_search(
        &self,
        vector: &[f32],
        filter: Option<&Predicate>,
        limit: usize,
    ) -> Result<Vec<(Chunk, f32)>, StoreError> {
        let table = self.table().await?.read().await;
        table.check_dimensions(vector.len())?;
        let ranked = table.rank_by_distance(vector, filter, limit);
        Ok(table.resolve(ranked))
    }

    async fn keyword_search(
        &self,
        text: &str,
        filter: Option<&Predicate>,
        limit: usize,
    ) -> Result<Vec<(Chunk, f32)>, StoreError> {
        let table = self.table().await?.read().await;
        let ranked = table.rank_by_keywords(text, filter, limit);
        Ok(table.resolve(ranked))
    }

    async fn hybrid_search(
        &self,
        text: &str,
        vector: &[f32],
        filter: Option<&Predicate>,
        limit: usize,
        fts_weight: f32,
    ) -> Result<Vec<(Chunk, f32)>, StoreError> {
        let table = self.table().await?.read().await;
        table.check_dimensions(vector.len())?;

        let fetch = limit.saturating_mul(HYBRID_FETCH_FACTOR);
        let by_vector = table.rank_by_distance(vector, filter, fetch);
        let by_keyword = table.rank_by_keywords(text, filter, fetch);

        let keyword_weight = fts_weight.clamp(0.0, 1.0);
        let vector_weight = 1.0 - keyword_weight;
        let mut fused = reciprocal_rank_fusion(&by_vector, &by_keyword, RRF_K, vector_weight, keyword_weight);

        // Rank one on both sides is the best attainable fused score.
        let best = (vector_weight + keyword_weight) / (RRF_K + 1.0);
        for (_, score) in fused.iter_mut() {
            *score = (*score / best).clamp(0.0, 1.0);
        }
        fused.truncate(limit);

        Ok(table.resolve(fused))
    }

    async fn get_indexed_files(&self) -> Result<HashSet<String>, StoreError> {
        let table = self.table().await?.read().await;
        Ok(table.rows.iter().map(|r| r.chunk.path.clone()).collect())
    }

    async fn get_indexed_files_by_branch(&self, branch: &str) -> Result<HashSet<String>, StoreError> {
        let table = self.table().await?.read().await;
        Ok(table
            .rows
            .iter()
            .filter(|r| r.chunk.branch.as_deref() == Some(branch))
            .map(|r| r.chunk.path.clone())
            .collect())
    }

    async fn get_file_hash(&self, path: &str) -> Result<Option<String>, StoreError> {
        let table = self.table().await?.read().await;
        Ok(table
            .rows
            .iter()
            .find(|r| r.chunk.path == path)
            .map(|r| r.chunk.file_hash.clone()))
    }

    async fn get_stats(&self) -> Result<IndexStats, StoreError> {
        let table = self.table().await?.read().await;
        Ok(IndexStats::from_chunks(table.rows.iter().map(|r| &r.chunk)))
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let table = self.table().await?.read().await;
        Ok(table.rows.len())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        // Never opened: skip the open so a mismatched table can still be removed.
        let mut table = match self.table.get() {
            Some(lock) => Some(lock.write().await),
            None => None,
        };
        if let Some(table) = table.as_mut() {
            **table = Table::empty(self.embedding.clone());
        }

        let path = self.table_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Io(e)),
        }
        drop(table);

        self.bump_generation();
        info!("Cleared all data from {}", self.table_name);
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        // Never opened means nothing to write.
        let Some(lock) = self.table.get() else {
            return Ok(());
        };

        let mut table = lock.write().await;
        if !table.dirty {
            return Ok(());
        }

        let file = TableFile {
            version: TABLE_FORMAT_VERSION,
            embedding: table.embedding.clone(),
            next_id: table.next_id,
            rows: table.rows.clone(),
        };
        let json = serde_json::to_string(&file)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.table_path();
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            warn!("Failed to move {:?} into place: {}", tmp, e);
            return Err(StoreError::Io(e));
        }

        table.dirty = false;
        debug!("Flushed {} rows to {:?}", table.rows.len(), path);
        Ok(())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkType;
    use crate::store::{Column, SearchFilter};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn chunk(path: &str, text: &str, vector: Vec<f32>, branch: Option<&str>) -> Chunk {
        Chunk {
            vector,
            text: text.to_string(),
            path: path.to_string(),
            start_line: 1,
            end_line: 3,
            chunk_type: ChunkType::Function,
            name: Some("f".to_string()),
            language: "python".to_string(),
            file_hash: format!("hash-{}", path),
            indexed_at: 100.0,
            branch: branch.map(String::from),
        }
    }

    async fn seeded(dir: &Path) -> LocalStore {
        let store = LocalStore::new(dir);
        store
            .add_chunks(vec![
                chunk("a.py", "def parse_config(): pass", vec![1.0, 0.0, 0.0], Some("main")),
                chunk("b.py", "def render_page(): pass", vec![0.0, 1.0, 0.0], Some("main")),
                chunk("src/c.rs", "fn parse_args() {}", vec![0.0, 0.0, 1.0], Some("dev")),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_add_count_and_stats() {
        let dir = tempdir().unwrap();
        let store = seeded(dir.path()).await;

        assert_eq!(store.count().await.unwrap(), 3);
        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.languages.get("python"), Some(&3));
        assert_eq!(stats.last_indexed, Some(100.0));
    }

    #[tokio::test]
    async fn test_vector_search_orders_by_distance() {
        let dir = tempdir().unwrap();
        let store = seeded(dir.path()).await;

        let hits = store.vector_search(&[0.9, 0.1, 0.0], None, 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.path, "a.py");
        assert!(hits[0].1 < hits[1].1);
    }

    #[tokio::test]
    async fn test_vector_search_with_filter() {
        let dir = tempdir().unwrap();
        let store = seeded(dir.path()).await;
        let predicate = SearchFilter::new().with_directories(vec!["src/".into()]).to_predicate();

        let hits = store.vector_search(&[1.0, 0.0, 0.0], predicate.as_ref(), 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.path, "src/c.rs");
    }

    #[tokio::test]
    async fn test_dimension_mismatch() {
        let dir = tempdir().unwrap();
        let store = seeded(dir.path()).await;

        let err = store.vector_search(&[1.0, 0.0], None, 5).await.unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { expected: 3, actual: 2 }));

        let err = store
            .add_chunks(vec![chunk("d.py", "x", vec![1.0], None)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_keyword_search() {
        let dir = tempdir().unwrap();
        let store = seeded(dir.path()).await;

        let hits = store.keyword_search("parse_config", None, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.path, "a.py");

        let hits = store.keyword_search("pass", None, 10).await.unwrap();
        let paths: HashSet<String> = hits.iter().map(|(c, _)| c.path.clone()).collect();
        assert_eq!(paths, HashSet::from(["a.py".to_string(), "b.py".to_string()]));

        let only_b = Predicate::eq(Column::Path, "b.py");
        let hits = store.keyword_search("pass", Some(&only_b), 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.path, "b.py");
    }

    #[tokio::test]
    async fn test_hybrid_scores_are_normalized() {
        let dir = tempdir().unwrap();
        let store = seeded(dir.path()).await;

        let hits = store
            .hybrid_search("parse_config", &[1.0, 0.0, 0.0], None, 3, 0.5)
            .await
            .unwrap();
        assert_eq!(hits[0].0.path, "a.py");
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
        assert!(hits.iter().all(|(_, s)| (0.0..=1.0).contains(s)));
    }

    #[tokio::test]
    async fn test_delete_by_path_and_branch() {
        let dir = tempdir().unwrap();
        let store = seeded(dir.path()).await;
        let before = store.generation();

        assert_eq!(store.delete_by_path("a.py").await.unwrap(), 1);
        assert!(store.generation() > before);
        assert_eq!(store.delete_by_path("a.py").await.unwrap(), 0);
        assert!(store.keyword_search("parse_config", None, 10).await.unwrap().is_empty());

        assert_eq!(store.delete_by_branch("dev").await.unwrap(), 1);
        assert_eq!(
            store.get_indexed_files().await.unwrap(),
            HashSet::from(["b.py".to_string()])
        );
    }

    #[tokio::test]
    async fn test_indexed_files_and_hash() {
        let dir = tempdir().unwrap();
        let store = seeded(dir.path()).await;

        let main = store.get_indexed_files_by_branch("main").await.unwrap();
        assert_eq!(main.len(), 2);
        assert!(!main.contains("src/c.rs"));

        assert_eq!(store.get_file_hash("b.py").await.unwrap().as_deref(), Some("hash-b.py"));
        assert_eq!(store.get_file_hash("zzz.py").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_flush_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = seeded(dir.path()).await;
            store.flush().await.unwrap();
            assert!(store.table_path().exists());
        }

        let reopened = LocalStore::new(dir.path());
        assert_eq!(reopened.count().await.unwrap(), 3);
        // The keyword index is rebuilt on open.
        assert_eq!(reopened.keyword_search("render_page", None, 5).await.unwrap().len(), 1);

        reopened
            .add_chunks(vec![chunk("e.py", "more", vec![0.5, 0.5, 0.0], None)])
            .await
            .unwrap();
        assert_eq!(reopened.count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_corrupt_table_is_fatal() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("chunks.json"), "{not json").unwrap();

        let store = LocalStore::new(dir.path());
        assert!(matches!(store.count().await, Err(StoreError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_clear_all() {
        let dir = tempdir().unwrap();
        let store = seeded(dir.path()).await;
        store.flush().await.unwrap();

        store.clear_all().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(!store.table_path().exists());
    }

    #[tokio::test]
    async fn test_embedding_mismatch_rejected_on_open() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path()).with_embedding("fastembed:all-MiniLM-L6-v2:384");
        store
            .add_chunks(vec![chunk("a.py", "alpha", vec![1.0, 0.0], None)])
            .await
            .unwrap();
        store.flush().await.unwrap();

        let same = LocalStore::new(dir.path()).with_embedding("fastembed:all-MiniLM-L6-v2:384");
        assert_eq!(same.count().await.unwrap(), 1);

        let other = LocalStore::new(dir.path()).with_embedding("hash:384");
        match other.count().await {
            Err(StoreError::EmbeddingMismatch { stored, expected }) => {
                assert_eq!(stored, "fastembed:all-MiniLM-L6-v2:384");
                assert_eq!(expected, "hash:384");
            }
            other => panic!("expected mismatch, got {:?}", other),
        }

        // Clearing still works and the emptied table takes the new fingerprint.
        other.clear_all().await.unwrap();
        other
            .add_chunks(vec![chunk("b.py", "beta", vec![0.0, 1.0], None)])
            .await
            .unwrap();
        other.flush().await.unwrap();
        let reopened = LocalStore::new(dir.path()).with_embedding("hash:384");
        assert_eq!(reopened.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unrecorded_table_adopts_fingerprint() {
        let dir = tempdir().unwrap();
        let legacy = seeded(dir.path()).await;
        legacy.flush().await.unwrap();

        let store = LocalStore::new(dir.path()).with_embedding("hash:2");
        assert!(store.count().await.unwrap() > 0);
        store.flush().await.unwrap();

        let other = LocalStore::new(dir.path()).with_embedding("hash:3");
        assert!(matches!(
            other.count().await,
            Err(StoreError::EmbeddingMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_first_access_shares_table() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.ensure_table().await.unwrap();
                store
                    .add_chunks(vec![chunk(&format!("f{}.py", i), "x", vec![1.0, 0.0], None)])
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.count().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_flush_without_table_is_noop() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("index"));
        store.flush().await.unwrap();
        assert!(!dir.path().join("index").exists());
    }
}
