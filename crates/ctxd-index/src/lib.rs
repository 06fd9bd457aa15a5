//! Incremental semantic code indexing and search for ctxd.
//!
//! This crate provides:
//! - Structure-aware chunking (tree-sitter definitions, markdown sections, paragraphs)
//! - Gitignore-aware file discovery with content-hash change detection
//! - Pluggable embedding providers (local ONNX, HTTP, feature hashing)
//! - A persisted chunk store with vector, BM25 and hybrid retrieval
//! - Mode-dispatching search with filters and a result cache
//! - Result de-duplication, recency re-ranking and context expansion

pub mod change;
pub mod chunker;
pub mod discovery;
pub mod embeddings;
pub mod enhancer;
pub mod git;
pub mod indexer;
pub mod progress;
pub mod search;
pub mod store;

// Re-exports
pub use chunker::{ChunkMetadata, ChunkType, Chunker, ChunkerSet};
pub use discovery::{DiscoveryConfig, FileDiscovery};
pub use embeddings::{create_provider, embedding_fingerprint, EmbeddingProvider, EmbeddingSettings, ProviderKind};
pub use git::{GitCli, GitInfoProvider};
pub use indexer::{FileOutcome, Indexer, IndexerConfig, RunSummary, SkipReason};
pub use progress::{ProgressCallback, ProgressEvent, ProgressReporter};
pub use search::{SearchConfig, SearchEngine, SearchError, SearchMode, SearchQuery, SearchResult};
pub use store::{Chunk, ChunkStore, IndexStats, LocalStore, SearchFilter, StoreError};

/// Default embedding dimensions (all-MiniLM-L6-v2)
pub const DEFAULT_DIMENSIONS: usize = 384;

/// Index location relative to the project root
pub const INDEX_DIR: &str = ".ctxd/index";
