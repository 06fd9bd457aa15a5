//! Structure-aware chunking of source files.
//!
//! Every strategy implements [`Chunker`] and turns file content into an
//! ordered list of `(text, metadata)` pairs:
//! - [`AstChunker`]: tree-sitter definitions (functions, classes, types)
//! - [`MarkdownChunker`]: ATX header sections
//! - [`ParagraphChunker`]: blank-line paragraphs with overlapping word windows
//!
//! Chunkers never fail. Malformed input degrades to a coarser strategy.

pub mod ast;
pub mod markdown;
pub mod paragraph;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use ast::{AstChunker, AstLanguage};
pub use markdown::MarkdownChunker;
pub use paragraph::ParagraphChunker;

/// Errors that can occur while selecting or running a chunker.
#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Failed to parse file: {0}")]
    ParseError(String),

    #[error("Unknown chunk type: {0}")]
    UnknownChunkType(String),
}

/// Kind of span a chunk covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Function,
    Class,
    Interface,
    Type,
    Section,
    Paragraph,
    Block,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Interface => "interface",
            Self::Type => "type",
            Self::Section => "section",
            Self::Paragraph => "paragraph",
            Self::Block => "block",
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkType {
    type Err = ChunkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "function" => Ok(Self::Function),
            "class" => Ok(Self::Class),
            "interface" => Ok(Self::Interface),
            "type" => Ok(Self::Type),
            "section" => Ok(Self::Section),
            "paragraph" => Ok(Self::Paragraph),
            "block" => Ok(Self::Block),
            other => Err(ChunkerError::UnknownChunkType(other.to_string())),
        }
    }
}

/// Position and identity of a chunk within its file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// First line (1-indexed, inclusive)
    pub start_line: usize,

    /// Last line (1-indexed, inclusive)
    pub end_line: usize,

    /// Kind of span
    pub chunk_type: ChunkType,

    /// Definition or section name, when one exists
    pub name: Option<String>,
}

impl ChunkMetadata {
    pub fn new(start_line: usize, end_line: usize, chunk_type: ChunkType, name: Option<String>) -> Self {
        Self {
            start_line,
            end_line: end_line.max(start_line),
            chunk_type,
            name,
        }
    }

    /// Metadata for a chunk covering a whole file of `line_count` lines.
    pub fn whole_file(line_count: usize) -> Self {
        Self::new(1, line_count.max(1), ChunkType::Block, None)
    }
}

/// A chunk's text paired with its metadata.
pub type RawChunk = (String, ChunkMetadata);

/// A chunking strategy.
pub trait Chunker: Send + Sync {
    /// Split `content` into ordered chunks. `path` is used for logging and
    /// grammar selection only.
    fn chunk(&self, content: &str, path: &str) -> Vec<RawChunk>;
}

/// Number of lines in `content` when split on `\n`.
pub(crate) fn line_count(content: &str) -> usize {
    content.split('\n').count()
}

/// Detect the language tag of a file from its extension.
pub fn detect_language(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("py") => "python",
        Some("js") | Some("jsx") => "javascript",
        Some("ts") | Some("tsx") => "typescript",
        Some("go") => "go",
        Some("rs") => "rust",
        Some("java") => "java",
        Some("c") | Some("h") => "c",
        Some("cpp") | Some("hpp") => "cpp",
        Some("md") => "markdown",
        Some("txt") => "text",
        Some("json") => "json",
        Some("yaml") | Some("yml") => "yaml",
        Some("toml") => "toml",
        _ => "unknown",
    }
}

/// The chunkers used during indexing, selected per language.
pub struct ChunkerSet {
    markdown: MarkdownChunker,
    fallback: ParagraphChunker,
}

impl ChunkerSet {
    pub fn new(max_chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            markdown: MarkdownChunker::new(),
            fallback: ParagraphChunker::new(max_chunk_size, chunk_overlap),
        }
    }

    /// Chunk `content` with the strategy that fits `language`.
    ///
    /// Languages without a grammar or header structure use the paragraph
    /// fallback.
    pub fn chunk(&self, language: &str, content: &str, path: &str) -> Vec<RawChunk> {
        if language == "markdown" {
            return self.markdown.chunk(content, path);
        }

        match AstLanguage::for_path(language, path) {
            Some(lang) => AstChunker::new(lang, self.fallback.clone()).chunk(content, path),
            None => self.fallback.chunk(content, path),
        }
    }

    pub fn fallback(&self) -> &ParagraphChunker {
        &self.fallback
    }
}

impl Default for ChunkerSet {
    fn default() -> Self {
        Self::new(paragraph::DEFAULT_MAX_CHUNK_SIZE, paragraph::DEFAULT_CHUNK_OVERLAP)
    }
}
