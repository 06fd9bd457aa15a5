//! Paragraph fallback chunking for files without structural support.

use tracing::debug;

use super::{line_count, ChunkMetadata, ChunkType, Chunker, RawChunk};

/// Default maximum words per chunk.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 500;

/// Default words shared between consecutive windows of a split paragraph.
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;

/// Splits content on blank lines. Paragraphs longer than `max_chunk_size`
/// words are cut into overlapping windows. Content with no blank line at all
/// is returned as a single block.
#[derive(Debug, Clone)]
pub struct ParagraphChunker {
    max_chunk_size: usize,
    chunk_overlap: usize,
}

impl ParagraphChunker {
    pub fn new(max_chunk_size: usize, chunk_overlap: usize) -> Self {
        let max_chunk_size = max_chunk_size.max(1);
        // Windows must always advance by at least one word.
        let chunk_overlap = chunk_overlap.min(max_chunk_size - 1);
        Self {
            max_chunk_size,
            chunk_overlap,
        }
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Cut one oversized paragraph into windows of `max_chunk_size` words,
    /// each advancing by `max_chunk_size - chunk_overlap` words. Line ranges
    /// follow the lines the window's first and last words sit on.
    fn split_paragraph(&self, para: &str, start_line: usize, out: &mut Vec<RawChunk>) {
        let mut words = Vec::new();
        let mut word_lines = Vec::new();
        for (offset, line) in para.split('\n').enumerate() {
            for word in line.split_whitespace() {
                words.push(word);
                word_lines.push(offset);
            }
        }

        let step = self.max_chunk_size - self.chunk_overlap;
        let mut i = 0;
        while i < words.len() {
            let end = (i + self.max_chunk_size).min(words.len());
            let text = words[i..end].join(" ");
            out.push((
                text,
                ChunkMetadata::new(
                    start_line + word_lines[i],
                    start_line + word_lines[end - 1],
                    ChunkType::Paragraph,
                    None,
                ),
            ));

            if end == words.len() {
                break;
            }
            i += step;
        }
    }
}

impl Default for ParagraphChunker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)
    }
}

impl Chunker for ParagraphChunker {
    fn chunk(&self, content: &str, path: &str) -> Vec<RawChunk> {
        if content.trim().is_empty() {
            return Vec::new();
        }

        // Without blank-line separators the whole file is one block,
        // whatever its length.
        if !content.contains("\n\n") {
            return vec![(content.to_string(), ChunkMetadata::whole_file(line_count(content)))];
        }

        let mut chunks = Vec::new();
        let mut cursor = 1;

        for piece in content.split("\n\n") {
            let trimmed_start = piece.trim_start();
            let leading_newlines = piece[..piece.len() - trimmed_start.len()].matches('\n').count();
            let para = piece.trim();

            if !para.is_empty() {
                let start_line = cursor + leading_newlines;
                let para_lines = para.matches('\n').count() + 1;

                if para.split_whitespace().count() <= self.max_chunk_size {
                    chunks.push((
                        para.to_string(),
                        ChunkMetadata::new(
                            start_line,
                            start_line + para_lines - 1,
                            ChunkType::Paragraph,
                            None,
                        ),
                    ));
                } else {
                    self.split_paragraph(para, start_line, &mut chunks);
                }
            }

            // The separator itself accounts for two line breaks.
            cursor += piece.matches('\n').count() + 2;
        }

        if chunks.is_empty() {
            return vec![(content.to_string(), ChunkMetadata::whole_file(line_count(content)))];
        }

        debug!("Chunked {} into {} chunks using fallback strategy", path, chunks.len());
        chunks
    }
}
