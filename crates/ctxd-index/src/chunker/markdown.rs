//! Header-based chunking for Markdown.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::{line_count, ChunkMetadata, ChunkType, Chunker, RawChunk};

static HEADER: Lazy<Regex> = Lazy::new(|| {
    // ATX headers only: `#word` without a space is not a header.
    Regex::new(r"^(#{1,6})\s+(.+)$").unwrap()
});

/// Splits Markdown into one chunk per ATX header section.
///
/// A section runs from its header line to the line before the next header of
/// any level. Lines inside a closed fenced code block are never treated as
/// headers.
#[derive(Debug, Clone, Default)]
pub struct MarkdownChunker;

struct Section {
    name: Option<String>,
    start: usize,
    lines: Vec<String>,
}

impl Section {
    fn into_chunk(self, end: usize) -> RawChunk {
        let text = self.lines.join("\n");
        (text, ChunkMetadata::new(self.start, end, ChunkType::Section, self.name))
    }
}

impl MarkdownChunker {
    pub fn new() -> Self {
        Self
    }

    fn header_name(line: &str) -> Option<String> {
        HEADER
            .captures(line)
            .and_then(|caps| caps.get(2))
            .map(|m| m.as_str().trim().to_string())
    }
}

/// Fence marker opening or closing a code block, if `line` is one.
fn fence_marker(line: &str) -> Option<&'static str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with("```") {
        Some("```")
    } else if trimmed.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

/// Per line, whether it sits inside a fenced code block. A fence only
/// counts when a matching closing fence follows; a stray opener is text.
fn fenced_lines(lines: &[&str]) -> Vec<bool> {
    let mut fenced = vec![false; lines.len()];
    let mut i = 0;
    while i < lines.len() {
        let Some(marker) = fence_marker(lines[i]) else {
            i += 1;
            continue;
        };
        let close = (i + 1..lines.len()).find(|&j| fence_marker(lines[j]) == Some(marker));
        match close {
            Some(j) => {
                fenced[i..=j].iter_mut().for_each(|f| *f = true);
                i = j + 1;
            }
            None => i += 1,
        }
    }
    fenced
}

impl Chunker for MarkdownChunker {
    fn chunk(&self, content: &str, path: &str) -> Vec<RawChunk> {
        if content.trim().is_empty() {
            return Vec::new();
        }

        let total_lines = line_count(content);
        let mut chunks = Vec::new();
        let mut saw_header = false;
        let lines: Vec<&str> = content.split('\n').collect();
        let fenced = fenced_lines(&lines);
        let mut current = Section {
            name: None,
            start: 1,
            lines: Vec::new(),
        };

        for (idx, line) in lines.iter().enumerate() {
            let line_no = idx + 1;
            let header = if fenced[idx] { None } else { Self::header_name(line) };
            match header {
                Some(name) => {
                    let previous = std::mem::replace(
                        &mut current,
                        Section {
                            name: Some(name),
                            start: line_no,
                            lines: vec![line.to_string()],
                        },
                    );
                    // Preamble before the first header is kept only when it has content.
                    let keep = if saw_header {
                        !previous.lines.is_empty()
                    } else {
                        previous.lines.iter().any(|l| !l.trim().is_empty())
                    };
                    if keep {
                        chunks.push(previous.into_chunk(line_no - 1));
                    }
                    saw_header = true;
                }
                None => current.lines.push(line.to_string()),
            }
        }

        if !saw_header {
            debug!("No headers found in {}, using single chunk", path);
            return vec![(content.to_string(), ChunkMetadata::whole_file(total_lines))];
        }

        chunks.push(current.into_chunk(total_lines));
        debug!("Extracted {} sections from {}", chunks.len(), path);
        chunks
    }
}
