//! Post-processing of ranked search results.
//!
//! The passes are independent and usually applied as: deduplicate, rerank by
//! recency, truncate to the requested limit, then expand context.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::discovery::read_text_lossy;
use crate::search::SearchResult;

/// Default overlap above which same-file results are considered duplicates.
pub const DEFAULT_OVERLAP_THRESHOLD: f32 = 0.5;

/// Default weight of the recency boost.
pub const DEFAULT_RECENCY_WEIGHT: f32 = 0.1;

fn by_score_desc(a: &SearchResult, b: &SearchResult) -> Ordering {
    b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal)
}

/// Fraction of the smaller of two inclusive line ranges covered by their
/// intersection. Disjoint ranges give 0, containment gives 1.
pub fn line_overlap(start1: usize, end1: usize, start2: usize, end2: usize) -> f32 {
    let overlap_start = start1.max(start2);
    let overlap_end = end1.min(end2);
    if overlap_start > overlap_end {
        return 0.0;
    }

    let overlap = (overlap_end - overlap_start + 1) as f32;
    let smaller = (end1.saturating_sub(start1) + 1).min(end2.saturating_sub(start2) + 1) as f32;
    overlap / smaller
}

/// Drop results whose line range overlaps a better-scoring result from the
/// same file by at least `threshold`. Different files never collapse.
pub fn deduplicate(results: Vec<SearchResult>, threshold: f32) -> Vec<SearchResult> {
    if results.is_empty() {
        return results;
    }
    let before = results.len();

    let mut groups: Vec<Vec<SearchResult>> = Vec::new();
    let mut group_of: HashMap<String, usize> = HashMap::new();
    for result in results {
        let idx = *group_of.entry(result.chunk.path.clone()).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[idx].push(result);
    }

    let mut deduplicated = Vec::with_capacity(before);
    for mut group in groups {
        group.sort_by(by_score_desc);

        let mut kept: Vec<SearchResult> = Vec::new();
        for result in group {
            let duplicate = kept.iter().any(|k| {
                line_overlap(
                    result.chunk.start_line,
                    result.chunk.end_line,
                    k.chunk.start_line,
                    k.chunk.end_line,
                ) >= threshold
            });
            if !duplicate {
                kept.push(result);
            }
        }
        deduplicated.extend(kept);
    }

    deduplicated.sort_by(by_score_desc);
    debug!("De-duplication: {} -> {} results", before, deduplicated.len());
    deduplicated
}

/// Boost scores by how recently each chunk was indexed, relative to the
/// other results: `min(1, score + weight * normalized_recency)`.
///
/// A zero weight or identical timestamps leave the input untouched.
pub fn rerank_by_recency(results: Vec<SearchResult>, weight: f32) -> Vec<SearchResult> {
    if results.is_empty() || weight == 0.0 {
        return results;
    }

    let (min_ts, max_ts) = results.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), r| {
        (lo.min(r.chunk.indexed_at), hi.max(r.chunk.indexed_at))
    });
    let range = max_ts - min_ts;
    if range <= 0.0 {
        return results;
    }

    let mut reranked: Vec<SearchResult> = results
        .into_iter()
        .map(|mut r| {
            let recency = ((r.chunk.indexed_at - min_ts) / range) as f32;
            r.score = (r.score + weight * recency).min(1.0);
            r
        })
        .collect();
    reranked.sort_by(by_score_desc);
    reranked
}

/// Replace each result's text with its source lines widened by `before` and
/// `after`, clamped to the file. Results whose file cannot be read are kept
/// unchanged.
pub fn expand_context(results: Vec<SearchResult>, before: usize, after: usize, project_root: &Path) -> Vec<SearchResult> {
    results
        .into_iter()
        .map(|result| {
            let path = project_root.join(&result.chunk.path);
            let content = match read_text_lossy(&path) {
                Ok(content) => content,
                Err(e) => {
                    if path.exists() {
                        warn!("Failed to expand context for {}: {}", result.chunk.path, e);
                    }
                    return result;
                }
            };

            let lines: Vec<&str> = content.split_inclusive('\n').collect();
            if lines.is_empty() {
                return result;
            }

            let start = result.chunk.start_line.saturating_sub(before).max(1);
            let end = (result.chunk.end_line + after).min(lines.len());
            if start > end {
                return result;
            }

            let mut expanded = result;
            expanded.chunk.text = lines[start - 1..end].concat();
            expanded.chunk.start_line = start;
            expanded.chunk.end_line = end;
            expanded
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkType;
    use crate::store::Chunk;
    use std::fs;
    use tempfile::tempdir;

    fn result(path: &str, start: usize, end: usize, score: f32, indexed_at: f64) -> SearchResult {
        SearchResult {
            chunk: Chunk {
                vector: vec![0.1, 0.2],
                text: format!("{}:{}-{}", path, start, end),
                path: path.to_string(),
                start_line: start,
                end_line: end,
                chunk_type: ChunkType::Function,
                name: Some("f".to_string()),
                language: "python".to_string(),
                file_hash: "abc".to_string(),
                indexed_at,
                branch: Some("main".to_string()),
            },
            score,
        }
    }

    #[test]
    fn test_line_overlap() {
        assert_eq!(line_overlap(1, 10, 20, 30), 0.0);
        assert_eq!(line_overlap(1, 20, 5, 10), 1.0);
        assert!((line_overlap(1, 10, 6, 15) - 0.5).abs() < 1e-6);
        assert_eq!(line_overlap(5, 5, 5, 5), 1.0);
    }

    #[test]
    fn test_deduplicate_same_file_keeps_best() {
        let results = vec![
            result("a.py", 1, 10, 0.7, 0.0),
            result("a.py", 3, 8, 0.9, 0.0),
            result("a.py", 40, 50, 0.5, 0.0),
        ];
        let out = deduplicate(results, 0.5);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].score, 0.9);
        assert_eq!((out[1].chunk.start_line, out[1].chunk.end_line), (40, 50));
    }

    #[test]
    fn test_deduplicate_never_crosses_files() {
        let results = vec![result("a.py", 1, 10, 0.9, 0.0), result("b.py", 1, 10, 0.8, 0.0)];
        assert_eq!(deduplicate(results, 0.5).len(), 2);
    }

    #[test]
    fn test_deduplicate_below_threshold_kept() {
        let results = vec![result("a.py", 1, 10, 0.9, 0.0), result("a.py", 9, 30, 0.8, 0.0)];
        // Two shared lines out of ten.
        assert_eq!(deduplicate(results, 0.5).len(), 2);
        assert!(deduplicate(Vec::new(), 0.5).is_empty());
    }

    #[test]
    fn test_recency_zero_weight_is_noop() {
        let results = vec![result("a.py", 1, 2, 0.5, 100.0), result("b.py", 1, 2, 0.6, 200.0)];
        let out = rerank_by_recency(results.clone(), 0.0);
        assert_eq!(out, results);
    }

    #[test]
    fn test_recency_identical_timestamps_is_noop() {
        let results = vec![result("a.py", 1, 2, 0.5, 100.0), result("b.py", 1, 2, 0.6, 100.0)];
        assert_eq!(rerank_by_recency(results.clone(), 0.5), results);
    }

    #[test]
    fn test_recency_boosts_newer() {
        let results = vec![result("old.py", 1, 2, 0.80, 100.0), result("new.py", 1, 2, 0.75, 200.0)];
        let out = rerank_by_recency(results, 0.1);

        assert_eq!(out[0].chunk.path, "new.py");
        assert!((out[0].score - 0.85).abs() < 1e-6);
        assert!((out[1].score - 0.80).abs() < 1e-6);
    }

    #[test]
    fn test_recency_caps_at_one() {
        let results = vec![result("a.py", 1, 2, 0.95, 0.0), result("b.py", 1, 2, 0.99, 10.0)];
        let out = rerank_by_recency(results, 0.5);
        assert!(out.iter().all(|r| r.score <= 1.0));
        assert_eq!(out[0].score, 1.0);
    }

    #[test]
    fn test_expand_context_clamps_to_file() {
        let dir = tempdir().unwrap();
        let body: String = (1..=10).map(|i| format!("line {}\n", i)).collect();
        fs::write(dir.path().join("a.py"), body).unwrap();

        let out = expand_context(
            vec![result("a.py", 2, 3, 0.9, 0.0), result("a.py", 9, 10, 0.8, 0.0)],
            3,
            3,
            dir.path(),
        );

        assert_eq!((out[0].chunk.start_line, out[0].chunk.end_line), (1, 6));
        assert!(out[0].chunk.text.starts_with("line 1\n"));
        assert!(out[0].chunk.text.ends_with("line 6\n"));
        assert_eq!((out[1].chunk.start_line, out[1].chunk.end_line), (6, 10));
        assert_eq!(out[0].chunk.file_hash, "abc");
        assert_eq!(out[0].chunk.branch.as_deref(), Some("main"));
        assert_eq!(out[0].score, 0.9);
    }

    #[test]
    fn test_expand_context_missing_file_keeps_result() {
        let dir = tempdir().unwrap();
        let original = result("gone.py", 2, 3, 0.9, 0.0);
        let out = expand_context(vec![original.clone()], 3, 3, dir.path());
        assert_eq!(out, vec![original]);
    }
}
