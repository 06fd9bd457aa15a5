//! Terminal rendering: progress bar, search results and index statistics.

use std::sync::Arc;

use chrono::{DateTime, Local};
use ctxd_index::progress::format_eta;
use ctxd_index::{IndexStats, ProgressCallback, ProgressEvent, SearchResult};
use indicatif::{ProgressBar, ProgressStyle};

/// A file progress bar and a callback that advances it. The length is taken
/// from the first event.
pub fn progress_bar() -> (ProgressBar, ProgressCallback) {
    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files {msg}")
    {
        bar.set_style(style.progress_chars("#>-"));
    }

    let handle = bar.clone();
    let callback: ProgressCallback = Arc::new(move |event: &ProgressEvent| {
        handle.set_length(event.total as u64);
        handle.set_position(event.current as u64);
        handle.set_message(progress_message(event));
    });
    (bar, callback)
}

/// `<file> (ETA <eta>)`, with long paths shortened from the left.
pub fn progress_message(event: &ProgressEvent) -> String {
    const MAX_NAME: usize = 40;
    let name = &event.filename;
    let count = name.chars().count();
    let shown = if count > MAX_NAME {
        let tail: String = name.chars().skip(count - (MAX_NAME - 3)).collect();
        format!("...{}", tail)
    } else {
        name.clone()
    };
    format!("{} (ETA {})", shown, format_eta(event.eta_seconds))
}

/// `N. path:start-end (score: x.xxx) type: name`, then the chunk text.
pub fn format_result(rank: usize, result: &SearchResult) -> String {
    let chunk = &result.chunk;
    let mut header = format!(
        "{}. {}:{}-{} (score: {:.3}) {}",
        rank, chunk.path, chunk.start_line, chunk.end_line, result.score, chunk.chunk_type
    );
    if let Some(name) = &chunk.name {
        header.push_str(": ");
        header.push_str(name);
    }
    format!("{}\n{}\n", header, chunk.text.trim_end())
}

pub fn print_results(results: &[SearchResult]) {
    if results.is_empty() {
        println!("No results found.");
        return;
    }
    for (i, result) in results.iter().enumerate() {
        println!("{}", format_result(i + 1, result));
    }
}

/// Human-readable local time of a unix timestamp.
pub fn format_timestamp(seconds: f64) -> String {
    DateTime::from_timestamp(seconds as i64, 0)
        .map(|utc| utc.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn format_stats(stats: &IndexStats) -> String {
    let mut out = String::new();
    out.push_str(&format!("Files:        {}\n", stats.total_files));
    out.push_str(&format!("Chunks:       {}\n", stats.total_chunks));
    out.push_str(&format!(
        "Size:         {:.2} MB\n",
        stats.total_size_bytes as f64 / 1024.0 / 1024.0
    ));
    let last = stats
        .last_indexed
        .map(format_timestamp)
        .unwrap_or_else(|| "never".to_string());
    out.push_str(&format!("Last indexed: {}\n", last));

    let languages = stats.languages_by_count();
    if !languages.is_empty() {
        out.push_str("Languages:\n");
        for (language, count) in languages {
            out.push_str(&format!("  {:<12} {}\n", language, count));
        }
    }
    out
}
