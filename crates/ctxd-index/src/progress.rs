//! Per-file progress reporting with ETA estimation.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Snapshot emitted once per processed file.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// Files processed so far
    pub current: usize,
    /// Files in this run
    pub total: usize,
    /// File that just finished
    pub filename: String,
    pub elapsed_seconds: f64,
    /// Estimated seconds remaining, `None` until a rate is known
    pub eta_seconds: Option<f64>,
    pub files_per_second: f64,
}

/// Callback receiving progress events.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Tracks processed files for one indexing run.
pub struct ProgressReporter {
    total: usize,
    current: usize,
    started: Instant,
    callback: Option<ProgressCallback>,
}

impl ProgressReporter {
    pub fn new(total: usize, callback: Option<ProgressCallback>) -> Self {
        Self {
            total,
            current: 0,
            started: Instant::now(),
            callback,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Record that `filename` finished and notify the callback.
    pub fn update(&mut self, filename: &str) -> ProgressEvent {
        let elapsed = self.started.elapsed();
        self.update_with_elapsed(filename, elapsed)
    }

    fn update_with_elapsed(&mut self, filename: &str, elapsed: Duration) -> ProgressEvent {
        self.current += 1;
        let elapsed_seconds = elapsed.as_secs_f64();

        let files_per_second = if elapsed_seconds > 0.0 {
            self.current as f64 / elapsed_seconds
        } else {
            0.0
        };

        let remaining = self.total.saturating_sub(self.current);
        let eta_seconds = if files_per_second > 0.0 {
            Some(remaining as f64 / files_per_second)
        } else {
            None
        };

        let event = ProgressEvent {
            current: self.current,
            total: self.total,
            filename: filename.to_string(),
            elapsed_seconds,
            eta_seconds,
            files_per_second,
        };

        if let Some(callback) = &self.callback {
            callback(&event);
        }

        event
    }

    /// One-line summary of the run so far.
    pub fn summary(&self) -> String {
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            self.current as f64 / elapsed
        } else {
            0.0
        };
        format!(
            "Processed {}/{} files in {} ({:.1} files/sec)",
            self.current,
            self.total,
            format_duration(elapsed),
            rate
        )
    }
}

/// Format an ETA such as "1h 15m", "2m 30s" or "45s".
pub fn format_eta(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds else {
        return "unknown".to_string();
    };

    let total = seconds.max(0.0) as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Format a duration such as "2.5s", "1m 30s" or "1h 15m".
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        return format!("{:.1}s", seconds);
    }

    let total = seconds as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, secs)
    }
}
