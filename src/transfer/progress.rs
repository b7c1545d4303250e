//! Progress tracking for streamed transfers
//!
//! Draws an indicatif bar (or spinner when the total is unknown) with the
//! record rate. Updates are driven by the transfer's progress timer, not by
//! record arrival.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};

/// Progress tracker for one transfer
pub struct ProgressTracker {
    processed: AtomicU64,
    start_time: Instant,
    bar: Option<ProgressBar>,
}

impl ProgressTracker {
    /// Create a new progress tracker
    ///
    /// # Arguments
    /// * `label` - Shown before the counters (entity and direction)
    /// * `total` - Expected record count if known
    /// * `enable_bar` - Whether to draw anything
    pub fn new(label: &str, total: Option<u64>, enable_bar: bool) -> Self {
        let bar = if enable_bar {
            let bar = match total {
                Some(n) => {
                    let bar = ProgressBar::new(n);
                    if let Ok(style) = ProgressStyle::default_bar()
                        .template("{spinner:.green} {prefix} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                    {
                        bar.set_style(style.progress_chars("#>-"));
                    }
                    bar
                }
                None => {
                    let bar = ProgressBar::new_spinner();
                    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {prefix} {pos} records {msg}") {
                        bar.set_style(style);
                    }
                    bar
                }
            };
            bar.set_prefix(label.to_string());
            Some(bar)
        } else {
            None
        };

        Self {
            processed: AtomicU64::new(0),
            start_time: Instant::now(),
            bar,
        }
    }

    /// Update progress with the total processed so far
    pub fn update(&self, count: u64) {
        self.processed.store(count, Ordering::Relaxed);

        if let Some(ref bar) = self.bar {
            bar.set_position(count);

            let elapsed = self.start_time.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                let speed = count as f64 / elapsed;
                bar.set_message(format!("({:.0} records/sec)", speed));
            }
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Finish and clear the progress bar
    pub fn finish(&self) {
        if let Some(ref bar) = self.bar {
            bar.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_tracker_with_total() {
        let tracker = ProgressTracker::new("Account", Some(1000), false);
        tracker.update(500);
        assert_eq!(tracker.processed(), 500);
    }

    #[test]
    fn test_progress_tracker_without_total() {
        let tracker = ProgressTracker::new("Account", None, false);
        tracker.update(42);
        tracker.finish();
        assert_eq!(tracker.processed(), 42);
    }
}
