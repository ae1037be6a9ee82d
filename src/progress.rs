//! Progress Tracking
//!
//! In-memory counters and timers for a run. Nothing here is persisted; a
//! resumed run starts its estimates cold.

use log::{debug, info};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Tracks completion percentage, throughput and ETA for one run.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_pages: u32,
    start_page: u32,
    /// Last page attempted; `start_page - 1` means nothing done yet.
    current_page: u32,
    start_time: Instant,
    last_update: Instant,
    page_times: Vec<Duration>,
    failed_pages: Vec<u32>,
}

/// Serializable snapshot of the tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSummary {
    pub current_page: u32,
    pub total_pages: u32,
    pub percentage: f64,
    pub elapsed_secs: f64,
    pub remaining_secs: Option<f64>,
    pub average_page_secs: Option<f64>,
    pub pages_per_minute: Option<f64>,
    pub failed_pages: Vec<u32>,
}

impl ProgressTracker {
    pub fn start(total_pages: u32, start_page: u32) -> Self {
        let now = Instant::now();
        info!(
            "ProgressTracker initialized: total={}, start={}",
            total_pages, start_page
        );
        ProgressTracker {
            total_pages,
            start_page,
            current_page: start_page.saturating_sub(1),
            start_time: now,
            last_update: now,
            page_times: Vec::new(),
            failed_pages: Vec::new(),
        }
    }

    /// Records an attempt at `page`. Only successful pages contribute timing.
    pub fn update(&mut self, page: u32, failed: bool) {
        let now = Instant::now();
        let page_time = now.duration_since(self.last_update);
        self.current_page = page;
        self.last_update = now;

        if failed {
            self.failed_pages.push(page);
        } else {
            self.page_times.push(page_time);
        }

        debug!(
            "Progress updated: page={}, time={:.2?}, failed={}",
            page, page_time, failed
        );
    }

    /// Moves the cursor without recording an attempt (used when resuming).
    pub fn rehydrate(&mut self, current_page: u32) {
        self.current_page = current_page;
    }

    pub fn set_total_pages(&mut self, total_pages: u32) {
        self.total_pages = total_pages;
    }

    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    pub fn start_page(&self) -> u32 {
        self.start_page
    }

    pub fn failed_pages(&self) -> &[u32] {
        &self.failed_pages
    }

    /// Completion in `[0, 100]`.
    pub fn percentage(&self) -> f64 {
        if self.total_pages == 0 {
            return 0.0;
        }
        let done = self.current_page as i64 - self.start_page as i64 + 1;
        let span = self.total_pages as i64 - self.start_page as i64 + 1;
        if done <= 0 || span <= 0 {
            return 0.0;
        }
        (done as f64 / span as f64 * 100.0).clamp(0.0, 100.0)
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn average_page_time(&self) -> Option<Duration> {
        if self.page_times.is_empty() {
            return None;
        }
        let total: Duration = self.page_times.iter().sum();
        Some(total / self.page_times.len() as u32)
    }

    /// `None` until at least one page succeeded.
    pub fn estimate_remaining(&self) -> Option<Duration> {
        let average = self.average_page_time()?;
        let remaining = self.total_pages.saturating_sub(self.current_page);
        Some(average * remaining)
    }

    pub fn throughput_per_minute(&self) -> Option<f64> {
        let average = self.average_page_time()?.as_secs_f64();
        if average == 0.0 {
            return None;
        }
        Some(60.0 / average)
    }

    /// Fixed-width bar, e.g. `[█████░░░░░] 50.0%`.
    pub fn render_bar(&self, width: usize) -> String {
        let percentage = self.percentage();
        let filled = ((width as f64 * percentage / 100.0) as usize).min(width);
        format!(
            "[{}{}] {:.1}%",
            "█".repeat(filled),
            "░".repeat(width - filled),
            percentage
        )
    }

    /// Human-readable progress lines.
    pub fn display(&self, verbose: bool) -> String {
        let mut lines = vec![
            format!(
                "Progress: {}/{} pages ({:.1}%)",
                self.current_page,
                self.total_pages,
                self.percentage()
            ),
            format!("Elapsed: {}", format_duration(self.elapsed())),
        ];
        match self.estimate_remaining() {
            Some(remaining) => lines.push(format!("Remaining: {}", format_duration(remaining))),
            None => lines.push("Remaining: Calculating...".to_string()),
        }

        if verbose {
            if let Some(avg) = self.average_page_time() {
                lines.push(format!("Avg time per page: {:.2}s", avg.as_secs_f64()));
            }
            if let Some(ppm) = self.throughput_per_minute() {
                lines.push(format!("Pages per minute: {:.1}", ppm));
            }
            if !self.failed_pages.is_empty() {
                lines.push(format!("Failed pages: {}", self.failed_pages.len()));
            }
        }

        lines.join("\n")
    }

    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary {
            current_page: self.current_page,
            total_pages: self.total_pages,
            percentage: self.percentage(),
            elapsed_secs: self.elapsed().as_secs_f64(),
            remaining_secs: self.estimate_remaining().map(|d| d.as_secs_f64()),
            average_page_secs: self.average_page_time().map(|d| d.as_secs_f64()),
            pages_per_minute: self.throughput_per_minute(),
            failed_pages: self.failed_pages.clone(),
        }
    }

    /// Back to "nothing done", optionally moving the start page.
    pub fn reset(&mut self, new_start_page: Option<u32>) {
        if let Some(start) = new_start_page {
            self.start_page = start;
        }
        let now = Instant::now();
        self.current_page = self.start_page.saturating_sub(1);
        self.start_time = now;
        self.last_update = now;
        self.page_times.clear();
        self.failed_pages.clear();
        info!("ProgressTracker reset: start_page={}", self.start_page);
    }
}

/// Formats as `1h 2m 3s`, `2m 3s` or `3s`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero_percent() {
        let tracker = ProgressTracker::start(10, 1);
        assert_eq!(tracker.current_page(), 0);
        assert_eq!(tracker.percentage(), 0.0);
        assert_eq!(tracker.estimate_remaining(), None);
        assert_eq!(tracker.throughput_per_minute(), None);
    }

    #[test]
    fn percentage_stays_within_bounds() {
        let mut tracker = ProgressTracker::start(20, 5);
        for page in 4..=20 {
            tracker.rehydrate(page);
            let pct = tracker.percentage();
            assert!((0.0..=100.0).contains(&pct), "page {} gave {}", page, pct);
        }
        tracker.rehydrate(20);
        assert_eq!(tracker.percentage(), 100.0);
        tracker.rehydrate(25);
        assert_eq!(tracker.percentage(), 100.0);
        tracker.rehydrate(4);
        assert_eq!(tracker.percentage(), 0.0);
    }

    #[test]
    fn zero_total_is_zero_percent() {
        let tracker = ProgressTracker::start(0, 1);
        assert_eq!(tracker.percentage(), 0.0);
    }

    #[test]
    fn failed_pages_do_not_feed_timing() {
        let mut tracker = ProgressTracker::start(10, 1);
        tracker.update(1, true);
        assert_eq!(tracker.failed_pages(), &[1]);
        assert_eq!(tracker.average_page_time(), None);

        tracker.update(2, false);
        assert!(tracker.average_page_time().is_some());
        assert!(tracker.estimate_remaining().is_some());
        assert_eq!(tracker.current_page(), 2);
    }

    #[test]
    fn render_bar_has_requested_width() {
        let mut tracker = ProgressTracker::start(4, 1);
        tracker.rehydrate(2);
        let bar = tracker.render_bar(10);
        assert_eq!(bar.chars().filter(|c| *c == '█').count(), 5);
        assert_eq!(bar.chars().filter(|c| *c == '░').count(), 5);
        assert!(bar.ends_with("50.0%"));
    }

    #[test]
    fn reset_returns_to_nothing_done() {
        let mut tracker = ProgressTracker::start(10, 1);
        tracker.update(1, false);
        tracker.update(2, true);
        tracker.reset(Some(5));
        assert_eq!(tracker.start_page(), 5);
        assert_eq!(tracker.current_page(), 4);
        assert!(tracker.failed_pages().is_empty());
        assert_eq!(tracker.average_page_time(), None);
    }

    #[test]
    fn durations_format_compactly() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }
}
