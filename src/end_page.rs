//! End-Page Detection
//!
//! Decides from a stream of successive page captures whether the reader has
//! stopped advancing, which is how the end of a book shows up on screen.

use crate::similarity::{Fingerprint, SimilarityChecker};
use image::DynamicImage;
use log::{debug, info};
use std::collections::VecDeque;

/// Default number of consecutive matching captures that mark the end.
pub const DEFAULT_CONSECUTIVE_SAME_PAGES: usize = 3;

/// Stateful detector fed with raw captures in page order.
pub struct EndPageDetector {
    checker: SimilarityChecker,
    consecutive_same_pages: usize,
    recent: VecDeque<Fingerprint>,
    same_page_count: usize,
}

impl EndPageDetector {
    /// `consecutive_same_pages` counts every matching observation, including
    /// the first capture of the run.
    pub fn new(checker: SimilarityChecker, consecutive_same_pages: usize) -> Self {
        let consecutive_same_pages = consecutive_same_pages.max(1);
        info!(
            "EndPageDetector initialized: consecutive_same_pages={}, similarity_threshold={}",
            consecutive_same_pages,
            checker.threshold()
        );
        EndPageDetector {
            checker,
            consecutive_same_pages,
            recent: VecDeque::with_capacity(consecutive_same_pages),
            same_page_count: 0,
        }
    }

    /// Feeds the next capture. Returns `true` once the end has been reached.
    pub fn check(&mut self, image: &DynamicImage) -> bool {
        let hash = self.checker.fingerprint(image);

        let Some(previous) = self.recent.back() else {
            self.record(hash);
            self.same_page_count = 0;
            debug!("First page recorded");
            return false;
        };

        if self.checker.is_similar(previous, &hash) {
            self.same_page_count += 1;
            debug!(
                "Same page detected: count={}/{}",
                self.same_page_count, self.consecutive_same_pages
            );
            // The first observation has no comparison, hence the `- 1`.
            if self.same_page_count >= self.consecutive_same_pages - 1 {
                info!(
                    "End page detected: {} consecutive same pages found",
                    self.consecutive_same_pages
                );
                return true;
            }
        } else {
            if self.same_page_count > 0 {
                debug!(
                    "Different page detected, resetting count from {}",
                    self.same_page_count
                );
            }
            self.same_page_count = 0;
            self.record(hash);
        }

        false
    }

    /// Similarity of `image` to the last recorded page, `None` before the
    /// first capture.
    pub fn similarity_score(&self, image: &DynamicImage) -> Option<f64> {
        let previous = self.recent.back()?;
        let hash = self.checker.fingerprint(image);
        Some(self.checker.similarity_score(previous, &hash))
    }

    pub fn same_page_count(&self) -> usize {
        self.same_page_count
    }

    pub fn reset(&mut self) {
        self.recent.clear();
        self.same_page_count = 0;
        debug!("EndPageDetector reset");
    }

    fn record(&mut self, hash: Fingerprint) {
        if self.recent.len() == self.consecutive_same_pages {
            self.recent.pop_front();
        }
        self.recent.push_back(hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::tests::noise_image;

    fn detector() -> EndPageDetector {
        EndPageDetector::new(SimilarityChecker::default(), 3)
    }

    #[test]
    fn three_identical_captures_end_the_book() {
        let mut d = detector();
        let a = noise_image(1);
        assert!(!d.check(&a));
        assert!(!d.check(&a));
        assert!(d.check(&a));
    }

    #[test]
    fn a_change_before_threshold_never_ends() {
        let mut d = detector();
        assert!(!d.check(&noise_image(1)));
        assert!(!d.check(&noise_image(1)));
        assert!(!d.check(&noise_image(2)));
        assert_eq!(d.same_page_count(), 0);
    }

    #[test]
    fn counter_restarts_after_transition() {
        let mut d = detector();
        let a = noise_image(1);
        let b = noise_image(2);
        assert!(!d.check(&a));
        assert!(!d.check(&b));
        assert!(!d.check(&b));
        assert!(d.check(&b));
    }

    #[test]
    fn score_is_unknown_until_first_capture() {
        let mut d = detector();
        let a = noise_image(3);
        assert_eq!(d.similarity_score(&a), None);
        d.check(&a);
        assert_eq!(d.similarity_score(&a), Some(1.0));
    }

    #[test]
    fn reset_clears_history() {
        let mut d = detector();
        let a = noise_image(4);
        d.check(&a);
        d.check(&a);
        d.reset();
        assert_eq!(d.same_page_count(), 0);
        assert!(!d.check(&a));
        assert!(!d.check(&a));
        assert!(d.check(&a));
    }

    #[test]
    fn history_stays_bounded() {
        let mut d = detector();
        for seed in 0..10 {
            d.check(&noise_image(seed));
        }
        assert!(d.recent.len() <= 3);
    }
}
