//! Page Processing Workflow
//!
//! Drives the reader one page at a time: locate the window, capture, check for
//! the end of the book, keep the screenshot, preprocess, recognize, append the
//! text and turn the page. Progress is checkpointed to the state store so an
//! interrupted run can be resumed.
//!
//! Failure policy: a page attempt that cannot produce text counts toward the
//! consecutive-failure ceiling and the loop moves on to the next page. Errors
//! writing the output file are fatal to the run.

use crate::capture::{CaptureProvider, PageDirection, Rect, WindowHandle, WindowProvider};
use crate::end_page::EndPageDetector;
use crate::ocr::{OcrEngine, page_text};
use crate::output::{OutputWriter, page_separator};
use crate::preprocess::Preprocessor;
use crate::progress::{ProgressTracker, format_duration};
use crate::settings::{Settings, seconds};
use crate::similarity::SimilarityChecker;
use crate::state::{ProcessingState, RunStatus, StatePatch, StateStore, sanitize_title};
use anyhow::{Context, Result, bail};
use image::DynamicImage;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The external pieces a run talks to.
pub struct Collaborators {
    pub window: Box<dyn WindowProvider>,
    pub capture: Box<dyn CaptureProvider>,
    pub preprocessor: Box<dyn Preprocessor>,
    pub ocr: Box<dyn OcrEngine>,
    pub writer: Box<dyn OutputWriter>,
}

/// How a run ended, short of a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every page was attempted or the end of the book was detected.
    Completed,
    /// The consecutive-failure ceiling was reached.
    Aborted,
    /// Stopped between pages on request; the state remains resumable.
    Interrupted,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Aborted => 1,
            RunOutcome::Interrupted => 130,
        }
    }
}

/// A page that made it through recognition.
struct PageAttempt {
    text: String,
    end_detected: bool,
}

pub struct Workflow {
    settings: Settings,
    store: StateStore,
    state: ProcessingState,
    tracker: ProgressTracker,
    detector: Option<EndPageDetector>,
    collaborators: Collaborators,
    cancel: Arc<AtomicBool>,
    bar: ProgressBar,
    focused_once: bool,
    fullscreen_applied: bool,
    last_window: Option<WindowHandle>,
    reader_reachable: bool,
}

impl Workflow {
    /// Prepares a fresh run of `book_title` starting at `start_page`.
    pub fn start(
        settings: Settings,
        collaborators: Collaborators,
        book_title: &str,
        total_pages: u32,
        start_page: u32,
    ) -> Result<Self> {
        info!("Initializing workflow for: {}", book_title);
        settings.validate()?;

        let output_dir = settings.output.base_dir.clone();
        let file_stem = sanitize_title(book_title);
        let screenshot_dir = output_dir.join(format!("{}_screenshots", file_stem));
        fs::create_dir_all(&screenshot_dir)
            .with_context(|| format!("Failed to create screenshot directory {:?}", screenshot_dir))?;
        let output_file = output_dir.join(format!("{}.txt", file_stem));
        if output_file.exists() {
            warn!("Output file {:?} exists; new text will be appended", output_file);
        }

        let store = StateStore::new(&settings.state.state_dir);
        if store.key_for(book_title).exists() {
            if let Some(previous) = store.load(book_title) {
                if previous.status == RunStatus::InProgress {
                    warn!(
                        "Replacing unfinished record for '{}' (stopped after page {}); use --resume to continue it instead",
                        book_title, previous.current_page
                    );
                }
            }
        }

        let state = store.create(book_title, total_pages, output_file, screenshot_dir, start_page);
        store.save(&state);
        let tracker = ProgressTracker::start(total_pages, start_page);
        info!("Workflow initialized successfully");
        Ok(Self::assemble(settings, store, state, tracker, collaborators))
    }

    /// Reloads the saved record of `book_title` and continues after its last
    /// attempted page. With `force`, a record marked `failed` is re-armed.
    pub fn resume(
        settings: Settings,
        collaborators: Collaborators,
        book_title: &str,
        force: bool,
    ) -> Result<Self> {
        info!("Attempting to resume: {}", book_title);
        settings.validate()?;
        let store = StateStore::new(&settings.state.state_dir);
        let Some(mut state) = store.load(book_title) else {
            bail!("No saved state found for '{}'", book_title);
        };

        let resumable = if force && state.status == RunStatus::Failed {
            warn!("Re-arming failed record for '{}'", book_title);
            state = store.update(&state, StatePatch::status(RunStatus::InProgress));
            state.is_resumable()
        } else {
            store.can_resume(book_title)
        };
        if !resumable {
            bail!(
                "Cannot resume '{}': status {:?} after page {}/{}",
                book_title,
                state.status,
                state.current_page,
                state.total_pages
            );
        }

        fs::create_dir_all(&state.screenshot_dir).with_context(|| {
            format!("Failed to create screenshot directory {:?}", state.screenshot_dir)
        })?;

        // Timing history is not persisted; only the position is restored.
        let first_page = state
            .first_recorded_page()
            .unwrap_or(state.current_page + 1);
        let mut tracker = ProgressTracker::start(state.total_pages, first_page);
        tracker.rehydrate(state.current_page);

        info!(
            "Resuming from page {}/{}",
            state.current_page + 1,
            state.total_pages
        );
        Ok(Self::assemble(settings, store, state, tracker, collaborators))
    }

    fn assemble(
        settings: Settings,
        store: StateStore,
        state: ProcessingState,
        tracker: ProgressTracker,
        collaborators: Collaborators,
    ) -> Self {
        let detection = &settings.end_page_detection;
        let detector = detection.enabled.then(|| {
            EndPageDetector::new(
                SimilarityChecker::new(detection.hash_size, detection.similarity_threshold),
                detection.consecutive_same_pages,
            )
        });

        let bar = if settings.progress.show_progress_bar {
            let bar = ProgressBar::new(state.total_pages as u64);
            let style = ProgressStyle::default_bar()
                .template("{spinner:.green} Pages [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-");
            bar.set_style(style);
            bar.set_position(state.current_page as u64);
            bar
        } else {
            ProgressBar::hidden()
        };

        Workflow {
            settings,
            store,
            state,
            tracker,
            detector,
            collaborators,
            cancel: Arc::new(AtomicBool::new(false)),
            bar,
            focused_once: false,
            fullscreen_applied: false,
            last_window: None,
            reader_reachable: false,
        }
    }

    /// Flag that, once set, stops the run before the next page.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> &ProcessingState {
        &self.state
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// Runs the page loop to its end.
    ///
    /// A fatal error marks the record `failed`, saves it and is returned.
    pub fn run(&mut self) -> Result<RunOutcome> {
        match self.run_pages() {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!("Fatal error in page loop: {:#}", e);
                self.state = self
                    .store
                    .update(&self.state, StatePatch::status(RunStatus::Failed));
                self.checkpoint();
                self.restore_fullscreen();
                self.bar.abandon_with_message("failed");
                Err(e)
            }
        }
    }

    fn run_pages(&mut self) -> Result<RunOutcome> {
        let first_page = (self.state.current_page + 1).max(1);
        let max_failures = self.settings.error_handling.max_consecutive_failures;
        let save_interval = self.settings.state.save_interval;
        let mut consecutive_failures = 0;

        info!(
            "Processing '{}' from page {} to {}",
            self.state.book_title, first_page, self.state.total_pages
        );

        let mut page = first_page;
        while page <= self.state.total_pages {
            if self.cancel.load(Ordering::SeqCst) {
                warn!("Processing interrupted before page {}", page);
                self.checkpoint();
                self.restore_fullscreen();
                self.bar.abandon_with_message("interrupted");
                info!("State has been saved. Use --resume to continue.");
                return Ok(RunOutcome::Interrupted);
            }

            let mut processed = self.state.processed_pages.clone();
            let mut failed = self.state.failed_pages.clone();
            let mut end_detected = false;

            match self.attempt_page(page) {
                Ok(attempt) => {
                    self.write_page(&attempt.text)?;
                    end_detected = attempt.end_detected;
                    if page < self.state.total_pages && !end_detected {
                        self.turn_page();
                    }
                    consecutive_failures = 0;
                    processed.push(page);
                    self.tracker.update(page, false);
                    info!("Page {} processed successfully", page);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    failed.push(page);
                    self.tracker.update(page, true);
                    warn!(
                        "Failed to process page {}: {:#} ({} consecutive)",
                        page, e, consecutive_failures
                    );
                    if page < self.state.total_pages && self.reader_reachable {
                        self.turn_page();
                    }
                }
            }

            let patch = StatePatch {
                current_page: Some(page),
                total_pages: end_detected.then_some(page),
                processed_pages: Some(processed),
                failed_pages: Some(failed),
                ..Default::default()
            };
            self.state = self.store.update(&self.state, patch);

            if consecutive_failures >= max_failures {
                error!(
                    "Too many consecutive failures ({}). Aborting.",
                    consecutive_failures
                );
                self.state = self
                    .store
                    .update(&self.state, StatePatch::status(RunStatus::Failed));
                self.checkpoint();
                self.restore_fullscreen();
                self.bar.abandon_with_message("aborted");
                self.log_summary();
                return Ok(RunOutcome::Aborted);
            }

            if page % save_interval == 0 {
                self.checkpoint();
            }

            if end_detected {
                info!("End of book detected at page {}", page);
                self.tracker.set_total_pages(page);
                self.report_progress();
                break;
            }
            self.report_progress();
            page += 1;
        }

        self.state = self
            .store
            .update(&self.state, StatePatch::status(RunStatus::Completed));
        self.checkpoint();
        self.bar.finish_with_message("done");
        self.log_summary();

        if self.settings.state.cleanup_on_completion {
            self.store.delete(&self.state.book_title);
        }
        self.restore_fullscreen();
        Ok(RunOutcome::Completed)
    }

    /// Capture through recognition for one page.
    fn attempt_page(&mut self, page: u32) -> Result<PageAttempt> {
        info!("Processing page {}/{}", page, self.state.total_pages);

        let region = self.locate_window()?;
        let image = self
            .collaborators
            .capture
            .capture(region)
            .with_context(|| format!("Failed to capture screenshot for page {}", page))?;

        // Fingerprint the raw capture; preprocessing may change it.
        let end_detected = self.check_end_page(&image);
        self.save_screenshot(page, &image);

        let optimized = self.collaborators.preprocessor.optimize(&image);
        let outcome = self
            .collaborators
            .ocr
            .recognize(&optimized)
            .with_context(|| format!("OCR failed on page {}", page))?;

        if !outcome.has_text() {
            match &outcome.error {
                Some(reason) => warn!("No text extracted from page {}: {}", page, reason),
                None => warn!("No text extracted from page {}", page),
            }
        } else {
            debug!(
                "Page {}: {} chars, confidence {:.2}",
                page,
                outcome.text.chars().count(),
                outcome.confidence
            );
        }

        Ok(PageAttempt {
            text: page_text(page, &outcome),
            end_detected,
        })
    }

    /// Finds and focuses the reader; returns the region to capture.
    fn locate_window(&mut self) -> Result<Option<Rect>> {
        self.reader_reachable = false;
        let window = &mut self.collaborators.window;

        let Some(handle) = window.find_target_window() else {
            if self.fullscreen_applied {
                warn!("Reader window not listed after fullscreen; capturing the whole display");
                self.reader_reachable = true;
                return Ok(None);
            }
            bail!("Reader window '{}' not found", self.settings.kindle.window_title);
        };
        self.reader_reachable = true;

        if !window.activate(&handle) {
            warn!("Failed to activate reader window; capturing anyway");
        } else if !self.focused_once {
            self.focused_once = true;
            if self.settings.kindle.fullscreen {
                if window.maximize_or_fullscreen(&handle) {
                    info!("Reader switched to fullscreen");
                    self.fullscreen_applied = true;
                } else {
                    warn!("Failed to switch reader to fullscreen");
                }
            }
        }

        let region = window.window_region(&handle);
        if region.is_none() {
            debug!("No window region available; capturing the whole display");
        }
        self.last_window = Some(handle);
        Ok(region)
    }

    fn check_end_page(&mut self, image: &DynamicImage) -> bool {
        let Some(detector) = self.detector.as_mut() else {
            return false;
        };
        if log::log_enabled!(log::Level::Debug) {
            if let Some(score) = detector.similarity_score(image) {
                debug!("Similarity to previous page: {:.4}", score);
            }
        }
        detector.check(image)
    }

    fn save_screenshot(&self, page: u32, image: &DynamicImage) {
        let path = self
            .state
            .screenshot_dir
            .join(format!("page_{:04}.png", page));
        match image.save(&path) {
            Ok(()) => debug!("Screenshot saved: {:?}", path),
            Err(e) => warn!("Failed to save screenshot {:?}: {}", path, e),
        }
    }

    fn write_page(&mut self, text: &str) -> Result<()> {
        let entry = format!("{}{}", text, page_separator());
        self.collaborators
            .writer
            .append(&self.state.output_file, &entry)
            .with_context(|| format!("Failed to write text to {:?}", self.state.output_file))
    }

    fn turn_page(&mut self) {
        if let Some(handle) = &self.last_window {
            if !self.collaborators.window.activate(handle) {
                warn!("Failed to reactivate reader window before page turn");
            }
        }
        if !self
            .collaborators
            .capture
            .send_page_turn(PageDirection::Forward)
        {
            warn!("Page turn command failed");
        }
        self.collaborators
            .capture
            .settle_delay(seconds(self.settings.kindle.page_turn_delay));
    }

    fn restore_fullscreen(&mut self) {
        if !self.fullscreen_applied {
            return;
        }
        self.fullscreen_applied = false;
        match &self.last_window {
            Some(handle) if self.collaborators.window.maximize_or_fullscreen(handle) => {
                info!("Reader fullscreen restored");
            }
            Some(_) => warn!("Failed to restore reader from fullscreen"),
            None => warn!("Reader window unknown; fullscreen left as is"),
        }
    }

    fn checkpoint(&mut self) -> bool {
        let saved = self.store.save(&self.state);
        if saved {
            debug!("Checkpoint after page {}", self.state.current_page);
        }
        saved
    }

    fn report_progress(&mut self) {
        self.bar.set_length(self.tracker.total_pages() as u64);
        self.bar.set_position(self.tracker.current_page() as u64);
        let eta = self
            .tracker
            .estimate_remaining()
            .map(format_duration)
            .unwrap_or_else(|| "calculating".to_string());
        self.bar.set_message(format!("ETA {}", eta));

        if self.bar.is_hidden() {
            info!(
                "\n{}\n{}",
                self.tracker.render_bar(50),
                self.tracker.display(false)
            );
        } else {
            debug!("{}", self.tracker.display(true));
        }
    }

    fn log_summary(&self) {
        let rule = "=".repeat(80);
        info!("{}", rule);
        info!("Processing finished with status {:?}", self.state.status);
        info!("Total pages: {}", self.state.total_pages);
        info!("Processed pages: {}", self.state.processed_pages.len());
        info!("Failed pages: {}", self.state.failed_pages.len());
        if !self.state.failed_pages.is_empty() {
            warn!("Failed page numbers: {:?}", self.state.failed_pages);
        }
        info!("Elapsed: {}", format_duration(self.tracker.elapsed()));
        info!("Output file: {:?}", self.state.output_file);
        info!("{}", rule);
        match serde_json::to_string(&self.tracker.summary()) {
            Ok(json) => debug!("Progress summary: {}", json),
            Err(e) => debug!("Progress summary unavailable: {}", e),
        }
    }
}
