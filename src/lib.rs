//! KindleOCR - Core Library
//!
//! Turns a book open in a desktop reader into a text file, one screenshot and
//! one OCR pass per page, with resumable progress.

use anyhow::{Result, bail};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

pub mod capture;
pub mod end_page;
pub mod ocr;
pub mod output;
pub mod preprocess;
pub mod progress;
pub mod settings;
pub mod similarity;
pub mod state;
pub mod workflow;

use capture::replay::{ReplayCapture, StaticWindow};
use output::TextFileWriter;
use preprocess::ImageOptimizer;
use settings::Settings;
use state::StateStore;
use workflow::{Collaborators, RunOutcome, Workflow};

/// Longest accepted book title, in characters.
pub const MAX_TITLE_LEN: usize = 200;

/// What the command line asked for.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub book_title: String,
    pub total_pages: Option<u32>,
    pub start_page: u32,
    pub resume: bool,
    pub force: bool,
    /// Read pages from saved screenshots instead of a live window.
    pub replay: Option<PathBuf>,
}

impl RunRequest {
    pub fn validate(&self) -> Result<()> {
        let title = self.book_title.trim();
        if title.is_empty() {
            bail!("Book title must not be empty");
        }
        if title.chars().count() > MAX_TITLE_LEN {
            bail!("Book title is longer than {} characters", MAX_TITLE_LEN);
        }
        if self.resume {
            return Ok(());
        }
        let Some(total) = self.total_pages else {
            bail!("--total-pages is required unless --resume is given");
        };
        if total == 0 {
            bail!("Total pages must be at least 1");
        }
        if self.start_page == 0 || self.start_page > total {
            bail!(
                "Start page {} is out of range 1..={}",
                self.start_page,
                total
            );
        }
        Ok(())
    }

    fn first_page(&self, settings: &Settings) -> u32 {
        if self.resume {
            StateStore::new(&settings.state.state_dir)
                .load(self.book_title.trim())
                .map(|state| state.current_page + 1)
                .unwrap_or(1)
        } else {
            self.start_page
        }
    }
}

/// Wires up the capture backend, optimizer, OCR engine and writer.
pub fn build_collaborators(settings: &Settings, request: &RunRequest) -> Result<Collaborators> {
    let (window, capture): (
        Box<dyn capture::WindowProvider>,
        Box<dyn capture::CaptureProvider>,
    ) = match &request.replay {
        Some(dir) => {
            let mut replay = ReplayCapture::open(dir)?;
            replay.seek_to_page(request.first_page(settings));
            (Box::new(StaticWindow), Box::new(replay))
        }
        None => desktop_backend(settings)?,
    };

    Ok(Collaborators {
        window,
        capture,
        preprocessor: Box::new(ImageOptimizer::new(settings.preprocessing.clone())),
        ocr: ocr::build_engine(&settings.ocr)?,
        writer: Box::new(TextFileWriter),
    })
}

#[cfg(feature = "desktop")]
fn desktop_backend(
    settings: &Settings,
) -> Result<(
    Box<dyn capture::WindowProvider>,
    Box<dyn capture::CaptureProvider>,
)> {
    use capture::desktop::{DesktopCapture, DesktopWindows};
    Ok((
        Box::new(DesktopWindows::new(settings)),
        Box::new(DesktopCapture::new(settings)),
    ))
}

#[cfg(not(feature = "desktop"))]
fn desktop_backend(
    _settings: &Settings,
) -> Result<(
    Box<dyn capture::WindowProvider>,
    Box<dyn capture::CaptureProvider>,
)> {
    bail!("This build has no desktop capture support; use --replay")
}

/// Validates the request, then starts or resumes the run.
pub fn run(settings: Settings, request: &RunRequest, cancel: Arc<AtomicBool>) -> Result<RunOutcome> {
    request.validate()?;
    let title = request.book_title.trim();
    if request.resume && (request.total_pages.is_some() || request.start_page > 1) {
        warn!("--total-pages and --start-page are ignored when resuming");
    }

    let collaborators = build_collaborators(&settings, request)?;
    let workflow = if request.resume {
        Workflow::resume(settings, collaborators, title, request.force)?
    } else {
        // Checked by validate.
        let total = request.total_pages.unwrap_or(1);
        Workflow::start(settings, collaborators, title, total, request.start_page)?
    };

    let mut workflow = workflow.with_cancel_flag(cancel);
    let outcome = workflow.run()?;
    info!("Run finished: {:?}", outcome);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(total: Option<u32>, start: u32) -> RunRequest {
        RunRequest {
            book_title: "本のタイトル".to_string(),
            total_pages: total,
            start_page: start,
            ..Default::default()
        }
    }

    #[test]
    fn accepts_a_plain_request() {
        assert!(request(Some(10), 1).validate().is_ok());
        assert!(request(Some(10), 10).validate().is_ok());
    }

    #[test]
    fn rejects_bad_page_ranges() {
        assert!(request(None, 1).validate().is_err());
        assert!(request(Some(0), 1).validate().is_err());
        assert!(request(Some(10), 0).validate().is_err());
        assert!(request(Some(10), 11).validate().is_err());
    }

    #[test]
    fn rejects_bad_titles() {
        let mut blank = request(Some(5), 1);
        blank.book_title = "   ".to_string();
        assert!(blank.validate().is_err());

        let mut long = request(Some(5), 1);
        long.book_title = "あ".repeat(MAX_TITLE_LEN + 1);
        assert!(long.validate().is_err());
        long.book_title = "あ".repeat(MAX_TITLE_LEN);
        assert!(long.validate().is_ok());
    }

    #[test]
    fn resume_needs_no_page_count() {
        let mut resume = request(None, 0);
        resume.resume = true;
        assert!(resume.validate().is_ok());
    }
}
