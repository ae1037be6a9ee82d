//! Replay backend: feeds previously saved page screenshots through the
//! pipeline instead of a live window.

use super::{CaptureProvider, PageDirection, Rect, WindowHandle, WindowProvider};
use anyhow::{Context, Result, bail};
use image::DynamicImage;
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Pages are the `page_*.png` files of a directory in name order. Turning
/// past the last file stays on it, which the end-page detector picks up.
pub struct ReplayCapture {
    pages: Vec<PathBuf>,
    cursor: usize,
}

impl ReplayCapture {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut pages: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("Failed to read replay directory {:?}", dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_page_file(path))
            .collect();
        pages.sort();
        if pages.is_empty() {
            bail!("No page_*.png files found in {:?}", dir);
        }
        info!("Replaying {} saved pages from {:?}", pages.len(), dir);
        Ok(ReplayCapture { pages, cursor: 0 })
    }

    /// Positions the replay on the `index`-th file (0-based).
    pub fn seek(&mut self, index: usize) {
        self.cursor = index.min(self.pages.len() - 1);
    }

    /// Positions the replay on `page_{page:04}.png`, or on the `page`-th file
    /// when no file carries that number.
    pub fn seek_to_page(&mut self, page: u32) {
        let wanted = format!("page_{:04}.png", page);
        let index = self
            .pages
            .iter()
            .position(|path| path.file_name().and_then(|n| n.to_str()) == Some(wanted.as_str()))
            .unwrap_or_else(|| page.saturating_sub(1) as usize);
        self.seek(index);
    }
}

impl CaptureProvider for ReplayCapture {
    fn capture(&mut self, _region: Option<Rect>) -> Result<DynamicImage> {
        let path = &self.pages[self.cursor];
        debug!("Replaying {:?}", path);
        image::open(path).with_context(|| format!("Failed to open {:?}", path))
    }

    fn send_page_turn(&mut self, direction: PageDirection) -> bool {
        match direction {
            PageDirection::Forward if self.cursor + 1 < self.pages.len() => self.cursor += 1,
            PageDirection::Backward if self.cursor > 0 => self.cursor -= 1,
            _ => debug!("Replay cursor stays at {}", self.cursor),
        }
        true
    }

    fn settle_delay(&mut self, _delay: Duration) {}
}

/// Window provider that always reports one window covering the capture.
pub struct StaticWindow;

impl WindowProvider for StaticWindow {
    fn find_target_window(&mut self) -> Option<WindowHandle> {
        Some(WindowHandle {
            id: 0,
            title: "replay".to_string(),
        })
    }

    fn activate(&mut self, _handle: &WindowHandle) -> bool {
        true
    }

    fn maximize_or_fullscreen(&mut self, _handle: &WindowHandle) -> bool {
        false
    }

    fn window_region(&mut self, _handle: &WindowHandle) -> Option<Rect> {
        None
    }
}

fn is_page_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    name.starts_with("page_") && name.ends_with(".png")
}
