//! Live desktop backend built on `xcap`.
//!
//! Window discovery and pixel capture go through xcap; focus, key presses and
//! the fullscreen toggle go through the configured [`InputCommands`].

use super::{
    CaptureProvider, InputCommands, PageDirection, Rect, WindowHandle, WindowProvider,
    key_for_direction,
};
use crate::settings::{Settings, seconds};
use anyhow::{Context, Result, anyhow};
use image::{DynamicImage, RgbaImage};
use log::{debug, info, warn};
use std::time::Duration;
use xcap::{Monitor, Window};

/// Finds the reader window by title substring.
pub struct DesktopWindows {
    title_pattern: String,
    input: InputCommands,
    fullscreen_key: String,
    activation_delay: Duration,
}

impl DesktopWindows {
    pub fn new(settings: &Settings) -> Self {
        DesktopWindows {
            title_pattern: settings.kindle.window_title.clone(),
            input: InputCommands::new(
                settings.input.activate_command.clone(),
                settings.input.key_command.clone(),
            ),
            fullscreen_key: settings.input.fullscreen_key.clone(),
            activation_delay: seconds(settings.kindle.window_activation_delay),
        }
    }

    fn lookup(&self, id: u32) -> Option<Window> {
        let windows = Window::all().ok()?;
        windows.into_iter().find(|w| w.id().ok() == Some(id))
    }
}

impl WindowProvider for DesktopWindows {
    fn find_target_window(&mut self) -> Option<WindowHandle> {
        let windows = match Window::all() {
            Ok(windows) => windows,
            Err(e) => {
                warn!("Failed to enumerate windows: {}", e);
                return None;
            }
        };

        let found = windows.into_iter().find_map(|window| {
            let title = window.title().ok()?;
            if !title.contains(&self.title_pattern) || window.is_minimized().unwrap_or(false) {
                return None;
            }
            let id = window.id().ok()?;
            Some(WindowHandle { id, title })
        });

        match &found {
            Some(handle) => debug!("Found reader window: {} (id {})", handle.title, handle.id),
            None => warn!("No window matching '{}'", self.title_pattern),
        }
        found
    }

    fn activate(&mut self, handle: &WindowHandle) -> bool {
        let ok = self.input.activate(&handle.title);
        if ok && !self.activation_delay.is_zero() {
            std::thread::sleep(self.activation_delay);
        }
        ok
    }

    fn maximize_or_fullscreen(&mut self, handle: &WindowHandle) -> bool {
        info!("Toggling fullscreen for '{}'", handle.title);
        let ok = self.input.press(&self.fullscreen_key);
        if ok && !self.activation_delay.is_zero() {
            std::thread::sleep(self.activation_delay);
        }
        ok
    }

    fn window_region(&mut self, handle: &WindowHandle) -> Option<Rect> {
        let window = self.lookup(handle.id)?;
        let region = Rect {
            left: window.x().ok()?,
            top: window.y().ok()?,
            width: window.width().ok()?,
            height: window.height().ok()?,
        };
        if region.width == 0 || region.height == 0 {
            return None;
        }
        Some(region)
    }
}

/// Screen grabs through xcap and page turns through key presses.
pub struct DesktopCapture {
    input: InputCommands,
    page_turn_key: String,
    screenshot_delay: Duration,
}

impl DesktopCapture {
    pub fn new(settings: &Settings) -> Self {
        DesktopCapture {
            input: InputCommands::new(
                settings.input.activate_command.clone(),
                settings.input.key_command.clone(),
            ),
            page_turn_key: settings.kindle.page_turn_key.clone(),
            screenshot_delay: seconds(settings.screenshot.delay),
        }
    }
}

impl CaptureProvider for DesktopCapture {
    fn capture(&mut self, region: Option<Rect>) -> Result<DynamicImage> {
        if !self.screenshot_delay.is_zero() {
            std::thread::sleep(self.screenshot_delay);
        }

        let monitor = match region {
            Some(r) => Monitor::from_point(r.left, r.top)
                .with_context(|| format!("No monitor contains ({}, {})", r.left, r.top))?,
            None => primary_monitor()?,
        };
        let shot = monitor.capture_image().context("Monitor capture failed")?;
        let (width, height) = (shot.width(), shot.height());
        // xcap may link a different `image` release; hand the pixels over raw.
        let full = RgbaImage::from_raw(width, height, shot.into_raw())
            .ok_or_else(|| anyhow!("Captured buffer does not match {}x{}", width, height))?;
        let full = DynamicImage::ImageRgba8(full);

        let Some(r) = region else {
            debug!("Captured full display: {}x{}", width, height);
            return Ok(DynamicImage::ImageRgb8(full.to_rgb8()));
        };

        let origin_x = monitor.x().context("Monitor position unavailable")?;
        let origin_y = monitor.y().context("Monitor position unavailable")?;
        let x = (r.left - origin_x).max(0) as u32;
        let y = (r.top - origin_y).max(0) as u32;
        let cropped = full.crop_imm(x, y, r.width, r.height);
        if cropped.width() == 0 || cropped.height() == 0 {
            return Err(anyhow!("Window region {:?} lies outside the monitor", r));
        }
        debug!("Captured region: {}x{}", cropped.width(), cropped.height());
        Ok(DynamicImage::ImageRgb8(cropped.to_rgb8()))
    }

    fn send_page_turn(&mut self, direction: PageDirection) -> bool {
        let key = key_for_direction(&self.page_turn_key, direction);
        debug!("Turning page: direction={:?}, key={}", direction, key);
        self.input.press(&key)
    }
}

fn primary_monitor() -> Result<Monitor> {
    let monitors = Monitor::all().context("Failed to enumerate monitors")?;
    let mut fallback = None;
    for monitor in monitors {
        if monitor.is_primary().unwrap_or(false) {
            return Ok(monitor);
        }
        fallback.get_or_insert(monitor);
    }
    fallback.ok_or_else(|| anyhow!("No monitors detected"))
}
