//! Window and Screen Capture
//!
//! The orchestrator only sees the two traits defined here. Concrete
//! providers live in the submodules: a live desktop backend (feature
//! `desktop`) and a replay backend that reads saved screenshots.

use anyhow::Result;
use image::DynamicImage;
use log::{debug, warn};
use std::process::Command;
use std::time::Duration;

#[cfg(feature = "desktop")]
pub mod desktop;
pub mod replay;

/// Screen rectangle in desktop coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

/// Opaque reference to the reader window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowHandle {
    pub id: u32,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDirection {
    Forward,
    Backward,
}

/// Locates and manipulates the reader window.
pub trait WindowProvider {
    fn find_target_window(&mut self) -> Option<WindowHandle>;

    /// Brings the window to the foreground. `false` if that failed.
    fn activate(&mut self, handle: &WindowHandle) -> bool;

    /// Toggles the reader's full-capture mode.
    fn maximize_or_fullscreen(&mut self, handle: &WindowHandle) -> bool;

    /// Content region of the window; `None` means "use the whole display".
    fn window_region(&mut self, handle: &WindowHandle) -> Option<Rect>;
}

/// Produces page images and turns pages.
pub trait CaptureProvider {
    /// Captures `region`, or the full primary display when `None`.
    fn capture(&mut self, region: Option<Rect>) -> Result<DynamicImage>;

    fn send_page_turn(&mut self, direction: PageDirection) -> bool;

    /// Waits for the reader to settle after a page turn.
    fn settle_delay(&mut self, delay: Duration) {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

/// Runs user-configured argv templates to focus windows and press keys.
#[derive(Debug, Clone, Default)]
pub struct InputCommands {
    activate: Vec<String>,
    key: Vec<String>,
}

impl InputCommands {
    pub fn new(activate: Vec<String>, key: Vec<String>) -> Self {
        InputCommands { activate, key }
    }

    /// `true` when no activation command is configured.
    pub fn activate(&self, title: &str) -> bool {
        if self.activate.is_empty() {
            return true;
        }
        run_template(&self.activate, &[("{title}", title)])
    }

    pub fn press(&self, key: &str) -> bool {
        if self.key.is_empty() {
            warn!("No key command configured; cannot press {}", key);
            return false;
        }
        run_template(&self.key, &[("{key}", key)])
    }
}

/// Key that turns the page in `direction`, mirroring the forward key for
/// backward turns.
pub fn key_for_direction(forward_key: &str, direction: PageDirection) -> String {
    match direction {
        PageDirection::Forward => forward_key.to_string(),
        PageDirection::Backward => match forward_key.to_ascii_lowercase().as_str() {
            "right" => "Left".to_string(),
            "left" => "Right".to_string(),
            "pagedown" | "page_down" | "next" => "Prior".to_string(),
            "pageup" | "page_up" | "prior" => "Next".to_string(),
            _ => forward_key.to_string(),
        },
    }
}

fn substitute(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter()
                .fold(arg.clone(), |acc, (name, value)| acc.replace(name, value))
        })
        .collect()
}

fn run_template(template: &[String], vars: &[(&str, &str)]) -> bool {
    let argv = substitute(template, vars);
    let Some((program, args)) = argv.split_first() else {
        return false;
    };
    debug!("Running input command: {:?}", argv);
    match Command::new(program).args(args).status() {
        Ok(status) if status.success() => true,
        Ok(status) => {
            warn!("Input command {:?} exited with {}", argv, status);
            false
        }
        Err(e) => {
            warn!("Failed to run input command {:?}: {}", argv, e);
            false
        }
    }
}
