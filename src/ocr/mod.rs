//! OCR Module
//!
//! Text recognition behind the [`OcrEngine`] trait. The engine used for a run
//! is picked once at startup from the configuration string through
//! [`OcrBackendKind`].
//!
//! An engine distinguishes two outcomes: `Ok(OcrOutcome)` whenever it ran,
//! including runs that found no text or reported a failure, and `Err` when
//! recognition itself blew up. Only the latter fails a page.

use crate::settings::OcrSettings;
use anyhow::{Result, anyhow};
use image::DynamicImage;
use log::{info, warn};
use std::fmt;
use std::str::FromStr;

pub mod command;
#[cfg(feature = "tesseract")]
pub mod tesseract;

/// Result of one recognition call.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutcome {
    pub text: String,
    /// In `[0, 1]`; 0.0 when the engine does not report confidence.
    pub confidence: f32,
    pub success: bool,
    pub error: Option<String>,
}

impl OcrOutcome {
    pub fn recognized(text: impl Into<String>, confidence: f32) -> Self {
        OcrOutcome {
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        OcrOutcome {
            text: String::new(),
            confidence: 0.0,
            success: false,
            error: Some(error.into()),
        }
    }

    /// `true` when there is text worth writing out.
    pub fn has_text(&self) -> bool {
        self.success && !self.text.trim().is_empty()
    }
}

/// A text recognition backend.
pub trait OcrEngine {
    fn name(&self) -> &str;

    fn recognize(&mut self, image: &DynamicImage) -> Result<OcrOutcome>;
}

/// The OCR backends this build knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcrBackendKind {
    Tesseract,
    Command,
}

impl FromStr for OcrBackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tesseract" => Ok(OcrBackendKind::Tesseract),
            "command" => Ok(OcrBackendKind::Command),
            other => Err(anyhow!(
                "Unknown OCR engine '{}' (expected 'tesseract' or 'command')",
                other
            )),
        }
    }
}

impl fmt::Display for OcrBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcrBackendKind::Tesseract => write!(f, "tesseract"),
            OcrBackendKind::Command => write!(f, "command"),
        }
    }
}

/// Constructs a single engine of the given kind.
pub fn create_engine(kind: OcrBackendKind, settings: &OcrSettings) -> Result<Box<dyn OcrEngine>> {
    match kind {
        OcrBackendKind::Command => Ok(Box::new(command::CommandEngine::new(
            &settings.command,
            crate::settings::seconds(settings.timeout),
        )?)),
        #[cfg(feature = "tesseract")]
        OcrBackendKind::Tesseract => Ok(Box::new(tesseract::TesseractEngine::new(
            &settings.tesseract,
        )?)),
        #[cfg(not(feature = "tesseract"))]
        OcrBackendKind::Tesseract => {
            anyhow::bail!("This build has no in-process Tesseract support; use the 'command' engine")
        }
    }
}

/// Builds the configured primary engine, wrapped with retries and fallback.
pub fn build_engine(settings: &OcrSettings) -> Result<Box<dyn OcrEngine>> {
    let primary_kind: OcrBackendKind = settings.primary_engine.parse()?;
    let primary = create_engine(primary_kind, settings)?;
    info!("OCR engine initialized: {}", primary.name());

    let fallback = match settings.fallback_engine.as_deref() {
        Some(name) if !name.trim().is_empty() => {
            let kind: OcrBackendKind = name.parse()?;
            if kind == primary_kind {
                warn!("Fallback OCR engine equals the primary engine; ignoring it");
                None
            } else {
                match create_engine(kind, settings) {
                    Ok(engine) => Some(engine),
                    Err(e) => {
                        warn!("Fallback OCR engine '{}' unavailable: {:#}", kind, e);
                        None
                    }
                }
            }
        }
        _ => None,
    };

    let retries = if settings.retry_on_failure {
        settings.max_retries
    } else {
        0
    };
    if retries == 0 && fallback.is_none() {
        return Ok(primary);
    }
    Ok(Box::new(RetryingEngine::new(primary, fallback, retries)))
}

/// Retries raised errors of the primary engine, then tries the fallback once.
///
/// Outcomes that merely report no text are returned as they are.
pub struct RetryingEngine {
    primary: Box<dyn OcrEngine>,
    fallback: Option<Box<dyn OcrEngine>>,
    max_retries: u32,
}

impl RetryingEngine {
    pub fn new(
        primary: Box<dyn OcrEngine>,
        fallback: Option<Box<dyn OcrEngine>>,
        max_retries: u32,
    ) -> Self {
        RetryingEngine {
            primary,
            fallback,
            max_retries,
        }
    }
}

impl OcrEngine for RetryingEngine {
    fn name(&self) -> &str {
        self.primary.name()
    }

    fn recognize(&mut self, image: &DynamicImage) -> Result<OcrOutcome> {
        let mut attempt = 0;
        let last_error = loop {
            match self.primary.recognize(image) {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "{} failed ({:#}); retry {}/{}",
                        self.primary.name(),
                        e,
                        attempt,
                        self.max_retries
                    );
                }
                Err(e) => break e,
            }
        };

        match self.fallback.as_mut() {
            Some(fallback) => {
                warn!(
                    "{} gave up ({:#}); falling back to {}",
                    self.primary.name(),
                    last_error,
                    fallback.name()
                );
                fallback.recognize(image)
            }
            None => Err(last_error),
        }
    }
}

/// Text written for a page: the recognized text, or a placeholder marker for
/// pages without any.
pub fn page_text(page: u32, outcome: &OcrOutcome) -> String {
    if outcome.has_text() {
        outcome.text.clone()
    } else {
        format!("\n[Page {} - No text detected]\n\n", page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Scripted {
        name: &'static str,
        replies: VecDeque<Result<OcrOutcome>>,
    }

    impl Scripted {
        fn new(name: &'static str, replies: Vec<Result<OcrOutcome>>) -> Self {
            Scripted {
                name,
                replies: replies.into(),
            }
        }
    }

    impl OcrEngine for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn recognize(&mut self, _image: &DynamicImage) -> Result<OcrOutcome> {
            self.replies
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("script exhausted")))
        }
    }

    fn blank() -> DynamicImage {
        DynamicImage::new_rgb8(4, 4)
    }

    #[test]
    fn parses_backend_names() {
        assert_eq!("Tesseract".parse::<OcrBackendKind>().unwrap(), OcrBackendKind::Tesseract);
        assert_eq!(" command ".parse::<OcrBackendKind>().unwrap(), OcrBackendKind::Command);
        assert!("yomitoku".parse::<OcrBackendKind>().is_err());
    }

    #[test]
    fn retries_raised_errors_until_success() {
        let primary = Scripted::new(
            "primary",
            vec![
                Err(anyhow!("busy")),
                Err(anyhow!("busy")),
                Ok(OcrOutcome::recognized("hello", 0.9)),
            ],
        );
        let mut engine = RetryingEngine::new(Box::new(primary), None, 3);
        let outcome = engine.recognize(&blank()).unwrap();
        assert_eq!(outcome.text, "hello");
    }

    #[test]
    fn falls_back_after_retries_are_exhausted() {
        let primary = Scripted::new("primary", vec![Err(anyhow!("a")), Err(anyhow!("b"))]);
        let fallback = Scripted::new("fallback", vec![Ok(OcrOutcome::recognized("backup", 0.5))]);
        let mut engine = RetryingEngine::new(Box::new(primary), Some(Box::new(fallback)), 1);
        assert_eq!(engine.recognize(&blank()).unwrap().text, "backup");
    }

    #[test]
    fn soft_failures_are_not_retried() {
        let primary = Scripted::new("primary", vec![Ok(OcrOutcome::failed("no text"))]);
        let mut engine = RetryingEngine::new(Box::new(primary), None, 5);
        let outcome = engine.recognize(&blank()).unwrap();
        assert!(!outcome.success);
    }

    #[test]
    fn exhausted_retries_without_fallback_raise() {
        let primary = Scripted::new("primary", vec![Err(anyhow!("x")), Err(anyhow!("y"))]);
        let mut engine = RetryingEngine::new(Box::new(primary), None, 1);
        assert!(engine.recognize(&blank()).is_err());
    }

    #[test]
    fn blank_pages_get_a_placeholder() {
        assert_eq!(
            page_text(12, &OcrOutcome::recognized("   \n", 0.8)),
            "\n[Page 12 - No text detected]\n\n"
        );
        assert_eq!(
            page_text(3, &OcrOutcome::failed("engine said no")),
            "\n[Page 3 - No text detected]\n\n"
        );
        assert_eq!(page_text(1, &OcrOutcome::recognized("本文", 0.7)), "本文");
    }

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(OcrOutcome::recognized("x", 1.7).confidence, 1.0);
    }
}
