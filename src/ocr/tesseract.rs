//! In-process Tesseract engine using the tesseract-rs crate.

use super::{OcrEngine, OcrOutcome};
use crate::settings::TesseractSettings;
use anyhow::{Context, Result, anyhow};
use image::DynamicImage;
use log::{debug, info};
use std::path::PathBuf;
use tesseract_rs::TesseractAPI;

/// Language data cache of the `tesseract-rs` build, used when
/// `ocr.tesseract.tessdata_dir` is not set.
fn default_tessdata_dir() -> Result<PathBuf> {
    let base_path = if cfg!(target_os = "macos") {
        let home = std::env::var("HOME").context("HOME env var not set")?;
        PathBuf::from(home)
            .join("Library")
            .join("Application Support")
    } else if cfg!(target_os = "linux") {
        let home = std::env::var("HOME").context("HOME env var not set")?;
        PathBuf::from(home).join(".tesseract-rs")
    } else if cfg!(target_os = "windows") {
        let appdata = std::env::var("APPDATA").context("APPDATA env var not set")?;
        PathBuf::from(appdata)
    } else {
        return Err(anyhow!("Unsupported operating system; set ocr.tesseract.tessdata_dir"));
    };
    Ok(base_path.join("tesseract-rs").join("tessdata"))
}

pub struct TesseractEngine {
    api: TesseractAPI,
    lang: String,
}

impl TesseractEngine {
    pub fn new(settings: &TesseractSettings) -> Result<Self> {
        let tessdata_dir = match &settings.tessdata_dir {
            Some(dir) => dir.clone(),
            None => default_tessdata_dir().context("Could not determine tessdata directory")?,
        };
        let tessdata = tessdata_dir
            .to_str()
            .ok_or_else(|| anyhow!("tessdata path is not valid UTF-8: {:?}", tessdata_dir))?;

        let api = TesseractAPI::new();
        api.init(tessdata, &settings.lang).context(format!(
            "Failed to initialize Tesseract with language '{}'",
            settings.lang
        ))?;
        info!(
            "Tesseract initialized: lang={}, tessdata={:?}",
            settings.lang, tessdata_dir
        );

        Ok(TesseractEngine {
            api,
            lang: settings.lang.clone(),
        })
    }
}

impl OcrEngine for TesseractEngine {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn recognize(&mut self, image: &DynamicImage) -> Result<OcrOutcome> {
        let frame = image.to_rgb8();
        self.api
            .set_image(
                frame.as_raw(),
                frame.width() as i32,
                frame.height() as i32,
                3,                          // bytes per pixel for RGB
                (frame.width() * 3) as i32, // bytes per line
            )
            .context("Tesseract failed to set image")?;
        self.api
            .recognize()
            .context("Tesseract failed to recognize text")?;

        let text = self
            .api
            .get_utf8_text()
            .context("Tesseract failed to return text")?;
        // Mean confidence is reported on a 0-100 scale.
        let confidence = self.api.mean_text_conf().unwrap_or(0) as f32 / 100.0;
        debug!(
            "Tesseract ({}) recognized {} chars, confidence {:.2}",
            self.lang,
            text.chars().count(),
            confidence
        );

        Ok(OcrOutcome::recognized(text, confidence))
    }
}
