//! Configuration
//!
//! Typed view of the YAML configuration file. Every section and field has a
//! default, so a partial file (or none at all) is valid.

use anyhow::{Context, Result, bail};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Location tried when no `--config` is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub kindle: KindleSettings,
    pub input: InputSettings,
    pub screenshot: ScreenshotSettings,
    pub preprocessing: PreprocessingSettings,
    pub ocr: OcrSettings,
    pub output: OutputSettings,
    pub state: StateSettings,
    pub progress: ProgressSettings,
    pub logging: LoggingSettings,
    pub error_handling: ErrorHandlingSettings,
    pub end_page_detection: EndPageSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindleSettings {
    /// Substring matched against window titles.
    pub window_title: String,
    pub page_turn_key: String,
    /// Seconds to wait after a page turn.
    pub page_turn_delay: f64,
    /// Seconds to wait after focusing the window.
    pub window_activation_delay: f64,
    /// Toggle fullscreen on first focus and restore it at exit.
    pub fullscreen: bool,
}

impl Default for KindleSettings {
    fn default() -> Self {
        KindleSettings {
            window_title: "Kindle".to_string(),
            page_turn_key: "Right".to_string(),
            page_turn_delay: 1.5,
            window_activation_delay: 0.5,
            fullscreen: false,
        }
    }
}

/// External commands used to drive the reader window.
///
/// Each command is an argv list; `{title}` and `{key}` are substituted. An
/// empty list disables the action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSettings {
    pub activate_command: Vec<String>,
    pub key_command: Vec<String>,
    pub fullscreen_key: String,
}

impl Default for InputSettings {
    fn default() -> Self {
        InputSettings {
            activate_command: argv(&["xdotool", "search", "--name", "{title}", "windowactivate"]),
            key_command: argv(&["xdotool", "key", "{key}"]),
            fullscreen_key: "F11".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenshotSettings {
    /// Seconds to wait before each capture.
    pub delay: f64,
}

impl Default for ScreenshotSettings {
    fn default() -> Self {
        ScreenshotSettings { delay: 0.5 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingSettings {
    pub noise_reduction: NoiseReductionSettings,
    pub contrast: ContrastSettings,
    pub margin_trim: MarginTrimSettings,
    pub binarization: BinarizationSettings,
}

impl PreprocessingSettings {
    /// Every stage switched off; the optimizer passes images through.
    pub fn disabled() -> Self {
        PreprocessingSettings {
            noise_reduction: NoiseReductionSettings {
                enabled: false,
                ..Default::default()
            },
            contrast: ContrastSettings {
                enabled: false,
                ..Default::default()
            },
            margin_trim: MarginTrimSettings {
                enabled: false,
                ..Default::default()
            },
            binarization: BinarizationSettings {
                enabled: false,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseReductionSettings {
    pub enabled: bool,
    /// Gaussian blur sigma.
    pub sigma: f32,
}

impl Default for NoiseReductionSettings {
    fn default() -> Self {
        NoiseReductionSettings {
            enabled: true,
            sigma: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContrastSettings {
    pub enabled: bool,
    /// Percentage passed to the contrast adjustment; positive increases.
    pub amount: f32,
}

impl Default for ContrastSettings {
    fn default() -> Self {
        ContrastSettings {
            enabled: true,
            amount: 20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarginTrimSettings {
    pub enabled: bool,
    /// Luma at or above which a pixel belongs to the page.
    pub threshold: u8,
    pub padding: u32,
}

impl Default for MarginTrimSettings {
    fn default() -> Self {
        MarginTrimSettings {
            enabled: true,
            threshold: 190,
            padding: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinarizationMethod {
    Otsu,
    Simple,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinarizationSettings {
    pub enabled: bool,
    pub method: BinarizationMethod,
    /// Used by the `simple` method.
    pub threshold: u8,
}

impl Default for BinarizationSettings {
    fn default() -> Self {
        BinarizationSettings {
            enabled: true,
            method: BinarizationMethod::Otsu,
            threshold: 127,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    pub primary_engine: String,
    pub fallback_engine: Option<String>,
    pub retry_on_failure: bool,
    pub max_retries: u32,
    /// Seconds an external OCR command may run.
    pub timeout: f64,
    pub tesseract: TesseractSettings,
    pub command: CommandEngineSettings,
}

impl Default for OcrSettings {
    fn default() -> Self {
        OcrSettings {
            primary_engine: "tesseract".to_string(),
            fallback_engine: None,
            retry_on_failure: true,
            max_retries: 3,
            timeout: 60.0,
            tesseract: TesseractSettings::default(),
            command: CommandEngineSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseractSettings {
    pub lang: String,
    /// Overrides the tesseract-rs cache location.
    pub tessdata_dir: Option<PathBuf>,
}

impl Default for TesseractSettings {
    fn default() -> Self {
        TesseractSettings {
            lang: "jpn".to_string(),
            tessdata_dir: None,
        }
    }
}

/// External OCR program; `{image}` is replaced by the path of a PNG file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandEngineSettings {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for CommandEngineSettings {
    fn default() -> Self {
        CommandEngineSettings {
            program: "tesseract".to_string(),
            args: argv(&["{image}", "stdout", "-l", "jpn"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub base_dir: PathBuf,
}

impl Default for OutputSettings {
    fn default() -> Self {
        OutputSettings {
            base_dir: PathBuf::from("output"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSettings {
    pub state_dir: PathBuf,
    /// Pages between checkpoints.
    pub save_interval: u32,
    pub cleanup_on_completion: bool,
}

impl Default for StateSettings {
    fn default() -> Self {
        StateSettings {
            state_dir: PathBuf::from("output/state"),
            save_interval: 10,
            cleanup_on_completion: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSettings {
    pub show_progress_bar: bool,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        ProgressSettings {
            show_progress_bar: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// Log file; `{book_title}` is substituted.
    pub file_path: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            level: "info".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorHandlingSettings {
    pub max_consecutive_failures: u32,
}

impl Default for ErrorHandlingSettings {
    fn default() -> Self {
        ErrorHandlingSettings {
            max_consecutive_failures: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndPageSettings {
    pub enabled: bool,
    pub consecutive_same_pages: usize,
    /// Maximum Hamming distance between fingerprints of the same page.
    pub similarity_threshold: u32,
    pub hash_size: usize,
}

impl Default for EndPageSettings {
    fn default() -> Self {
        EndPageSettings {
            enabled: true,
            consecutive_same_pages: crate::end_page::DEFAULT_CONSECUTIVE_SAME_PAGES,
            similarity_threshold: crate::similarity::DEFAULT_SIMILARITY_THRESHOLD,
            hash_size: crate::similarity::DEFAULT_HASH_SIZE,
        }
    }
}

impl Settings {
    /// Reads and validates a YAML configuration file.
    pub fn load(path: &Path) -> Result<Settings> {
        info!("Loading configuration from: {:?}", path);
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {:?}", path))?;
        Self::from_yaml_str(&raw).with_context(|| format!("Invalid configuration in {:?}", path))
    }

    /// Resolves the configuration for a run: an explicit path must exist, the
    /// default path is optional.
    pub fn resolve(explicit: Option<&Path>) -> Result<Settings> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    info!("No configuration file found; using built-in defaults");
                    Ok(Settings::default())
                }
            }
        }
    }

    pub fn from_yaml_str(raw: &str) -> Result<Settings> {
        // An empty document parses as null; treat it as "all defaults".
        let settings: Settings = if raw.trim().is_empty() {
            Settings::default()
        } else {
            serde_yaml::from_str(raw).context("Failed to parse YAML configuration")?
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.error_handling.max_consecutive_failures == 0 {
            bail!("error_handling.max_consecutive_failures must be at least 1");
        }
        if self.state.save_interval == 0 {
            bail!("state.save_interval must be at least 1");
        }
        if self.end_page_detection.consecutive_same_pages == 0 {
            bail!("end_page_detection.consecutive_same_pages must be at least 1");
        }
        if self.end_page_detection.hash_size < 2 {
            bail!("end_page_detection.hash_size must be at least 2");
        }
        for (name, value) in [
            ("kindle.page_turn_delay", self.kindle.page_turn_delay),
            ("kindle.window_activation_delay", self.kindle.window_activation_delay),
            ("screenshot.delay", self.screenshot.delay),
            ("ocr.timeout", self.ocr.timeout),
        ] {
            if !value.is_finite() || value < 0.0 {
                bail!("{} must be a non-negative number of seconds, got {}", name, value);
            }
        }
        if self.kindle.window_title.trim().is_empty() {
            bail!("kindle.window_title must not be empty");
        }
        Ok(())
    }
}

/// Converts a validated seconds value into a `Duration`.
pub fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or_default()
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_document_uses_defaults() {
        let settings = Settings::from_yaml_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.error_handling.max_consecutive_failures, 5);
        assert_eq!(settings.end_page_detection.consecutive_same_pages, 3);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let yaml = r#"
kindle:
  window_title: "Kindle for PC"
state:
  save_interval: 3
  cleanup_on_completion: true
preprocessing:
  binarization:
    method: simple
    threshold: 100
"#;
        let settings = Settings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.kindle.window_title, "Kindle for PC");
        assert_eq!(settings.kindle.page_turn_key, "Right");
        assert_eq!(settings.state.save_interval, 3);
        assert!(settings.state.cleanup_on_completion);
        assert_eq!(
            settings.preprocessing.binarization.method,
            BinarizationMethod::Simple
        );
        assert!(settings.preprocessing.noise_reduction.enabled);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Settings::from_yaml_str("state:\n  save_interval: 0\n").is_err());
        assert!(Settings::from_yaml_str("kindle:\n  page_turn_delay: -1\n").is_err());
        assert!(
            Settings::from_yaml_str("error_handling:\n  max_consecutive_failures: 0\n").is_err()
        );
        assert!(Settings::from_yaml_str("ocr: [1, 2]\n").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(Settings::resolve(Some(&dir.path().join("missing.yaml"))).is_err());
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "ocr:\n  primary_engine: command\n  max_retries: 1\n").unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.ocr.primary_engine, "command");
        assert_eq!(settings.ocr.max_retries, 1);
    }

    #[test]
    fn seconds_never_panics() {
        assert_eq!(seconds(1.5), Duration::from_millis(1500));
        assert_eq!(seconds(-3.0), Duration::ZERO);
    }
}
