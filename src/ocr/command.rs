//! External OCR program engine.
//!
//! Writes the page to a temporary PNG, runs the configured program on it and
//! takes the recognized text from its standard output.

use super::{OcrEngine, OcrOutcome};
use crate::settings::CommandEngineSettings;
use anyhow::{Context, Result, anyhow, bail};
use image::DynamicImage;
use log::{debug, warn};
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const IMAGE_PLACEHOLDER: &str = "{image}";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandEngine {
    pub fn new(settings: &CommandEngineSettings, timeout: Duration) -> Result<Self> {
        if settings.program.trim().is_empty() {
            bail!("ocr.command.program must not be empty");
        }
        Ok(CommandEngine {
            program: settings.program.clone(),
            args: settings.args.clone(),
            timeout,
        })
    }

    fn argv(&self, image_path: &str) -> Vec<String> {
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.replace(IMAGE_PLACEHOLDER, image_path))
            .collect();
        if !self.args.iter().any(|arg| arg.contains(IMAGE_PLACEHOLDER)) {
            args.push(image_path.to_string());
        }
        args
    }
}

impl OcrEngine for CommandEngine {
    fn name(&self) -> &str {
        &self.program
    }

    fn recognize(&mut self, image: &DynamicImage) -> Result<OcrOutcome> {
        let file = tempfile::Builder::new()
            .prefix("kindleocr-")
            .suffix(".png")
            .tempfile()
            .context("Failed to create temporary image file")?;
        image
            .save(file.path())
            .context("Failed to write temporary image file")?;
        let image_path = file
            .path()
            .to_str()
            .ok_or_else(|| anyhow!("Temporary path is not valid UTF-8"))?;

        let args = self.argv(image_path);
        debug!("Running OCR command: {} {:?}", self.program, args);
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start OCR program '{}'", self.program))?;

        // Drain the pipes on their own threads so a chatty program cannot block.
        let mut stdout = child.stdout.take().context("OCR stdout not captured")?;
        let mut stderr = child.stderr.take().context("OCR stderr not captured")?;
        let out_reader = thread::spawn(move || {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).map(|_| buf)
        });
        let err_reader = thread::spawn(move || {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).map(|_| buf)
        });

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait().context("Failed to poll OCR program")? {
                break status;
            }
            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                bail!(
                    "OCR program '{}' timed out after {:.1?}",
                    self.program,
                    self.timeout
                );
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = out_reader
            .join()
            .map_err(|_| anyhow!("OCR stdout reader panicked"))?
            .context("Failed to read OCR output")?;
        let stderr = err_reader
            .join()
            .map_err(|_| anyhow!("OCR stderr reader panicked"))?
            .unwrap_or_default();

        if !status.success() {
            let message = String::from_utf8_lossy(&stderr).trim().to_string();
            warn!("OCR program '{}' exited with {}: {}", self.program, status, message);
            return Ok(OcrOutcome::failed(format!("{}: {}", status, message)));
        }

        let text = String::from_utf8_lossy(&stdout).into_owned();
        Ok(OcrOutcome::recognized(text, 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(program: &str, args: &[&str]) -> CommandEngine {
        CommandEngine::new(
            &CommandEngineSettings {
                program: program.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn image_path_is_substituted_or_appended() {
        let with_placeholder = engine("ocr", &["--in={image}", "-q"]);
        assert_eq!(with_placeholder.argv("/tmp/p.png"), vec!["--in=/tmp/p.png", "-q"]);

        let without = engine("ocr", &["-q"]);
        assert_eq!(without.argv("/tmp/p.png"), vec!["-q", "/tmp/p.png"]);
    }

    #[test]
    fn empty_program_is_rejected() {
        let settings = CommandEngineSettings {
            program: " ".to_string(),
            args: Vec::new(),
        };
        assert!(CommandEngine::new(&settings, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn missing_program_raises() {
        let mut engine = engine("kindleocr-no-such-program", &[]);
        assert!(engine.recognize(&DynamicImage::new_rgb8(2, 2)).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn stdout_becomes_text() {
        let mut engine = engine("sh", &["-c", "echo recognized", "{image}"]);
        let outcome = engine.recognize(&DynamicImage::new_rgb8(2, 2)).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.text.trim(), "recognized");
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_a_reported_failure() {
        let mut engine = engine("sh", &["-c", "echo boom >&2; exit 3", "{image}"]);
        let outcome = engine.recognize(&DynamicImage::new_rgb8(2, 2)).unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("boom"));
    }
}
