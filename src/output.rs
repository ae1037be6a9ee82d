//! Text Output
//!
//! Appends recognized page text to the book's running output file.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Line written after every page.
pub fn page_separator() -> String {
    format!("\n{}\n\n", "=".repeat(80))
}

/// Append-only sink for page text.
pub trait OutputWriter {
    fn append(&mut self, path: &Path, text: &str) -> Result<()>;
}

/// Appends UTF-8 text to a file, creating it and its directory on first use.
#[derive(Debug, Default)]
pub struct TextFileWriter;

impl OutputWriter for TextFileWriter {
    fn append(&mut self, path: &Path, text: &str) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create output directory {:?}", parent))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open output file {:?}", path))?;
        file.write_all(text.as_bytes())
            .with_context(|| format!("Failed to append to {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_without_truncating() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("book.txt");
        let mut writer = TextFileWriter;
        writer.append(&path, "first").unwrap();
        writer.append(&path, "second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "firstsecond");
    }

    #[test]
    fn separator_is_a_rule_of_80() {
        let sep = page_separator();
        assert_eq!(sep.matches('=').count(), 80);
        assert!(sep.starts_with('\n') && sep.ends_with("\n\n"));
    }
}
