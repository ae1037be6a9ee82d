//! Persisted Processing State
//!
//! One JSON record per book, keyed by a sanitized form of the title. The store
//! never returns errors to its caller: failures are logged and reported as
//! `false` or `None`.

use chrono::{Local, SecondsFormat};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const STATE_FILE_SUFFIX: &str = "_state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Failed,
}

/// Durable progress of one book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub book_title: String,
    #[serde(alias = "start_datetime")]
    pub start_time: String,
    pub last_update: String,
    /// Last page attempted, successfully or not.
    pub current_page: u32,
    pub total_pages: u32,
    pub processed_pages: Vec<u32>,
    pub failed_pages: Vec<u32>,
    pub output_file: PathBuf,
    pub screenshot_dir: PathBuf,
    pub status: RunStatus,
}

impl ProcessingState {
    pub fn is_resumable(&self) -> bool {
        self.status == RunStatus::InProgress && self.current_page < self.total_pages
    }

    /// Lowest page recorded in this state, if any page was attempted.
    pub fn first_recorded_page(&self) -> Option<u32> {
        self.processed_pages
            .iter()
            .chain(self.failed_pages.iter())
            .copied()
            .min()
    }
}

/// Partial update applied with [`StateStore::update`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatePatch {
    pub current_page: Option<u32>,
    pub total_pages: Option<u32>,
    pub processed_pages: Option<Vec<u32>>,
    pub failed_pages: Option<Vec<u32>>,
    pub status: Option<RunStatus>,
    /// Keys that match no field; reported and dropped.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

impl StatePatch {
    pub fn status(status: RunStatus) -> Self {
        StatePatch {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Builds a patch from a loose JSON object, keeping unknown keys aside.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}

/// Directory-backed store of [`ProcessingState`] records.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_dir: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        info!("StateStore using directory: {:?}", state_dir);
        StateStore { state_dir }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Path of the record for `book_title`.
    pub fn key_for(&self, book_title: &str) -> PathBuf {
        self.state_dir
            .join(format!("{}{}", sanitize_title(book_title), STATE_FILE_SUFFIX))
    }

    /// Builds the initial record without touching disk.
    pub fn create(
        &self,
        book_title: &str,
        total_pages: u32,
        output_file: PathBuf,
        screenshot_dir: PathBuf,
        start_page: u32,
    ) -> ProcessingState {
        let now = timestamp();
        info!("Initial state created for: {}", book_title);
        ProcessingState {
            book_title: book_title.to_string(),
            start_time: now.clone(),
            last_update: now,
            current_page: start_page.saturating_sub(1),
            total_pages,
            processed_pages: Vec::new(),
            failed_pages: Vec::new(),
            output_file,
            screenshot_dir,
            status: RunStatus::InProgress,
        }
    }

    pub fn save(&self, state: &ProcessingState) -> bool {
        let path = self.key_for(&state.book_title);
        match write_record(&path, state) {
            Ok(()) => {
                debug!("State saved: {:?}", path);
                true
            }
            Err(e) => {
                error!("Failed to save state to {:?}: {:#}", path, e);
                false
            }
        }
    }

    /// Loads the record for `book_title`; missing or malformed files yield `None`.
    pub fn load(&self, book_title: &str) -> Option<ProcessingState> {
        let path = self.key_for(book_title);
        if !path.exists() {
            warn!("State file not found: {:?}", path);
            return None;
        }
        match read_record(&path) {
            Ok(state) => {
                info!("State loaded: {:?}", path);
                Some(state)
            }
            Err(e) => {
                error!("Failed to load state from {:?}: {:#}", path, e);
                None
            }
        }
    }

    /// Returns `state` with `patch` applied and `last_update` refreshed.
    pub fn update(&self, state: &ProcessingState, patch: StatePatch) -> ProcessingState {
        for key in patch.unknown.keys() {
            warn!("Unknown state key: {}", key);
        }
        let mut next = state.clone();
        if let Some(page) = patch.current_page {
            next.current_page = page;
        }
        if let Some(total) = patch.total_pages {
            next.total_pages = total;
        }
        if let Some(pages) = patch.processed_pages {
            next.processed_pages = pages;
        }
        if let Some(pages) = patch.failed_pages {
            next.failed_pages = pages;
        }
        if let Some(status) = patch.status {
            next.status = status;
        }
        next.last_update = timestamp();
        next
    }

    pub fn can_resume(&self, book_title: &str) -> bool {
        let Some(state) = self.load(book_title) else {
            return false;
        };
        if state.status != RunStatus::InProgress {
            info!("Cannot resume: status is {:?}", state.status);
            return false;
        }
        if state.current_page >= state.total_pages {
            info!("Cannot resume: all pages processed");
            return false;
        }
        info!("Can resume after page {}", state.current_page);
        true
    }

    /// Removes the record. Returns `true` when no record remains.
    pub fn delete(&self, book_title: &str) -> bool {
        let path = self.key_for(book_title);
        if !path.exists() {
            debug!("State file already absent: {:?}", path);
            return true;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("State file deleted: {:?}", path);
                true
            }
            Err(e) => {
                error!("Failed to delete state file {:?}: {}", path, e);
                false
            }
        }
    }

    /// Every readable record in the directory, ordered by file name.
    pub fn list_all(&self) -> Vec<ProcessingState> {
        let entries = match fs::read_dir(&self.state_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read state directory {:?}: {}", self.state_dir, e);
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with(STATE_FILE_SUFFIX))
            })
            .collect();
        paths.sort();

        let states: Vec<ProcessingState> = paths
            .iter()
            .filter_map(|path| match read_record(path) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!("Skipping unreadable state file {:?}: {:#}", path, e);
                    None
                }
            })
            .collect();
        info!("Found {} state files", states.len());
        states
    }
}

/// Filesystem-safe token for a book title.
///
/// Alphanumerics (any script), space, underscore and hyphen are kept, anything
/// else becomes `_`; surrounding whitespace is dropped and spaces become `_`.
pub fn sanitize_title(title: &str) -> String {
    let safe: String = title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    safe.trim().replace(' ', "_")
}

fn timestamp() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn write_record(path: &Path, state: &ProcessingState) -> anyhow::Result<()> {
    use anyhow::Context;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let json = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("Failed to write {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to move {:?} into place", tmp))?;
    Ok(())
}

fn read_record(path: &Path) -> anyhow::Result<ProcessingState> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample(store: &StateStore, title: &str) -> ProcessingState {
        store.create(
            title,
            120,
            PathBuf::from("output/book.txt"),
            PathBuf::from("output/book_screenshots"),
            1,
        )
    }

    #[test]
    fn key_is_sanitized() {
        let store = StateStore::new("state");
        assert_eq!(
            store.key_for("My Book: Vol/2"),
            PathBuf::from("state/My_Book__Vol_2_state.json")
        );
        assert_eq!(sanitize_title("  spaced out  "), "spaced_out");
        assert_eq!(sanitize_title("吾輩は猫である"), "吾輩は猫である");
    }

    #[test]
    fn initial_state_has_nothing_done() {
        let store = StateStore::new("state");
        let state = store.create("b", 50, "o.txt".into(), "s".into(), 10);
        assert_eq!(state.current_page, 9);
        assert_eq!(state.status, RunStatus::InProgress);
        assert!(state.processed_pages.is_empty());
        assert!(state.failed_pages.is_empty());
        assert_eq!(state.start_time, state.last_update);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state"));
        let mut state = sample(&store, "Round Trip");
        state.current_page = 7;
        state.processed_pages = vec![1, 2, 3, 5, 6, 7];
        state.failed_pages = vec![4];

        assert!(store.save(&state));
        assert_eq!(store.load("Round Trip"), Some(state));
    }

    #[test]
    fn missing_or_malformed_records_load_as_none() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert_eq!(store.load("nothing here"), None);

        fs::write(store.key_for("broken"), "{ not json").unwrap();
        assert_eq!(store.load("broken"), None);
        assert!(!store.can_resume("broken"));
    }

    #[test]
    fn legacy_start_datetime_is_accepted() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let legacy = json!({
            "book_title": "legacy",
            "start_datetime": "2024-01-01T10:00:00",
            "last_update": "2024-01-01T10:05:00",
            "current_page": 3,
            "total_pages": 10,
            "processed_pages": [1, 2, 3],
            "failed_pages": [],
            "output_file": "out/legacy.txt",
            "screenshot_dir": "out/legacy_screenshots",
            "status": "in_progress"
        });
        fs::write(store.key_for("legacy"), legacy.to_string()).unwrap();

        let state = store.load("legacy").unwrap();
        assert_eq!(state.start_time, "2024-01-01T10:00:00");
        assert!(store.can_resume("legacy"));
    }

    #[test]
    fn update_applies_known_fields_only() {
        let store = StateStore::new("state");
        let state = sample(&store, "patch");
        let patch = StatePatch::from_value(json!({
            "current_page": 4,
            "failed_pages": [2],
            "colour": "blue"
        }))
        .unwrap();
        assert!(patch.unknown.contains_key("colour"));

        let next = store.update(&state, patch);
        assert_eq!(next.current_page, 4);
        assert_eq!(next.failed_pages, vec![2]);
        assert_eq!(next.total_pages, state.total_pages);
        assert_eq!(next.book_title, state.book_title);
        // The input record is left untouched.
        assert_eq!(state.current_page, 0);
    }

    #[test]
    fn resumability_follows_status_and_position() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let state = sample(&store, "resume");

        store.save(&store.update(
            &state,
            StatePatch {
                current_page: Some(60),
                ..Default::default()
            },
        ));
        assert!(store.can_resume("resume"));

        store.save(&store.update(
            &state,
            StatePatch {
                current_page: Some(120),
                ..Default::default()
            },
        ));
        assert!(!store.can_resume("resume"));

        store.save(&store.update(&state, StatePatch::status(RunStatus::Completed)));
        assert!(!store.can_resume("resume"));

        store.save(&store.update(&state, StatePatch::status(RunStatus::Failed)));
        assert!(!store.can_resume("resume"));
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let state = sample(&store, "gone");
        assert!(store.save(&state));
        assert!(store.delete("gone"));
        assert!(!store.key_for("gone").exists());
        assert!(store.delete("gone"));
    }

    #[test]
    fn list_all_skips_unrelated_and_broken_files() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&sample(&store, "alpha"));
        store.save(&sample(&store, "beta"));
        fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();
        fs::write(store.key_for("broken"), "[]").unwrap();

        let titles: Vec<String> = store
            .list_all()
            .into_iter()
            .map(|s| s.book_title)
            .collect();
        assert_eq!(titles, vec!["alpha".to_string(), "beta".to_string()]);
    }
}
