//! # Append-Only JSON Array Log
//!
//! Durable append-only store backing the annotation and note logs. Each log
//! is one JSON array on disk; `append` reads the array back, pushes the new
//! entry and rewrites the file, so a reader always sees entries in append
//! order.
//!
//! ## Partial-Write Tolerance
//! Unreadable or non-array content is treated as an empty log rather than an
//! error: a torn write loses at most the tail, never the ability to read.

use crate::error::AppResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Handle to one on-disk JSON array.
#[derive(Debug, Clone)]
pub struct JsonArrayLog {
    path: PathBuf,
}

impl JsonArrayLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry, preserving everything already stored.
    pub fn append<T: Serialize + DeserializeOwned>(&self, entry: &T) -> AppResult<()> {
        let mut entries: Vec<serde_json::Value> = self.read_values();
        entries.push(serde_json::to_value(entry)?);

        let rendered = serde_json::to_string_pretty(&entries)?;
        fs::write(&self.path, rendered)?;
        Ok(())
    }

    /// Read the whole log back in append order.
    ///
    /// Entries that fail to deserialize into `T` are skipped with a warning
    /// so one corrupt element never hides the rest of the log.
    pub fn read_all<T: DeserializeOwned>(&self) -> Vec<T> {
        self.read_values()
            .into_iter()
            .filter_map(|value| match serde_json::from_value(value) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping malformed log entry in {:?}: {}", self.path, e);
                    None
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read_values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_values(&self) -> Vec<serde_json::Value> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };

        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(serde_json::Value::Array(entries)) => entries,
            Ok(_) => {
                warn!("Log file {:?} is not a JSON array, treating as empty", self.path);
                Vec::new()
            }
            Err(e) => {
                warn!("Unreadable log file {:?} ({}), treating as empty", self.path, e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Entry {
        seq: u32,
        text: String,
    }

    #[test]
    fn test_append_then_read_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonArrayLog::new(dir.path().join("entries.json"));

        for seq in 0..7 {
            log.append(&Entry {
                seq,
                text: format!("entry {}", seq),
            })
            .unwrap();
        }

        let entries: Vec<Entry> = log.read_all();
        assert_eq!(entries.len(), 7);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.seq, i as u32);
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonArrayLog::new(dir.path().join("absent.json"));
        let entries: Vec<Entry> = log.read_all();
        assert!(entries.is_empty());
        assert!(log.is_empty());
    }

    #[test]
    fn test_corrupt_file_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.json");
        std::fs::write(&path, "[{\"seq\": 1, \"text\": \"ok\"}, {\"seq\":").unwrap();

        let log = JsonArrayLog::new(&path);
        let entries: Vec<Entry> = log.read_all();
        assert!(entries.is_empty());

        // Appending after corruption starts a fresh array
        log.append(&Entry {
            seq: 9,
            text: "recovered".to_string(),
        })
        .unwrap();
        let entries: Vec<Entry> = log.read_all();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq, 9);
    }

    #[test]
    fn test_non_array_content_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("object.json");
        std::fs::write(&path, "{\"not\": \"a list\"}").unwrap();

        let log = JsonArrayLog::new(&path);
        assert!(log.read_all::<Entry>().is_empty());
    }
}
