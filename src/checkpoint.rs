//! Resumption state: the last finalized item id and every emitted fact hash.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::artifacts::save_json_atomic;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub last_id: i64,
    #[serde(default)]
    pub seen_hashes: BTreeSet<String>,
}

impl Checkpoint {
    pub fn has_seen(&self, hash: &str) -> bool {
        self.seen_hashes.contains(hash)
    }

    /// Zero both fields.
    pub fn reset(&mut self) {
        self.last_id = 0;
        self.seen_hashes.clear();
    }
}

/// Loads and atomically saves a [`Checkpoint`] file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The persisted checkpoint, or an empty one if none exists yet.
    pub fn load(&self) -> Result<Checkpoint> {
        if !self.path.exists() {
            return Ok(Checkpoint::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read checkpoint {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Corrupt checkpoint file {}", self.path.display()))
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        save_json_atomic(&self.path, checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path().join("checkpoint.json"));
        assert_eq!(store.load().unwrap(), Checkpoint::default());
    }

    #[test]
    fn save_then_load() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path().join("state/checkpoint.json"));
        let mut cp = Checkpoint::default();
        cp.last_id = 42;
        cp.seen_hashes.insert("abc".to_string());
        store.save(&cp).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.last_id, 42);
        assert!(loaded.has_seen("abc"));
    }

    #[test]
    fn reads_list_written_by_older_runs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("checkpoint.json");
        std::fs::write(&path, r#"{"last_id": 7, "seen_hashes": ["b", "a", "b"]}"#).unwrap();
        let cp = CheckpointStore::new(&path).load().unwrap();
        assert_eq!(cp.last_id, 7);
        assert_eq!(cp.seen_hashes.len(), 2);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("checkpoint.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(CheckpointStore::new(&path).load().is_err());
    }

    #[test]
    fn reset_clears_everything() {
        let mut cp = Checkpoint {
            last_id: 9,
            seen_hashes: ["x".to_string()].into_iter().collect(),
        };
        cp.reset();
        assert_eq!(cp, Checkpoint::default());
    }
}
