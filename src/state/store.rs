//! Durable, atomic persistence for [`PipelineState`].
//!
//! One JSON document per output directory. Saves go through a temp file,
//! fsync, and rename so a crash mid-write never corrupts the previous
//! valid document. A corrupt or unmigratable file is a loud error: the
//! store never fabricates state to paper over it.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use super::model::{PipelineState, STATE_SCHEMA_VERSION};

/// File name of the persisted state document inside the output directory.
pub const STATE_FILE_NAME: &str = "pipeline-state.json";

/// Errors raised by state persistence.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("state file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("state file {path} uses schema version {found}, newer than supported {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("cannot migrate state file {path} from version {from}: {reason}")]
    Migration {
        path: PathBuf,
        from: u32,
        reason: String,
    },
}

/// Result type for state persistence operations.
pub type StateStoreResult<T> = Result<T, StateStoreError>;

/// State store bound to one output directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    path: PathBuf,
}

impl StateStore {
    /// Bind a store to `output_dir`, creating the directory if needed.
    pub fn new(output_dir: impl Into<PathBuf>) -> StateStoreResult<Self> {
        let dir = output_dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join(STATE_FILE_NAME);
        Ok(Self { dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn output_dir(&self) -> &Path {
        &self.dir
    }

    /// Load the persisted state, if any.
    ///
    /// Returns `Ok(None)` when no state file exists yet. A document with an
    /// older schema version is migrated forward one version gap at a time;
    /// unknown fields from minor additions are ignored by deserialization.
    pub fn load(&self) -> StateStoreResult<Option<PipelineState>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StateStoreError::Io(err)),
        };

        let mut doc: Value = serde_json::from_str(&content)?;
        let mut version = doc
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32;

        if version > STATE_SCHEMA_VERSION {
            return Err(StateStoreError::UnsupportedVersion {
                path: self.path.clone(),
                found: version,
                supported: STATE_SCHEMA_VERSION,
            });
        }

        while version < STATE_SCHEMA_VERSION {
            migrate_one(&mut doc, version).map_err(|reason| StateStoreError::Migration {
                path: self.path.clone(),
                from: version,
                reason,
            })?;
            version += 1;
            doc["schema_version"] = Value::from(version);
        }

        let mut state: PipelineState = serde_json::from_value(doc)?;
        state.normalize();
        Ok(Some(state))
    }

    /// Persist the full document atomically, stamping `last_updated` and
    /// the current schema version as part of the same write.
    pub fn save(&self, state: &mut PipelineState) -> StateStoreResult<()> {
        state.schema_version = STATE_SCHEMA_VERSION;
        state.last_updated = Utc::now();

        let json = serde_json::to_string_pretty(state)?;
        let temp_path = self.dir.join(format!("{}.tmp", STATE_FILE_NAME));

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }
}

/// Apply the migration for one version gap, `from -> from + 1`.
fn migrate_one(doc: &mut Value, from: u32) -> Result<(), String> {
    match from {
        1 => migrate_v1_to_v2(doc),
        other => Err(format!("no migration registered for version {}", other)),
    }
}

/// v1 -> v2: per-phase unit maps were stored under `chapters`, and token
/// totals were a bare `total_tokens` counter at the root.
fn migrate_v1_to_v2(doc: &mut Value) -> Result<(), String> {
    let root = doc
        .as_object_mut()
        .ok_or_else(|| "document root is not an object".to_string())?;

    if let Some(total) = root.remove("total_tokens") {
        let total = total
            .as_u64()
            .ok_or_else(|| "total_tokens is not an integer".to_string())?;
        root.insert(
            "token_stats".to_string(),
            serde_json::json!({ "input_tokens": total, "output_tokens": 0, "cost": 0.0 }),
        );
    }

    if let Some(phases) = root.get_mut("phases").and_then(Value::as_object_mut) {
        for (name, phase) in phases.iter_mut() {
            let phase = phase
                .as_object_mut()
                .ok_or_else(|| format!("phase {} is not an object", name))?;
            if let Some(chapters) = phase.remove("chapters") {
                phase.insert("units".to_string(), chapters);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::{Phase, Status};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = TempDir::new().expect("temp dir");
        let store = StateStore::new(dir.path()).expect("store");
        assert!(store.load().expect("load").is_none());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let store = StateStore::new(dir.path()).expect("store");

        let mut state = PipelineState::new("book.epub", "The Book", 300);
        let unit = state.phase_mut(Phase::Analyze).ensure_unit("chapter-1");
        unit.begin("chapter-1").expect("begin");
        unit.complete("chapter-1", json!({"scene": 1}), 77)
            .expect("complete");

        store.save(&mut state).expect("save");
        let loaded = store.load().expect("load").expect("state present");
        assert_eq!(loaded, state);
        assert_eq!(loaded.schema_version, STATE_SCHEMA_VERSION);
    }

    #[test]
    fn test_save_updates_last_updated() {
        let dir = TempDir::new().expect("temp dir");
        let store = StateStore::new(dir.path()).expect("store");
        let mut state = PipelineState::new("b", "t", 1);
        let before = state.last_updated;
        store.save(&mut state).expect("save");
        assert!(state.last_updated >= before);
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = TempDir::new().expect("temp dir");
        let store = StateStore::new(dir.path()).expect("store");
        let mut state = PipelineState::new("b", "t", 1);
        store.save(&mut state).expect("save");
        assert!(store.path().exists());
        assert!(!dir.path().join(format!("{}.tmp", STATE_FILE_NAME)).exists());
    }

    #[test]
    fn test_corrupt_file_fails_loudly() {
        let dir = TempDir::new().expect("temp dir");
        let store = StateStore::new(dir.path()).expect("store");
        fs::write(store.path(), "{ not json").expect("write");
        assert!(matches!(
            store.load().unwrap_err(),
            StateStoreError::Json(_)
        ));
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let store = StateStore::new(dir.path()).expect("store");
        let doc = json!({
            "schema_version": STATE_SCHEMA_VERSION + 1,
            "source_file": "b",
            "book_title": "t",
            "total_pages": 1,
            "last_updated": Utc::now(),
        });
        fs::write(store.path(), doc.to_string()).expect("write");
        assert!(matches!(
            store.load().unwrap_err(),
            StateStoreError::UnsupportedVersion { .. }
        ));
    }

    #[test]
    fn test_v1_document_is_migrated() {
        let dir = TempDir::new().expect("temp dir");
        let store = StateStore::new(dir.path()).expect("store");
        let doc = json!({
            "schema_version": 1,
            "source_file": "book.epub",
            "book_title": "The Book",
            "total_pages": 250,
            "total_tokens": 12345,
            "phases": {
                "analyze": {
                    "status": "in_progress",
                    "current_sub_phase": "execute",
                    "chapters": {
                        "chapter-1": { "status": "completed", "tokens_used": 900 }
                    }
                }
            },
            "last_updated": Utc::now(),
        });
        fs::write(store.path(), doc.to_string()).expect("write");

        let state = store.load().expect("load").expect("state");
        assert_eq!(state.schema_version, STATE_SCHEMA_VERSION);
        assert_eq!(state.token_stats.input_tokens, 12345);
        let analyze = state.phase(Phase::Analyze).expect("phase");
        assert_eq!(
            analyze.units.get("chapter-1").map(|u| u.status),
            Some(Status::Completed)
        );
        // Missing phases are filled in on load.
        assert!(state.phase(Phase::Illustrate).is_some());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let dir = TempDir::new().expect("temp dir");
        let store = StateStore::new(dir.path()).expect("store");
        let mut state = PipelineState::new("b", "t", 9);
        store.save(&mut state).expect("save");

        // Simulate a minor forward addition.
        let mut doc: Value =
            serde_json::from_str(&fs::read_to_string(store.path()).expect("read")).expect("json");
        doc["future_field"] = json!("ignored");
        fs::write(store.path(), doc.to_string()).expect("write");

        let loaded = store.load().expect("load").expect("state");
        assert_eq!(loaded.book_title, "t");
    }
}
