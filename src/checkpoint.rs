use crate::error::Result;
use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Resume point of a migration run, persisted after every page.
///
/// Field names are those of the on-disk record:
/// `{ "step": int|null, "after": string|null, "number": int }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationState {
    #[serde(rename = "step")]
    pub stage: Option<Stage>,
    #[serde(rename = "after")]
    pub cursor: Option<String>,
    #[serde(rename = "number")]
    pub processed_count: u64,
}

impl MigrationState {
    /// Stage to run now; a fresh state starts at the first stage.
    pub fn active_stage(&self) -> Stage {
        self.stage.unwrap_or(Stage::FIRST)
    }

    /// Record a finished page within the active stage.
    pub fn advance_page(&mut self, end_cursor: Option<String>, processed: u64) {
        self.stage = Some(self.active_stage());
        if end_cursor.is_some() {
            self.cursor = end_cursor;
        }
        self.processed_count += processed;
    }

    /// Move to the stage after the active one. Returns `false` when the
    /// active stage is the last; the state is left untouched in that case.
    pub fn advance_stage(&mut self) -> bool {
        match self.active_stage().next() {
            Some(next) => {
                self.stage = Some(next);
                self.cursor = None;
                self.processed_count = 0;
                true
            }
            None => false,
        }
    }
}

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

    /// Returns the persisted state, creating the default record if none exists.
    pub fn load(&self) -> Result<MigrationState> {
        if !self.path.exists() {
            let state = MigrationState::default();
            self.save(&state)?;
            info!(path = %self.path.display(), "Created new migration state");
            return Ok(state);
        }

        let content = fs::read_to_string(&self.path)?;
        let state: MigrationState = serde_json::from_str(&content)?;
        info!(
            stage = ?state.stage.map(|s| s.step()),
            cursor = ?state.cursor,
            processed = state.processed_count,
            "Loaded migration state"
        );
        Ok(state)
    }

    /// Write to a sibling temp file then rename over the previous record.
    pub fn save(&self, state: &MigrationState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, state)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        debug!(
            stage = ?state.stage.map(|s| s.step()),
            processed = state.processed_count,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Overwrite the record with a fresh state.
    pub fn reset(&self) -> Result<MigrationState> {
        let state = MigrationState::default();
        self.save(&state)?;
        info!(path = %self.path.display(), "Migration state reset");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_creates_default_when_missing() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("state.json"));

        let state = store.load().unwrap();
        assert_eq!(state, MigrationState::default());
        assert!(store.path().exists());

        let raw = fs::read_to_string(store.path()).unwrap();
        assert_eq!(raw, r#"{"step":null,"after":null,"number":0}"#);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("state.json"));

        let state = MigrationState {
            stage: Some(Stage::Observables),
            cursor: Some("YXJyYXljb25uZWN0aW9uOjk5".to_string()),
            processed_count: 200,
        };
        store.save(&state).unwrap();

        assert_eq!(store.load().unwrap(), state);
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn reads_hand_written_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{ "step": 4, "after": "abc", "number": 17 }"#).unwrap();

        let state = CheckpointStore::new(&path).load().unwrap();
        assert_eq!(state.stage, Some(Stage::RelationshipToRelationship));
        assert_eq!(state.cursor.as_deref(), Some("abc"));
        assert_eq!(state.processed_count, 17);
    }

    #[test]
    fn corrupt_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "not json").unwrap();
        assert!(CheckpointStore::new(&path).load().is_err());
    }

    #[test]
    fn count_is_sum_of_page_sizes() {
        let mut state = MigrationState::default();
        for (i, size) in [100u64, 100, 50].iter().enumerate() {
            state.advance_page(Some(format!("cursor-{i}")), *size);
        }
        assert_eq!(state.processed_count, 250);
        assert_eq!(state.cursor.as_deref(), Some("cursor-2"));
        assert_eq!(state.stage, Some(Stage::DomainObjects));
    }

    #[test]
    fn empty_page_keeps_cursor() {
        let mut state = MigrationState::default();
        state.advance_page(Some("c1".to_string()), 3);
        state.advance_page(None, 0);
        assert_eq!(state.cursor.as_deref(), Some("c1"));
    }

    #[test]
    fn stage_transition_resets_cursor_and_count() {
        let mut state = MigrationState {
            stage: Some(Stage::DomainObjects),
            cursor: Some("end".to_string()),
            processed_count: 42,
        };
        assert!(state.advance_stage());
        assert_eq!(state.stage, Some(Stage::Observables));
        assert_eq!(state.cursor, None);
        assert_eq!(state.processed_count, 0);
    }

    #[test]
    fn advancing_past_last_stage_is_noop() {
        let mut state = MigrationState {
            stage: Some(Stage::Containers),
            cursor: Some("end".to_string()),
            processed_count: 9,
        };
        let before = state.clone();
        assert!(!state.advance_stage());
        assert_eq!(state, before);
    }

    #[test]
    fn reset_overwrites_existing_state() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("state.json"));
        store
            .save(&MigrationState {
                stage: Some(Stage::Containers),
                cursor: None,
                processed_count: 5,
            })
            .unwrap();

        store.reset().unwrap();
        assert_eq!(store.load().unwrap(), MigrationState::default());
    }
}
