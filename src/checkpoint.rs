//! Checkpoint persistence.
//!
//! One checkpoint per completed epoch, named `epoch_{e}.json` under the
//! configured save directory. Payloads hold opaque state snapshots produced
//! by the model and optimizer adapters; the store never interprets them.
//!
//! Writes go to a temporary file in the same directory followed by a rename,
//! so a crash mid-write never leaves a half-written `epoch_*.json` behind.
//! There is no rotation: every epoch's checkpoint is kept.
//!
//! On load, a missing file and an unreadable payload are reported as
//! distinct errors ([`TrainingError::CheckpointNotFound`] vs
//! [`TrainingError::CorruptCheckpoint`]), since a resume flow treats them
//! very differently.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{TrainResult, TrainingError};

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Provenance recorded alongside every checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Host the checkpoint was written on.
    pub hostname: String,
    /// Free-form operator notes.
    pub notes: Option<String>,
}

impl CheckpointMetadata {
    fn capture() -> Self {
        Self {
            created_at: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            notes: None,
        }
    }
}

/// A complete training checkpoint for one epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Format version, checked on load.
    pub version: u32,
    /// Zero-based epoch this checkpoint completes.
    pub epoch: u32,
    /// Opaque model state snapshot.
    pub model_state: Vec<u8>,
    /// Opaque optimizer state snapshot; `None` only on the final epoch,
    /// where no further updates will consume it.
    pub optimizer_state: Option<Vec<u8>>,
    /// Provenance.
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Creates a checkpoint with freshly captured metadata.
    #[must_use]
    pub fn new(epoch: u32, model_state: Vec<u8>, optimizer_state: Option<Vec<u8>>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            epoch,
            model_state,
            optimizer_state,
            metadata: CheckpointMetadata::capture(),
        }
    }
}

/// Directory-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Opens a store, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::CheckpointIo`] if the directory cannot be
    /// created.
    pub fn new(dir: impl Into<PathBuf>) -> TrainResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| TrainingError::CheckpointIo {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// The store's directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a given epoch's checkpoint lives at.
    #[must_use]
    pub fn path_for(&self, epoch: u32) -> PathBuf {
        self.dir.join(format!("epoch_{epoch}.json"))
    }

    /// Persists a checkpoint atomically, returning its final path.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::CheckpointIo`] on serialization or I/O
    /// failure.
    pub fn save(&self, checkpoint: &Checkpoint) -> TrainResult<PathBuf> {
        let path = self.path_for(checkpoint.epoch);
        let tmp = self.dir.join(format!(".epoch_{}.json.tmp", checkpoint.epoch));

        let payload = serde_json::to_vec(checkpoint).map_err(|e| TrainingError::CheckpointIo {
            path: path.clone(),
            source: std::io::Error::other(e),
        })?;
        fs::write(&tmp, payload).map_err(|source| TrainingError::CheckpointIo {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| TrainingError::CheckpointIo {
            path: path.clone(),
            source,
        })?;

        info!(epoch = checkpoint.epoch, path = %path.display(), "checkpoint saved");
        Ok(path)
    }

    /// Loads the checkpoint for one epoch.
    ///
    /// # Errors
    ///
    /// [`TrainingError::CheckpointNotFound`] if no file exists for the
    /// epoch, [`TrainingError::CorruptCheckpoint`] if the file cannot be
    /// decoded or carries an unknown version, [`TrainingError::CheckpointIo`]
    /// for other I/O failures.
    pub fn load(&self, epoch: u32) -> TrainResult<Checkpoint> {
        self.load_path(&self.path_for(epoch))
    }

    /// Loads a checkpoint from an explicit path.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`CheckpointStore::load`].
    pub fn load_path(&self, path: &Path) -> TrainResult<Checkpoint> {
        let bytes = fs::read(path).map_err(|source| {
            if source.kind() == ErrorKind::NotFound {
                TrainingError::CheckpointNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                TrainingError::CheckpointIo {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        let checkpoint: Checkpoint =
            serde_json::from_slice(&bytes).map_err(|e| TrainingError::CorruptCheckpoint {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(TrainingError::CorruptCheckpoint {
                path: path.to_path_buf(),
                detail: format!(
                    "version {} is not the supported version {CHECKPOINT_VERSION}",
                    checkpoint.version
                ),
            });
        }
        Ok(checkpoint)
    }

    /// Highest epoch with a checkpoint on disk, if any.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::CheckpointIo`] if the directory cannot be
    /// read.
    pub fn latest_epoch(&self) -> TrainResult<Option<u32>> {
        let entries = fs::read_dir(&self.dir).map_err(|source| TrainingError::CheckpointIo {
            path: self.dir.clone(),
            source,
        })?;

        let mut latest = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(epoch) = name
                .strip_prefix("epoch_")
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|digits| digits.parse::<u32>().ok())
            else {
                continue;
            };
            latest = Some(latest.map_or(epoch, |prev: u32| prev.max(epoch)));
        }
        Ok(latest)
    }

    /// Loads the most recent checkpoint.
    ///
    /// # Errors
    ///
    /// [`TrainingError::CheckpointNotFound`] when the store is empty, plus
    /// the [`CheckpointStore::load`] taxonomy.
    pub fn load_latest(&self) -> TrainResult<Checkpoint> {
        match self.latest_epoch()? {
            Some(epoch) => self.load(epoch),
            None => Err(TrainingError::CheckpointNotFound {
                path: self.dir.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, CheckpointStore) {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let (_dir, store) = store();
        let checkpoint = Checkpoint::new(3, vec![1, 2, 3], Some(vec![4, 5]));
        let path = store.save(&checkpoint).unwrap();
        assert!(path.ends_with("epoch_3.json"));

        let loaded = store.load(3).unwrap();
        assert_eq!(loaded.epoch, 3);
        assert_eq!(loaded.model_state, vec![1, 2, 3]);
        assert_eq!(loaded.optimizer_state, Some(vec![4, 5]));
        assert_eq!(loaded.version, CHECKPOINT_VERSION);
    }

    #[test]
    fn test_final_epoch_omits_optimizer_state() {
        let (_dir, store) = store();
        store.save(&Checkpoint::new(99, vec![7], None)).unwrap();
        let loaded = store.load(99).unwrap();
        assert!(loaded.optimizer_state.is_none());
    }

    #[test]
    fn test_missing_checkpoint_is_not_found() {
        let (_dir, store) = store();
        let err = store.load(0).unwrap_err();
        assert!(matches!(err, TrainingError::CheckpointNotFound { .. }));
    }

    #[test]
    fn test_garbage_file_is_corrupt_not_missing() {
        let (_dir, store) = store();
        fs::write(store.path_for(0), b"not json at all").unwrap();
        let err = store.load(0).unwrap_err();
        assert!(matches!(err, TrainingError::CorruptCheckpoint { .. }));
    }

    #[test]
    fn test_version_mismatch_is_corrupt() {
        let (_dir, store) = store();
        let mut checkpoint = Checkpoint::new(0, vec![], None);
        checkpoint.version = CHECKPOINT_VERSION + 1;
        let payload = serde_json::to_vec(&checkpoint).unwrap();
        fs::write(store.path_for(0), payload).unwrap();

        let err = store.load(0).unwrap_err();
        assert!(matches!(err, TrainingError::CorruptCheckpoint { .. }));
    }

    #[test]
    fn test_distinct_epochs_do_not_collide() {
        let (_dir, store) = store();
        let a = store.save(&Checkpoint::new(0, vec![0], Some(vec![]))).unwrap();
        let b = store.save(&Checkpoint::new(1, vec![1], Some(vec![]))).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.load(0).unwrap().model_state, vec![0]);
        assert_eq!(store.load(1).unwrap().model_state, vec![1]);
    }

    #[test]
    fn test_latest_epoch_scan() {
        let (_dir, store) = store();
        assert_eq!(store.latest_epoch().unwrap(), None);
        for epoch in [0, 4, 2] {
            store.save(&Checkpoint::new(epoch, vec![], Some(vec![]))).unwrap();
        }
        // stray files are ignored by the scan
        fs::write(store.dir().join("notes.txt"), b"x").unwrap();
        assert_eq!(store.latest_epoch().unwrap(), Some(4));
        assert_eq!(store.load_latest().unwrap().epoch, 4);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let (_dir, store) = store();
        store.save(&Checkpoint::new(0, vec![1], None)).unwrap();
        let leftovers: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
