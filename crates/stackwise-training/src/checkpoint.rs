//! Checkpoint persistence and the exit-save guard.
//!
//! A store is addressed by one location, `<dir>/<name>`. Each save writes a
//! step-tagged snapshot `<name>-<step>.json` and rewrites the index
//! `<name>.index.json`, whose last record is the canonical "latest"
//! checkpoint. The index keeps a SHA-256 digest per snapshot so corrupt files
//! are caught on restore.

use crate::config::TrainingConfig;
use crate::error::{TrainingError, TrainingResult};
use crate::model::{StageModel, Tensor};
use crate::optimizer::{OptimizerBank, OptimizerState};
use crate::stage::{SchedulerState, StageIndex};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Everything needed to resume training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub global_step: u64,
    pub state: SchedulerState,
    /// Trainable parameters, one list per stage.
    pub parameters: Vec<Vec<Tensor>>,
    pub optimizers: Vec<OptimizerState>,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn capture<M: StageModel + ?Sized>(
        global_step: u64,
        state: SchedulerState,
        model: &M,
        optimizers: &OptimizerBank,
    ) -> Self {
        let parameters = StageIndex::all(model.stage_count()).map(|s| model.parameters(s).to_vec()).collect();

        Self { global_step, state, parameters, optimizers: optimizers.states(), created_at: Utc::now() }
    }

    /// Copy parameters and optimizer state into a freshly built model and bank.
    pub fn apply<M: StageModel + ?Sized>(self, model: &mut M, optimizers: &mut OptimizerBank) -> Result<(), String> {
        if self.parameters.len() != model.stage_count() {
            return Err(format!(
                "checkpoint has {} stages, model has {}",
                self.parameters.len(),
                model.stage_count()
            ));
        }

        for (stage, saved) in StageIndex::all(model.stage_count()).zip(&self.parameters) {
            let params = model.parameters_mut(stage);
            if params.len() != saved.len() || params.iter().zip(saved).any(|(p, s)| p.shape() != s.shape()) {
                return Err(format!("checkpoint parameters for stage {stage} do not match the model"));
            }
            for (param, value) in params.iter_mut().zip(saved) {
                param.assign(value);
            }
        }

        optimizers.restore_states(self.optimizers)
    }
}

/// Anything whose state can be written out as a [`Snapshot`].
pub trait Checkpointable {
    fn snapshot(&self) -> Snapshot;

    /// Global step the snapshot would be tagged with.
    fn checkpoint_step(&self) -> u64;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub step: u64,
    pub file: String,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckpointIndex {
    /// Oldest first; the last record is the latest checkpoint.
    records: Vec<CheckpointRecord>,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    name: String,
    max_to_keep: usize,
}

impl CheckpointStore {
    /// `location` is `<dir>/<name>`; files are written next to it.
    #[must_use]
    pub fn new(location: &Path, max_to_keep: usize) -> Self {
        let dir = location.parent().map(Path::to_path_buf).unwrap_or_default();
        let name = location.file_name().map_or_else(|| "checkpoint".to_string(), |n| n.to_string_lossy().to_string());
        Self { dir, name, max_to_keep: max_to_keep.max(1) }
    }

    #[must_use]
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(&config.checkpoint_path(), config.max_to_keep)
    }

    #[must_use]
    pub fn location(&self) -> PathBuf {
        self.dir.join(&self.name)
    }

    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.dir.join(format!("{}.index.json", self.name))
    }

    #[must_use]
    pub fn snapshot_path(&self, record: &CheckpointRecord) -> PathBuf {
        self.dir.join(&record.file)
    }

    fn write_error(path: &Path, source: std::io::Error) -> TrainingError {
        TrainingError::CheckpointWrite { path: path.to_path_buf(), source }
    }

    /// Write to a sibling temp file and rename over `path`.
    fn write_atomic(path: &Path, bytes: &[u8]) -> TrainingResult<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(|e| Self::write_error(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| Self::write_error(path, e))
    }

    /// The index to extend on save. A missing index starts empty; a corrupt
    /// one is replaced, since the snapshot being written supersedes it.
    fn read_index(&self) -> TrainingResult<CheckpointIndex> {
        let path = self.index_path();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(CheckpointIndex::default()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(index) => Ok(index),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Checkpoint index is corrupt, starting a new one");
                Ok(CheckpointIndex::default())
            }
        }
    }

    /// Persist `snapshot` tagged with its global step and make it the latest.
    pub fn save(&self, snapshot: &Snapshot) -> TrainingResult<CheckpointRecord> {
        std::fs::create_dir_all(&self.dir).map_err(|e| Self::write_error(&self.dir, e))?;

        let bytes = serde_json::to_vec(snapshot)?;
        let file = format!("{}-{}.json", self.name, snapshot.global_step);
        let path = self.dir.join(&file);
        Self::write_atomic(&path, &bytes)?;

        let record = CheckpointRecord {
            step: snapshot.global_step,
            file,
            sha256: hex::encode(Sha256::digest(&bytes)),
            created_at: snapshot.created_at,
        };

        let mut index = self.read_index()?;
        index.records.retain(|r| r.step != record.step);
        index.records.push(record.clone());

        let excess = index.records.len().saturating_sub(self.max_to_keep);
        let stale: Vec<CheckpointRecord> = index.records.drain(..excess).collect();

        // Old snapshots go only once the index no longer points at them.
        Self::write_atomic(&self.index_path(), &serde_json::to_vec_pretty(&index)?)?;
        for stale in stale {
            match std::fs::remove_file(self.snapshot_path(&stale)) {
                Ok(()) => debug!(step = stale.step, "Pruned old checkpoint"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(step = stale.step, error = %e, "Failed to prune old checkpoint"),
            }
        }
        info!(step = record.step, path = %path.display(), "Saved checkpoint");
        Ok(record)
    }

    /// The latest checkpoint record, if an index exists.
    pub fn latest(&self) -> TrainingResult<Option<CheckpointRecord>> {
        let bytes = match std::fs::read(self.index_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let index: CheckpointIndex = serde_json::from_slice(&bytes)?;
        Ok(index.records.last().cloned())
    }

    /// Load the latest snapshot, verifying its digest.
    pub fn restore(&self) -> TrainingResult<Snapshot> {
        let location = self.location();
        let record = self
            .latest()
            .map_err(|e| TrainingError::restore(&location, format!("unreadable checkpoint index: {e}")))?
            .ok_or_else(|| TrainingError::restore(&location, "no checkpoint found"))?;

        let path = self.snapshot_path(&record);
        let bytes = std::fs::read(&path)
            .map_err(|e| TrainingError::restore(&path, format!("failed to read snapshot: {e}")))?;

        if hex::encode(Sha256::digest(&bytes)) != record.sha256 {
            return Err(TrainingError::restore(&path, "snapshot digest mismatch"));
        }

        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| TrainingError::restore(&path, format!("failed to parse snapshot: {e}")))?;
        info!(step = snapshot.global_step, path = %path.display(), "Restored checkpoint");
        Ok(snapshot)
    }
}

/// Scoped guard that saves a final checkpoint when the training scope exits.
///
/// [`FinalSave::finish`] performs the save and returns its result. If the
/// guard is dropped without `finish` (a panic unwinding through the loop), the
/// save happens in `Drop` and a failure can only be logged.
pub struct FinalSave<'a, T: Checkpointable> {
    store: &'a CheckpointStore,
    target: &'a mut T,
    finished: bool,
}

impl<'a, T: Checkpointable> FinalSave<'a, T> {
    pub fn new(store: &'a CheckpointStore, target: &'a mut T) -> Self {
        Self { store, target, finished: false }
    }

    pub fn target(&mut self) -> &mut T {
        &mut *self.target
    }

    pub fn finish(mut self) -> TrainingResult<CheckpointRecord> {
        self.finished = true;
        self.store.save(&self.target.snapshot())
    }
}

impl<T: Checkpointable> Drop for FinalSave<'_, T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let step = self.target.checkpoint_step();
        warn!(step, "Training scope exited abnormally, saving final checkpoint");
        if let Err(e) = self.store.save(&self.target.snapshot()) {
            error!(step, error = %e, "Failed to save final checkpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;
    use tempfile::TempDir;

    fn snapshot(step: u64) -> Snapshot {
        Snapshot {
            global_step: step,
            state: SchedulerState::Stage(StageIndex::FIRST),
            parameters: vec![vec![Tensor::from_elem(IxDyn(&[2]), step as f32)]],
            optimizers: vec![OptimizerState { step_count: step, ..Default::default() }],
            created_at: Utc::now(),
        }
    }

    fn store(temp: &TempDir, max_to_keep: usize) -> CheckpointStore {
        CheckpointStore::new(&temp.path().join("logs").join("model.ckpt"), max_to_keep)
    }

    struct Counter {
        step: u64,
    }

    impl Checkpointable for Counter {
        fn snapshot(&self) -> Snapshot {
            snapshot(self.step)
        }

        fn checkpoint_step(&self) -> u64 {
            self.step
        }
    }

    #[test]
    fn test_save_then_restore_latest() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp, 5);

        store.save(&snapshot(0)).unwrap();
        store.save(&snapshot(200)).unwrap();

        let restored = store.restore().unwrap();
        assert_eq!(restored.global_step, 200);
        assert_eq!(restored.optimizers[0].step_count, 200);
    }

    #[test]
    fn test_restore_without_checkpoint_fails() {
        let temp = TempDir::new().unwrap();
        let err = store(&temp, 5).restore().unwrap_err();
        assert!(matches!(err, TrainingError::RestoreFailure { .. }));
    }

    #[test]
    fn test_restore_detects_corruption() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp, 5);
        let record = store.save(&snapshot(7)).unwrap();

        std::fs::write(store.snapshot_path(&record), b"{\"global_step\": 7}").unwrap();

        let err = store.restore().unwrap_err();
        assert!(matches!(err, TrainingError::RestoreFailure { .. }));
    }

    #[test]
    fn test_save_prunes_beyond_max_to_keep() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp, 2);

        let first = store.save(&snapshot(0)).unwrap();
        store.save(&snapshot(200)).unwrap();
        store.save(&snapshot(400)).unwrap();

        assert!(!store.snapshot_path(&first).exists());
        assert_eq!(store.latest().unwrap().unwrap().step, 400);
    }

    #[test]
    fn test_save_replaces_corrupt_index() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp, 5);
        store.save(&snapshot(10)).unwrap();
        std::fs::write(store.index_path(), b"not json").unwrap();

        store.save(&snapshot(20)).unwrap();

        assert_eq!(store.latest().unwrap().unwrap().step, 20);
        assert_eq!(store.restore().unwrap().global_step, 20);
    }

    #[test]
    fn test_failed_index_write_keeps_previous_snapshots() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp, 1);
        let first = store.save(&snapshot(100)).unwrap();
        std::fs::create_dir(store.index_path().with_extension("tmp")).unwrap();

        assert!(matches!(store.save(&snapshot(200)), Err(TrainingError::CheckpointWrite { .. })));

        assert!(store.snapshot_path(&first).exists());
        assert_eq!(store.latest().unwrap().unwrap().step, 100);
        assert_eq!(store.restore().unwrap().global_step, 100);
    }

    #[test]
    fn test_resaving_a_step_replaces_it() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp, 5);

        store.save(&snapshot(5)).unwrap();
        store.save(&snapshot(5)).unwrap();

        let bytes = std::fs::read(store.index_path()).unwrap();
        let index: CheckpointIndex = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(index.records.len(), 1);
    }

    #[test]
    fn test_save_into_unwritable_location_surfaces() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, b"file, not a directory").unwrap();
        let store = CheckpointStore::new(&blocker.join("model.ckpt"), 5);

        assert!(matches!(store.save(&snapshot(1)), Err(TrainingError::CheckpointWrite { .. })));
    }

    #[test]
    fn test_finish_saves_once() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp, 5);
        let mut counter = Counter { step: 3 };

        let mut guard = FinalSave::new(&store, &mut counter);
        guard.target().step = 9;
        let record = guard.finish().unwrap();

        assert_eq!(record.step, 9);
        assert_eq!(store.latest().unwrap().unwrap().step, 9);
    }

    #[test]
    fn test_drop_saves_when_scope_panics() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp, 5);
        let mut counter = Counter { step: 11 };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = FinalSave::new(&store, &mut counter);
            panic!("step blew up");
        }));

        assert!(result.is_err());
        assert_eq!(store.latest().unwrap().unwrap().step, 11);
    }

    #[test]
    fn test_location_splits_dir_and_name() {
        let store = CheckpointStore::new(Path::new("data/logs/autoencoder_model.ckpt"), 5);
        assert_eq!(store.location(), PathBuf::from("data/logs/autoencoder_model.ckpt"));
        assert_eq!(store.index_path(), PathBuf::from("data/logs/autoencoder_model.ckpt.index.json"));
    }
}
