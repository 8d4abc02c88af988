//! Checkpoint files and bounded retention of numbered snapshots.
//!
//! One file per named state. The payload is a bincode-encoded
//! [`CheckpointFile`]; weights checkpoints carry the model's state dict plus
//! named auxiliary items, each encoded on its own so that a reader can pick
//! the items it needs.

use crate::error::{EngineError, Result};
use crate::model::{Model, TracedModel};
use crate::tensor::{ParamSet, StateDict};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use trainforge_core::persistence;

/// File extension of every checkpoint.
pub const CHECKPOINT_EXT: &str = "ckpt";

/// What a checkpoint file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveKind {
    /// The whole parameter set, structure included.
    Model,
    /// Weights plus auxiliary training state; what resume needs.
    #[default]
    Weights,
    /// The model's traced inference export.
    Traced,
}

impl SaveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Weights => "weights",
            Self::Traced => "traced",
        }
    }
}

/// Weights plus named auxiliary items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub model: StateDict,
    items: BTreeMap<String, Vec<u8>>,
}

impl CheckpointRecord {
    pub fn new(model: StateDict) -> Self {
        Self {
            model,
            items: BTreeMap::new(),
        }
    }

    pub fn insert_item<T: Serialize>(&mut self, name: &str, value: &T) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
        self.items.insert(name.to_string(), bytes);
        Ok(())
    }

    /// Decode item `name`, `None` when absent.
    pub fn item<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.items.get(name) {
            Some(bytes) => {
                let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Decode item `name`, failing when absent.
    pub fn require<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        self.item(name)?
            .ok_or_else(|| EngineError::invalid_config(format!("checkpoint has no item '{name}'")))
    }

    pub fn item_names(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }
}

/// On-disk payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CheckpointFile {
    Model(ParamSet),
    Weights(CheckpointRecord),
    Traced(TracedModel),
}

impl CheckpointFile {
    pub fn kind(&self) -> SaveKind {
        match self {
            Self::Model(_) => SaveKind::Model,
            Self::Weights(_) => SaveKind::Weights,
            Self::Traced(_) => SaveKind::Traced,
        }
    }
}

/// Encode and atomically write `file` to `path`.
pub fn write_checkpoint(path: &Path, file: &CheckpointFile) -> Result<()> {
    let bytes = bincode::serde::encode_to_vec(file, bincode::config::standard())?;
    persistence::atomic_write(path, &bytes)?;
    Ok(())
}

/// Read the checkpoint at `path`, which must hold a `expected` payload.
pub fn read_checkpoint(path: &Path, expected: SaveKind) -> Result<CheckpointFile> {
    let bytes = persistence::read_bytes(path)?;
    let (file, _): (CheckpointFile, usize) =
        bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
    if file.kind() != expected {
        return Err(EngineError::CheckpointKind {
            path: path.to_path_buf(),
            expected: expected.as_str().to_string(),
            found: file.kind().as_str().to_string(),
        });
    }
    Ok(file)
}

/// Build the payload for `kind` from `model`. `record` supplies the weights
/// payload and is ignored for the other kinds.
pub fn payload<M: Model + ?Sized>(kind: SaveKind, model: &M, record: CheckpointRecord) -> Result<CheckpointFile> {
    Ok(match kind {
        SaveKind::Model => CheckpointFile::Model(model.params().clone()),
        SaveKind::Weights => CheckpointFile::Weights(record),
        SaveKind::Traced => CheckpointFile::Traced(model.trace()?),
    })
}

/// Named checkpoints of one run directory.
///
/// `last` and `best` are overwritten in place. Numbered snapshots
/// (`<unit>_<n>.ckpt`) form a bounded series: once more than `max_numbered`
/// exist, the oldest by creation time is deleted.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    max_numbered: usize,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, max_numbered: usize) -> Self {
        Self {
            dir: dir.into(),
            max_numbered,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_numbered(&self) -> usize {
        self.max_numbered
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{CHECKPOINT_EXT}"))
    }

    pub fn last_path(&self) -> PathBuf {
        self.path("last")
    }

    pub fn best_path(&self) -> PathBuf {
        self.path("best")
    }

    pub fn numbered_path(&self, unit: &str, n: u64) -> PathBuf {
        self.path(&format!("{unit}_{n}"))
    }

    pub fn save_named(&self, name: &str, file: &CheckpointFile) -> Result<PathBuf> {
        let path = self.path(name);
        write_checkpoint(&path, file)?;
        tracing::debug!(path = %path.display(), "checkpoint saved");
        Ok(path)
    }

    /// Write a numbered snapshot, then enforce retention. Returns the pruned
    /// files.
    pub fn save_numbered(&self, unit: &str, n: u64, file: &CheckpointFile) -> Result<Vec<PathBuf>> {
        let path = self.numbered_path(unit, n);
        write_checkpoint(&path, file)?;
        tracing::debug!(path = %path.display(), "numbered checkpoint saved");
        self.prune()
    }

    /// Numbered snapshots, oldest first.
    pub fn numbered(&self) -> Result<Vec<PathBuf>> {
        let mut entries: Vec<(SystemTime, u64, PathBuf)> = Vec::new();
        for path in persistence::list_files(&self.dir, CHECKPOINT_EXT)? {
            if let Some(n) = snapshot_number(&path) {
                entries.push((persistence::created_time(&path)?, n, path));
            }
        }
        entries.sort();
        Ok(entries.into_iter().map(|(_, _, path)| path).collect())
    }

    /// Delete the oldest numbered snapshots while more than `max_numbered`
    /// exist.
    pub fn prune(&self) -> Result<Vec<PathBuf>> {
        let files = self.numbered()?;
        let excess = files.len().saturating_sub(self.max_numbered);
        let mut removed = Vec::with_capacity(excess);
        for path in files.into_iter().take(excess) {
            std::fs::remove_file(&path)?;
            tracing::debug!(path = %path.display(), "pruned checkpoint");
            removed.push(path);
        }
        Ok(removed)
    }
}

/// `n` for a `<unit>_<n>.ckpt` file name.
fn snapshot_number(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let (unit, n) = stem.rsplit_once('_')?;
    if unit.is_empty() {
        return None;
    }
    n.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;
    use pretty_assertions::assert_eq;

    fn record(value: f32) -> CheckpointRecord {
        let mut state = StateDict::new();
        state.insert("w".to_string(), Tensor::from_slice(&[value, -0.0, f32::MIN_POSITIVE]));
        CheckpointRecord::new(state)
    }

    #[test]
    fn test_record_items_roundtrip() {
        let mut rec = record(0.1);
        rec.insert_item("run_id", &"abc".to_string()).unwrap();
        rec.insert_item("steps", &42u64).unwrap();

        assert_eq!(rec.item::<String>("run_id").unwrap(), Some("abc".to_string()));
        assert_eq!(rec.require::<u64>("steps").unwrap(), 42);
        assert_eq!(rec.item::<u64>("missing").unwrap(), None);
        assert!(rec.require::<u64>("missing").is_err());
        assert_eq!(rec.item_names().collect::<Vec<_>>(), vec!["run_id", "steps"]);
    }

    #[test]
    fn test_write_read_is_bit_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.ckpt");
        let file = CheckpointFile::Weights(record(0.1));
        write_checkpoint(&path, &file).unwrap();

        let loaded = read_checkpoint(&path, SaveKind::Weights).unwrap();
        assert_eq!(loaded, file);
    }

    #[test]
    fn test_model_payload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.ckpt");
        let mut params = ParamSet::new();
        params
            .insert("w", Tensor::from_slice(&[0.25, -1.5]))
            .insert_frozen("b", Tensor::scalar(3.0));
        let file = CheckpointFile::Model(params.clone());
        write_checkpoint(&path, &file).unwrap();

        let loaded = read_checkpoint(&path, SaveKind::Model).unwrap();
        assert_eq!(loaded, file);
        assert_eq!(loaded, CheckpointFile::Model(params));
    }

    #[test]
    fn test_missing_and_wrong_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.ckpt");
        assert!(matches!(
            read_checkpoint(&path, SaveKind::Weights),
            Err(EngineError::CheckpointNotFound(p)) if p == path
        ));

        let traced = CheckpointFile::Traced(TracedModel {
            format: "test".into(),
            graph: vec![1, 2, 3],
        });
        write_checkpoint(&path, &traced).unwrap();
        assert!(matches!(
            read_checkpoint(&path, SaveKind::Weights),
            Err(EngineError::CheckpointKind { .. })
        ));
    }

    #[test]
    fn test_retention_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), 3);
        let file = CheckpointFile::Weights(record(1.0));

        store.save_named("last", &file).unwrap();
        let mut pruned = Vec::new();
        for n in 1..=4 {
            pruned.extend(store.save_numbered("epoch", n, &file).unwrap());
        }

        assert_eq!(pruned, vec![store.numbered_path("epoch", 1)]);
        assert_eq!(
            store.numbered().unwrap(),
            vec![
                store.numbered_path("epoch", 2),
                store.numbered_path("epoch", 3),
                store.numbered_path("epoch", 4),
            ]
        );
        assert!(store.last_path().exists());
    }

    #[test]
    fn test_snapshot_number() {
        assert_eq!(snapshot_number(Path::new("/x/step_120.ckpt")), Some(120));
        assert_eq!(snapshot_number(Path::new("/x/last.ckpt")), None);
        assert_eq!(snapshot_number(Path::new("/x/best.ckpt")), None);
        assert_eq!(snapshot_number(Path::new("/x/_3.ckpt")), None);
    }
}
