//! Checkpoint records and their on-disk form.
//!
//! [`TaskState`] is the serializable snapshot of a task. It is produced by
//! `Task::get_state` and applied by `Task::set_state`. A [`CheckpointFile`]
//! wraps it with a format version, a timestamp and optionally the
//! configuration the task was built from.
//!
//! Files are written atomically (write to `.tmp`, then rename).

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::backend::{Backend, ProcessGroup};
use crate::error::{CheckpointError, Result};

/// File name used when a checkpoint location is a directory.
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Current on-disk format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Complete task state needed to resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub train: bool,
    pub base_model: Value,
    pub meters: Vec<Value>,
    pub optimizer: Value,
    pub phase_idx: i64,
    pub train_phase_idx: i64,
    pub num_updates: u64,
    pub losses: Vec<f64>,
    /// Hook states keyed by hook name.
    #[serde(default)]
    pub hooks: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amp: Option<Value>,
}

/// A checkpoint as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub task_state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl CheckpointFile {
    pub fn new(task_state: TaskState, config: Option<Value>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            saved_at: Utc::now(),
            task_state,
            config,
        }
    }
}

/// Resolve a checkpoint location: a file, or a directory holding
/// [`CHECKPOINT_FILE`].
pub fn resolve_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(CHECKPOINT_FILE)
    } else {
        path.to_path_buf()
    }
}

/// Write `file` to `dir/checkpoint.json`, creating `dir` if needed.
pub fn save_checkpoint(dir: &Path, file: &CheckpointFile) -> std::result::Result<PathBuf, CheckpointError> {
    let path = dir.join(CHECKPOINT_FILE);
    atomic_write_json(&path, file).map_err(|source| CheckpointError::Io {
        path: path.clone(),
        source,
    })?;
    info!(
        path = %path.display(),
        phase_idx = file.task_state.phase_idx,
        num_updates = file.task_state.num_updates,
        "Saved checkpoint"
    );
    Ok(path)
}

/// Read a checkpoint from a file or a checkpoint directory.
pub fn load_checkpoint(path: &Path) -> std::result::Result<CheckpointFile, CheckpointError> {
    let path = resolve_path(path);
    if !path.exists() {
        return Err(CheckpointError::NotFound { path });
    }
    let data = std::fs::read_to_string(&path).map_err(|source| CheckpointError::Io {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| CheckpointError::Parse { path, source })
}

/// Load a checkpoint on the primary process and broadcast its task state to
/// every other process. All processes must call this together.
pub fn load_and_broadcast<B: Backend>(path: &Path, group: &dyn ProcessGroup<B>) -> Result<TaskState> {
    let local = if group.is_primary() {
        let file = load_checkpoint(path)?;
        info!(path = %path.display(), version = file.version, "Loaded checkpoint");
        Some(serde_json::to_value(file.task_state).map_err(|e| {
            CheckpointError::RestoreFailed {
                message: e.to_string(),
            }
        })?)
    } else {
        None
    };

    let received = group
        .broadcast_state(local, 0)?
        .ok_or_else(|| CheckpointError::RestoreFailed {
            message: "no checkpoint state received from the primary process".to_string(),
        })?;
    let state = serde_json::from_value(received).map_err(|e| CheckpointError::RestoreFailed {
        message: e.to_string(),
    })?;
    Ok(state)
}

fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalGroup;
    use crate::cpu::CpuBackend;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_state() -> TaskState {
        TaskState {
            train: true,
            base_model: json!({"weight": [[0.5, -0.25]], "bias": [0.1]}),
            meters: vec![json!({"sum": 1.5, "count": 3})],
            optimizer: json!({"lr": 0.1, "steps": 4}),
            phase_idx: 3,
            train_phase_idx: 1,
            num_updates: 128,
            losses: vec![0.5, 0.25],
            hooks: BTreeMap::from([("logging".to_string(), json!({}))]),
            loss: None,
            amp: Some(json!({"scale": 1024.0})),
        }
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let file = CheckpointFile::new(sample_state(), Some(json!({"num_epochs": 2})));

        let path = save_checkpoint(dir.path(), &file).unwrap();
        assert_eq!(path, dir.path().join(CHECKPOINT_FILE));
        assert!(!path.with_extension("tmp").exists());

        let from_file = load_checkpoint(&path).unwrap();
        assert_eq!(from_file, file);

        let from_dir = load_checkpoint(dir.path()).unwrap();
        assert_eq!(from_dir.task_state, file.task_state);
    }

    #[test]
    fn test_save_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("runs").join("a");
        let file = CheckpointFile::new(sample_state(), None);
        save_checkpoint(&nested, &file).unwrap();
        assert!(nested.join(CHECKPOINT_FILE).exists());
    }

    #[test]
    fn test_load_missing_checkpoint() {
        let dir = TempDir::new().unwrap();
        let err = load_checkpoint(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound { .. }));
    }

    #[test]
    fn test_load_corrupt_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        std::fs::write(&path, "{not json").unwrap();
        let err = load_checkpoint(&path).unwrap_err();
        assert!(matches!(err, CheckpointError::Parse { .. }));
    }

    #[test]
    fn test_optional_fields_default() {
        let mut value = serde_json::to_value(sample_state()).unwrap();
        let obj = value.as_object_mut().unwrap();
        obj.remove("hooks");
        obj.remove("amp");
        let state: TaskState = serde_json::from_value(value).unwrap();
        assert!(state.hooks.is_empty());
        assert!(state.amp.is_none());
        assert!(state.loss.is_none());
    }

    #[test]
    fn test_load_and_broadcast_single_process() {
        let dir = TempDir::new().unwrap();
        let file = CheckpointFile::new(sample_state(), None);
        save_checkpoint(dir.path(), &file).unwrap();

        let group: &dyn ProcessGroup<CpuBackend> = &LocalGroup;
        let state = load_and_broadcast(dir.path(), group).unwrap();
        assert_eq!(state, sample_state());
    }
}
