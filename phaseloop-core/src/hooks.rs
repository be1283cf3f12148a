//! Lifecycle hooks.
//!
//! Hooks observe a [`Task`] at fixed points of its lifecycle and get read
//! access to all of it, including the last batch. Callbacks take `&self`;
//! hooks that keep state across callbacks use interior mutability.
//!
//! Hook names are identities: they key hook state inside checkpoints and
//! must be unique within a task.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde_json::{Value, json};
use tracing::{debug, info};

use crate::backend::Backend;
use crate::checkpoint::{self, CheckpointFile};
use crate::task::Task;

/// Observer of task lifecycle events.
pub trait Hook<B: Backend>: Send + Sync {
    /// Stable, unique identity of the hook.
    fn name(&self) -> &str;

    fn on_start(&self, _task: &Task<B>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_phase_start(&self, _task: &Task<B>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_phase_end(&self, _task: &Task<B>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_end(&self, _task: &Task<B>) -> anyhow::Result<()> {
        Ok(())
    }

    fn get_state(&self) -> anyhow::Result<Value> {
        Ok(json!({}))
    }

    fn set_state(&mut self, _state: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logs a summary of every phase.
#[derive(Debug, Default, Clone)]
pub struct LoggingHook;

impl LoggingHook {
    pub const NAME: &'static str = "logging";
}

impl<B: Backend> Hook<B> for LoggingHook {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_start(&self, task: &Task<B>) -> anyhow::Result<()> {
        info!(
            backend = B::name(),
            phases = task.phases().len(),
            num_epochs = task.num_epochs(),
            test_only = task.test_only(),
            "Starting training"
        );
        Ok(())
    }

    fn on_phase_start(&self, task: &Task<B>) -> anyhow::Result<()> {
        debug!(
            phase_idx = task.phase_idx(),
            phase_type = %task.phase_type(),
            "Phase started"
        );
        Ok(())
    }

    fn on_phase_end(&self, task: &Task<B>) -> anyhow::Result<()> {
        let meters = Value::Object(
            task.meters()
                .iter()
                .map(|meter| (meter.name().to_string(), meter.value()))
                .collect(),
        );
        let throughput = task.perf_log().last().map(|sample| sample.im_per_sec);
        info!(
            phase_idx = task.phase_idx(),
            phase_type = %task.phase_type(),
            batches = task.losses().len(),
            avg_loss = task.average_loss(),
            meters = %meters,
            im_per_sec = throughput,
            "Phase complete"
        );
        Ok(())
    }

    fn on_end(&self, task: &Task<B>) -> anyhow::Result<()> {
        info!(num_updates = task.num_updates(), "Training finished");
        Ok(())
    }
}

/// Writes a checkpoint every `period` phases and after the last phase.
///
/// Only the primary process writes. The path of the last written checkpoint
/// is part of the hook state.
#[derive(Debug)]
pub struct CheckpointHook {
    dir: PathBuf,
    period: usize,
    last_saved: Mutex<Option<PathBuf>>,
}

impl CheckpointHook {
    pub const NAME: &'static str = "checkpoint";

    pub fn new(dir: impl Into<PathBuf>, period: usize) -> Self {
        Self {
            dir: dir.into(),
            period: period.max(1),
            last_saved: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn last_saved(&self) -> Option<PathBuf> {
        self.last_saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn should_save<B: Backend>(&self, task: &Task<B>) -> bool {
        let completed = task.phase_idx() + 1;
        task.done_training() || (completed > 0 && completed as usize % self.period == 0)
    }
}

impl<B: Backend> Hook<B> for CheckpointHook {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_phase_end(&self, task: &Task<B>) -> anyhow::Result<()> {
        if !task.is_primary() || !self.should_save(task) {
            return Ok(());
        }
        let file = CheckpointFile::new(task.get_state()?, task.config().cloned());
        let path = checkpoint::save_checkpoint(&self.dir, &file)?;
        *self.last_saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(path);
        Ok(())
    }

    fn get_state(&self) -> anyhow::Result<Value> {
        Ok(json!({ "last_saved": self.last_saved() }))
    }

    fn set_state(&mut self, state: &Value) -> anyhow::Result<()> {
        let restored = state
            .get("last_saved")
            .and_then(Value::as_str)
            .map(PathBuf::from);
        *self.last_saved.get_mut().unwrap_or_else(PoisonError::into_inner) = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBackend;

    #[test]
    fn test_checkpoint_hook_state_roundtrip() {
        let mut hook = CheckpointHook::new("/tmp/run", 2);
        assert_eq!(
            Hook::<CpuBackend>::get_state(&hook).unwrap(),
            json!({"last_saved": null})
        );

        Hook::<CpuBackend>::set_state(&mut hook, &json!({"last_saved": "/tmp/run/checkpoint.json"}))
            .unwrap();
        assert_eq!(
            hook.last_saved(),
            Some(PathBuf::from("/tmp/run/checkpoint.json"))
        );
        assert_eq!(
            Hook::<CpuBackend>::get_state(&hook).unwrap(),
            json!({"last_saved": "/tmp/run/checkpoint.json"})
        );
    }

    #[test]
    fn test_checkpoint_hook_period_is_at_least_one() {
        let hook = CheckpointHook::new("/tmp/run", 0);
        assert_eq!(hook.period, 1);
        assert_eq!(hook.dir(), Path::new("/tmp/run"));
    }

    #[test]
    fn test_hook_names() {
        assert_eq!(Hook::<CpuBackend>::name(&LoggingHook), "logging");
        assert_eq!(
            Hook::<CpuBackend>::name(&CheckpointHook::new("/tmp", 1)),
            "checkpoint"
        );
    }
}
