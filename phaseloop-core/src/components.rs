//! Collaborator interfaces driven by the task orchestrator.
//!
//! Models, losses, optimizers, meters, datasets and the optional
//! mixed-precision / batch-norm-sync backends are external to this crate. The
//! orchestrator only binds them together, so each is a trait here. Fallible
//! methods return `anyhow::Result`; the orchestrator wraps those failures in
//! [`TaskError::Collaborator`](crate::error::TaskError::Collaborator).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{Backend, ProcessGroup, Sample};

/// Component whose state is captured in checkpoints.
pub trait Stateful {
    /// Serializable snapshot of the component state.
    fn get_state(&self) -> anyhow::Result<Value>;

    /// Restore a snapshot produced by [`Stateful::get_state`].
    fn set_state(&mut self, state: &Value) -> anyhow::Result<()>;
}

/// Behavior shared by models and losses.
pub trait Module<B: Backend>: Send {
    /// Switch between training and evaluation behavior.
    fn train(&mut self, mode: bool);

    /// Non-learnable tensors (running statistics and the like).
    fn buffers_mut(&mut self) -> Vec<&mut B::Tensor> {
        Vec::new()
    }

    /// Learnable parameters.
    fn parameters(&self) -> Vec<B::Parameter> {
        Vec::new()
    }

    /// Place the module on the accelerator (`true`) or the host (`false`).
    fn to_device(&mut self, accelerator: bool) -> anyhow::Result<()>;
}

/// A trainable model.
pub trait Model<B: Backend>: Module<B> + Stateful {
    fn forward(&mut self, input: &B::Tensor) -> anyhow::Result<B::Tensor>;
}

/// A loss function. Losses may hold learned parameters and state, but neither
/// is required.
pub trait Loss<B: Backend>: Module<B> {
    fn forward(&mut self, output: &B::Tensor, target: &B::Tensor) -> anyhow::Result<B::Tensor>;

    /// Whether the loss holds learnable parameters and therefore needs
    /// gradient synchronization of its own.
    fn has_learned_parameters(&self) -> bool {
        false
    }

    /// Whether the loss participates in checkpointing.
    fn supports_state(&self) -> bool {
        false
    }

    fn get_state(&self) -> anyhow::Result<Value> {
        Ok(Value::Object(Default::default()))
    }

    fn set_state(&mut self, _state: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Optimizer wrapper with progress-driven schedules.
pub trait Optimizer<B: Backend>: Stateful + Send {
    /// Bind the optimizer to the (already device-placed) model and loss.
    fn init(&mut self, model: &mut dyn Model<B>, loss: &mut dyn Loss<B>) -> anyhow::Result<()>;

    fn zero_grad(&mut self) -> anyhow::Result<()>;

    /// Compute gradients of `loss` with respect to the bound parameters.
    fn backward(&mut self, loss: &B::Tensor) -> anyhow::Result<()>;

    /// Apply one parameter update.
    fn step(&mut self) -> anyhow::Result<()>;

    /// Per-step schedule update. `progress` is in `[0, 1)`.
    fn update_schedule_on_step(&mut self, progress: f64) -> anyhow::Result<()>;

    /// Per-epoch schedule update. `progress` is in `[0, 1)`.
    fn update_schedule_on_epoch(&mut self, progress: f64) -> anyhow::Result<()>;
}

/// Stateful metric accumulator, reset at every phase start.
pub trait Meter<B: Backend>: Stateful + Send {
    fn name(&self) -> &str;

    fn reset(&mut self);

    /// Accumulate one batch. Tensors are detached host copies.
    fn update(&mut self, output: &B::Tensor, target: &B::Tensor, is_train: bool) -> anyhow::Result<()>;

    /// Merge accumulators across processes.
    fn sync_state(&mut self, group: &dyn ProcessGroup<B>) -> anyhow::Result<()>;

    /// Current metric value, for reporting.
    fn value(&self) -> Value;
}

/// Start method for data-loading worker processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MpContext {
    #[default]
    Spawn,
    Fork,
    Forkserver,
}

/// Options used to build a [`DataLoader`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderOptions {
    /// Worker count. `None` lets the dataset choose.
    pub num_workers: Option<usize>,
    pub pin_memory: bool,
    pub mp_context: Option<MpContext>,
    /// 0 for test phases, the train phase index for train phases. Lets a
    /// dataset vary its sampling per phase.
    pub current_phase_id: usize,
}

/// Iterator over the batches of one phase.
pub type BatchIter<B> = Box<dyn Iterator<Item = anyhow::Result<Sample<<B as Backend>::Tensor>>> + Send>;

/// Source of samples for one phase type.
pub trait Dataset<B: Backend>: Send {
    /// Build a data loader over this dataset.
    fn iterator(&self, options: &LoaderOptions) -> anyhow::Result<Box<dyn DataLoader<B>>>;

    /// Batch size seen by this process.
    fn batchsize_per_replica(&self) -> usize;

    /// Batch size summed over all processes.
    fn global_batchsize(&self) -> usize;

    /// Train phases per epoch over this dataset.
    fn phases_per_epoch(&self) -> f64 {
        1.0
    }
}

/// A built loader: knows its batch count and its effective options and can
/// produce fresh iterators.
pub trait DataLoader<B: Backend>: Send {
    /// Number of batches per pass.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Options the loader was built with, with defaults resolved.
    fn options(&self) -> &LoaderOptions;

    fn iter(&self) -> anyhow::Result<BatchIter<B>>;
}

/// Whole-batch transform applied before the training forward pass (data
/// mixing augmentation).
pub trait BatchTransform<B: Backend>: Send {
    fn apply(&mut self, sample: Sample<B::Tensor>) -> anyhow::Result<Sample<B::Tensor>>;
}

/// Arguments forwarded to the mixed-precision backend.
pub type AmpArgs = serde_json::Map<String, Value>;

/// Mixed-precision backend (loss scaling and its checkpointable state).
pub trait MixedPrecision<B: Backend>: Send {
    /// Patch the model and optimizer for mixed precision. Must run before any
    /// checkpoint is restored, since the backend state is itself checkpointed.
    fn initialize(
        &mut self,
        model: &mut dyn Model<B>,
        optimizer: &mut dyn Optimizer<B>,
        args: &AmpArgs,
    ) -> anyhow::Result<()>;

    /// Backward pass through the scaled loss.
    fn scaled_backward(&mut self, loss: &B::Tensor, optimizer: &mut dyn Optimizer<B>) -> anyhow::Result<()>;

    fn state_dict(&self) -> anyhow::Result<Value>;

    fn load_state_dict(&mut self, state: &Value) -> anyhow::Result<()>;
}

/// Third-party synchronized batch-norm conversion.
pub trait SyncBatchNorm<B: Backend>: Send {
    fn convert(&self, model: &mut dyn Model<B>) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mp_context_serde() {
        let ctx: MpContext = serde_json::from_str("\"forkserver\"").unwrap();
        assert_eq!(ctx, MpContext::Forkserver);
        assert_eq!(serde_json::to_string(&MpContext::Spawn).unwrap(), "\"spawn\"");
        assert_eq!(MpContext::default(), MpContext::Spawn);
    }

    #[test]
    fn test_loader_options_default() {
        let opts = LoaderOptions::default();
        assert_eq!(opts.num_workers, None);
        assert!(!opts.pin_memory);
        assert_eq!(opts.mp_context, None);
        assert_eq!(opts.current_phase_id, 0);
    }
}
