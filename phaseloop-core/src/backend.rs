//! Tensor backend and cross-process collectives.
//!
//! The orchestrator never touches tensor data directly. Everything it needs
//! from the numeric framework goes through [`Backend`] (device placement,
//! detaching, scalar extraction, gradient scopes) and everything it needs from
//! the process group goes through [`ProcessGroup`].

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::components::{Model, Module};
use crate::replication::ReplicaOptions;

/// Key of the model input in a [`Sample`].
pub const INPUT_KEY: &str = "input";
/// Key of the training target in a [`Sample`].
pub const TARGET_KEY: &str = "target";

/// One batch as produced by a data loader: a mapping from names to tensors.
/// Must contain at least [`INPUT_KEY`] and [`TARGET_KEY`].
pub type Sample<T> = BTreeMap<String, T>;

/// A numeric framework the orchestrator can drive.
///
/// All functions are associated (no receiver): a backend is a type-level
/// choice, the way `burn` and `candle` select devices and tensor kinds.
pub trait Backend: Sized + Send + Sync + 'static {
    /// Tensor type flowing through models, losses and meters.
    type Tensor: Clone + fmt::Debug + Send + Sync;
    /// Handle to a learnable parameter, shared between a module and the
    /// optimizer that updates it.
    type Parameter: Clone + fmt::Debug + Send + Sync;

    /// Short backend name for logs.
    fn name() -> &'static str;

    /// Whether an accelerator device can be used at all.
    fn accelerator_available() -> bool;

    /// Number of accelerator devices visible to this process.
    fn device_count() -> usize;

    /// Copy a tensor to the accelerator.
    fn to_device(tensor: &Self::Tensor, non_blocking: bool) -> anyhow::Result<Self::Tensor>;

    /// A host-side copy of `tensor` that no longer participates in gradient
    /// tracking.
    fn detach(tensor: &Self::Tensor) -> Self::Tensor;

    /// Extract the single value of a one-element tensor.
    fn scalar(tensor: &Self::Tensor) -> anyhow::Result<f64>;

    /// Size of the leading (batch) dimension.
    fn leading_dim(tensor: &Self::Tensor) -> usize;

    /// Run `f` with gradient tracking enabled or disabled.
    fn with_grad<R>(enabled: bool, f: impl FnOnce() -> R) -> R {
        let _ = enabled;
        f()
    }

    /// Framework-native synchronized batch-norm conversion. Identity unless
    /// the backend has batch-norm layers to swap.
    fn convert_sync_batchnorm(model: &mut dyn Model<Self>) -> anyhow::Result<()> {
        let _ = model;
        Ok(())
    }
}

/// Collective operations across the processes of one training job.
///
/// Every process must issue the same collectives in the same order; a process
/// that diverges leaves its peers blocked.
pub trait ProcessGroup<B: Backend>: Send + Sync {
    /// Rank of this process, 0 being the primary.
    fn rank(&self) -> usize;

    /// Number of participating processes.
    fn world_size(&self) -> usize;

    /// Whether this is a multi-process run.
    fn is_distributed(&self) -> bool {
        self.world_size() > 1
    }

    /// Whether this process is the primary (rank 0).
    fn is_primary(&self) -> bool {
        self.rank() == 0
    }

    /// Average a scalar across all processes.
    fn all_reduce_mean(&self, value: f64) -> anyhow::Result<f64>;

    /// Sum a vector of values element-wise across all processes, in place.
    fn all_reduce_sum(&self, values: &mut [f64]) -> anyhow::Result<()>;

    /// Overwrite `tensor` on every process with the copy held by `src`.
    fn broadcast(&self, tensor: &mut B::Tensor, src: usize) -> anyhow::Result<()>;

    /// Broadcast a serializable value held by `src`. Non-source processes pass
    /// `None` and receive the source's value.
    fn broadcast_state(&self, state: Option<Value>, src: usize) -> anyhow::Result<Option<Value>>;

    /// Block until every process has reached this point.
    fn barrier(&self) -> anyhow::Result<()>;

    /// Install gradient synchronization on `module` so that its gradients are
    /// averaged across processes during the backward pass.
    fn replicate(&self, module: &mut dyn Module<B>, options: &ReplicaOptions) -> anyhow::Result<()>;
}

/// Process group of a single-process run. All collectives are identities.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalGroup;

impl<B: Backend> ProcessGroup<B> for LocalGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&self, value: f64) -> anyhow::Result<f64> {
        Ok(value)
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) -> anyhow::Result<()> {
        Ok(())
    }

    fn broadcast(&self, _tensor: &mut B::Tensor, _src: usize) -> anyhow::Result<()> {
        Ok(())
    }

    fn broadcast_state(&self, state: Option<Value>, _src: usize) -> anyhow::Result<Option<Value>> {
        Ok(state)
    }

    fn barrier(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn replicate(&self, _module: &mut dyn Module<B>, _options: &ReplicaOptions) -> anyhow::Result<()> {
        anyhow::bail!("a single-process group cannot replicate modules")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{CpuBackend, CpuTensor};

    #[test]
    fn test_local_group_is_identity() {
        let group: &dyn ProcessGroup<CpuBackend> = &LocalGroup;
        assert_eq!(group.rank(), 0);
        assert_eq!(group.world_size(), 1);
        assert!(!group.is_distributed());
        assert!(group.is_primary());
        assert_eq!(group.all_reduce_mean(2.5).unwrap(), 2.5);

        let mut values = [1.0, 2.0];
        group.all_reduce_sum(&mut values).unwrap();
        assert_eq!(values, [1.0, 2.0]);

        let mut tensor = CpuTensor::row(vec![1.0, 2.0]);
        group.broadcast(&mut tensor, 0).unwrap();
        assert_eq!(tensor.data(), &[1.0, 2.0]);

        let state = group
            .broadcast_state(Some(serde_json::json!({"a": 1})), 0)
            .unwrap();
        assert_eq!(state, Some(serde_json::json!({"a": 1})));
        group.barrier().unwrap();
    }
}
