//! Data-parallel replication of the model and loss.
//!
//! The task keeps exclusive ownership of the base model. Replication installs
//! gradient synchronization on it through the [`ProcessGroup`] and then acts
//! as a computation-time view: forward passes go through [`Replication`] so
//! the buffer policy can be applied, but nothing here is ever checkpointed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{Backend, ProcessGroup};
use crate::components::{Loss, Model, Module};
use crate::config::BroadcastBuffersMode;
use crate::error::{ContractViolation, Result};

/// Options forwarded to [`ProcessGroup::replicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaOptions {
    /// Let the group broadcast buffers itself on every forward call.
    pub broadcast_buffers: bool,
    /// Tolerate parameters that a forward pass does not use.
    pub find_unused_parameters: bool,
}

/// Replication state of one task.
pub struct Replication<B: Backend> {
    group: Arc<dyn ProcessGroup<B>>,
    mode: BroadcastBuffersMode,
    find_unused_parameters: bool,
    model_replicated: bool,
    loss_replicated: bool,
    initialized: bool,
}

impl<B: Backend> Replication<B> {
    pub fn new(
        group: Arc<dyn ProcessGroup<B>>,
        mode: BroadcastBuffersMode,
        find_unused_parameters: bool,
    ) -> Self {
        Self {
            group,
            mode,
            find_unused_parameters,
            model_replicated: false,
            loss_replicated: false,
            initialized: false,
        }
    }

    pub fn group(&self) -> &dyn ProcessGroup<B> {
        self.group.as_ref()
    }

    pub fn shared_group(&self) -> Arc<dyn ProcessGroup<B>> {
        Arc::clone(&self.group)
    }

    pub fn mode(&self) -> BroadcastBuffersMode {
        self.mode
    }

    pub fn find_unused_parameters(&self) -> bool {
        self.find_unused_parameters
    }

    pub fn is_distributed(&self) -> bool {
        self.group.is_distributed()
    }

    pub fn model_replicated(&self) -> bool {
        self.model_replicated
    }

    pub fn loss_replicated(&self) -> bool {
        self.loss_replicated
    }

    pub fn options(&self) -> ReplicaOptions {
        ReplicaOptions {
            broadcast_buffers: self.mode == BroadcastBuffersMode::ForwardPass,
            find_unused_parameters: self.find_unused_parameters,
        }
    }

    /// Install gradient synchronization on the model and, if it holds learned
    /// parameters, on the loss. A no-op for single-process runs. May only be
    /// called once per task.
    pub fn init(&mut self, model: &mut dyn Model<B>, loss: &mut dyn Loss<B>) -> Result<()> {
        if !self.group.is_distributed() {
            return Ok(());
        }
        if self.initialized {
            return Err(ContractViolation::AlreadyReplicated.into());
        }
        self.initialized = true;

        let options = self.options();
        info!(
            world_size = self.group.world_size(),
            rank = self.group.rank(),
            broadcast_buffers = ?self.mode,
            find_unused_parameters = options.find_unused_parameters,
            "Initializing distributed model"
        );
        let model: &mut dyn Module<B> = model;
        self.group.replicate(model, &options)?;
        self.model_replicated = true;

        if loss.has_learned_parameters() {
            info!("Initializing distributed loss");
            let loss: &mut dyn Module<B> = loss;
            self.group.replicate(loss, &options)?;
            self.loss_replicated = true;
        }
        Ok(())
    }

    /// Forward pass through the replicated view of `model`.
    pub fn forward_model(&self, model: &mut dyn Model<B>, input: &B::Tensor) -> Result<B::Tensor> {
        if self.model_replicated && self.mode == BroadcastBuffersMode::ForwardPass {
            self.broadcast_module_buffers(model)?;
        }
        Ok(model.forward(input)?)
    }

    /// Loss computation through the replicated view of `loss`.
    pub fn forward_loss(
        &self,
        loss: &mut dyn Loss<B>,
        output: &B::Tensor,
        target: &B::Tensor,
    ) -> Result<B::Tensor> {
        Ok(loss.forward(output, target)?)
    }

    /// Broadcast every model buffer from the primary process. Used when
    /// entering an eval phase under [`BroadcastBuffersMode::BeforeEval`].
    pub fn broadcast_buffers(&self, model: &mut dyn Model<B>) -> Result<()> {
        if !self.model_replicated {
            return Ok(());
        }
        info!("Synchronizing buffers before evaluation.");
        self.broadcast_module_buffers(model)
    }

    fn broadcast_module_buffers(&self, model: &mut dyn Model<B>) -> Result<()> {
        let buffers = model.buffers_mut();
        debug!(count = buffers.len(), "Broadcasting model buffers");
        for buffer in buffers {
            self.group.broadcast(buffer, 0)?;
        }
        Ok(())
    }

    /// Reduce a reporting value across processes.
    pub fn all_reduce_mean(&self, value: f64) -> Result<f64> {
        Ok(self.group.all_reduce_mean(value)?)
    }

    pub fn barrier(&self) -> Result<()> {
        Ok(self.group.barrier()?)
    }
}

impl<B: Backend> std::fmt::Debug for Replication<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replication")
            .field("rank", &self.group.rank())
            .field("world_size", &self.group.world_size())
            .field("mode", &self.mode)
            .field("find_unused_parameters", &self.find_unused_parameters)
            .field("model_replicated", &self.model_replicated)
            .field("loss_replicated", &self.loss_replicated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalGroup;
    use crate::cpu::{CpuBackend, CpuTensor, LinearModel, MseLoss, SimulatedGroup};
    use crate::error::TaskError;

    fn simulated(world_size: usize) -> Arc<SimulatedGroup> {
        Arc::new(SimulatedGroup::new(0, world_size))
    }

    #[test]
    fn test_init_is_noop_for_single_process() {
        let mut replication: Replication<CpuBackend> =
            Replication::new(Arc::new(LocalGroup), BroadcastBuffersMode::Disabled, true);
        let mut model = LinearModel::new(2, 1, 0);
        let mut loss = MseLoss::default();
        replication.init(&mut model, &mut loss).unwrap();
        replication.init(&mut model, &mut loss).unwrap();
        assert!(!replication.model_replicated());
    }

    #[test]
    fn test_init_twice_fails_when_distributed() {
        let group = simulated(2);
        let mut replication: Replication<CpuBackend> =
            Replication::new(group.clone(), BroadcastBuffersMode::Disabled, true);
        let mut model = LinearModel::new(2, 1, 0);
        let mut loss = MseLoss::default();
        replication.init(&mut model, &mut loss).unwrap();
        assert!(replication.model_replicated());
        assert!(!replication.loss_replicated());
        assert_eq!(group.replicate_calls(), 1);

        let err = replication.init(&mut model, &mut loss).unwrap_err();
        assert!(matches!(
            err,
            TaskError::Contract(ContractViolation::AlreadyReplicated)
        ));
        assert_eq!(group.replicate_calls(), 1);
    }

    #[test]
    fn test_loss_with_parameters_is_replicated() {
        let group = simulated(2);
        let mut replication: Replication<CpuBackend> =
            Replication::new(group.clone(), BroadcastBuffersMode::Disabled, false);
        let mut model = LinearModel::new(2, 1, 0);
        let mut loss = MseLoss::with_learned_scale(1.0);
        replication.init(&mut model, &mut loss).unwrap();
        assert!(replication.loss_replicated());
        assert_eq!(group.replicate_calls(), 2);
        assert_eq!(
            group.last_options(),
            Some(ReplicaOptions {
                broadcast_buffers: false,
                find_unused_parameters: false,
            })
        );
    }

    #[test]
    fn test_forward_pass_mode_broadcasts_every_forward() {
        let group = simulated(2);
        let mut replication: Replication<CpuBackend> =
            Replication::new(group.clone(), BroadcastBuffersMode::ForwardPass, true);
        let mut model = LinearModel::new(2, 1, 0);
        let mut loss = MseLoss::default();
        replication.init(&mut model, &mut loss).unwrap();
        assert!(replication.options().broadcast_buffers);

        let input = CpuTensor::row(vec![1.0, 2.0]);
        replication.forward_model(&mut model, &input).unwrap();
        replication.forward_model(&mut model, &input).unwrap();
        assert_eq!(group.broadcast_calls(), 2);
    }

    #[test]
    fn test_before_eval_broadcast_only_when_replicated() {
        let group = simulated(2);
        let mut replication: Replication<CpuBackend> =
            Replication::new(group.clone(), BroadcastBuffersMode::BeforeEval, true);
        let mut model = LinearModel::new(2, 1, 0);
        let mut loss = MseLoss::default();

        replication.broadcast_buffers(&mut model).unwrap();
        assert_eq!(group.broadcast_calls(), 0);

        replication.init(&mut model, &mut loss).unwrap();
        let input = CpuTensor::row(vec![1.0, 2.0]);
        replication.forward_model(&mut model, &input).unwrap();
        assert_eq!(group.broadcast_calls(), 0);

        replication.broadcast_buffers(&mut model).unwrap();
        assert_eq!(group.broadcast_calls(), 1);
    }
}
