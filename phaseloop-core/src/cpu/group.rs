//! An in-process stand-in for a multi-process group.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;

use super::CpuBackend;
use super::tensor::CpuTensor;
use crate::backend::ProcessGroup;
use crate::components::Module;
use crate::replication::ReplicaOptions;

/// Behaves like one rank of a `world_size`-process job whose peers all hold
/// identical data: means are unchanged, sums scale by `world_size`, and
/// broadcasts keep local values. Counts collective calls so tests can check
/// when synchronization happens.
#[derive(Debug)]
pub struct SimulatedGroup {
    rank: usize,
    world_size: usize,
    replicate_calls: AtomicUsize,
    broadcast_calls: AtomicUsize,
    barrier_calls: AtomicUsize,
    last_options: Mutex<Option<ReplicaOptions>>,
    inbox: Mutex<Option<Value>>,
}

impl SimulatedGroup {
    pub fn new(rank: usize, world_size: usize) -> Self {
        Self {
            rank,
            world_size: world_size.max(1),
            replicate_calls: AtomicUsize::new(0),
            broadcast_calls: AtomicUsize::new(0),
            barrier_calls: AtomicUsize::new(0),
            last_options: Mutex::new(None),
            inbox: Mutex::new(None),
        }
    }

    /// Value a non-primary rank receives from its next `broadcast_state`.
    pub fn deliver(&self, state: Value) {
        *self.inbox.lock().unwrap_or_else(PoisonError::into_inner) = Some(state);
    }

    pub fn replicate_calls(&self) -> usize {
        self.replicate_calls.load(Ordering::SeqCst)
    }

    pub fn broadcast_calls(&self) -> usize {
        self.broadcast_calls.load(Ordering::SeqCst)
    }

    pub fn barrier_calls(&self) -> usize {
        self.barrier_calls.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<ReplicaOptions> {
        *self.last_options.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProcessGroup<CpuBackend> for SimulatedGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_mean(&self, value: f64) -> anyhow::Result<f64> {
        Ok(value)
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> anyhow::Result<()> {
        let factor = self.world_size as f64;
        values.iter_mut().for_each(|v| *v *= factor);
        Ok(())
    }

    fn broadcast(&self, _tensor: &mut CpuTensor, src: usize) -> anyhow::Result<()> {
        anyhow::ensure!(src < self.world_size, "broadcast source {src} is not a rank");
        self.broadcast_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn broadcast_state(&self, state: Option<Value>, src: usize) -> anyhow::Result<Option<Value>> {
        anyhow::ensure!(src < self.world_size, "broadcast source {src} is not a rank");
        if self.rank == src {
            return Ok(state);
        }
        Ok(self.inbox.lock().unwrap_or_else(PoisonError::into_inner).take())
    }

    fn barrier(&self) -> anyhow::Result<()> {
        self.barrier_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn replicate(&self, _module: &mut dyn Module<CpuBackend>, options: &ReplicaOptions) -> anyhow::Result<()> {
        self.replicate_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock().unwrap_or_else(PoisonError::into_inner) = Some(*options);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collectives() {
        let group = SimulatedGroup::new(0, 4);
        assert!(group.is_distributed());
        assert!(group.is_primary());
        assert_eq!(group.all_reduce_mean(0.5).unwrap(), 0.5);

        let mut values = [1.0, 2.0];
        group.all_reduce_sum(&mut values).unwrap();
        assert_eq!(values, [4.0, 8.0]);

        group.barrier().unwrap();
        assert_eq!(group.barrier_calls(), 1);
        assert!(group.broadcast_state(None, 7).is_err());
    }

    #[test]
    fn test_non_primary_receives_delivered_state() {
        let group = SimulatedGroup::new(1, 2);
        assert!(!group.is_primary());
        assert_eq!(group.broadcast_state(None, 0).unwrap(), None);
        group.deliver(json!({"phase_idx": 2}));
        assert_eq!(
            group.broadcast_state(None, 0).unwrap(),
            Some(json!({"phase_idx": 2}))
        );
    }
}
