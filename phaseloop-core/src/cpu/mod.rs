//! Reference CPU backend.
//!
//! A small dense-matrix backend that exercises every path of the task
//! orchestrator end to end: a linear model with a buffer, a mean-squared-error
//! loss (optionally with a learned parameter), SGD with schedules, seeded
//! synthetic data, a mean-absolute-error meter, and an in-process stand-in
//! for a distributed group. It has no accelerator.

mod data;
mod factory;
mod group;
mod meter;
mod modules;
mod optim;
mod tensor;

pub use data::{SyntheticConfig, SyntheticDataset, SyntheticLoader};
pub use factory::CpuFactory;
pub use group::SimulatedGroup;
pub use meter::MeanAbsoluteErrorMeter;
pub use modules::{LinearModel, MseLoss};
pub use optim::{LrSchedule, Sgd, SgdConfig, UpdateInterval};
pub use tensor::{CpuParameter, CpuTensor, GradFn, ParamGrads, Tape, grad_enabled, with_grad_mode};

use crate::backend::Backend;

/// Backend marker for [`CpuTensor`] / [`CpuParameter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Tensor = CpuTensor;
    type Parameter = CpuParameter;

    fn name() -> &'static str {
        "cpu"
    }

    fn accelerator_available() -> bool {
        false
    }

    fn device_count() -> usize {
        0
    }

    fn to_device(_tensor: &CpuTensor, _non_blocking: bool) -> anyhow::Result<CpuTensor> {
        anyhow::bail!("the cpu backend has no accelerator")
    }

    fn detach(tensor: &CpuTensor) -> CpuTensor {
        tensor.detach()
    }

    fn scalar(tensor: &CpuTensor) -> anyhow::Result<f64> {
        match tensor.data() {
            [value] => Ok(*value),
            data => anyhow::bail!("expected a one-element tensor, got {} elements", data.len()),
        }
    }

    fn leading_dim(tensor: &CpuTensor) -> usize {
        tensor.rows()
    }

    fn with_grad<R>(enabled: bool, f: impl FnOnce() -> R) -> R {
        with_grad_mode(enabled, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_basics() {
        assert_eq!(CpuBackend::name(), "cpu");
        assert!(!CpuBackend::accelerator_available());
        assert!(CpuBackend::to_device(&CpuTensor::scalar(1.0), true).is_err());
        assert_eq!(CpuBackend::scalar(&CpuTensor::scalar(2.5)).unwrap(), 2.5);
        assert!(CpuBackend::scalar(&CpuTensor::row(vec![1.0, 2.0])).is_err());
        assert_eq!(CpuBackend::leading_dim(&CpuTensor::column(vec![1.0, 2.0, 3.0])), 3);
    }

    #[test]
    fn test_with_grad_scopes_tape_recording() {
        let recorded = CpuBackend::with_grad(false, grad_enabled);
        assert!(!recorded);
        assert!(grad_enabled());
    }
}
