//! Stochastic gradient descent with momentum and progress-driven schedules.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::CpuBackend;
use super::tensor::{CpuParameter, CpuTensor, Tape};
use crate::components::{Loss, Model, Optimizer, Stateful};

/// Learning rate as a function of training progress.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum LrSchedule {
    #[default]
    Constant,
    Linear {
        end_lr: f64,
    },
    Cosine {
        end_lr: f64,
    },
}

impl LrSchedule {
    pub fn value(&self, base_lr: f64, progress: f64) -> f64 {
        match *self {
            LrSchedule::Constant => base_lr,
            LrSchedule::Linear { end_lr } => base_lr + (end_lr - base_lr) * progress,
            LrSchedule::Cosine { end_lr } => {
                end_lr + (base_lr - end_lr) * (1.0 + (PI * progress).cos()) / 2.0
            }
        }
    }
}

/// Whether the schedule advances on every step or once per train phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateInterval {
    Step,
    #[default]
    Epoch,
}

/// Optimizer configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SgdConfig {
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default)]
    pub momentum: f64,
    #[serde(default)]
    pub schedule: LrSchedule,
    #[serde(default)]
    pub update_interval: UpdateInterval,
    /// Injected by the task builder.
    #[serde(default)]
    pub num_epochs: Option<f64>,
}

fn default_lr() -> f64 {
    0.1
}

#[derive(Debug, Serialize, Deserialize)]
struct SgdState {
    lr: f64,
    steps: u64,
    velocity: Vec<Vec<f64>>,
}

pub struct Sgd {
    config: SgdConfig,
    lr: f64,
    steps: u64,
    params: Vec<CpuParameter>,
    velocity: Vec<Vec<f64>>,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Self::from_config(SgdConfig {
            lr,
            momentum: 0.0,
            schedule: LrSchedule::Constant,
            update_interval: UpdateInterval::Epoch,
            num_epochs: None,
        })
    }

    pub fn from_config(config: SgdConfig) -> Self {
        Self {
            lr: config.lr,
            config,
            steps: 0,
            params: Vec::new(),
            velocity: Vec::new(),
        }
    }

    pub fn from_value(config: &Value) -> anyhow::Result<Self> {
        Ok(Self::from_config(serde_json::from_value(config.clone())?))
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn params(&self) -> &[CpuParameter] {
        &self.params
    }

    fn update_lr(&mut self, progress: f64) {
        self.lr = self.config.schedule.value(self.config.lr, progress);
        debug!(lr = self.lr, progress, "Updated learning rate");
    }
}

impl Stateful for Sgd {
    fn get_state(&self) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(SgdState {
            lr: self.lr,
            steps: self.steps,
            velocity: self.velocity.clone(),
        })?)
    }

    fn set_state(&mut self, state: &Value) -> anyhow::Result<()> {
        let state: SgdState = serde_json::from_value(state.clone())?;
        if !self.params.is_empty() {
            anyhow::ensure!(
                state.velocity.len() == self.params.len(),
                "optimizer state has {} momentum buffers for {} parameters",
                state.velocity.len(),
                self.params.len()
            );
        }
        self.lr = state.lr;
        self.steps = state.steps;
        self.velocity = state.velocity;
        Ok(())
    }
}

impl Optimizer<CpuBackend> for Sgd {
    fn init(
        &mut self,
        model: &mut dyn Model<CpuBackend>,
        loss: &mut dyn Loss<CpuBackend>,
    ) -> anyhow::Result<()> {
        self.params = model.parameters();
        self.params.extend(loss.parameters());
        self.velocity = self.params.iter().map(|p| vec![0.0; p.len()]).collect();
        Ok(())
    }

    fn zero_grad(&mut self) -> anyhow::Result<()> {
        for param in &self.params {
            param.zero_grad();
        }
        Ok(())
    }

    fn backward(&mut self, loss: &CpuTensor) -> anyhow::Result<()> {
        self.zero_grad()?;
        let Some(Tape::Loss(grads)) = loss.tape() else {
            anyhow::bail!("loss tensor has no gradient record; was it computed without gradients?");
        };
        for (param, grad) in grads.iter() {
            param.accumulate_grad(grad);
        }
        Ok(())
    }

    fn step(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.velocity.len() == self.params.len(),
            "optimizer used before init"
        );
        let (lr, momentum) = (self.lr, self.config.momentum);
        for (param, velocity) in self.params.iter().zip(&mut self.velocity) {
            param.update(|value, grad| {
                for ((v, x), g) in velocity.iter_mut().zip(value.iter_mut()).zip(grad) {
                    *v = momentum * *v + g;
                    *x -= lr * *v;
                }
            });
        }
        self.steps += 1;
        Ok(())
    }

    fn update_schedule_on_step(&mut self, progress: f64) -> anyhow::Result<()> {
        if self.config.update_interval == UpdateInterval::Step {
            self.update_lr(progress);
        }
        Ok(())
    }

    fn update_schedule_on_epoch(&mut self, progress: f64) -> anyhow::Result<()> {
        if self.config.update_interval == UpdateInterval::Epoch {
            self.update_lr(progress);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::modules::{LinearModel, MseLoss};
    use serde_json::json;

    #[test]
    fn test_schedules() {
        assert_eq!(LrSchedule::Constant.value(0.1, 0.7), 0.1);
        let linear = LrSchedule::Linear { end_lr: 0.0 };
        assert!((linear.value(1.0, 0.25) - 0.75).abs() < 1e-12);
        let cosine = LrSchedule::Cosine { end_lr: 0.0 };
        assert!((cosine.value(1.0, 0.0) - 1.0).abs() < 1e-12);
        assert!((cosine.value(1.0, 0.5) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_config_from_value() {
        let sgd = Sgd::from_value(&json!({
            "lr": 0.5,
            "momentum": 0.9,
            "schedule": {"name": "linear", "end_lr": 0.05},
            "update_interval": "step",
            "num_epochs": 4.0
        }))
        .unwrap();
        assert_eq!(sgd.config().schedule, LrSchedule::Linear { end_lr: 0.05 });
        assert_eq!(sgd.config().update_interval, UpdateInterval::Step);
        assert_eq!(sgd.config().num_epochs, Some(4.0));

        let defaults = Sgd::from_value(&json!({})).unwrap();
        assert_eq!(defaults.lr(), 0.1);
        assert_eq!(defaults.config().update_interval, UpdateInterval::Epoch);
    }

    #[test]
    fn test_interval_selects_update_hook() {
        let mut sgd = Sgd::new(1.0);
        sgd.config.schedule = LrSchedule::Linear { end_lr: 0.0 };
        sgd.update_schedule_on_step(0.5).unwrap();
        assert_eq!(sgd.lr(), 1.0);
        sgd.update_schedule_on_epoch(0.5).unwrap();
        assert!((sgd.lr() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_step_descends() {
        let mut model = LinearModel::new(1, 1, 0);
        model.weight().set_value(&[0.0]).unwrap();
        let mut loss = MseLoss::default();
        let mut sgd = Sgd::new(0.25);
        sgd.init(&mut model, &mut loss).unwrap();
        assert_eq!(sgd.params().len(), 2);

        let input = CpuTensor::column(vec![1.0]);
        let target = CpuTensor::column(vec![2.0]);
        let before = loss
            .forward(&model.forward(&input).unwrap(), &target)
            .unwrap();
        sgd.backward(&before).unwrap();
        sgd.step().unwrap();
        let after = loss
            .forward(&model.forward(&input).unwrap(), &target)
            .unwrap();
        assert!(after.data()[0] < before.data()[0]);
        assert_eq!(sgd.steps(), 1);
    }

    #[test]
    fn test_backward_without_tape_fails() {
        let mut sgd = Sgd::new(0.1);
        assert!(sgd.backward(&CpuTensor::scalar(1.0)).is_err());
    }

    #[test]
    fn test_state_roundtrip() {
        let mut model = LinearModel::new(2, 1, 0);
        let mut loss = MseLoss::default();
        let mut sgd = Sgd::new(0.3);
        sgd.init(&mut model, &mut loss).unwrap();
        sgd.steps = 5;
        sgd.lr = 0.2;
        let state = sgd.get_state().unwrap();

        let mut other = Sgd::new(0.3);
        other.init(&mut model, &mut loss).unwrap();
        other.set_state(&state).unwrap();
        assert_eq!(other.steps(), 5);
        assert_eq!(other.lr(), 0.2);
    }
}
