//! A linear model and a mean-squared-error loss.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::CpuBackend;
use super::tensor::{CpuParameter, CpuTensor, ParamGrads, Tape, grad_enabled};
use crate::components::{Loss, Model, Module, Stateful};

const RUNNING_MEAN_MOMENTUM: f64 = 0.1;

/// `y = x W^T + b`, with a running mean of its inputs as a buffer.
pub struct LinearModel {
    in_features: usize,
    out_features: usize,
    weight: CpuParameter,
    bias: CpuParameter,
    running_mean: CpuTensor,
    training: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct LinearState {
    weight: Vec<f64>,
    bias: Vec<f64>,
    running_mean: Vec<f64>,
}

impl LinearModel {
    /// Weights are initialized deterministically from `seed`.
    pub fn new(in_features: usize, out_features: usize, seed: u64) -> Self {
        use rand::{Rng, SeedableRng, rngs::StdRng};

        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (in_features.max(1) as f64).sqrt();
        let weight = (0..in_features * out_features)
            .map(|_| rng.gen_range(-bound..bound))
            .collect();
        Self {
            in_features,
            out_features,
            weight: CpuParameter::new("weight", weight),
            bias: CpuParameter::new("bias", vec![0.0; out_features]),
            running_mean: CpuTensor::zeros(1, in_features),
            training: true,
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &CpuParameter {
        &self.weight
    }

    pub fn bias(&self) -> &CpuParameter {
        &self.bias
    }

    pub fn running_mean(&self) -> &CpuTensor {
        &self.running_mean
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    fn update_running_mean(&mut self, input: &CpuTensor) {
        let rows = input.rows().max(1) as f64;
        for col in 0..self.in_features {
            let mean = (0..input.rows())
                .map(|row| input.row_slice(row)[col])
                .sum::<f64>()
                / rows;
            let slot = &mut self.running_mean.data_mut()[col];
            *slot = (1.0 - RUNNING_MEAN_MOMENTUM) * *slot + RUNNING_MEAN_MOMENTUM * mean;
        }
    }
}

impl Module<CpuBackend> for LinearModel {
    fn train(&mut self, mode: bool) {
        self.training = mode;
    }

    fn buffers_mut(&mut self) -> Vec<&mut CpuTensor> {
        vec![&mut self.running_mean]
    }

    fn parameters(&self) -> Vec<CpuParameter> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    fn to_device(&mut self, accelerator: bool) -> anyhow::Result<()> {
        anyhow::ensure!(!accelerator, "the cpu backend has no accelerator");
        Ok(())
    }
}

impl Stateful for LinearModel {
    fn get_state(&self) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(LinearState {
            weight: self.weight.value(),
            bias: self.bias.value(),
            running_mean: self.running_mean.data().to_vec(),
        })?)
    }

    fn set_state(&mut self, state: &Value) -> anyhow::Result<()> {
        let state: LinearState = serde_json::from_value(state.clone())?;
        self.weight.set_value(&state.weight)?;
        self.bias.set_value(&state.bias)?;
        self.running_mean = CpuTensor::new(state.running_mean, 1, self.in_features)?;
        Ok(())
    }
}

impl Model<CpuBackend> for LinearModel {
    fn forward(&mut self, input: &CpuTensor) -> anyhow::Result<CpuTensor> {
        anyhow::ensure!(
            input.cols() == self.in_features,
            "linear model expects {} input features, got {}",
            self.in_features,
            input.cols()
        );
        if self.training {
            self.update_running_mean(input);
        }

        let weight = self.weight.value();
        let bias = self.bias.value();
        let (n, inputs, outputs) = (input.rows(), self.in_features, self.out_features);
        let mut out = vec![0.0; n * outputs];
        for row in 0..n {
            let x = input.row_slice(row);
            for o in 0..outputs {
                let w = &weight[o * inputs..(o + 1) * inputs];
                out[row * outputs + o] = bias[o] + x.iter().zip(w).map(|(a, b)| a * b).sum::<f64>();
            }
        }
        let output = CpuTensor::new(out, n, outputs)?;
        if !grad_enabled() {
            return Ok(output);
        }

        let x = input.detach();
        let (weight_param, bias_param) = (self.weight.clone(), self.bias.clone());
        let grad_fn = move |upstream: &[f64]| -> ParamGrads {
            let mut d_weight = vec![0.0; outputs * inputs];
            let mut d_bias = vec![0.0; outputs];
            for row in 0..n {
                let xr = x.row_slice(row);
                for o in 0..outputs {
                    let g = upstream[row * outputs + o];
                    d_bias[o] += g;
                    for (i, xi) in xr.iter().enumerate() {
                        d_weight[o * inputs + i] += g * xi;
                    }
                }
            }
            vec![(weight_param.clone(), d_weight), (bias_param.clone(), d_bias)]
        };
        Ok(output.with_tape(Tape::Output(Arc::new(grad_fn))))
    }
}

/// Mean squared error, optionally multiplied by a learned scale.
#[derive(Default)]
pub struct MseLoss {
    scale: Option<CpuParameter>,
}

impl MseLoss {
    /// A loss holding one learnable parameter, used to exercise loss
    /// replication and loss state.
    pub fn with_learned_scale(initial: f64) -> Self {
        Self {
            scale: Some(CpuParameter::new("loss_scale", vec![initial])),
        }
    }
}

impl Module<CpuBackend> for MseLoss {
    fn train(&mut self, _mode: bool) {}

    fn parameters(&self) -> Vec<CpuParameter> {
        self.scale.iter().cloned().collect()
    }

    fn to_device(&mut self, accelerator: bool) -> anyhow::Result<()> {
        anyhow::ensure!(!accelerator, "the cpu backend has no accelerator");
        Ok(())
    }
}

impl Loss<CpuBackend> for MseLoss {
    fn forward(&mut self, output: &CpuTensor, target: &CpuTensor) -> anyhow::Result<CpuTensor> {
        anyhow::ensure!(
            output.rows() == target.rows() && output.cols() == target.cols(),
            "output shape {}x{} does not match target shape {}x{}",
            output.rows(),
            output.cols(),
            target.rows(),
            target.cols()
        );
        let count = output.data().len().max(1) as f64;
        let diffs: Vec<f64> = output
            .data()
            .iter()
            .zip(target.data())
            .map(|(o, t)| o - t)
            .collect();
        let mse = diffs.iter().map(|d| d * d).sum::<f64>() / count;
        let scale = self.scale.as_ref().map_or(1.0, |p| p.value()[0]);
        let loss = CpuTensor::scalar(scale * mse);

        if !grad_enabled() {
            return Ok(loss);
        }
        let mut grads = ParamGrads::new();
        if let Some(Tape::Output(grad_fn)) = output.tape() {
            let upstream: Vec<f64> = diffs.iter().map(|d| scale * 2.0 * d / count).collect();
            grads.extend(grad_fn(&upstream));
        }
        if let Some(param) = &self.scale {
            grads.push((param.clone(), vec![mse]));
        }
        Ok(loss.with_tape(Tape::Loss(Arc::new(grads))))
    }

    fn has_learned_parameters(&self) -> bool {
        self.scale.is_some()
    }

    fn supports_state(&self) -> bool {
        self.scale.is_some()
    }

    fn get_state(&self) -> anyhow::Result<Value> {
        Ok(json!({ "scale": self.scale.as_ref().map(CpuParameter::value) }))
    }

    fn set_state(&mut self, state: &Value) -> anyhow::Result<()> {
        if let (Some(param), Some(values)) = (&self.scale, state.get("scale")) {
            let values: Vec<f64> = serde_json::from_value(values.clone())?;
            param.set_value(&values)?;
        }
        Ok(())
    }
}
