use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::CpuBackend;
use super::tensor::CpuTensor;
use crate::backend::ProcessGroup;
use crate::components::{Meter, Stateful};

/// Mean absolute error between output and target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeanAbsoluteErrorMeter {
    sum: f64,
    count: f64,
}

impl MeanAbsoluteErrorMeter {
    pub const NAME: &'static str = "mae";

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0.0).then(|| self.sum / self.count)
    }

    pub fn count(&self) -> f64 {
        self.count
    }
}

impl Stateful for MeanAbsoluteErrorMeter {
    fn get_state(&self) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn set_state(&mut self, state: &Value) -> anyhow::Result<()> {
        *self = serde_json::from_value(state.clone())?;
        Ok(())
    }
}

impl Meter<CpuBackend> for MeanAbsoluteErrorMeter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0.0;
    }

    fn update(&mut self, output: &CpuTensor, target: &CpuTensor, _is_train: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            output.data().len() == target.data().len(),
            "meter got {} outputs for {} targets",
            output.data().len(),
            target.data().len()
        );
        self.sum += output
            .data()
            .iter()
            .zip(target.data())
            .map(|(o, t)| (o - t).abs())
            .sum::<f64>();
        self.count += output.data().len() as f64;
        Ok(())
    }

    fn sync_state(&mut self, group: &dyn ProcessGroup<CpuBackend>) -> anyhow::Result<()> {
        let mut totals = [self.sum, self.count];
        group.all_reduce_sum(&mut totals)?;
        [self.sum, self.count] = totals;
        Ok(())
    }

    fn value(&self) -> Value {
        json!(self.mean())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalGroup;

    #[test]
    fn test_update_and_reset() {
        let mut meter = MeanAbsoluteErrorMeter::default();
        assert_eq!(meter.value(), Value::Null);
        meter
            .update(
                &CpuTensor::column(vec![1.0, 2.0]),
                &CpuTensor::column(vec![0.0, 4.0]),
                true,
            )
            .unwrap();
        assert_eq!(meter.mean(), Some(1.5));
        meter.sync_state(&LocalGroup).unwrap();
        assert_eq!(meter.value(), json!(1.5));
        meter.reset();
        assert_eq!(meter.mean(), None);
    }

    #[test]
    fn test_state_roundtrip() {
        let mut meter = MeanAbsoluteErrorMeter::default();
        meter
            .update(&CpuTensor::scalar(3.0), &CpuTensor::scalar(1.0), false)
            .unwrap();
        let mut other = MeanAbsoluteErrorMeter::default();
        other.set_state(&meter.get_state().unwrap()).unwrap();
        assert_eq!(other, meter);
    }
}
