//! Train and eval steps.

use std::fmt;

use tracing::trace;

use crate::backend::{Backend, INPUT_KEY, Sample, TARGET_KEY};
use crate::error::{ContractViolation, Result, TaskError};
use crate::task::Task;

/// What the most recent step consumed and produced. Replaced as a whole on
/// every step and read by hooks between steps.
pub struct LastBatch<B: Backend> {
    /// Loss averaged across processes.
    pub loss: f64,
    pub output: B::Tensor,
    pub target: B::Tensor,
    pub sample: Sample<B::Tensor>,
}

impl<B: Backend> fmt::Debug for LastBatch<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LastBatch")
            .field("loss", &self.loss)
            .field("output", &self.output)
            .field("target", &self.target)
            .field("sample_keys", &self.sample.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Fail on a non-finite loss.
pub fn check_finite(loss: f64) -> Result<()> {
    if !loss.is_finite() {
        return Err(TaskError::NumericFault { loss });
    }
    Ok(())
}

fn tensor<'a, T>(sample: &'a Sample<T>, key: &str) -> Result<&'a T> {
    sample.get(key).ok_or_else(|| {
        ContractViolation::MalformedBatch {
            keys: sample.keys().cloned().collect(),
        }
        .into()
    })
}

impl<B: Backend> Task<B> {
    /// Run one step of the current phase. Returns
    /// [`TaskError::DataExhausted`] once the phase has no batches left.
    pub fn step(&mut self) -> Result<()> {
        if self.train {
            self.train_step()
        } else {
            self.eval_step()
        }
    }

    /// One optimization step.
    ///
    /// The loss is recorded and the meters updated before the finiteness
    /// check, so a diverging batch still shows up in the history. The check
    /// runs before the optimizer steps, so a non-finite loss never updates
    /// parameters or the update counter.
    pub fn train_step(&mut self) -> Result<()> {
        self.last_batch = None;

        let sample = self.next_sample()?;
        let target = tensor(&sample, TARGET_KEY)?.clone();
        let mut sample = self.copy_to_device(sample)?;
        if let Some(mixup) = self.mixup.as_mut() {
            sample = mixup.apply(sample)?;
        }

        let (output, local_loss) = B::with_grad(true, || self.forward(&sample))?;

        let loss = self.replication.all_reduce_mean(B::scalar(&B::detach(&local_loss))?)?;
        self.losses.push(loss * B::leading_dim(&target) as f64);
        self.update_meters(&output, tensor(&sample, TARGET_KEY)?)?;

        match (&self.amp_args, self.amp.as_mut()) {
            (Some(_), Some(amp)) => {
                self.optimizer.zero_grad()?;
                amp.scaled_backward(&local_loss, self.optimizer.as_mut())?;
            }
            _ => self.optimizer.backward(&local_loss)?,
        }

        check_finite(loss)?;

        let progress = self.progress()?;
        self.optimizer.update_schedule_on_step(progress)?;
        self.optimizer.step()?;

        self.num_updates += self.global_batchsize()? as u64;
        trace!(loss, num_updates = self.num_updates, "Train step");

        self.last_batch = Some(LastBatch {
            loss,
            output,
            target,
            sample,
        });
        Ok(())
    }

    /// One evaluation step. Never touches the optimizer or update counter.
    pub fn eval_step(&mut self) -> Result<()> {
        self.last_batch = None;

        let sample = self.next_sample()?;
        let target = tensor(&sample, TARGET_KEY)?.clone();
        let sample = self.copy_to_device(sample)?;

        let (output, local_loss) = B::with_grad(false, || self.forward(&sample))?;

        let loss = self.replication.all_reduce_mean(B::scalar(&B::detach(&local_loss))?)?;
        check_finite(loss)?;

        self.losses.push(loss * B::leading_dim(&target) as f64);
        self.update_meters(&output, tensor(&sample, TARGET_KEY)?)?;
        trace!(loss, "Eval step");

        self.last_batch = Some(LastBatch {
            loss,
            output,
            target,
            sample,
        });
        Ok(())
    }

    /// Pull the next batch and check it carries input and target.
    fn next_sample(&mut self) -> Result<Sample<B::Tensor>> {
        let iterator = self
            .data_iterator
            .as_mut()
            .ok_or_else(|| ContractViolation::NotPrepared {
                operation: "stepping".to_string(),
            })?;
        let sample = iterator.next().ok_or(TaskError::DataExhausted)??;
        if !sample.contains_key(INPUT_KEY) || !sample.contains_key(TARGET_KEY) {
            return Err(ContractViolation::MalformedBatch {
                keys: sample.keys().cloned().collect(),
            }
            .into());
        }
        Ok(sample)
    }

    fn copy_to_device(&self, sample: Sample<B::Tensor>) -> Result<Sample<B::Tensor>> {
        if !self.use_accelerator {
            return Ok(sample);
        }
        sample
            .into_iter()
            .map(|(key, value)| -> Result<(String, B::Tensor)> {
                Ok((key, B::to_device(&value, true)?))
            })
            .collect()
    }

    fn forward(&mut self, sample: &Sample<B::Tensor>) -> Result<(B::Tensor, B::Tensor)> {
        let output = self
            .replication
            .forward_model(self.model.as_mut(), tensor(sample, INPUT_KEY)?)?;
        let loss = self
            .replication
            .forward_loss(self.loss.as_mut(), &output, tensor(sample, TARGET_KEY)?)?;
        Ok((output, loss))
    }

    fn update_meters(&mut self, output: &B::Tensor, target: &B::Tensor) -> Result<()> {
        let output = B::detach(output);
        let target = B::detach(target);
        let is_train = self.train;
        for meter in &mut self.meters {
            meter.update(&output, &target, is_train)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_finite() {
        assert!(check_finite(0.25).is_ok());
        assert!(check_finite(-3.0).is_ok());
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                check_finite(bad),
                Err(TaskError::NumericFault { .. })
            ));
        }
    }
}
