//! Single-process trainer loop.

use tracing::info;

use crate::backend::Backend;
use crate::error::Result;
use crate::task::Task;

/// Drives a task through its full lifecycle on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTrainer;

impl LocalTrainer {
    pub fn new() -> Self {
        Self
    }

    /// Prepare the task and run every phase of its plan to completion.
    ///
    /// A phase ends when its data runs out. Any other error stops the run.
    pub fn train<B: Backend>(&self, task: &mut Task<B>) -> Result<()> {
        task.prepare()?;
        task.on_start()?;
        while !task.done_training() {
            task.on_phase_start()?;
            let mut steps = 0usize;
            loop {
                match task.step() {
                    Ok(()) => steps += 1,
                    Err(err) if err.is_data_exhausted() => break,
                    Err(err) => return Err(err),
                }
            }
            task.on_phase_end()?;
            info!(
                phase_idx = task.phase_idx(),
                phase_type = %task.phase_type(),
                steps,
                "Finished phase"
            );
        }
        task.on_end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TaskBuilder;
    use crate::cpu::{CpuBackend, LinearModel, MseLoss, Sgd, SyntheticDataset};
    use crate::phases::PhaseType;
    use crate::task::TaskStatus;

    fn task(num_epochs: usize) -> Task<CpuBackend> {
        TaskBuilder::new()
            .num_epochs(num_epochs)
            .model(Box::new(LinearModel::new(2, 1, 4)))
            .loss(Box::new(MseLoss::default()))
            .optimizer(Box::new(Sgd::new(0.2)))
            .dataset(PhaseType::Train, Box::new(SyntheticDataset::new(32, 8, 2, 1)))
            .dataset(PhaseType::Test, Box::new(SyntheticDataset::new(16, 8, 2, 2)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_train_runs_every_phase() {
        let mut task = task(3);
        LocalTrainer::new().train(&mut task).unwrap();
        assert_eq!(task.status(), TaskStatus::Done);
        assert_eq!(task.phase_idx(), 5);
        assert_eq!(task.train_phase_idx(), 2);
        // 3 train phases of 4 batches of 8.
        assert_eq!(task.num_updates(), 3 * 4 * 8);
        assert!(!task.is_train());
        assert_eq!(task.losses().len(), 2);
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut first = task(1);
        LocalTrainer::new().train(&mut first).unwrap();
        let mut longer = task(6);
        LocalTrainer::new().train(&mut longer).unwrap();
        let (Some(short_loss), Some(long_loss)) = (first.average_loss(), longer.average_loss()) else {
            panic!("both runs end with a test phase");
        };
        assert!(long_loss < short_loss, "{long_loss} >= {short_loss}");
    }
}
