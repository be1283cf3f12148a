//! Phase plan construction.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConfigError;

/// Kind of data a phase iterates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    Train,
    Test,
}

impl PhaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseType::Train => "train",
            PhaseType::Test => "test",
        }
    }

    pub fn from_train(train: bool) -> Self {
        if train { PhaseType::Train } else { PhaseType::Test }
    }
}

impl fmt::Display for PhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the phase plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub train: bool,
}

impl Phase {
    pub const TRAIN: Phase = Phase { train: true };
    pub const TEST: Phase = Phase { train: false };

    pub fn phase_type(&self) -> PhaseType {
        PhaseType::from_train(self.train)
    }
}

/// Inputs of [`build_phases`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhasePlanSpec {
    pub num_epochs: usize,
    pub phases_per_epoch: f64,
    pub test_phase_period: usize,
    pub test_only: bool,
}

impl Default for PhasePlanSpec {
    fn default() -> Self {
        Self {
            num_epochs: 1,
            phases_per_epoch: 1.0,
            test_phase_period: 1,
            test_only: false,
        }
    }
}

/// Build the ordered phase plan for a whole run.
///
/// A test phase follows every `test_phase_period`-th train phase, and the plan
/// always ends with a test phase. Test-only runs get `num_epochs` test phases.
pub fn build_phases(spec: &PhasePlanSpec) -> Result<Vec<Phase>, ConfigError> {
    if spec.test_only {
        return Ok(vec![Phase::TEST; spec.num_epochs]);
    }
    if spec.test_phase_period == 0 {
        return Err(ConfigError::invalid("test_phase_period must be >= 1"));
    }
    if !spec.phases_per_epoch.is_finite() || spec.phases_per_epoch <= 0.0 {
        return Err(ConfigError::invalid(format!(
            "phases_per_epoch must be positive, got {}",
            spec.phases_per_epoch
        )));
    }

    let num_train = (spec.phases_per_epoch * spec.num_epochs as f64).ceil() as usize;
    let mut phases = Vec::with_capacity(num_train + num_train / spec.test_phase_period + 1);
    for idx in 0..num_train {
        phases.push(Phase::TRAIN);
        if (idx + 1) % spec.test_phase_period == 0 {
            phases.push(Phase::TEST);
        }
    }
    if phases.last().is_none_or(|phase| phase.train) {
        phases.push(Phase::TEST);
    }
    Ok(phases)
}

pub fn count_train(phases: &[Phase]) -> usize {
    phases.iter().filter(|p| p.train).count()
}

pub fn count_test(phases: &[Phase]) -> usize {
    phases.iter().filter(|p| !p.train).count()
}

/// Compact rendering such as `train,test,train,test`.
pub fn describe(phases: &[Phase]) -> String {
    phases
        .iter()
        .map(|p| p.phase_type().as_str())
        .collect::<Vec<_>>()
        .join(",")
}
