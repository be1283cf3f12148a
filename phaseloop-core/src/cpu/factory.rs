use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use super::CpuBackend;
use super::data::{SyntheticConfig, SyntheticDataset};
use super::meter::MeanAbsoluteErrorMeter;
use super::modules::{LinearModel, MseLoss};
use super::optim::Sgd;
use crate::backend::{LocalGroup, ProcessGroup};
use crate::builder::ComponentFactory;
use crate::components::{BatchTransform, Dataset, Loss, Meter, Model, Optimizer};
use crate::config::MixupConfig;
use crate::error::ConfigError;
use crate::phases::PhaseType;

#[derive(Debug, Deserialize)]
struct ModelConfig {
    #[serde(default = "default_in_features")]
    in_features: usize,
    #[serde(default = "default_out_features")]
    out_features: usize,
    #[serde(default)]
    seed: u64,
}

fn default_in_features() -> usize {
    2
}

fn default_out_features() -> usize {
    1
}

#[derive(Debug, Default, Deserialize)]
struct LossConfig {
    #[serde(default)]
    learned_scale: Option<f64>,
}

/// Builds CPU collaborators from configuration sections.
///
/// Sections: `model { in_features, out_features, seed }`,
/// `loss { learned_scale }`, `optimizer` (see [`SgdConfig`](super::SgdConfig)),
/// `dataset.*` (see [`SyntheticConfig`]), `meters { mae = {} }`.
#[derive(Clone)]
pub struct CpuFactory {
    group: Arc<dyn ProcessGroup<CpuBackend>>,
}

impl Default for CpuFactory {
    fn default() -> Self {
        Self {
            group: Arc::new(LocalGroup),
        }
    }
}

impl CpuFactory {
    pub fn with_group(group: Arc<dyn ProcessGroup<CpuBackend>>) -> Self {
        Self { group }
    }
}

impl ComponentFactory<CpuBackend> for CpuFactory {
    fn build_model(&self, config: &Value) -> anyhow::Result<Box<dyn Model<CpuBackend>>> {
        let config: ModelConfig = serde_json::from_value(config.clone())?;
        Ok(Box::new(LinearModel::new(
            config.in_features,
            config.out_features,
            config.seed,
        )))
    }

    fn build_loss(&self, config: &Value) -> anyhow::Result<Box<dyn Loss<CpuBackend>>> {
        let config: LossConfig = serde_json::from_value(config.clone())?;
        Ok(match config.learned_scale {
            Some(scale) => Box::new(MseLoss::with_learned_scale(scale)),
            None => Box::new(MseLoss::default()),
        })
    }

    fn build_optimizer(&self, config: &Value) -> anyhow::Result<Box<dyn Optimizer<CpuBackend>>> {
        Ok(Box::new(Sgd::from_value(config)?))
    }

    fn build_dataset(
        &self,
        config: &Value,
        phase_type: PhaseType,
    ) -> anyhow::Result<Box<dyn Dataset<CpuBackend>>> {
        let config: SyntheticConfig = serde_json::from_value(config.clone())?;
        let default_seed = match phase_type {
            PhaseType::Train => 0,
            PhaseType::Test => 1,
        };
        let dataset = SyntheticDataset::from_config(&config, default_seed)?
            .with_world_size(self.group.world_size());
        Ok(Box::new(dataset))
    }

    fn build_meters(&self, config: &Value) -> anyhow::Result<Vec<Box<dyn Meter<CpuBackend>>>> {
        let Some(sections) = config.as_object() else {
            anyhow::bail!("the meters section must be a table of meter names");
        };
        sections
            .keys()
            .map(|name| -> anyhow::Result<Box<dyn Meter<CpuBackend>>> {
                match name.as_str() {
                    MeanAbsoluteErrorMeter::NAME => Ok(Box::new(MeanAbsoluteErrorMeter::default())),
                    other => anyhow::bail!("unknown meter '{other}'"),
                }
            })
            .collect()
    }

    fn build_mixup(&self, _config: &MixupConfig) -> anyhow::Result<Box<dyn BatchTransform<CpuBackend>>> {
        Err(ConfigError::missing_backend("mixup").into())
    }

    fn process_group(&self) -> Arc<dyn ProcessGroup<CpuBackend>> {
        Arc::clone(&self.group)
    }
}
