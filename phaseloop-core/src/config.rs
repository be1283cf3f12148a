//! Task configuration.
//!
//! Uses `figment` for layered configuration: defaults -> TOML file ->
//! `PHASELOOP_` environment variables. Scalar options are typed here;
//! collaborator sections (`model`, `loss`, `optimizer`, `dataset.*`, `meters`,
//! `hooks`) are free-form and interpreted by a
//! [`ComponentFactory`](crate::builder::ComponentFactory).

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};

use crate::components::{AmpArgs, MpContext};
use crate::error::ConfigError;

/// How model buffers are kept consistent across replicas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastBuffersMode {
    /// No buffer synchronization.
    #[default]
    Disabled,
    /// Buffers are broadcast from the primary before every forward pass.
    ForwardPass,
    /// Buffers are broadcast once, when entering an eval phase.
    BeforeEval,
}

/// Synchronized batch normalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchNormSyncMode {
    #[default]
    Disabled,
    /// Conversion provided by the tensor backend itself.
    Native,
    /// Conversion provided by an optional third-party converter.
    ThirdParty,
}

/// Data-mixing augmentation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixupConfig {
    pub alpha: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_classes: Option<usize>,
}

/// Dataset sections per phase type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetConfigs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<Value>,
}

/// Top-level task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Number of epochs to run.
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    /// A test phase runs after every `test_phase_period` train phases.
    #[serde(default = "default_test_phase_period")]
    pub test_phase_period: usize,
    /// Only run test phases.
    #[serde(default)]
    pub test_only: bool,
    /// Place model, loss and batches on the accelerator. Defaults to whatever
    /// the backend reports as available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_accelerator: Option<bool>,
    /// Mixed-precision arguments; absent disables mixed precision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amp_args: Option<AmpArgs>,
    /// Data-mixing augmentation; absent disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mixup: Option<MixupConfig>,
    #[serde(default)]
    pub broadcast_buffers: BroadcastBuffersMode,
    #[serde(default)]
    pub batch_norm_sync_mode: BatchNormSyncMode,
    /// Allow models whose forward pass does not use every parameter.
    #[serde(default = "default_true")]
    pub find_unused_parameters: bool,
    /// Start method of data-loading workers.
    #[serde(default)]
    pub dataloader_mp_context: MpContext,
    /// Checkpoint to restore during `prepare()`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<PathBuf>,
    #[serde(default = "empty_section")]
    pub model: Value,
    #[serde(default = "empty_section")]
    pub loss: Value,
    #[serde(default = "empty_section")]
    pub optimizer: Value,
    #[serde(default)]
    pub dataset: DatasetConfigs,
    /// Meter sections keyed by meter name.
    #[serde(default = "empty_section")]
    pub meters: Value,
    #[serde(default)]
    pub hooks: Vec<Value>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            num_epochs: default_num_epochs(),
            test_phase_period: default_test_phase_period(),
            test_only: false,
            use_accelerator: None,
            amp_args: None,
            mixup: None,
            broadcast_buffers: BroadcastBuffersMode::default(),
            batch_norm_sync_mode: BatchNormSyncMode::default(),
            find_unused_parameters: true,
            dataloader_mp_context: MpContext::default(),
            checkpoint: None,
            model: empty_section(),
            loss: empty_section(),
            optimizer: empty_section(),
            dataset: DatasetConfigs::default(),
            meters: empty_section(),
            hooks: Vec::new(),
        }
    }
}

fn default_num_epochs() -> usize {
    1
}

fn default_test_phase_period() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn empty_section() -> Value {
    Value::Object(Default::default())
}

impl TaskConfig {
    /// Parse a configuration from a TOML string without layering.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TaskConfig =
            toml::from_str(content).map_err(|e| ConfigError::invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_epochs == 0 {
            return Err(ConfigError::invalid("num_epochs must be >= 1"));
        }
        if self.test_phase_period == 0 {
            return Err(ConfigError::invalid("test_phase_period must be >= 1"));
        }
        if self.dataset.test.is_none() {
            return Err(ConfigError::invalid("dataset.test is required"));
        }
        if !self.test_only && self.dataset.train.is_none() {
            return Err(ConfigError::invalid(
                "dataset.train is required unless test_only is set",
            ));
        }
        if let Some(mixup) = &self.mixup {
            if !mixup.alpha.is_finite() || mixup.alpha <= 0.0 {
                return Err(ConfigError::invalid("mixup.alpha must be > 0"));
            }
        }
        Ok(())
    }

    /// Train phases per epoch declared by the train dataset section
    /// (`phases_per_epoch`, default 1). Always 1 for test-only runs.
    pub fn train_phases_per_epoch(&self) -> f64 {
        if self.test_only {
            return 1.0;
        }
        self.dataset
            .train
            .as_ref()
            .and_then(|train| train.get("phases_per_epoch"))
            .and_then(Value::as_f64)
            .unwrap_or(1.0)
    }

    /// A small runnable configuration for the reference CPU backend.
    pub fn starter() -> Self {
        Self {
            num_epochs: 2,
            optimizer: json!({ "lr": 0.1, "momentum": 0.9 }),
            dataset: DatasetConfigs {
                train: Some(json!({ "num_samples": 64, "batch_size": 8 })),
                test: Some(json!({ "num_samples": 32, "batch_size": 8 })),
            },
            meters: json!({ "mae": {} }),
            hooks: vec![json!({ "name": "logging" })],
            ..Self::default()
        }
    }

    /// [`TaskConfig::starter`] rendered as TOML.
    pub fn starter_toml() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::starter()).map_err(|e| ConfigError::invalid(e.to_string()))
    }
}

/// Load a task configuration.
///
/// Layers (later wins): built-in defaults, the TOML file at `path` (if given),
/// then environment variables (`PHASELOOP_NUM_EPOCHS`,
/// `PHASELOOP_OPTIMIZER__LR`, ...). The result is validated.
pub fn load_config(path: Option<&Path>) -> Result<TaskConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(TaskConfig::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::invalid(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("PHASELOOP_").split("__"));

    let config: TaskConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
num_epochs = 3

[dataset.train]
num_samples = 32

[dataset.test]
num_samples = 16
"#;

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config = TaskConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.num_epochs, 3);
        assert_eq!(config.test_phase_period, 1);
        assert!(!config.test_only);
        assert!(config.find_unused_parameters);
        assert_eq!(config.broadcast_buffers, BroadcastBuffersMode::Disabled);
        assert_eq!(config.batch_norm_sync_mode, BatchNormSyncMode::Disabled);
        assert_eq!(config.dataloader_mp_context, MpContext::Spawn);
        assert!(config.amp_args.is_none());
        assert!(config.mixup.is_none());
    }

    #[test]
    fn test_enums_parse_snake_case() {
        let toml_str = format!(
            "broadcast_buffers = \"before_eval\"\nbatch_norm_sync_mode = \"third_party\"\ndataloader_mp_context = \"fork\"\n{MINIMAL}"
        );
        let config = TaskConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(config.broadcast_buffers, BroadcastBuffersMode::BeforeEval);
        assert_eq!(config.batch_norm_sync_mode, BatchNormSyncMode::ThirdParty);
        assert_eq!(config.dataloader_mp_context, MpContext::Fork);
    }

    #[test]
    fn test_amp_args_section() {
        let toml_str = format!("{MINIMAL}\n[amp_args]\nopt_level = \"O1\"\n");
        let config = TaskConfig::from_toml_str(&toml_str).unwrap();
        let amp = config.amp_args.unwrap();
        assert_eq!(amp.get("opt_level").and_then(Value::as_str), Some("O1"));
    }

    #[test]
    fn test_validation_rejects_zero_epochs() {
        let mut config = TaskConfig::from_toml_str(MINIMAL).unwrap();
        config.num_epochs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_period() {
        let mut config = TaskConfig::from_toml_str(MINIMAL).unwrap();
        config.test_phase_period = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_requires_train_dataset_unless_test_only() {
        let mut config = TaskConfig::from_toml_str(MINIMAL).unwrap();
        config.dataset.train = None;
        assert!(config.validate().is_err());
        config.test_only = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_mixup_without_positive_alpha() {
        let mut config = TaskConfig::from_toml_str(MINIMAL).unwrap();
        config.mixup = Some(MixupConfig {
            alpha: 0.0,
            num_classes: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mixup_section_requires_alpha_key() {
        let toml_str = format!("{MINIMAL}\n[mixup]\nnum_classes = 10\n");
        assert!(TaskConfig::from_toml_str(&toml_str).is_err());
    }

    #[test]
    fn test_train_phases_per_epoch() {
        let mut config = TaskConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.train_phases_per_epoch(), 1.0);

        config.dataset.train = Some(serde_json::json!({"phases_per_epoch": 4}));
        assert_eq!(config.train_phases_per_epoch(), 4.0);

        config.test_only = true;
        assert_eq!(config.train_phases_per_epoch(), 1.0);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "test_phase_period = 2\n{MINIMAL}").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.num_epochs, 3);
        assert_eq!(config.test_phase_period, 2);
        assert_eq!(
            config.dataset.test.unwrap().get("num_samples").and_then(Value::as_u64),
            Some(16)
        );
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config(Some(Path::new("nonexistent_task.toml")));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_starter_toml_is_valid() {
        let toml_str = TaskConfig::starter_toml().unwrap();
        let config = TaskConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(config.num_epochs, 2);
        assert_eq!(config.hooks.len(), 1);
        assert!(config.meters.get("mae").is_some());
    }
}
