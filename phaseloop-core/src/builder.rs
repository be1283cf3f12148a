//! Task construction.
//!
//! [`TaskBuilder`] takes fully built collaborators through explicit setters
//! and validates everything once in [`TaskBuilder::build`].
//! [`Task::from_config`] drives the builder from a [`TaskConfig`], asking a
//! [`ComponentFactory`] to turn each configuration section into a collaborator.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::backend::{Backend, LocalGroup, ProcessGroup};
use crate::components::{
    AmpArgs, BatchTransform, Dataset, Loss, Meter, MixedPrecision, Model, MpContext, Optimizer,
    SyncBatchNorm,
};
use crate::config::{BatchNormSyncMode, BroadcastBuffersMode, MixupConfig, TaskConfig};
use crate::error::{ConfigError, Result};
use crate::hooks::{CheckpointHook, Hook, LoggingHook};
use crate::phases::PhaseType;
use crate::replication::Replication;
use crate::task::{Task, TaskStatus};

/// Builds collaborators from configuration sections, and provides the
/// optional capabilities of the environment.
pub trait ComponentFactory<B: Backend> {
    fn build_model(&self, config: &Value) -> anyhow::Result<Box<dyn Model<B>>>;

    fn build_loss(&self, config: &Value) -> anyhow::Result<Box<dyn Loss<B>>>;

    /// `config` carries the injected `num_epochs` (epochs times train phases
    /// per epoch), which schedules are defined over.
    fn build_optimizer(&self, config: &Value) -> anyhow::Result<Box<dyn Optimizer<B>>>;

    fn build_dataset(&self, config: &Value, phase_type: PhaseType) -> anyhow::Result<Box<dyn Dataset<B>>>;

    fn build_meters(&self, config: &Value) -> anyhow::Result<Vec<Box<dyn Meter<B>>>>;

    fn build_mixup(&self, config: &MixupConfig) -> anyhow::Result<Box<dyn BatchTransform<B>>>;

    /// Builds the built-in hooks (`logging`, `checkpoint`) by default.
    fn build_hooks(&self, configs: &[Value]) -> anyhow::Result<Vec<Box<dyn Hook<B>>>> {
        configs.iter().map(builtin_hook).collect()
    }

    fn process_group(&self) -> Arc<dyn ProcessGroup<B>> {
        Arc::new(LocalGroup)
    }

    /// Mixed-precision backend, if one is installed.
    fn mixed_precision(&self) -> Option<Box<dyn MixedPrecision<B>>> {
        None
    }

    /// Third-party synchronized batch-norm converter, if one is installed.
    fn external_sync_batchnorm(&self) -> Option<Box<dyn SyncBatchNorm<B>>> {
        None
    }
}

/// Build one of the built-in hooks from a `{ name = "...", ... }` section.
pub fn builtin_hook<B: Backend>(config: &Value) -> anyhow::Result<Box<dyn Hook<B>>> {
    let name = config
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("hook section is missing a 'name': {config}"))?;
    match name {
        LoggingHook::NAME => Ok(Box::new(LoggingHook)),
        CheckpointHook::NAME => {
            let dir = config
                .get("dir")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("checkpoint hook requires a 'dir'"))?;
            let period = config.get("period").and_then(Value::as_u64).unwrap_or(1) as usize;
            Ok(Box::new(CheckpointHook::new(dir, period)))
        }
        other => anyhow::bail!("unknown hook '{other}'"),
    }
}

/// Step-by-step construction of a [`Task`].
pub struct TaskBuilder<B: Backend> {
    num_epochs: usize,
    test_phase_period: usize,
    test_only: bool,
    use_accelerator: Option<bool>,
    amp_args: Option<AmpArgs>,
    mixup: Option<Box<dyn BatchTransform<B>>>,
    broadcast_buffers: BroadcastBuffersMode,
    batch_norm_sync_mode: BatchNormSyncMode,
    find_unused_parameters: bool,
    dataloader_mp_context: MpContext,
    checkpoint: Option<PathBuf>,
    config: Option<Value>,
    model: Option<Box<dyn Model<B>>>,
    loss: Option<Box<dyn Loss<B>>>,
    optimizer: Option<Box<dyn Optimizer<B>>>,
    datasets: BTreeMap<PhaseType, Box<dyn Dataset<B>>>,
    meters: Vec<Box<dyn Meter<B>>>,
    hooks: Vec<Box<dyn Hook<B>>>,
    amp: Option<Box<dyn MixedPrecision<B>>>,
    sync_batchnorm: Option<Box<dyn SyncBatchNorm<B>>>,
    process_group: Arc<dyn ProcessGroup<B>>,
}

impl<B: Backend> Default for TaskBuilder<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> TaskBuilder<B> {
    pub fn new() -> Self {
        Self {
            num_epochs: 1,
            test_phase_period: 1,
            test_only: false,
            use_accelerator: None,
            amp_args: None,
            mixup: None,
            broadcast_buffers: BroadcastBuffersMode::Disabled,
            batch_norm_sync_mode: BatchNormSyncMode::Disabled,
            find_unused_parameters: true,
            dataloader_mp_context: MpContext::Spawn,
            checkpoint: None,
            config: None,
            model: None,
            loss: None,
            optimizer: None,
            datasets: BTreeMap::new(),
            meters: Vec::new(),
            hooks: Vec::new(),
            amp: None,
            sync_batchnorm: None,
            process_group: Arc::new(LocalGroup),
        }
    }

    pub fn num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    pub fn test_phase_period(mut self, period: usize) -> Self {
        self.test_phase_period = period;
        self
    }

    pub fn test_only(mut self, test_only: bool) -> Self {
        self.test_only = test_only;
        self
    }

    /// Defaults to whether the backend has an accelerator.
    pub fn use_accelerator(mut self, use_accelerator: bool) -> Self {
        self.use_accelerator = Some(use_accelerator);
        self
    }

    /// `None` disables mixed precision.
    pub fn amp_args(mut self, amp_args: Option<AmpArgs>) -> Self {
        self.amp_args = amp_args;
        self
    }

    pub fn mixed_precision(mut self, backend: Option<Box<dyn MixedPrecision<B>>>) -> Self {
        self.amp = backend;
        self
    }

    /// `None` disables data mixing.
    pub fn mixup(mut self, transform: Option<Box<dyn BatchTransform<B>>>) -> Self {
        self.mixup = transform;
        self
    }

    pub fn broadcast_buffers(mut self, mode: BroadcastBuffersMode) -> Self {
        self.broadcast_buffers = mode;
        self
    }

    pub fn batch_norm_sync_mode(mut self, mode: BatchNormSyncMode) -> Self {
        self.batch_norm_sync_mode = mode;
        self
    }

    pub fn sync_batchnorm_backend(mut self, converter: Option<Box<dyn SyncBatchNorm<B>>>) -> Self {
        self.sync_batchnorm = converter;
        self
    }

    pub fn find_unused_parameters(mut self, find_unused_parameters: bool) -> Self {
        self.find_unused_parameters = find_unused_parameters;
        self
    }

    pub fn dataloader_mp_context(mut self, context: MpContext) -> Self {
        self.dataloader_mp_context = context;
        self
    }

    /// Checkpoint file or directory restored during `prepare()`.
    pub fn checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }

    /// Configuration recorded in checkpoints and shown by `Display`.
    pub fn config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }

    pub fn model(mut self, model: Box<dyn Model<B>>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn loss(mut self, loss: Box<dyn Loss<B>>) -> Self {
        self.loss = Some(loss);
        self
    }

    pub fn optimizer(mut self, optimizer: Box<dyn Optimizer<B>>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn dataset(mut self, phase_type: PhaseType, dataset: Box<dyn Dataset<B>>) -> Self {
        self.datasets.insert(phase_type, dataset);
        self
    }

    pub fn meter(mut self, meter: Box<dyn Meter<B>>) -> Self {
        self.meters.push(meter);
        self
    }

    pub fn meters(mut self, meters: Vec<Box<dyn Meter<B>>>) -> Self {
        self.meters = meters;
        self
    }

    pub fn hook(mut self, hook: Box<dyn Hook<B>>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn hooks(mut self, hooks: Vec<Box<dyn Hook<B>>>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn process_group(mut self, group: Arc<dyn ProcessGroup<B>>) -> Self {
        self.process_group = group;
        self
    }

    /// Validate the configuration and assemble an unprepared task.
    pub fn build(self) -> Result<Task<B>> {
        if self.num_epochs == 0 {
            return Err(ConfigError::invalid("num_epochs must be >= 1").into());
        }
        if self.test_phase_period == 0 {
            return Err(ConfigError::invalid("test_phase_period must be >= 1").into());
        }

        let model = self.model.ok_or_else(|| ConfigError::invalid("a model is required"))?;
        let loss = self.loss.ok_or_else(|| ConfigError::invalid("a loss is required"))?;
        let optimizer = self
            .optimizer
            .ok_or_else(|| ConfigError::invalid("an optimizer is required"))?;

        if !self.datasets.contains_key(&PhaseType::Test) {
            return Err(ConfigError::invalid("a test dataset is required").into());
        }
        if !self.test_only && !self.datasets.contains_key(&PhaseType::Train) {
            return Err(ConfigError::invalid("a train dataset is required unless test_only is set").into());
        }

        let mut names = HashSet::new();
        for hook in &self.hooks {
            if !names.insert(hook.name().to_string()) {
                return Err(ConfigError::invalid(format!(
                    "hook names must be unique, '{}' is used twice",
                    hook.name()
                ))
                .into());
            }
        }

        let use_accelerator = match self.use_accelerator {
            Some(true) if !B::accelerator_available() => {
                return Err(ConfigError::AcceleratorUnavailable.into());
            }
            Some(requested) => requested,
            None => B::accelerator_available(),
        };

        match &self.amp_args {
            None => info!("AMP disabled"),
            Some(args) => {
                if self.amp.is_none() {
                    return Err(ConfigError::missing_backend("Mixed precision").into());
                }
                let args = Value::Object(args.clone());
                info!(args = %args, "AMP enabled");
            }
        }

        if self.mixup.is_some() {
            info!("mixup enabled");
        } else {
            info!("mixup disabled");
        }

        match self.batch_norm_sync_mode {
            BatchNormSyncMode::Disabled => info!("Synchronized Batch Normalization is disabled"),
            BatchNormSyncMode::Native => info!("Using native synchronized batch normalization"),
            BatchNormSyncMode::ThirdParty => {
                if self.sync_batchnorm.is_none() {
                    return Err(
                        ConfigError::missing_backend("Third-party synchronized batch norm").into(),
                    );
                }
                info!("Using third-party synchronized batch normalization");
            }
        }

        if self.amp.is_some() && self.amp_args.is_none() {
            warn!("A mixed-precision backend was provided without amp_args; it will not be used");
        }

        let replication = Replication::new(
            self.process_group,
            self.broadcast_buffers,
            self.find_unused_parameters,
        );

        Ok(Task {
            num_epochs: self.num_epochs,
            test_phase_period: self.test_phase_period,
            test_only: self.test_only,
            use_accelerator,
            amp_args: self.amp_args,
            batch_norm_sync_mode: self.batch_norm_sync_mode,
            dataloader_mp_context: self.dataloader_mp_context,
            checkpoint_path: self.checkpoint,
            pending_state: None,
            config: self.config,
            model,
            loss,
            optimizer,
            datasets: self.datasets,
            meters: self.meters,
            hooks: self.hooks,
            mixup: self.mixup,
            amp: self.amp,
            sync_batchnorm: self.sync_batchnorm,
            replication,
            status: TaskStatus::Unprepared,
            phases: Vec::new(),
            phase_idx: -1,
            train_phase_idx: -1,
            train: !self.test_only,
            num_updates: 0,
            losses: Vec::new(),
            perf_log: Vec::new(),
            dataloaders: BTreeMap::new(),
            data_iterator: None,
            last_batch: None,
            phase_start: None,
            train_timer_start: None,
        })
    }
}

impl<B: Backend> Task<B> {
    /// Build a task from configuration.
    ///
    /// The optimizer section receives `num_epochs` = epochs times the train
    /// dataset's phases per epoch. Test-only runs build only the test dataset.
    pub fn from_config(config: &TaskConfig, factory: &dyn ComponentFactory<B>) -> Result<Self> {
        config.validate()?;

        let mut datasets = BTreeMap::new();
        if let Some(test) = &config.dataset.test {
            datasets.insert(PhaseType::Test, factory.build_dataset(test, PhaseType::Test)?);
        }
        if !config.test_only {
            if let Some(train) = &config.dataset.train {
                datasets.insert(PhaseType::Train, factory.build_dataset(train, PhaseType::Train)?);
            }
        }

        let train_phases_per_epoch = datasets
            .get(&PhaseType::Train)
            .map_or(1.0, |dataset| dataset.phases_per_epoch());
        let mut optimizer_config = config.optimizer.clone();
        let Value::Object(section) = &mut optimizer_config else {
            return Err(ConfigError::invalid("the optimizer section must be a table").into());
        };
        section.insert(
            "num_epochs".to_string(),
            json!(config.num_epochs as f64 * train_phases_per_epoch),
        );

        let mixup = config
            .mixup
            .as_ref()
            .map(|mixup| factory.build_mixup(mixup))
            .transpose()?;
        let amp = config
            .amp_args
            .as_ref()
            .and_then(|_| factory.mixed_precision());
        let sync_batchnorm = match config.batch_norm_sync_mode {
            BatchNormSyncMode::ThirdParty => factory.external_sync_batchnorm(),
            _ => None,
        };
        let recorded = serde_json::to_value(config).map_err(|e| ConfigError::invalid(e.to_string()))?;

        let mut builder = TaskBuilder::new()
            .num_epochs(config.num_epochs)
            .test_phase_period(config.test_phase_period)
            .test_only(config.test_only)
            .amp_args(config.amp_args.clone())
            .mixed_precision(amp)
            .mixup(mixup)
            .broadcast_buffers(config.broadcast_buffers)
            .batch_norm_sync_mode(config.batch_norm_sync_mode)
            .sync_batchnorm_backend(sync_batchnorm)
            .find_unused_parameters(config.find_unused_parameters)
            .dataloader_mp_context(config.dataloader_mp_context)
            .model(factory.build_model(&config.model)?)
            .loss(factory.build_loss(&config.loss)?)
            .optimizer(factory.build_optimizer(&optimizer_config)?)
            .meters(factory.build_meters(&config.meters)?)
            .hooks(factory.build_hooks(&config.hooks)?)
            .process_group(factory.process_group())
            .config(recorded);
        for (phase_type, dataset) in datasets {
            builder = builder.dataset(phase_type, dataset);
        }
        if let Some(accelerator) = config.use_accelerator {
            builder = builder.use_accelerator(accelerator);
        }
        if let Some(path) = &config.checkpoint {
            builder = builder.checkpoint(path);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{CpuBackend, CpuFactory, LinearModel, MseLoss, Sgd, SyntheticDataset};
    use crate::error::TaskError;

    fn builder() -> TaskBuilder<CpuBackend> {
        TaskBuilder::new()
            .model(Box::new(LinearModel::new(2, 1, 0)))
            .loss(Box::new(MseLoss::default()))
            .optimizer(Box::new(Sgd::new(0.1)))
            .dataset(PhaseType::Train, Box::new(SyntheticDataset::new(16, 4, 2, 1)))
            .dataset(PhaseType::Test, Box::new(SyntheticDataset::new(8, 4, 2, 2)))
    }

    fn config_error(result: Result<Task<CpuBackend>>) -> ConfigError {
        match result {
            Err(TaskError::Config(err)) => err,
            Err(other) => panic!("expected a configuration error, got {other}"),
            Ok(_) => panic!("expected a configuration error"),
        }
    }

    #[test]
    fn test_build_defaults() {
        let task = builder().build().unwrap();
        assert_eq!(task.status(), TaskStatus::Unprepared);
        assert_eq!(task.phase_idx(), -1);
        assert_eq!(task.train_phase_idx(), -1);
        assert_eq!(task.num_updates(), 0);
        assert!(!task.use_accelerator());
        assert!(!task.amp_enabled());
        assert!(!task.is_distributed());
    }

    #[test]
    fn test_build_rejects_zero_epochs() {
        let err = config_error(builder().num_epochs(0).build());
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_build_requires_train_dataset() {
        let result = TaskBuilder::<CpuBackend>::new()
            .model(Box::new(LinearModel::new(2, 1, 0)))
            .loss(Box::new(MseLoss::default()))
            .optimizer(Box::new(Sgd::new(0.1)))
            .dataset(PhaseType::Test, Box::new(SyntheticDataset::new(8, 4, 2, 2)))
            .build();
        assert!(matches!(config_error(result), ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_build_rejects_duplicate_hook_names() {
        let result = builder()
            .hook(Box::new(LoggingHook))
            .hook(Box::new(LoggingHook))
            .build();
        assert!(matches!(config_error(result), ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_build_amp_without_backend() {
        let result = builder().amp_args(Some(AmpArgs::new())).build();
        assert!(matches!(
            config_error(result),
            ConfigError::MissingBackend { .. }
        ));
    }

    #[test]
    fn test_build_third_party_sync_bn_without_converter() {
        let result = builder()
            .batch_norm_sync_mode(BatchNormSyncMode::ThirdParty)
            .build();
        assert!(matches!(
            config_error(result),
            ConfigError::MissingBackend { .. }
        ));
    }

    #[test]
    fn test_build_accelerator_unavailable() {
        let result = builder().use_accelerator(true).build();
        assert!(matches!(
            config_error(result),
            ConfigError::AcceleratorUnavailable
        ));
    }

    #[test]
    fn test_builtin_hooks() {
        let hooks: Vec<Box<dyn Hook<CpuBackend>>> = [
            json!({"name": "logging"}),
            json!({"name": "checkpoint", "dir": "/tmp/ckpt", "period": 2}),
        ]
        .iter()
        .map(builtin_hook)
        .collect::<anyhow::Result<_>>()
        .unwrap();
        let names: Vec<&str> = hooks.iter().map(|h| h.name()).collect();
        assert_eq!(names, vec!["logging", "checkpoint"]);

        assert!(builtin_hook::<CpuBackend>(&json!({"name": "nope"})).is_err());
        assert!(builtin_hook::<CpuBackend>(&json!({"name": "checkpoint"})).is_err());
        assert!(builtin_hook::<CpuBackend>(&json!({})).is_err());
    }

    #[test]
    fn test_from_config_test_only_skips_train_dataset() {
        let config = TaskConfig::from_toml_str(
            r#"
num_epochs = 2
test_only = true

[dataset.test]
num_samples = 8
batch_size = 4
"#,
        )
        .unwrap();
        let mut task = Task::from_config(&config, &CpuFactory::default()).unwrap();
        assert!(task.test_only());
        assert!(!task.datasets.contains_key(&PhaseType::Train));
        task.prepare().unwrap();
        assert_eq!(task.total_test_phases(), 2);
        assert_eq!(task.total_training_phases(), 0);
    }

    #[test]
    fn test_from_config_mixup_unsupported_by_cpu_factory() {
        let config = TaskConfig::from_toml_str(
            r#"
[mixup]
alpha = 0.2

[dataset.train]
num_samples = 8

[dataset.test]
num_samples = 8
"#,
        )
        .unwrap();
        let result = Task::from_config(&config, &CpuFactory::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_display_shows_config() {
        let config = TaskConfig::from_toml_str(
            r#"
num_epochs = 3

[dataset.train]
num_samples = 8

[dataset.test]
num_samples = 8
"#,
        )
        .unwrap();
        let task = Task::from_config(&config, &CpuFactory::default()).unwrap();
        let shown = task.to_string();
        assert!(shown.contains("\"num_epochs\": 3"));

        let plain = builder().build().unwrap();
        assert!(plain.to_string().starts_with("Task(backend=cpu"));
    }
}
