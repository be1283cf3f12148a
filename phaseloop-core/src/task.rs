//! The task orchestrator.
//!
//! A [`Task`] owns every collaborator of a training run and exposes the
//! lifecycle entry points a trainer loop drives:
//!
//! ```text
//! Unprepared --prepare()--> Ready --on_start()--> Running --on_end()--> Done
//!                                  on_phase_start() / step()* / on_phase_end()
//! ```
//!
//! Every process of a distributed run must call these entry points the same
//! number of times in the same order. Steps live in [`crate::step`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::checkpoint::{self, TaskState};
use crate::components::{
    AmpArgs, BatchIter, BatchTransform, DataLoader, Dataset, LoaderOptions, Loss, Meter,
    MixedPrecision, Model, MpContext, Optimizer, SyncBatchNorm,
};
use crate::config::{BatchNormSyncMode, BroadcastBuffersMode};
use crate::error::{CheckpointError, ConfigError, ContractViolation, Result};
use crate::hooks::Hook;
use crate::phases::{self, Phase, PhasePlanSpec, PhaseType};
use crate::replication::Replication;
use crate::step::LastBatch;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Unprepared,
    Ready,
    Running,
    Done,
}

/// Which timer a performance sample was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerfTag {
    /// From the end of the phase-start hooks to the end of the phase.
    Train,
    /// From the start of the phase, hooks included.
    Total,
}

/// Throughput of one train phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfSample {
    pub tag: PerfTag,
    pub phase_idx: i64,
    pub epoch_duration: f64,
    pub im_per_sec: f64,
}

/// The aggregate root of a training run.
///
/// Built with [`TaskBuilder`](crate::builder::TaskBuilder) or
/// [`Task::from_config`](crate::builder).
pub struct Task<B: Backend> {
    // Configuration.
    pub(crate) num_epochs: usize,
    pub(crate) test_phase_period: usize,
    pub(crate) test_only: bool,
    pub(crate) use_accelerator: bool,
    pub(crate) amp_args: Option<AmpArgs>,
    pub(crate) batch_norm_sync_mode: BatchNormSyncMode,
    pub(crate) dataloader_mp_context: MpContext,
    pub(crate) checkpoint_path: Option<PathBuf>,
    pub(crate) pending_state: Option<TaskState>,
    pub(crate) config: Option<Value>,

    // Collaborators.
    pub(crate) model: Box<dyn Model<B>>,
    pub(crate) loss: Box<dyn Loss<B>>,
    pub(crate) optimizer: Box<dyn Optimizer<B>>,
    pub(crate) datasets: BTreeMap<PhaseType, Box<dyn Dataset<B>>>,
    pub(crate) meters: Vec<Box<dyn Meter<B>>>,
    pub(crate) hooks: Vec<Box<dyn Hook<B>>>,
    pub(crate) mixup: Option<Box<dyn BatchTransform<B>>>,
    pub(crate) amp: Option<Box<dyn MixedPrecision<B>>>,
    pub(crate) sync_batchnorm: Option<Box<dyn SyncBatchNorm<B>>>,
    pub(crate) replication: Replication<B>,

    // Runtime state.
    pub(crate) status: TaskStatus,
    pub(crate) phases: Vec<Phase>,
    pub(crate) phase_idx: i64,
    pub(crate) train_phase_idx: i64,
    pub(crate) train: bool,
    pub(crate) num_updates: u64,
    pub(crate) losses: Vec<f64>,
    pub(crate) perf_log: Vec<PerfSample>,
    pub(crate) dataloaders: BTreeMap<PhaseType, Box<dyn DataLoader<B>>>,
    pub(crate) data_iterator: Option<BatchIter<B>>,
    pub(crate) last_batch: Option<LastBatch<B>>,
    pub(crate) phase_start: Option<Instant>,
    pub(crate) train_timer_start: Option<Instant>,
}

impl<B: Backend> Task<B> {
    /// Build the phase plan and dataloaders, place and bind the model, then
    /// restore any configured checkpoint and initialize replication.
    pub fn prepare(&mut self) -> Result<()> {
        self.phases = phases::build_phases(&self.plan_spec())?;
        info!(
            phases = %phases::describe(&self.phases),
            train_phases = self.total_training_phases(),
            test_phases = self.total_test_phases(),
            "Built phase plan"
        );

        self.dataloaders = self.build_dataloaders()?;

        match self.batch_norm_sync_mode {
            BatchNormSyncMode::Disabled => {}
            BatchNormSyncMode::Native => {
                info!("Converting batch norm to synchronized batch norm");
                B::convert_sync_batchnorm(self.model.as_mut())?;
            }
            BatchNormSyncMode::ThirdParty => {
                let converter = self
                    .sync_batchnorm
                    .as_ref()
                    .ok_or_else(|| ConfigError::missing_backend("Third-party synchronized batch norm"))?;
                info!("Converting batch norm with the third-party converter");
                converter.convert(self.model.as_mut())?;
            }
        }

        if self.use_accelerator {
            debug!(backend = B::name(), "Moving model and loss to the accelerator");
            self.model.to_device(true)?;
            self.loss.to_device(true)?;
        }

        self.optimizer.init(self.model.as_mut(), self.loss.as_mut())?;

        // Mixed precision patches model and optimizer and has checkpointed
        // state of its own, so it must come before restoration.
        if let Some(args) = &self.amp_args {
            let amp = self
                .amp
                .as_mut()
                .ok_or_else(|| ConfigError::missing_backend("Mixed precision"))?;
            amp.initialize(self.model.as_mut(), self.optimizer.as_mut(), args)?;
        }

        let restored = match (self.pending_state.take(), &self.checkpoint_path) {
            (Some(state), _) => Some(state),
            (None, Some(path)) => Some(checkpoint::load_and_broadcast(path, self.replication.group())?),
            (None, None) => None,
        };
        if let Some(state) = restored {
            self.set_state(&state)
                .map_err(|e| CheckpointError::RestoreFailed {
                    message: e.to_string(),
                })?;
            info!(
                phase_idx = self.phase_idx,
                num_updates = self.num_updates,
                "Restored task state from checkpoint"
            );
        }

        self.replication.init(self.model.as_mut(), self.loss.as_mut())?;
        self.status = TaskStatus::Ready;
        Ok(())
    }

    pub fn on_start(&mut self) -> Result<()> {
        self.require_prepared("on_start")?;
        self.status = TaskStatus::Running;
        for hook in &self.hooks {
            hook.on_start(self)?;
        }
        Ok(())
    }

    pub fn on_phase_start(&mut self) -> Result<()> {
        self.require_prepared("on_phase_start")?;
        self.phase_start = Some(Instant::now());
        self.advance_phase()?;
        for hook in &self.hooks {
            hook.on_phase_start(self)?;
        }
        self.train_timer_start = Some(Instant::now());
        Ok(())
    }

    pub fn on_phase_end(&mut self) -> Result<()> {
        self.log_phase_end(PerfTag::Train)?;

        let group = self.replication.group();
        for meter in &mut self.meters {
            meter.sync_state(group)?;
        }
        // No process may enter the next phase's collectives before every
        // peer is done with this one.
        self.replication.barrier()?;

        for hook in &self.hooks {
            hook.on_phase_end(self)?;
        }
        self.perf_log.clear();
        self.log_phase_end(PerfTag::Total)?;
        Ok(())
    }

    pub fn on_end(&mut self) -> Result<()> {
        for hook in &self.hooks {
            hook.on_end(self)?;
        }
        self.status = TaskStatus::Done;
        Ok(())
    }

    /// Whether the last phase of the plan has started.
    pub fn done_training(&self) -> bool {
        self.phase_idx + 1 >= self.phases.len() as i64
    }

    /// Move to the next phase of the plan.
    ///
    /// Resets meters and loss history, rebuilds the dataloader and iterator,
    /// switches model and loss mode, and applies the eval buffer broadcast
    /// and per-epoch schedule update where they apply.
    pub fn advance_phase(&mut self) -> Result<()> {
        debug!("Advancing phase");
        let next_idx = self.phase_idx + 1;
        let phase = *usize::try_from(next_idx)
            .ok()
            .and_then(|idx| self.phases.get(idx))
            .ok_or(ContractViolation::PhaseOutOfRange {
                index: next_idx,
                len: self.phases.len(),
            })?;

        for meter in &mut self.meters {
            meter.reset();
        }
        self.losses.clear();

        self.phase_idx = next_idx;
        self.train = phase.train;
        if self.train {
            self.train_phase_idx += 1;
        }

        self.recreate_data_loader()?;
        self.create_data_iterator()?;
        self.set_model_train_mode()?;

        if self.train && self.train_phase_idx > 0 {
            let progress = self.progress()?;
            self.optimizer.update_schedule_on_epoch(progress)?;
        }

        debug!(
            phase_idx = self.phase_idx,
            train_phase_idx = self.train_phase_idx,
            phase_type = %self.phase_type(),
            "Started phase"
        );
        Ok(())
    }

    /// Fraction of the run completed, in `[0, 1)`.
    ///
    /// Counted in steps over the phases of the current mode (train phases, or
    /// test phases for test-only runs). A value outside `[0, 1)` means the plan
    /// and the iterator disagree on counts and is reported as a contract
    /// violation rather than clamped.
    pub fn progress(&self) -> Result<f64> {
        let num_batches = self.num_batches_per_phase()?;
        if num_batches == 0 {
            return Err(ContractViolation::EmptyPhase.into());
        }
        let current_step = self.num_updates as f64 / self.global_batchsize()? as f64;
        let num_phases = if self.test_only {
            self.total_test_phases()
        } else {
            self.total_training_phases()
        };
        let value = current_step / (num_phases as f64 * num_batches as f64);
        if !(0.0..1.0).contains(&value) {
            return Err(ContractViolation::InvalidProgress { value }.into());
        }
        Ok(value)
    }

    /// Snapshot of the full task state. Every field is an independent copy.
    pub fn get_state(&self) -> Result<TaskState> {
        let meters = self
            .meters
            .iter()
            .map(|meter| meter.get_state())
            .collect::<anyhow::Result<Vec<_>>>()?;
        let mut hooks = BTreeMap::new();
        for hook in &self.hooks {
            hooks.insert(hook.name().to_string(), hook.get_state()?);
        }
        let loss = if self.loss.supports_state() {
            Some(self.loss.get_state()?)
        } else {
            None
        };
        let amp = match (&self.amp_args, &self.amp) {
            (Some(_), Some(amp)) => Some(amp.state_dict()?),
            _ => None,
        };

        Ok(TaskState {
            train: self.train,
            base_model: self.model.get_state()?,
            meters,
            optimizer: self.optimizer.get_state()?,
            phase_idx: self.phase_idx,
            train_phase_idx: self.train_phase_idx,
            num_updates: self.num_updates,
            losses: self.losses.clone(),
            hooks,
            loss,
            amp,
        })
    }

    /// Restore a snapshot produced by [`Task::get_state`].
    ///
    /// Test-only tasks keep their own counters and meters and always resume
    /// in eval mode. Hooks missing from the snapshot keep their current state.
    /// Dataloader, iterator and module modes are rebuilt for the restored
    /// phase.
    pub fn set_state(&mut self, state: &TaskState) -> Result<()> {
        self.train = !self.test_only && state.train;
        if !self.test_only {
            self.phase_idx = state.phase_idx;
            self.num_updates = state.num_updates;
            self.losses = state.losses.clone();
            self.train_phase_idx = state.train_phase_idx;
            for (meter, meter_state) in self.meters.iter_mut().zip(&state.meters) {
                meter.set_state(meter_state)?;
            }
        }

        self.model.set_state(&state.base_model)?;
        self.optimizer.set_state(&state.optimizer)?;

        if let Some(loss_state) = &state.loss {
            if self.loss.supports_state() {
                self.loss.set_state(loss_state)?;
            }
        }

        if let (Some(amp_state), Some(amp)) = (&state.amp, self.amp.as_mut()) {
            if self.amp_args.is_some() {
                amp.load_state_dict(amp_state)?;
            }
        }

        for hook in &mut self.hooks {
            match state.hooks.get(hook.name()) {
                Some(hook_state) => hook.set_state(hook_state)?,
                None => warn!(hook = hook.name(), "No state found for hook"),
            }
        }

        self.recreate_data_loader()?;
        self.create_data_iterator()?;
        self.set_model_train_mode()
    }

    /// Restore `state` during the next [`Task::prepare`] instead of reading a
    /// checkpoint from disk.
    pub fn set_checkpoint_state(&mut self, state: TaskState) {
        self.pending_state = Some(state);
    }

    /// Checkpoint to restore during [`Task::prepare`].
    pub fn set_checkpoint(&mut self, path: impl Into<PathBuf>) {
        self.checkpoint_path = Some(path.into());
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn phase_idx(&self) -> i64 {
        self.phase_idx
    }

    pub fn train_phase_idx(&self) -> i64 {
        self.train_phase_idx
    }

    /// Index of the current phase among test phases.
    pub fn eval_phase_idx(&self) -> i64 {
        self.phase_idx - self.train_phase_idx - 1
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    pub fn losses(&self) -> &[f64] {
        &self.losses
    }

    pub fn perf_log(&self) -> &[PerfSample] {
        &self.perf_log
    }

    pub fn is_train(&self) -> bool {
        self.train
    }

    pub fn phase_type(&self) -> PhaseType {
        PhaseType::from_train(self.train)
    }

    pub fn test_only(&self) -> bool {
        self.test_only
    }

    pub fn num_epochs(&self) -> usize {
        self.num_epochs
    }

    pub fn test_phase_period(&self) -> usize {
        self.test_phase_period
    }

    pub fn use_accelerator(&self) -> bool {
        self.use_accelerator
    }

    pub fn amp_enabled(&self) -> bool {
        self.amp_args.is_some()
    }

    pub fn mixup_enabled(&self) -> bool {
        self.mixup.is_some()
    }

    pub fn batch_norm_sync_mode(&self) -> BatchNormSyncMode {
        self.batch_norm_sync_mode
    }

    pub fn total_training_phases(&self) -> usize {
        phases::count_train(&self.phases)
    }

    pub fn total_test_phases(&self) -> usize {
        phases::count_test(&self.phases)
    }

    pub fn model(&self) -> &dyn Model<B> {
        self.model.as_ref()
    }

    pub fn loss(&self) -> &dyn Loss<B> {
        self.loss.as_ref()
    }

    pub fn optimizer(&self) -> &dyn Optimizer<B> {
        self.optimizer.as_ref()
    }

    pub fn meters(&self) -> &[Box<dyn Meter<B>>] {
        &self.meters
    }

    pub fn hooks(&self) -> &[Box<dyn Hook<B>>] {
        &self.hooks
    }

    pub fn replication(&self) -> &Replication<B> {
        &self.replication
    }

    pub fn is_distributed(&self) -> bool {
        self.replication.is_distributed()
    }

    pub fn is_primary(&self) -> bool {
        self.replication.group().is_primary()
    }

    /// The most recent step's batch, output and reported loss. `None` before
    /// the first step and while a step is running.
    pub fn last_batch(&self) -> Option<&LastBatch<B>> {
        self.last_batch.as_ref()
    }

    /// Configuration the task was built from, if it was built from one.
    pub fn config(&self) -> Option<&Value> {
        self.config.as_ref()
    }

    /// Batch count of the current phase's dataloader.
    pub fn num_batches_per_phase(&self) -> Result<usize> {
        Ok(self.current_loader()?.len())
    }

    pub fn batchsize_per_replica(&self) -> Result<usize> {
        Ok(self.current_dataset()?.batchsize_per_replica())
    }

    pub fn global_batchsize(&self) -> Result<usize> {
        Ok(self.current_dataset()?.global_batchsize())
    }

    /// Average reported loss of the current phase, per sample.
    pub fn average_loss(&self) -> Option<f64> {
        let per_replica = self.current_dataset().ok()?.batchsize_per_replica();
        let samples = (self.losses.len() * per_replica) as f64;
        (samples > 0.0).then(|| self.losses.iter().sum::<f64>() / samples)
    }

    pub(crate) fn require_prepared(&self, operation: &str) -> Result<()> {
        if self.status == TaskStatus::Unprepared {
            return Err(ContractViolation::NotPrepared {
                operation: operation.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn plan_spec(&self) -> PhasePlanSpec {
        let phases_per_epoch = if self.test_only {
            1.0
        } else {
            self.datasets
                .get(&PhaseType::Train)
                .map_or(1.0, |dataset| dataset.phases_per_epoch())
        };
        PhasePlanSpec {
            num_epochs: self.num_epochs,
            phases_per_epoch,
            test_phase_period: self.test_phase_period,
            test_only: self.test_only,
        }
    }

    fn default_loader_options(&self) -> LoaderOptions {
        LoaderOptions {
            num_workers: None,
            pin_memory: self.use_accelerator && B::device_count() > 1,
            mp_context: Some(self.dataloader_mp_context),
            current_phase_id: 0,
        }
    }

    fn build_dataloaders(&self) -> Result<BTreeMap<PhaseType, Box<dyn DataLoader<B>>>> {
        let options = self.default_loader_options();
        let mut loaders = BTreeMap::new();
        for (phase_type, dataset) in &self.datasets {
            loaders.insert(*phase_type, dataset.iterator(&options)?);
        }
        Ok(loaders)
    }

    fn current_dataset(&self) -> Result<&dyn Dataset<B>> {
        let phase_type = self.phase_type();
        self.datasets
            .get(&phase_type)
            .map(|dataset| dataset.as_ref())
            .ok_or_else(|| missing_dataset(phase_type))
    }

    fn current_loader(&self) -> Result<&dyn DataLoader<B>> {
        let phase_type = self.phase_type();
        self.dataloaders
            .get(&phase_type)
            .map(|loader| loader.as_ref())
            .ok_or_else(|| missing_dataset(phase_type))
    }

    /// Rebuild the current phase type's dataloader, keeping the previous
    /// loader's worker settings and recomputing the phase id.
    fn recreate_data_loader(&mut self) -> Result<()> {
        let phase_type = self.phase_type();
        let mut options = self
            .dataloaders
            .get(&phase_type)
            .map(|loader| loader.options().clone())
            .unwrap_or_else(|| self.default_loader_options());
        options.current_phase_id = match phase_type {
            PhaseType::Train => self.train_phase_idx.max(0) as usize,
            PhaseType::Test => 0,
        };
        let loader = self.current_dataset()?.iterator(&options)?;
        self.dataloaders.insert(phase_type, loader);
        Ok(())
    }

    fn create_data_iterator(&mut self) -> Result<()> {
        let iterator = self.current_loader()?.iter()?;
        self.data_iterator = Some(iterator);
        Ok(())
    }

    /// Put model and loss in the current phase's mode. Entering eval under
    /// [`BroadcastBuffersMode::BeforeEval`] also syncs model buffers from the
    /// primary process.
    fn set_model_train_mode(&mut self) -> Result<()> {
        let train = usize::try_from(self.phase_idx)
            .ok()
            .and_then(|idx| self.phases.get(idx))
            .map_or(self.train, |phase| phase.train);
        self.model.train(train);
        self.loss.train(train);

        if !train && self.replication.mode() == BroadcastBuffersMode::BeforeEval {
            self.replication.broadcast_buffers(self.model.as_mut())?;
        }
        Ok(())
    }

    fn log_phase_end(&mut self, tag: PerfTag) -> Result<()> {
        if !self.train {
            return Ok(());
        }
        let start = match tag {
            PerfTag::Train => self.train_timer_start,
            PerfTag::Total => self.phase_start,
        };
        let Some(start) = start else {
            return Ok(());
        };
        let epoch_duration = start.elapsed().as_secs_f64();
        let images = (self.global_batchsize()? * self.num_batches_per_phase()?) as f64;
        let im_per_sec = if epoch_duration > 0.0 {
            images / epoch_duration
        } else {
            0.0
        };
        let sample = PerfSample {
            tag,
            phase_idx: self.train_phase_idx,
            epoch_duration,
            im_per_sec,
        };
        debug!(
            tag = ?sample.tag,
            phase_idx = sample.phase_idx,
            epoch_duration = sample.epoch_duration,
            im_per_sec = sample.im_per_sec,
            "Phase throughput"
        );
        self.perf_log.push(sample);
        Ok(())
    }
}

fn missing_dataset(phase_type: PhaseType) -> crate::error::TaskError {
    ContractViolation::MissingDataset {
        phase_type: phase_type.to_string(),
    }
    .into()
}

impl<B: Backend> fmt::Display for Task<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(config) = &self.config {
            if let Ok(pretty) = serde_json::to_string_pretty(config) {
                return f.write_str(&pretty);
            }
        }
        write!(
            f,
            "Task(backend={}, num_epochs={}, test_phase_period={}, test_only={}, phase_idx={}, status={:?})",
            B::name(),
            self.num_epochs,
            self.test_phase_period,
            self.test_only,
            self.phase_idx,
            self.status
        )
    }
}

impl<B: Backend> fmt::Debug for Task<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("status", &self.status)
            .field("phase_idx", &self.phase_idx)
            .field("train_phase_idx", &self.train_phase_idx)
            .field("num_updates", &self.num_updates)
            .field("phases", &self.phases.len())
            .field("replication", &self.replication)
            .finish_non_exhaustive()
    }
}
