//! # phaseloop core
//!
//! Orchestration of phased training runs: a plan of alternating train and
//! test phases, a task that owns model, loss, optimizer, datasets, meters and
//! hooks and drives them through that plan, optional multi-process
//! replication, and checkpoint save/restore.
//!
//! Numeric work is delegated to a [`Backend`]; the [`cpu`] module provides a
//! small reference backend.

pub mod backend;
pub mod builder;
pub mod checkpoint;
pub mod components;
pub mod config;
pub mod cpu;
pub mod error;
pub mod hooks;
pub mod phases;
pub mod replication;
pub mod step;
pub mod task;
pub mod trainer;

pub use backend::{Backend, INPUT_KEY, LocalGroup, ProcessGroup, Sample, TARGET_KEY};
pub use builder::{ComponentFactory, TaskBuilder};
pub use checkpoint::{CheckpointFile, TaskState, load_checkpoint, save_checkpoint};
pub use config::{BatchNormSyncMode, BroadcastBuffersMode, TaskConfig, load_config};
pub use error::{CheckpointError, ConfigError, ContractViolation, Result, TaskError};
pub use hooks::{CheckpointHook, Hook, LoggingHook};
pub use phases::{Phase, PhasePlanSpec, PhaseType, build_phases};
pub use replication::{ReplicaOptions, Replication};
pub use step::LastBatch;
pub use task::{PerfSample, PerfTag, Task, TaskStatus};
pub use trainer::LocalTrainer;
