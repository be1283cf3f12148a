//! Error types for the phaseloop core.
//!
//! Uses `thiserror` for the public error taxonomy: configuration errors,
//! contract violations, numeric faults and checkpoint failures. Collaborator
//! implementations report failures through `anyhow` and are wrapped in
//! [`TaskError::Collaborator`].

use std::path::PathBuf;

/// Top-level error type for task orchestration.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Contract violation: {0}")]
    Contract(#[from] ContractViolation),

    #[error("Loss is infinity or NaN: {loss}")]
    NumericFault { loss: f64 },

    /// The current phase iterator has no more batches. Signals the end of a
    /// phase to the trainer loop rather than a failure.
    #[error("Data iterator exhausted")]
    DataExhausted,

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl TaskError {
    /// Whether this error is the end-of-phase signal.
    pub fn is_data_exhausted(&self) -> bool {
        matches!(self, TaskError::DataExhausted)
    }
}

/// Errors raised while validating configuration or resolving optional backends.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("{feature} requested but no backend is available")]
    MissingBackend { feature: String },

    #[error("Accelerator requested but the backend has no accelerator available")]
    AcceleratorUnavailable,

    #[error("Configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn missing_backend(feature: impl Into<String>) -> Self {
        Self::MissingBackend {
            feature: feature.into(),
        }
    }
}

/// Violations of the orchestrator's calling contract. These indicate a caller
/// or collaborator bug and are never recovered from.
#[derive(Debug, thiserror::Error)]
pub enum ContractViolation {
    #[error("Returned sample with keys {keys:?} is not a map with 'input' and 'target' keys")]
    MalformedBatch { keys: Vec<String> },

    #[error("Distributed replication must only be initialized once")]
    AlreadyReplicated,

    #[error("No batches to read. Is the dataset empty?")]
    EmptyPhase,

    #[error("Invalid progress: {value}")]
    InvalidProgress { value: f64 },

    #[error("Phase index {index} is out of range for a plan of {len} phases")]
    PhaseOutOfRange { index: i64, len: usize },

    #[error("No dataset registered for phase type '{phase_type}'")]
    MissingDataset { phase_type: String },

    #[error("Task must be prepared before {operation}")]
    NotPrepared { operation: String },
}

/// Errors from checkpoint persistence and restoration.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse checkpoint {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Checkpoint not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Update task state from checkpoint was unsuccessful: {message}")]
    RestoreFailed { message: String },
}

/// A type alias for results using [`TaskError`].
pub type Result<T> = std::result::Result<T, TaskError>;
