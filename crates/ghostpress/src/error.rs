use std::path::PathBuf;
use thiserror::Error;

use crate::job::JobId;

#[derive(Error, Debug)]
pub enum GhostpressError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Orchestration error: {0}")]
    Orchestration(#[from] OrchestrationError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

/// Failures raised by the codec engine or the adapter wrapping it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The real engine could not be acquired. Recovered by simulation fallback.
    #[error("Engine initialization failed: {0}")]
    Init(String),

    /// A single compression invocation failed.
    #[error("Compression failed: {0}")]
    Exec(String),

    /// Scratch filesystem operation failed.
    #[error("Engine file '{name}' unavailable: {reason}")]
    File { name: String, reason: String },

    /// The compression was cancelled before it produced a result.
    #[error("Compression cancelled")]
    Cancelled,

    /// The transport to the engine context failed for this job.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Failed to spawn engine worker: {0}")]
    SpawnFailed(String),

    #[error("Engine worker channel closed unexpectedly")]
    Closed,

    #[error("Engine worker crashed: {0}")]
    WorkerCrashed(String),
}

/// Rejection reasons for files offered at submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unsupported file type '{mime_type}' for '{name}'")]
    UnsupportedKind { name: String, mime_type: String },

    #[error("File '{0}' is empty")]
    Empty(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Settings of job {id} are frozen while it is {status}")]
    SettingsFrozen { id: JobId, status: String },

    #[error("Invalid setting '{key}': {reason}")]
    InvalidSetting { key: &'static str, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationError {
    #[error("Queue is busy: {active} job(s) still active")]
    QueueBusy { active: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, GhostpressError>;
