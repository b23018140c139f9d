pub mod broadcast;
pub mod compressor;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod logging;
pub mod orchestrator;
pub mod store;
pub mod worker;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use broadcast::{JobEvent, JobEventBroadcaster, JobEventKind};
pub use compressor::{build_compressor, in_process_compressor, Compressor};
pub use config::{load_config, load_config_from_str, ExecutionMode, GhostpressConfig};
pub use engine::{CodecEngine, EngineSession, FfmpegEngine, InProcessCompressor, SessionState};
pub use error::{
    ChannelError, ConfigError, EngineError, GhostpressError, OrchestrationError, Result, StoreError,
    ValidationError,
};
pub use job::{
    CompressionRequest, CompressionSettings, FailureKind, JobFailure, JobId, JobStatus, MediaKind,
    SettingsUpdate, SourceFile,
};
pub use logging::{init_logging, LogFormat, LoggingError};
pub use orchestrator::Orchestrator;
pub use store::{BlobHandle, BlobRegistry, JobSnapshot, JobStore, StatusCounts, SubmitReport};
pub use worker::WorkerCompressor;
