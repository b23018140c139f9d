//! Codec engine abstraction, its ffmpeg backend and the adapter that drives
//! one compression end to end.

pub mod adapter;
pub mod ffmpeg;
pub mod params;
pub mod progress;
pub mod session;
pub mod simulate;

use async_trait::async_trait;

use crate::error::EngineError;

pub use adapter::InProcessCompressor;
pub use ffmpeg::FfmpegEngine;
pub use params::{
    build_invocation, image_qscale, result_extension, video_crf, EngineInvocation, VideoCodecOptions,
};
pub use progress::{FnProgress, MonotonicProgress, NoopProgress, ProgressReporter};
pub use session::{EngineMode, EngineSession, SessionState};
pub use simulate::{simulate, SimulationProfile};

/// A media codec engine with its own scratch filesystem.
///
/// Files are addressed by bare names inside the engine's scratch space.
/// Engines are shared between concurrent jobs, so names must be unique per job.
#[async_trait]
pub trait CodecEngine: Send + Sync {
    /// Acquires the engine. Called at most once per session.
    async fn load(&self) -> Result<(), EngineError>;

    async fn write_file(&self, name: &str, bytes: &[u8]) -> Result<(), EngineError>;

    /// Runs the engine with the given arguments, reporting raw progress.
    async fn exec(&self, args: &[String], progress: &dyn ProgressReporter) -> Result<(), EngineError>;

    async fn read_file(&self, name: &str) -> Result<Vec<u8>, EngineError>;

    /// Removes a scratch file. Missing files are not an error.
    async fn delete_file(&self, name: &str) -> Result<(), EngineError>;
}
