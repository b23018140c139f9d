//! The seam between orchestration and the engine, whatever context it runs in.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{ExecutionMode, GhostpressConfig};
use crate::engine::{EngineSession, FfmpegEngine, InProcessCompressor, ProgressReporter, SessionState};
use crate::error::EngineError;
use crate::job::{CompressionRequest, JobId};
use crate::worker::WorkerCompressor;

/// Runs compressions on behalf of the orchestrator.
#[async_trait]
pub trait Compressor: Send + Sync {
    /// Brings the engine up. Idempotent; never fails, degrading to simulation.
    async fn initialize(&self) -> SessionState;

    fn status(&self) -> SessionState;

    /// Compresses one source. Exactly one outcome is returned per call.
    async fn compress(
        &self,
        request: CompressionRequest,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Vec<u8>, EngineError>;

    /// Asks for an in-flight compression to stop. Returns false if the job
    /// is not running here.
    async fn cancel(&self, job_id: JobId) -> bool;
}

/// Builds an in-process compressor from configuration.
pub fn in_process_compressor(config: &GhostpressConfig) -> InProcessCompressor {
    let session = if config.simulation.force {
        EngineSession::simulated()
    } else {
        EngineSession::new(Arc::new(FfmpegEngine::new(
            config.engine.binary.clone(),
            config.engine.scratch_dir.clone(),
        )))
    };
    InProcessCompressor::new(
        Arc::new(session),
        config.engine.video_options(),
        config.simulation.profile(),
        config.engine.parallelism,
    )
}

/// Builds the compressor selected by `engine.mode`.
///
/// If worker contexts cannot be started the engine runs in process instead.
pub fn build_compressor(config: &GhostpressConfig) -> Arc<dyn Compressor> {
    match config.engine.mode {
        ExecutionMode::InProcess => Arc::new(in_process_compressor(config)),
        ExecutionMode::Worker => match WorkerCompressor::spawn(config) {
            Ok(workers) => Arc::new(workers),
            Err(e) => {
                log::warn!("Engine workers unavailable, running in process: {}", e);
                Arc::new(in_process_compressor(config))
            }
        },
    }
}
