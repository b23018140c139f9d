//! Drives one compression through the engine session: scratch file setup,
//! invocation, result readback and cleanup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{oneshot, Semaphore};
use tracing::Instrument;

use super::params::{build_invocation, VideoCodecOptions};
use super::progress::{MonotonicProgress, ProgressReporter};
use super::session::{EngineMode, EngineSession, SessionState};
use super::simulate::{simulate, SimulationProfile};
use super::CodecEngine;
use crate::compressor::Compressor;
use crate::error::EngineError;
use crate::job::{CompressionRequest, JobId};

/// Compressor that runs the engine inside the current process.
///
/// Used directly in `in_process` mode and as the body of each worker context.
pub struct InProcessCompressor {
    session: Arc<EngineSession>,
    video: VideoCodecOptions,
    simulation: SimulationProfile,
    slots: Semaphore,
    in_flight: Mutex<HashMap<JobId, oneshot::Sender<()>>>,
}

impl InProcessCompressor {
    pub fn new(
        session: Arc<EngineSession>,
        video: VideoCodecOptions,
        simulation: SimulationProfile,
        parallelism: usize,
    ) -> Self {
        Self {
            session,
            video,
            simulation,
            slots: Semaphore::new(parallelism.max(1)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// A compressor that always simulates.
    pub fn simulated(simulation: SimulationProfile) -> Self {
        Self::new(
            Arc::new(EngineSession::simulated()),
            VideoCodecOptions::default(),
            simulation,
            num_cpus::get(),
        )
    }

    pub fn session(&self) -> &Arc<EngineSession> {
        &self.session
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock_in_flight().len()
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<JobId, oneshot::Sender<()>>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("In-flight job table lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    async fn run(
        &self,
        request: CompressionRequest,
        progress: MonotonicProgress,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<Vec<u8>, EngineError> {
        let mode = self.session.initialize().await;

        let _permit = tokio::select! {
            permit = self.slots.acquire() => permit
                .map_err(|_| EngineError::Exec("engine slots closed".to_string()))?,
            Ok(()) = &mut cancel => return Err(EngineError::Cancelled),
        };

        let result = match (mode, self.session.engine()) {
            (EngineMode::Real, Some(engine)) => {
                run_engine(engine.as_ref(), &request, &self.video, &progress, &mut cancel).await
            }
            _ => {
                tokio::select! {
                    output = simulate(&request.source, &self.simulation, &progress) => Ok(output),
                    Ok(()) = &mut cancel => Err(EngineError::Cancelled),
                }
            }
        };

        if result.is_ok() {
            progress.report(100);
        }
        result
    }
}

async fn run_engine(
    engine: &dyn CodecEngine,
    request: &CompressionRequest,
    video: &VideoCodecOptions,
    progress: &dyn ProgressReporter,
    cancel: &mut oneshot::Receiver<()>,
) -> Result<Vec<u8>, EngineError> {
    let invocation = build_invocation(request, video);
    log::debug!("Engine args for {}: {:?}", request.job_id, invocation.args);

    let outcome = async {
        engine.write_file(&invocation.input_name, &request.source).await?;
        tokio::select! {
            // A finished run wins over a cancel that arrives at the same time.
            biased;
            result = engine.exec(&invocation.args, progress) => result?,
            Ok(()) = &mut *cancel => return Err(EngineError::Cancelled),
        }
        engine.read_file(&invocation.output_name).await
    }
    .await;

    for name in [&invocation.input_name, &invocation.output_name] {
        if let Err(e) = engine.delete_file(name).await {
            log::warn!("Failed to remove scratch file {}: {}", name, e);
        }
    }

    outcome
}

#[async_trait]
impl Compressor for InProcessCompressor {
    async fn initialize(&self) -> SessionState {
        self.session.initialize().await.into()
    }

    fn status(&self) -> SessionState {
        self.session.state()
    }

    async fn compress(
        &self,
        request: CompressionRequest,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Vec<u8>, EngineError> {
        let job_id = request.job_id;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        {
            let mut in_flight = self.lock_in_flight();
            if in_flight.contains_key(&job_id) {
                return Err(EngineError::Exec(format!("job {} is already compressing", job_id)));
            }
            in_flight.insert(job_id, cancel_tx);
        }

        let span = tracing::info_span!(
            "engine.compress",
            job_id = %job_id,
            file = %request.file_name,
            kind = %request.media_kind,
            size = request.source.len()
        );
        let result = self
            .run(request, MonotonicProgress::new(progress), cancel_rx)
            .instrument(span)
            .await;

        self.lock_in_flight().remove(&job_id);

        match &result {
            Ok(output) => log::debug!("Job {} produced {} bytes", job_id, output.len()),
            Err(EngineError::Cancelled) => log::info!("Job {} cancelled", job_id),
            Err(e) => log::warn!("Job {} failed: {}", job_id, e),
        }
        result
    }

    async fn cancel(&self, job_id: JobId) -> bool {
        match self.lock_in_flight().remove(&job_id) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}
