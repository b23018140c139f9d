//! An isolated engine context: a dedicated thread with its own runtime and
//! its own compressor, reachable only through protocol messages.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::protocol::{WorkerEvent, WorkerMessage, WorkerRequest};
use crate::compressor::Compressor;
use crate::engine::{ProgressReporter, SessionState};
use crate::error::{ChannelError, EngineError};
use crate::job::JobId;

/// Builds the compressor owned by one context. Runs on the context thread.
pub type CompressorFactory = Arc<dyn Fn() -> Arc<dyn Compressor> + Send + Sync>;

pub(crate) struct ContextHandle {
    pub requests: mpsc::UnboundedSender<WorkerRequest>,
    pub thread: JoinHandle<()>,
}

pub(crate) fn spawn_context(
    worker: usize,
    factory: CompressorFactory,
    events: Sender<WorkerMessage>,
) -> Result<ContextHandle, ChannelError> {
    let (requests, receiver) = mpsc::unbounded_channel();

    let thread = thread::Builder::new()
        .name(format!("ghostpress-worker-{}", worker))
        .spawn(move || run_context(worker, factory, receiver, events))
        .map_err(|e| ChannelError::SpawnFailed(e.to_string()))?;

    Ok(ContextHandle { requests, thread })
}

fn run_context(
    worker: usize,
    factory: CompressorFactory,
    receiver: mpsc::UnboundedReceiver<WorkerRequest>,
    events: Sender<WorkerMessage>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Worker {} failed to create runtime: {}", worker, e);
            send(&events, worker, global_error(format!("runtime unavailable: {}", e)));
            return;
        }
    };

    debug!("Worker {} started", worker);

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(serve(worker, factory, receiver, events.clone()))
    }));

    match outcome {
        Ok(()) => debug!("Worker {} stopped", worker),
        Err(panic) => {
            let reason = panic_message(&*panic);
            error!("Worker {} crashed: {}", worker, reason);
            send(&events, worker, global_error(reason));
        }
    }
}

async fn serve(
    worker: usize,
    factory: CompressorFactory,
    mut receiver: mpsc::UnboundedReceiver<WorkerRequest>,
    events: Sender<WorkerMessage>,
) {
    let compressor = factory();
    let running: Arc<Mutex<HashMap<JobId, AbortHandle>>> = Arc::new(Mutex::new(HashMap::new()));

    while let Some(request) = receiver.recv().await {
        match request {
            WorkerRequest::Load => {
                let state = compressor.initialize().await;
                info!("Worker {} engine ready ({:?})", worker, state);
                send(
                    &events,
                    worker,
                    WorkerEvent::Loaded {
                        simulated: state == SessionState::ReadySimulated,
                    },
                );
            }
            WorkerRequest::Compress(request) => {
                let job_id = request.job_id;
                let progress: Arc<dyn ProgressReporter> = Arc::new(ChannelProgress {
                    worker,
                    job_id,
                    events: events.clone(),
                });

                let job = {
                    let compressor = Arc::clone(&compressor);
                    tokio::spawn(async move { compressor.compress(request, progress).await })
                };
                lock(&running).insert(job_id, job.abort_handle());

                let events = events.clone();
                let running = Arc::clone(&running);
                tokio::spawn(async move {
                    let event = match job.await {
                        Ok(Ok(result)) => WorkerEvent::Done { job_id, result },
                        Ok(Err(EngineError::Cancelled)) => WorkerEvent::Cancelled { job_id },
                        Ok(Err(e)) => WorkerEvent::Error {
                            job_id: Some(job_id),
                            message: e.to_string(),
                        },
                        Err(e) if e.is_cancelled() => WorkerEvent::Cancelled { job_id },
                        Err(e) => WorkerEvent::Error {
                            job_id: Some(job_id),
                            message: format!("compression task failed: {}", e),
                        },
                    };
                    lock(&running).remove(&job_id);
                    send(&events, worker, event);
                });
            }
            WorkerRequest::Cancel { job_id } => {
                if !compressor.cancel(job_id).await {
                    // Not yet started inside the compressor; nothing to clean up.
                    if let Some(handle) = lock(&running).get(&job_id) {
                        handle.abort();
                    }
                }
            }
            WorkerRequest::Shutdown => {
                debug!("Worker {} received shutdown", worker);
                break;
            }
        }
    }
}

/// Forwards progress reports as protocol events.
struct ChannelProgress {
    worker: usize,
    job_id: JobId,
    events: Sender<WorkerMessage>,
}

impl ProgressReporter for ChannelProgress {
    fn report(&self, percent: u8) {
        send(
            &self.events,
            self.worker,
            WorkerEvent::Progress {
                job_id: self.job_id,
                percent,
            },
        );
    }
}

fn send(events: &Sender<WorkerMessage>, worker: usize, event: WorkerEvent) {
    if events.send(WorkerMessage { worker, event }).is_err() {
        debug!("Worker {} event dropped, receiver gone", worker);
    }
}

fn global_error(message: String) -> WorkerEvent {
    WorkerEvent::Error {
        job_id: None,
        message,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Worker task table lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
