//! Orchestration policy: starts jobs, tracks their tasks and reconciles
//! engine outcomes back into the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};

use crate::broadcast::JobEventBroadcaster;
use crate::compressor::{build_compressor, Compressor};
use crate::config::{GhostpressConfig, QueueConfig};
use crate::engine::{ProgressReporter, SessionState};
use crate::error::{EngineError, OrchestrationError, StoreError};
use crate::job::{CompressionRequest, FailureKind, JobFailure, JobId, JobStatus};
use crate::store::{JobSnapshot, JobStore};

/// How often a pending cancel is re-offered to a compressor that does not
/// track the job yet.
const CANCEL_RETRY: Duration = Duration::from_millis(10);

/// Bookkeeping for one started job.
struct JobTask {
    cancel: Option<oneshot::Sender<()>>,
    work: AbortHandle,
    supervisor: JoinHandle<()>,
}

enum Start {
    Now(CompressionRequest, Option<OwnedSemaphorePermit>),
    Queued(JobId, Arc<Semaphore>),
}

/// Feeds engine progress into the store.
struct StoreProgress {
    store: Arc<JobStore>,
    job_id: JobId,
}

impl ProgressReporter for StoreProgress {
    fn report(&self, percent: u8) {
        self.store.update_progress(self.job_id, percent);
    }
}

pub struct Orchestrator {
    store: Arc<JobStore>,
    compressor: Arc<dyn Compressor>,
    tasks: Arc<Mutex<HashMap<JobId, JobTask>>>,
    slots: Option<Arc<Semaphore>>,
    cancel_on_remove: bool,
}

impl Orchestrator {
    pub fn new(store: Arc<JobStore>, compressor: Arc<dyn Compressor>, queue: &QueueConfig) -> Self {
        Self {
            store,
            compressor,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            slots: queue
                .max_concurrent_jobs
                .map(|limit| Arc::new(Semaphore::new(limit.max(1)))),
            cancel_on_remove: queue.cancel_on_remove,
        }
    }

    /// Builds the store, the event broadcaster and the configured compressor.
    pub fn from_config(config: &GhostpressConfig) -> Self {
        let events = JobEventBroadcaster::new(config.queue.event_capacity);
        let store = Arc::new(JobStore::new(config.defaults.clone(), events));
        Self::new(store, build_compressor(config), &config.queue)
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<JobId, JobTask>> {
        lock_tasks(&self.tasks)
    }

    pub async fn initialize_engine(&self) -> SessionState {
        self.compressor.initialize().await
    }

    pub fn engine_status(&self) -> SessionState {
        self.compressor.status()
    }

    pub fn is_simulated(&self) -> bool {
        self.engine_status() == SessionState::ReadySimulated
    }

    pub fn any_active(&self) -> bool {
        self.store.any_active()
    }

    /// Whether a start-all request would do anything.
    pub fn can_start_all(&self) -> bool {
        let counts = self.store.counts();
        counts.active() == 0 && counts.idle > 0
    }

    /// Starts one idle job. Returns false if the job is not idle.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_one(&self, id: JobId) -> Result<bool, StoreError> {
        match self.store.status(id) {
            None => return Err(StoreError::NotFound(id)),
            Some(JobStatus::Idle) => {}
            Some(_) => return Ok(false),
        }

        let start = match &self.slots {
            None => match self.store.begin(id) {
                Some(request) => Start::Now(request, None),
                None => return Ok(false),
            },
            Some(slots) => match Arc::clone(slots).try_acquire_owned() {
                Ok(permit) => match self.store.begin(id) {
                    Some(request) => Start::Now(request, Some(permit)),
                    None => return Ok(false),
                },
                Err(_) => {
                    if !self.store.mark_queued(id) {
                        return Ok(false);
                    }
                    Start::Queued(id, Arc::clone(slots))
                }
            },
        };

        self.spawn_job(id, start);
        Ok(true)
    }

    fn spawn_job(&self, id: JobId, start: Start) {
        let (cancel_tx, cancel_rx) = oneshot::channel();

        // Held while spawning so the supervisor cannot unregister before we register.
        let mut tasks = self.lock_tasks();
        tasks.retain(|_, task| !task.supervisor.is_finished());

        let work = tokio::spawn(run_job(
            Arc::clone(&self.store),
            Arc::clone(&self.compressor),
            start,
            cancel_rx,
        ));
        let abort = work.abort_handle();
        let supervisor = tokio::spawn(supervise(
            Arc::clone(&self.store),
            Arc::clone(&self.tasks),
            id,
            work,
        ));

        tasks.insert(
            id,
            JobTask {
                cancel: Some(cancel_tx),
                work: abort,
                supervisor,
            },
        );
    }

    /// Starts every idle job. Rejected while any job is active; a no-op when
    /// nothing is idle.
    pub fn start_all(&self) -> Result<Vec<JobId>, OrchestrationError> {
        let active = self.store.counts().active();
        if active > 0 {
            return Err(OrchestrationError::QueueBusy { active });
        }

        let mut started = Vec::new();
        for id in self.store.ids_with_status(JobStatus::Idle) {
            match self.start_one(id) {
                Ok(true) => started.push(id),
                Ok(false) => {}
                // Removed concurrently.
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if !started.is_empty() {
            info!("Started {} job(s)", started.len());
        }
        Ok(started)
    }

    /// Cancels a queued or compressing job. The job ends in `error` with kind
    /// `cancelled` once the engine has released its scratch files.
    pub fn cancel(&self, id: JobId) -> Result<bool, StoreError> {
        match self.store.status(id) {
            None => Err(StoreError::NotFound(id)),
            Some(JobStatus::Queued) => {
                if self
                    .store
                    .fail_queued(id, cancelled_failure("Cancelled before start"))
                {
                    if let Some(task) = self.lock_tasks().remove(&id) {
                        task.work.abort();
                    }
                    return Ok(true);
                }
                // Got a slot in the meantime.
                Ok(self.signal_cancel(id))
            }
            Some(JobStatus::Compressing) => Ok(self.signal_cancel(id)),
            Some(_) => Ok(false),
        }
    }

    fn signal_cancel(&self, id: JobId) -> bool {
        let signal = self
            .lock_tasks()
            .get_mut(&id)
            .and_then(|task| task.cancel.take());
        match signal {
            Some(signal) => {
                debug!("Cancelling job {}", id);
                signal.send(()).is_ok()
            }
            None => false,
        }
    }

    /// Removes a job in any status. An in-flight compression keeps running
    /// detached and its outcome is discarded, unless `cancel_on_remove` is set.
    pub fn remove(&self, id: JobId) -> Result<JobSnapshot, StoreError> {
        let removed = self.store.remove(id)?;
        let task = self.lock_tasks().remove(&id);

        if let Some(mut task) = task {
            match removed.status {
                JobStatus::Queued => task.work.abort(),
                JobStatus::Compressing if self.cancel_on_remove => {
                    if let Some(signal) = task.cancel.take() {
                        let _ = signal.send(());
                    }
                }
                JobStatus::Compressing => {
                    debug!("Job {} removed while compressing, result will be discarded", id);
                }
                _ => {}
            }
        }
        Ok(removed)
    }

    /// Removes every job. Rejected while any job is active.
    pub fn clear_all(&self) -> Result<usize, OrchestrationError> {
        let active = self.store.counts().active();
        if active > 0 {
            return Err(OrchestrationError::QueueBusy { active });
        }
        let removed = self.store.clear();
        self.lock_tasks().clear();
        Ok(removed.len())
    }

    /// Number of tracked job tasks that have not finished.
    pub fn running_tasks(&self) -> usize {
        self.lock_tasks()
            .values()
            .filter(|task| !task.supervisor.is_finished())
            .count()
    }

    /// Resolves once no job is queued or compressing.
    pub async fn wait_for_idle(&self) {
        let mut events = self.store.subscribe();
        while self.store.any_active() {
            let _ = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        }
    }
}

fn lock_tasks(tasks: &Mutex<HashMap<JobId, JobTask>>) -> MutexGuard<'_, HashMap<JobId, JobTask>> {
    match tasks.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Job task table lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn cancelled_failure(message: &str) -> JobFailure {
    JobFailure {
        kind: FailureKind::Cancelled,
        message: message.to_string(),
    }
}

async fn run_job(
    store: Arc<JobStore>,
    compressor: Arc<dyn Compressor>,
    start: Start,
    cancel: oneshot::Receiver<()>,
) {
    let (request, _permit) = match start {
        Start::Now(request, permit) => (request, permit),
        Start::Queued(id, slots) => {
            let Ok(permit) = slots.acquire_owned().await else {
                return;
            };
            // Removed or cancelled while waiting.
            let Some(request) = store.begin(id) else {
                return;
            };
            (request, Some(permit))
        }
    };

    let id = request.job_id;
    let progress: Arc<dyn ProgressReporter> = Arc::new(StoreProgress {
        store: Arc::clone(&store),
        job_id: id,
    });

    match compress_cancellable(compressor.as_ref(), request, progress, cancel).await {
        Ok(result) => {
            let size = result.len();
            if store.complete(id, result) {
                info!("Job {} completed ({} bytes)", id, size);
            } else {
                debug!("Discarding result of job {}, no longer compressing", id);
            }
        }
        Err(e) => {
            if store.fail(id, JobFailure::from(&e)) {
                match e {
                    EngineError::Cancelled => info!("Job {} cancelled", id),
                    _ => warn!("Job {} failed: {}", id, e),
                }
            } else {
                debug!("Discarding failure of job {}: {}", id, e);
            }
        }
    }
}

/// Runs one compression, forwarding a cancel request to the compressor once
/// it tracks the job. A result that is already available wins over a cancel.
async fn compress_cancellable(
    compressor: &dyn Compressor,
    request: CompressionRequest,
    progress: Arc<dyn ProgressReporter>,
    mut cancel: oneshot::Receiver<()>,
) -> Result<Vec<u8>, EngineError> {
    let id = request.job_id;
    let compress = compressor.compress(request, progress);
    tokio::pin!(compress);

    tokio::select! {
        biased;
        outcome = &mut compress => return outcome,
        Ok(()) = &mut cancel => {}
    }

    loop {
        if compressor.cancel(id).await {
            return compress.await;
        }
        tokio::select! {
            biased;
            outcome = &mut compress => return outcome,
            _ = tokio::time::sleep(CANCEL_RETRY) => {}
        }
    }
}

/// Awaits the job task and turns a panic or abort into a job failure, so a
/// job never stays active without a task behind it.
async fn supervise(
    store: Arc<JobStore>,
    tasks: Arc<Mutex<HashMap<JobId, JobTask>>>,
    id: JobId,
    work: JoinHandle<()>,
) {
    if let Err(e) = work.await {
        let failure = if e.is_cancelled() {
            cancelled_failure("Compression task aborted")
        } else {
            JobFailure {
                kind: FailureKind::Engine,
                message: format!("Compression task panicked: {}", e),
            }
        };
        if store.fail(id, failure) {
            warn!("Job {} task ended abnormally: {}", id, e);
        }
    }
    lock_tasks(&tasks).remove(&id);
}
