//! Control-side end of the job protocol: routes requests to worker contexts
//! and correlates their events back to the awaiting callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, OnceCell};

use super::context::{spawn_context, CompressorFactory};
use super::protocol::{WorkerEvent, WorkerMessage, WorkerRequest};
use crate::compressor::{in_process_compressor, Compressor};
use crate::config::GhostpressConfig;
use crate::engine::session::LoadingGuard;
use crate::engine::{InProcessCompressor, ProgressReporter, SessionState, SimulationProfile};
use crate::error::{ChannelError, EngineError};
use crate::job::{CompressionRequest, JobId};

type JobOutcome = Result<Vec<u8>, EngineError>;

/// One record per job awaiting a terminal event.
struct PendingJob {
    worker: usize,
    progress: Arc<dyn ProgressReporter>,
    last_percent: u8,
    done: oneshot::Sender<JobOutcome>,
}

struct WorkerSlot {
    requests: mpsc::UnboundedSender<WorkerRequest>,
    alive: AtomicBool,
    loaded: Mutex<Option<oneshot::Sender<Result<bool, String>>>>,
}

struct Shared {
    workers: Vec<WorkerSlot>,
    pending: Mutex<HashMap<JobId, PendingJob>>,
}

impl Shared {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<JobId, PendingJob>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Pending job table lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn take_load_waiter(&self, worker: usize) -> Option<oneshot::Sender<Result<bool, String>>> {
        let slot = self.workers.get(worker)?;
        let mut guard = match slot.loaded.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take()
    }

    fn dispatch(&self, message: WorkerMessage) {
        let WorkerMessage { worker, event } = message;
        match event {
            WorkerEvent::Loaded { simulated } => {
                if let Some(waiter) = self.take_load_waiter(worker) {
                    let _ = waiter.send(Ok(simulated));
                }
            }
            WorkerEvent::Progress { job_id, percent } => {
                let reporter = {
                    let mut pending = self.lock_pending();
                    match pending.get_mut(&job_id) {
                        Some(job) if percent > job.last_percent => {
                            job.last_percent = percent;
                            Some(Arc::clone(&job.progress))
                        }
                        Some(_) => None,
                        None => {
                            debug!("Ignoring progress for settled job {}", job_id);
                            None
                        }
                    }
                };
                if let Some(reporter) = reporter {
                    reporter.report(percent);
                }
            }
            WorkerEvent::Done { job_id, result } => self.settle(job_id, Ok(result)),
            WorkerEvent::Cancelled { job_id } => self.settle(job_id, Err(EngineError::Cancelled)),
            WorkerEvent::Error {
                job_id: Some(job_id),
                message,
            } => self.settle(job_id, Err(EngineError::Exec(message))),
            WorkerEvent::Error {
                job_id: None,
                message,
            } => self.fail_worker(worker, message),
        }
    }

    /// Delivers the first terminal event for a job; later ones are dropped.
    fn settle(&self, job_id: JobId, outcome: JobOutcome) {
        let job = self.lock_pending().remove(&job_id);
        match job {
            Some(job) => {
                if job.done.send(outcome).is_err() {
                    debug!("Caller for job {} stopped waiting", job_id);
                }
            }
            None => debug!("Ignoring late terminal event for job {}", job_id),
        }
    }

    fn fail_worker(&self, worker: usize, message: String) {
        error!("Engine worker {} failed: {}", worker, message);

        let failed: Vec<(JobId, PendingJob)> = {
            let mut pending = self.lock_pending();
            if let Some(slot) = self.workers.get(worker) {
                slot.alive.store(false, Ordering::Release);
            }
            let ids: Vec<JobId> = pending
                .iter()
                .filter(|(_, job)| job.worker == worker)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|job| (id, job)))
                .collect()
        };

        for (job_id, job) in failed {
            warn!("Failing job {} after worker {} crash", job_id, worker);
            let _ = job.done.send(Err(EngineError::Channel(ChannelError::WorkerCrashed(
                message.clone(),
            ))));
        }

        if let Some(waiter) = self.take_load_waiter(worker) {
            let _ = waiter.send(Err(message));
        }
    }

    fn mark_dead(&self, worker: usize) {
        let _pending = self.lock_pending();
        if let Some(slot) = self.workers.get(worker) {
            slot.alive.store(false, Ordering::Release);
        }
    }

    fn live_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.alive.load(Ordering::Acquire))
            .count()
    }
}

/// Compressor backed by isolated worker contexts.
///
/// Each context owns its own engine session. Jobs go to the live context with
/// the fewest pending jobs. If no context comes up, compression falls back to
/// an in-process simulated compressor.
pub struct WorkerCompressor {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    state: OnceCell<SessionState>,
    loading: AtomicBool,
    fallback: OnceCell<Arc<InProcessCompressor>>,
    load_timeout: Duration,
    simulation: SimulationProfile,
    shut_down: AtomicBool,
}

impl WorkerCompressor {
    /// Starts `engine.worker_count` contexts configured from `config`.
    pub fn spawn(config: &GhostpressConfig) -> Result<Self, ChannelError> {
        let engine_config = config.clone();
        let factory: CompressorFactory =
            Arc::new(move || Arc::new(in_process_compressor(&engine_config)) as Arc<dyn Compressor>);
        Self::with_factory(
            config.engine.worker_count,
            factory,
            config.engine.load_timeout(),
            config.simulation.profile(),
        )
    }

    pub fn with_factory(
        worker_count: usize,
        factory: CompressorFactory,
        load_timeout: Duration,
        simulation: SimulationProfile,
    ) -> Result<Self, ChannelError> {
        if worker_count == 0 {
            return Err(ChannelError::SpawnFailed("worker_count must be > 0".to_string()));
        }

        let (event_tx, event_rx) = crossbeam_channel::unbounded::<WorkerMessage>();
        let mut workers: Vec<WorkerSlot> = Vec::with_capacity(worker_count);
        let mut threads = Vec::with_capacity(worker_count);

        for worker in 0..worker_count {
            let handle = match spawn_context(worker, Arc::clone(&factory), event_tx.clone()) {
                Ok(handle) => handle,
                Err(e) => {
                    for slot in &workers {
                        let _ = slot.requests.send(WorkerRequest::Shutdown);
                    }
                    return Err(e);
                }
            };
            workers.push(WorkerSlot {
                requests: handle.requests,
                alive: AtomicBool::new(true),
                loaded: Mutex::new(None),
            });
            threads.push(handle.thread);
        }
        // Only contexts hold event senders; the dispatcher ends once they exit.
        drop(event_tx);

        let shared = Arc::new(Shared {
            workers,
            pending: Mutex::new(HashMap::new()),
        });

        let dispatcher = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("ghostpress-dispatch".to_string())
                .spawn(move || run_dispatcher(shared, event_rx))
                .map_err(|e| ChannelError::SpawnFailed(e.to_string()))?
        };

        info!("Started {} engine worker(s)", worker_count);

        Ok(Self {
            shared,
            threads,
            dispatcher: Some(dispatcher),
            state: OnceCell::new(),
            loading: AtomicBool::new(false),
            fallback: OnceCell::new(),
            load_timeout,
            simulation,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn live_workers(&self) -> usize {
        self.shared.live_workers()
    }

    pub fn pending_jobs(&self) -> usize {
        self.shared.lock_pending().len()
    }

    /// True when compression runs on the in-process fallback.
    pub fn is_fallback(&self) -> bool {
        self.fallback.get().is_some()
    }

    async fn load_all(&self) -> SessionState {
        let mut waiters = Vec::with_capacity(self.shared.workers.len());
        for (index, slot) in self.shared.workers.iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            match slot.loaded.lock() {
                Ok(mut guard) => *guard = Some(tx),
                Err(poisoned) => *poisoned.into_inner() = Some(tx),
            }
            if slot.requests.send(WorkerRequest::Load).is_err() {
                warn!("Engine worker {} is gone before load", index);
                self.shared.mark_dead(index);
                continue;
            }
            waiters.push((index, rx));
        }

        // One deadline for the whole pool, not one per worker.
        let deadline = tokio::time::Instant::now() + self.load_timeout;
        let mut any_real = false;
        let mut any_ready = false;
        for (index, rx) in waiters {
            match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(Ok(simulated))) => {
                    any_ready = true;
                    any_real |= !simulated;
                }
                Ok(Ok(Err(message))) => {
                    warn!("Engine worker {} failed to load: {}", index, message);
                }
                Ok(Err(_)) => {
                    warn!("Engine worker {} closed before loading", index);
                    self.shared.mark_dead(index);
                }
                Err(_) => {
                    warn!("Engine worker {} did not load within {:?}", index, self.load_timeout);
                    self.shared.mark_dead(index);
                    let _ = self.shared.take_load_waiter(index);
                }
            }
        }

        if any_ready && self.shared.live_workers() > 0 {
            if any_real {
                SessionState::Ready
            } else {
                SessionState::ReadySimulated
            }
        } else {
            warn!("No engine worker available, compressing in process with simulation");
            let fallback = Arc::new(InProcessCompressor::simulated(self.simulation));
            let _ = self.fallback.set(fallback);
            SessionState::ReadySimulated
        }
    }

    /// Registers the job on the least loaded live context and sends it.
    fn submit(
        &self,
        request: CompressionRequest,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<oneshot::Receiver<JobOutcome>, EngineError> {
        let job_id = request.job_id;
        let (done_tx, done_rx) = oneshot::channel();

        let worker = {
            let mut pending = self.shared.lock_pending();
            if pending.contains_key(&job_id) {
                return Err(EngineError::Exec(format!("job {} is already compressing", job_id)));
            }
            let mut load = vec![0usize; self.shared.workers.len()];
            for job in pending.values() {
                load[job.worker] += 1;
            }
            let worker = self
                .shared
                .workers
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.alive.load(Ordering::Acquire))
                .min_by_key(|(index, _)| load[*index])
                .map(|(index, _)| index)
                .ok_or(EngineError::Channel(ChannelError::Closed))?;

            pending.insert(
                job_id,
                PendingJob {
                    worker,
                    progress,
                    last_percent: 0,
                    done: done_tx,
                },
            );
            worker
        };

        debug!("Routing job {} to engine worker {}", job_id, worker);
        if self.shared.workers[worker]
            .requests
            .send(WorkerRequest::Compress(request))
            .is_err()
        {
            self.shared.lock_pending().remove(&job_id);
            self.shared.fail_worker(worker, "request channel closed".to_string());
            return Err(EngineError::Channel(ChannelError::Closed));
        }

        Ok(done_rx)
    }

    /// Stops every context and waits for their threads.
    pub fn shutdown(mut self) {
        self.send_shutdown();
        for (index, thread) in self.threads.drain(..).enumerate() {
            if thread.join().is_err() {
                error!("Engine worker {} thread panicked", index);
            }
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
        info!("All engine workers have stopped");
    }

    fn send_shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for slot in &self.shared.workers {
            let _ = slot.requests.send(WorkerRequest::Shutdown);
        }
    }
}

fn run_dispatcher(shared: Arc<Shared>, events: Receiver<WorkerMessage>) {
    for message in events.iter() {
        shared.dispatch(message);
    }

    // Every context has exited; nothing will settle what is left.
    let orphaned: Vec<PendingJob> = shared.lock_pending().drain().map(|(_, job)| job).collect();
    for job in orphaned {
        let _ = job.done.send(Err(EngineError::Channel(ChannelError::Closed)));
    }
    debug!("Engine event dispatcher stopped");
}

impl Drop for WorkerCompressor {
    fn drop(&mut self) {
        self.send_shutdown();
    }
}

#[async_trait]
impl Compressor for WorkerCompressor {
    async fn initialize(&self) -> SessionState {
        *self
            .state
            .get_or_init(|| async {
                let _loading = LoadingGuard::raise(&self.loading);
                self.load_all().await
            })
            .await
    }

    fn status(&self) -> SessionState {
        match self.state.get() {
            Some(state) => *state,
            None if self.loading.load(Ordering::Acquire) => SessionState::Loading,
            None => SessionState::Uninitialized,
        }
    }

    async fn compress(
        &self,
        request: CompressionRequest,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Vec<u8>, EngineError> {
        self.initialize().await;

        if let Some(fallback) = self.fallback.get() {
            return fallback.compress(request, progress).await;
        }

        let done = self.submit(request, progress)?;
        done.await
            .unwrap_or(Err(EngineError::Channel(ChannelError::Closed)))
    }

    async fn cancel(&self, job_id: JobId) -> bool {
        if let Some(fallback) = self.fallback.get() {
            return fallback.cancel(job_id).await;
        }

        let worker = match self.shared.lock_pending().get(&job_id) {
            Some(job) => job.worker,
            None => return false,
        };
        self.shared.workers[worker]
            .requests
            .send(WorkerRequest::Cancel { job_id })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineSession, FnProgress, NoopProgress, VideoCodecOptions};
    use crate::job::{CompressionSettings, MediaKind};
    use crate::testing::ScriptedEngine;
    use std::time::Instant;

    fn factory(engine: Arc<ScriptedEngine>) -> CompressorFactory {
        Arc::new(move || {
            Arc::new(InProcessCompressor::new(
                Arc::new(EngineSession::new(engine.clone())),
                VideoCodecOptions::default(),
                SimulationProfile::default(),
                4,
            )) as Arc<dyn Compressor>
        })
    }

    fn request(bytes: Vec<u8>) -> CompressionRequest {
        CompressionRequest {
            job_id: JobId::new(),
            file_name: "clip.mp4".to_string(),
            media_kind: MediaKind::Video,
            source: Arc::new(bytes),
            settings: CompressionSettings::default(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_round_trip_through_worker() {
        let engine = Arc::new(ScriptedEngine::new());
        let workers = WorkerCompressor::with_factory(
            2,
            factory(engine.clone()),
            Duration::from_secs(5),
            SimulationProfile::default(),
        )
        .unwrap();

        assert_eq!(workers.status(), SessionState::Uninitialized);
        assert_eq!(workers.initialize().await, SessionState::Ready);
        // One session per context.
        assert_eq!(engine.load_calls(), 2);

        let output = workers
            .compress(request(vec![5u8; 64]), Arc::new(NoopProgress))
            .await
            .unwrap();
        assert_eq!(output, vec![5u8; 32]);
        assert_eq!(workers.pending_jobs(), 0);
        workers.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_engine_failure_is_job_scoped() {
        let engine = Arc::new(ScriptedEngine::new());
        let workers = WorkerCompressor::with_factory(
            1,
            factory(engine.clone()),
            Duration::from_secs(5),
            SimulationProfile::default(),
        )
        .unwrap();

        let err = workers
            .compress(request(ScriptedEngine::failing_input()), Arc::new(NoopProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Exec(_)));

        // The context survives a job failure.
        assert_eq!(workers.live_workers(), 1);
        assert!(workers
            .compress(request(vec![1u8; 10]), Arc::new(NoopProgress))
            .await
            .is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_routes_to_owning_worker() {
        let engine = Arc::new(ScriptedEngine::new());
        let workers = Arc::new(
            WorkerCompressor::with_factory(
                2,
                factory(engine.clone()),
                Duration::from_secs(5),
                SimulationProfile::default(),
            )
            .unwrap(),
        );
        workers.initialize().await;

        let req = request(ScriptedEngine::slow_input(5_000));
        let job_id = req.job_id;
        let task = {
            let workers = Arc::clone(&workers);
            tokio::spawn(async move { workers.compress(req, Arc::new(NoopProgress)).await })
        };

        for _ in 0..200 {
            if engine.exec_calls() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(workers.cancel(job_id).await);
        assert_eq!(task.await.unwrap(), Err(EngineError::Cancelled));
        assert!(engine.file_names().is_empty());
        assert!(!workers.cancel(job_id).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_all_workers_failing_falls_back_in_process() {
        let crashing: CompressorFactory =
            Arc::new(|| -> Arc<dyn Compressor> { panic!("no engine in this context") });
        let workers = WorkerCompressor::with_factory(
            2,
            crashing,
            Duration::from_secs(5),
            SimulationProfile {
                tick: Duration::from_millis(1),
                size_ratio: 0.7,
            },
        )
        .unwrap();

        assert_eq!(workers.initialize().await, SessionState::ReadySimulated);
        assert!(workers.is_fallback());
        assert_eq!(workers.live_workers(), 0);

        let output = workers
            .compress(request(vec![0u8; 100]), Arc::new(NoopProgress))
            .await
            .unwrap();
        assert_eq!(output.len(), 70);
    }

    /// A correlation table with one pending job on worker 0.
    fn table_with_job(
        job_id: JobId,
    ) -> (Shared, oneshot::Receiver<JobOutcome>, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let (done, rx) = oneshot::channel();
        let mut pending = HashMap::new();
        pending.insert(
            job_id,
            PendingJob {
                worker: 0,
                progress: Arc::new(FnProgress(move |p| sink.lock().unwrap().push(p))),
                last_percent: 0,
                done,
            },
        );
        let shared = Shared {
            workers: Vec::new(),
            pending: Mutex::new(pending),
        };
        (shared, rx, seen)
    }

    fn event(event: WorkerEvent) -> WorkerMessage {
        WorkerMessage { worker: 0, event }
    }

    #[test]
    fn test_only_first_terminal_event_is_delivered() {
        let job_id = JobId::new();
        let (shared, mut rx, seen) = table_with_job(job_id);

        shared.dispatch(event(WorkerEvent::Progress { job_id, percent: 30 }));
        shared.dispatch(event(WorkerEvent::Progress { job_id, percent: 20 }));
        shared.dispatch(event(WorkerEvent::Done {
            job_id,
            result: vec![1, 2],
        }));
        shared.dispatch(event(WorkerEvent::Done {
            job_id,
            result: vec![9],
        }));
        shared.dispatch(event(WorkerEvent::Error {
            job_id: Some(job_id),
            message: "late failure".to_string(),
        }));
        shared.dispatch(event(WorkerEvent::Cancelled { job_id }));
        shared.dispatch(event(WorkerEvent::Progress { job_id, percent: 90 }));

        assert_eq!(rx.try_recv().unwrap(), Ok(vec![1, 2]));
        assert_eq!(*seen.lock().unwrap(), vec![30]);
        assert!(shared.lock_pending().is_empty());
    }

    #[test]
    fn test_error_before_done_wins() {
        let job_id = JobId::new();
        let (shared, mut rx, seen) = table_with_job(job_id);

        shared.dispatch(event(WorkerEvent::Error {
            job_id: Some(job_id),
            message: "invalid data".to_string(),
        }));
        shared.dispatch(event(WorkerEvent::Done {
            job_id,
            result: vec![1],
        }));

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(EngineError::Exec("invalid data".to_string()))
        );
        assert!(seen.lock().unwrap().is_empty());
        assert!(shared.lock_pending().is_empty());
    }

    /// Never finishes loading.
    struct StuckLoad;

    #[async_trait]
    impl Compressor for StuckLoad {
        async fn initialize(&self) -> SessionState {
            std::future::pending().await
        }

        fn status(&self) -> SessionState {
            SessionState::Loading
        }

        async fn compress(
            &self,
            _request: CompressionRequest,
            _progress: Arc<dyn ProgressReporter>,
        ) -> Result<Vec<u8>, EngineError> {
            Err(EngineError::Init("not loaded".to_string()))
        }

        async fn cancel(&self, _job_id: JobId) -> bool {
            false
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hung_workers_share_one_load_deadline() {
        let stuck: CompressorFactory = Arc::new(|| Arc::new(StuckLoad) as Arc<dyn Compressor>);
        let timeout = Duration::from_millis(300);
        let workers = WorkerCompressor::with_factory(3, stuck, timeout, SimulationProfile::default())
            .unwrap();

        let started = Instant::now();
        assert_eq!(workers.initialize().await, SessionState::ReadySimulated);
        let elapsed = started.elapsed();

        assert!(elapsed < timeout * 2, "load took {:?}", elapsed);
        assert_eq!(workers.live_workers(), 0);
        assert!(workers.is_fallback());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let engine = Arc::new(ScriptedEngine::new());
        let result = WorkerCompressor::with_factory(
            0,
            factory(engine),
            Duration::from_secs(1),
            SimulationProfile::default(),
        );
        assert!(matches!(result, Err(ChannelError::SpawnFailed(_))));
    }
}
