//! Engine availability: simulation fallback, worker contexts and crashes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use common::*;
use ghostpress::engine::{InProcessCompressor, ProgressReporter};
use ghostpress::worker::CompressorFactory;
use ghostpress::{
    CompressionRequest, Compressor, EngineError, FailureKind, JobId, JobStatus, SessionState,
    WorkerCompressor,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_load_failure_falls_back_to_simulation() {
    let harness = TestHarness::in_process(
        ScriptedEngine::with_load(LoadBehavior::Fail),
        ConfigBuilder::new().build(),
    );
    assert_eq!(harness.orchestrator.engine_status(), SessionState::Uninitialized);

    // No explicit initialization; the first job brings the engine up.
    let ids = harness.submit(vec![image("a.png", 100), video("b.mp4", 33)]);
    harness.orchestrator.start_all().unwrap();
    harness.settle().await;

    assert!(harness.orchestrator.is_simulated());
    assert_eq!(harness.engine.load_calls(), 1);
    assert_eq!(harness.engine.exec_calls(), 0);
    assert_eq!(harness.store().get(ids[0]).unwrap().result_size, Some(70));
    assert_eq!(harness.store().get(ids[1]).unwrap().result_size, Some(23));

    // Initialization is not retried.
    assert_eq!(harness.orchestrator.initialize_engine().await, SessionState::ReadySimulated);
    assert_eq!(harness.engine.load_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forced_simulation_from_config() {
    let config = ConfigBuilder::new().forced_simulation().size_ratio(0.5).build();
    let harness = TestHarness::from_config(config);

    assert_eq!(harness.orchestrator.initialize_engine().await, SessionState::ReadySimulated);
    let ids = harness.submit(vec![image("a.png", 101)]);
    harness.orchestrator.start_all().unwrap();
    harness.settle().await;

    let job = harness.store().get(ids[0]).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result_size, Some(50));
    assert_eq!(job.progress, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_contexts_compress_jobs() {
    let harness = TestHarness::with_workers(ScriptedEngine::new(), ConfigBuilder::new().workers(2).build());

    assert_eq!(harness.orchestrator.initialize_engine().await, SessionState::Ready);
    assert_eq!(harness.engine.load_calls(), 2);

    let ids = harness.submit(vec![
        image("a.png", 40),
        slow_video("b.mp4", 50),
        broken_image("c.png"),
        image("d.png", 10),
    ]);
    harness.orchestrator.start_all().unwrap();
    harness.settle().await;

    let store = harness.store();
    assert_eq!(store.get(ids[0]).unwrap().result_size, Some(20));
    assert_eq!(store.status(ids[1]), Some(JobStatus::Completed));
    assert_eq!(store.status(ids[3]), Some(JobStatus::Completed));

    let failed = store.get(ids[2]).unwrap();
    assert_eq!(failed.status, JobStatus::Error);
    assert!(failed.error.unwrap().message.contains("invalid data"));
    assert_eq!(harness.engine.file_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_cancel_round_trip() {
    let harness = TestHarness::with_workers(ScriptedEngine::new(), ConfigBuilder::new().workers(1).build());
    harness.orchestrator.initialize_engine().await;

    let ids = harness.submit(vec![slow_video("long.mp4", 5_000)]);
    harness.orchestrator.start_all().unwrap();
    harness.wait_for_status(ids[0], JobStatus::Compressing).await;
    assert!(harness.orchestrator.cancel(ids[0]).unwrap());

    tokio::time::timeout(Duration::from_secs(2), harness.settle())
        .await
        .expect("cancel did not reach the worker");
    let job = harness.store().get(ids[0]).unwrap();
    assert_eq!(job.error.unwrap().kind, FailureKind::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_load_failure_simulates_inside_workers() {
    let harness = TestHarness::with_workers(
        ScriptedEngine::with_load(LoadBehavior::Fail),
        ConfigBuilder::new().workers(1).build(),
    );

    assert_eq!(harness.orchestrator.initialize_engine().await, SessionState::ReadySimulated);
    let ids = harness.submit(vec![image("a.png", 10)]);
    harness.orchestrator.start_all().unwrap();
    harness.settle().await;

    assert_eq!(harness.store().get(ids[0]).unwrap().result_size, Some(7));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crashed_workers_fall_back_to_in_process_simulation() {
    let harness = TestHarness::with_workers(
        ScriptedEngine::with_load(LoadBehavior::Panic),
        ConfigBuilder::new().workers(2).build(),
    );

    assert_eq!(harness.orchestrator.initialize_engine().await, SessionState::ReadySimulated);

    let ids = harness.submit(vec![image("a.png", 100), image("b.png", 20)]);
    harness.orchestrator.start_all().unwrap();
    harness.settle().await;

    let jobs = harness.store().snapshot();
    assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
    assert_eq!(harness.store().get(ids[0]).unwrap().result_size, Some(70));
    assert_eq!(harness.store().get(ids[1]).unwrap().result_size, Some(14));
}

/// Runs jobs normally but brings down its whole context on cancel.
struct CrashOnCancel {
    inner: InProcessCompressor,
}

#[async_trait]
impl Compressor for CrashOnCancel {
    async fn initialize(&self) -> SessionState {
        self.inner.initialize().await
    }

    fn status(&self) -> SessionState {
        self.inner.status()
    }

    async fn compress(
        &self,
        request: CompressionRequest,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Vec<u8>, EngineError> {
        self.inner.compress(request, progress).await
    }

    async fn cancel(&self, _job_id: JobId) -> bool {
        panic!("engine context crashed");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_crash_fails_only_its_jobs() {
    let config = ConfigBuilder::new().workers(2).build();
    let engine = Arc::new(ScriptedEngine::new());
    let factory: CompressorFactory = {
        let engine = Arc::clone(&engine);
        let config = config.clone();
        Arc::new(move || {
            Arc::new(CrashOnCancel {
                inner: scripted_compressor(&engine, &config),
            }) as Arc<dyn Compressor>
        })
    };
    let workers = Arc::new(
        WorkerCompressor::with_factory(
            2,
            factory,
            config.engine.load_timeout(),
            config.simulation.profile(),
        )
        .unwrap(),
    );
    let harness = TestHarness::with_compressor(workers.clone(), &config);
    assert_eq!(harness.orchestrator.initialize_engine().await, SessionState::Ready);

    let ids = harness.submit(vec![slow_video("doomed.mp4", 5_000), image("after.png", 30)]);
    harness.orchestrator.start_one(ids[0]).unwrap();
    harness.wait_for_status(ids[0], JobStatus::Compressing).await;
    harness.orchestrator.cancel(ids[0]).unwrap();

    tokio::time::timeout(Duration::from_secs(2), harness.settle())
        .await
        .expect("crash did not settle the job");
    let doomed = harness.store().get(ids[0]).unwrap();
    assert_eq!(doomed.status, JobStatus::Error);
    assert_eq!(doomed.error.unwrap().kind, FailureKind::Channel);
    assert_eq!(workers.live_workers(), 1);

    // The surviving context keeps serving.
    harness.orchestrator.start_one(ids[1]).unwrap();
    harness.settle().await;
    let after = harness.store().get(ids[1]).unwrap();
    assert_eq!(after.status, JobStatus::Completed);
    assert_eq!(after.result_size, Some(15));
    assert_eq!(workers.pending_jobs(), 0);
}
