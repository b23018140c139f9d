//! Test harness wiring an orchestrator to a scripted engine.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;

use ghostpress::engine::{EngineSession, InProcessCompressor};
use ghostpress::worker::CompressorFactory;
use ghostpress::{
    Compressor, GhostpressConfig, JobEvent, JobEventBroadcaster, JobId, JobStatus, JobStore,
    Orchestrator, SourceFile, WorkerCompressor,
};

use ghostpress::testing::ScriptedEngine;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Isolated orchestrator plus everything a test needs to observe it.
pub struct TestHarness {
    temp_dir: TempDir,
    pub engine: Arc<ScriptedEngine>,
    pub orchestrator: Orchestrator,
    events: broadcast::Receiver<JobEvent>,
}

impl TestHarness {
    /// Engine runs on the test runtime.
    pub fn in_process(engine: ScriptedEngine, config: GhostpressConfig) -> Self {
        let engine = Arc::new(engine);
        let compressor: Arc<dyn Compressor> = Arc::new(scripted_compressor(&engine, &config));
        Self::assemble(engine, compressor, &config)
    }

    /// Engine runs in worker contexts, one session per context.
    pub fn with_workers(engine: ScriptedEngine, config: GhostpressConfig) -> Self {
        let engine = Arc::new(engine);
        let factory: CompressorFactory = {
            let engine = Arc::clone(&engine);
            let config = config.clone();
            Arc::new(move || Arc::new(scripted_compressor(&engine, &config)) as Arc<dyn Compressor>)
        };
        let workers = WorkerCompressor::with_factory(
            config.engine.worker_count,
            factory,
            config.engine.load_timeout(),
            config.simulation.profile(),
        )
        .expect("Failed to start engine workers");
        Self::assemble(engine, Arc::new(workers), &config)
    }

    /// Everything built from configuration alone, as the CLI does.
    pub fn from_config(config: GhostpressConfig) -> Self {
        let orchestrator = Orchestrator::from_config(&config);
        let events = orchestrator.store().subscribe();
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
            engine: Arc::new(ScriptedEngine::new()),
            orchestrator,
            events,
        }
    }

    /// A caller-supplied compressor; the scripted engine stays unused.
    pub fn with_compressor(compressor: Arc<dyn Compressor>, config: &GhostpressConfig) -> Self {
        Self::assemble(Arc::new(ScriptedEngine::new()), compressor, config)
    }

    fn assemble(
        engine: Arc<ScriptedEngine>,
        compressor: Arc<dyn Compressor>,
        config: &GhostpressConfig,
    ) -> Self {
        let store = Arc::new(JobStore::new(
            config.defaults.clone(),
            JobEventBroadcaster::new(config.queue.event_capacity),
        ));
        let events = store.subscribe();
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
            engine,
            orchestrator: Orchestrator::new(store, compressor, &config.queue),
            events,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        self.orchestrator.store()
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes a config file into the harness directory.
    pub fn write_config(&self, filename: &str, json: &str) -> PathBuf {
        let path = self.temp_dir.path().join(filename);
        std::fs::write(&path, json).expect("Failed to write config file");
        path
    }

    /// Submits files and returns the accepted ids. Panics on rejections.
    pub fn submit(&self, files: Vec<SourceFile>) -> Vec<JobId> {
        let report = self.store().submit(files);
        assert!(report.rejected.is_empty(), "unexpected rejections: {:?}", report.rejected);
        report.accepted
    }

    /// Waits until no job is queued or compressing.
    pub async fn settle(&self) {
        tokio::time::timeout(SETTLE_TIMEOUT, self.orchestrator.wait_for_idle())
            .await
            .expect("jobs did not settle in time");
    }

    pub async fn wait_for_status(&self, id: JobId, status: JobStatus) {
        tokio::time::timeout(SETTLE_TIMEOUT, async {
            while self.store().status(id) != Some(status) {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job {} never reached {}", id, status));
    }

    /// Waits until the orchestrator holds no job task, finished or not.
    pub async fn wait_for_tasks(&self) {
        tokio::time::timeout(SETTLE_TIMEOUT, async {
            while self.orchestrator.running_tasks() > 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("job tasks did not finish in time");
    }

    /// Events received so far, in order.
    pub fn drain_events(&mut self) -> Vec<JobEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }
}

pub fn scripted_compressor(
    engine: &Arc<ScriptedEngine>,
    config: &GhostpressConfig,
) -> InProcessCompressor {
    let session = if config.simulation.force {
        EngineSession::simulated()
    } else {
        EngineSession::new(Arc::clone(engine) as Arc<dyn ghostpress::CodecEngine>)
    };
    InProcessCompressor::new(
        Arc::new(session),
        config.engine.video_options(),
        config.simulation.profile(),
        config.engine.parallelism,
    )
}
