use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::{SimulationProfile, VideoCodecOptions};
use crate::job::CompressionSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GhostpressConfig {
    pub version: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    /// Settings applied to newly submitted jobs.
    #[serde(default)]
    pub defaults: CompressionSettings,
}

impl Default for GhostpressConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            engine: EngineConfig::default(),
            simulation: SimulationConfig::default(),
            queue: QueueConfig::default(),
            defaults: CompressionSettings::default(),
        }
    }
}

/// Where the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Isolated worker contexts reached through the job protocol.
    #[default]
    Worker,
    /// Engine calls run directly on the caller's runtime.
    InProcess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default = "default_binary")]
    pub binary: PathBuf,
    /// Parent directory for engine scratch space. System temp dir when unset.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Concurrent engine invocations per context.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_video_preset")]
    pub video_preset: String,
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
}

fn default_binary() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_worker_count() -> usize {
    1
}

fn default_parallelism() -> usize {
    num_cpus::get()
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

fn default_video_preset() -> String {
    "ultrafast".to_string()
}

fn default_load_timeout_ms() -> u64 {
    30_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            binary: default_binary(),
            scratch_dir: None,
            worker_count: default_worker_count(),
            parallelism: default_parallelism(),
            video_codec: default_video_codec(),
            video_preset: default_video_preset(),
            load_timeout_ms: default_load_timeout_ms(),
        }
    }
}

impl EngineConfig {
    pub fn video_options(&self) -> VideoCodecOptions {
        VideoCodecOptions {
            codec: self.video_codec.clone(),
            preset: self.video_preset.clone(),
        }
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_size_ratio")]
    pub size_ratio: f64,
    /// Skip the engine entirely.
    #[serde(default)]
    pub force: bool,
}

fn default_tick_ms() -> u64 {
    100
}

fn default_size_ratio() -> f64 {
    0.7
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            size_ratio: default_size_ratio(),
            force: false,
        }
    }
}

impl SimulationConfig {
    pub fn profile(&self) -> SimulationProfile {
        SimulationProfile {
            tick: Duration::from_millis(self.tick_ms),
            size_ratio: self.size_ratio,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Upper bound on jobs compressing at once. Unbounded when unset.
    #[serde(default)]
    pub max_concurrent_jobs: Option<usize>,
    /// Cancel in-flight work when its job is removed.
    #[serde(default)]
    pub cancel_on_remove: bool,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_event_capacity() -> usize {
    256
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: None,
            cancel_on_remove: false,
            event_capacity: default_event_capacity(),
        }
    }
}
