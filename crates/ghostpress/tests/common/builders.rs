//! Builders for test configurations and source files.

#![allow(dead_code)]

use ghostpress::config::{ExecutionMode, GhostpressConfig};
use ghostpress::{CompressionSettings, SourceFile};

use ghostpress::testing::ScriptedEngine;

/// Builder for `GhostpressConfig` instances tuned for fast tests.
pub struct ConfigBuilder {
    config: GhostpressConfig,
}

impl ConfigBuilder {
    /// In-process mode, 1ms simulation ticks.
    pub fn new() -> Self {
        let mut config = GhostpressConfig::default();
        config.engine.mode = ExecutionMode::InProcess;
        config.engine.load_timeout_ms = 5_000;
        config.simulation.tick_ms = 1;
        config.queue.event_capacity = 4_096;
        Self { config }
    }

    pub fn workers(mut self, count: usize) -> Self {
        self.config.engine.mode = ExecutionMode::Worker;
        self.config.engine.worker_count = count;
        self
    }

    pub fn forced_simulation(mut self) -> Self {
        self.config.simulation.force = true;
        self
    }

    pub fn size_ratio(mut self, ratio: f64) -> Self {
        self.config.simulation.size_ratio = ratio;
        self
    }

    pub fn max_concurrent_jobs(mut self, limit: usize) -> Self {
        self.config.queue.max_concurrent_jobs = Some(limit);
        self
    }

    pub fn cancel_on_remove(mut self) -> Self {
        self.config.queue.cancel_on_remove = true;
        self
    }

    pub fn defaults(mut self, defaults: CompressionSettings) -> Self {
        self.config.defaults = defaults;
        self
    }

    pub fn build(self) -> GhostpressConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn image(name: &str, size: usize) -> SourceFile {
    SourceFile::new(name, Some("image/png".to_string()), vec![7u8; size])
}

pub fn video(name: &str, size: usize) -> SourceFile {
    SourceFile::new(name, Some("video/mp4".to_string()), vec![3u8; size])
}

/// An image the scripted engine rejects.
pub fn broken_image(name: &str) -> SourceFile {
    SourceFile::new(name, Some("image/png".to_string()), ScriptedEngine::failing_input())
}

/// A video the scripted engine takes `ms` to compress.
pub fn slow_video(name: &str, ms: u64) -> SourceFile {
    SourceFile::new(name, Some("video/mp4".to_string()), ScriptedEngine::slow_input(ms))
}
