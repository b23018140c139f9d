//! Scripted in-memory codec engine for unit and integration tests.
//!
//! Behaviour is driven by the input bytes so one engine can serve a whole
//! batch of jobs with different outcomes:
//! - `FAIL...` makes `exec` fail
//! - `SLOW<u64 ms>...` makes `exec` take that long, reporting progress
//! - anything else succeeds with the first half of the input
//!
//! Available to integration tests through the `test-util` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::{CodecEngine, ProgressReporter};
use crate::error::EngineError;

const FAIL_MARKER: &[u8] = b"FAIL";
const SLOW_MARKER: &[u8] = b"SLOW";

/// How `load` behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBehavior {
    #[default]
    Succeed,
    Fail,
    Panic,
}

#[derive(Default)]
pub struct ScriptedEngine {
    files: Mutex<HashMap<String, Vec<u8>>>,
    load: LoadBehavior,
    load_delay: Duration,
    loads: AtomicUsize,
    execs: AtomicUsize,
    peak_files: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_load(load: LoadBehavior) -> Self {
        Self {
            load,
            ..Self::default()
        }
    }

    pub fn failing_load(mut self) -> Self {
        self.load = LoadBehavior::Fail;
        self
    }

    pub fn with_load_delay_ms(mut self, ms: u64) -> Self {
        self.load_delay = Duration::from_millis(ms);
        self
    }

    pub fn failing_input() -> Vec<u8> {
        let mut bytes = FAIL_MARKER.to_vec();
        bytes.extend_from_slice(&[0u8; 60]);
        bytes
    }

    pub fn slow_input(ms: u64) -> Vec<u8> {
        let mut bytes = SLOW_MARKER.to_vec();
        bytes.extend_from_slice(&ms.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 52]);
        bytes
    }

    pub fn load_calls(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn exec_calls(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    /// Scratch files currently held, sorted.
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_files().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn file_count(&self) -> usize {
        self.lock_files().len()
    }

    /// Most scratch files held at any one time.
    pub fn peak_file_count(&self) -> usize {
        self.peak_files.load(Ordering::SeqCst)
    }

    fn lock_files(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        match self.files.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn store_file(&self, name: String, bytes: Vec<u8>) {
        let mut files = self.lock_files();
        files.insert(name, bytes);
        self.peak_files.fetch_max(files.len(), Ordering::SeqCst);
    }
}

fn bad_args(reason: &str) -> EngineError {
    EngineError::Exec(format!("bad arguments: {}", reason))
}

#[async_trait]
impl CodecEngine for ScriptedEngine {
    async fn load(&self) -> Result<(), EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        match self.load {
            LoadBehavior::Succeed => Ok(()),
            LoadBehavior::Fail => Err(EngineError::Init("engine binary not found".to_string())),
            LoadBehavior::Panic => panic!("engine load crashed"),
        }
    }

    async fn write_file(&self, name: &str, bytes: &[u8]) -> Result<(), EngineError> {
        self.store_file(name.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn exec(&self, args: &[String], progress: &dyn ProgressReporter) -> Result<(), EngineError> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        let input_at = args
            .iter()
            .position(|a| a == "-i")
            .ok_or_else(|| bad_args("missing -i"))?;
        let input_name = args.get(input_at + 1).ok_or_else(|| bad_args("missing input"))?;
        let output_name = args.last().ok_or_else(|| bad_args("missing output"))?.clone();
        let input = self.read_file(input_name).await?;

        if input.starts_with(FAIL_MARKER) {
            return Err(EngineError::Exec("invalid data found when processing input".to_string()));
        }

        if input.starts_with(SLOW_MARKER) && input.len() >= 12 {
            let mut ms = [0u8; 8];
            ms.copy_from_slice(&input[4..12]);
            let total = u64::from_le_bytes(ms);
            for step in 1..=10u64 {
                tokio::time::sleep(Duration::from_millis(total / 10)).await;
                progress.report((step * 9) as u8);
            }
        } else {
            // Out of order on purpose.
            for p in [20u8, 55, 35, 80] {
                progress.report(p);
                tokio::task::yield_now().await;
            }
        }

        self.store_file(output_name, input[..input.len() / 2].to_vec());
        Ok(())
    }

    async fn read_file(&self, name: &str) -> Result<Vec<u8>, EngineError> {
        self.lock_files()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::File {
                name: name.to_string(),
                reason: "no such file".to_string(),
            })
    }

    async fn delete_file(&self, name: &str) -> Result<(), EngineError> {
        self.lock_files().remove(name);
        Ok(())
    }
}
