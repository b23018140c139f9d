//! Engine session: one-shot engine acquisition with simulation fallback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use super::CodecEngine;

/// Which backend the session settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    Real,
    Simulated,
}

/// Observable readiness of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Loading,
    Ready,
    ReadySimulated,
}

impl SessionState {
    pub fn is_ready(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::ReadySimulated)
    }
}

impl From<EngineMode> for SessionState {
    fn from(mode: EngineMode) -> Self {
        match mode {
            EngineMode::Real => SessionState::Ready,
            EngineMode::Simulated => SessionState::ReadySimulated,
        }
    }
}

/// Raises a loading flag for as long as it lives.
///
/// Dropping it lowers the flag, so a load abandoned mid-flight does not
/// leave the state stuck at `Loading`.
pub(crate) struct LoadingGuard<'a>(&'a AtomicBool);

impl<'a> LoadingGuard<'a> {
    pub(crate) fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the engine for one execution context.
///
/// Initialization runs at most once; concurrent callers wait for the same
/// attempt. A failed load never surfaces as an error: the session settles on
/// simulation instead.
pub struct EngineSession {
    engine: Option<Arc<dyn CodecEngine>>,
    mode: OnceCell<EngineMode>,
    loading: AtomicBool,
}

impl EngineSession {
    pub fn new(engine: Arc<dyn CodecEngine>) -> Self {
        Self {
            engine: Some(engine),
            mode: OnceCell::new(),
            loading: AtomicBool::new(false),
        }
    }

    /// A session that never loads an engine.
    pub fn simulated() -> Self {
        Self {
            engine: None,
            mode: OnceCell::new(),
            loading: AtomicBool::new(false),
        }
    }

    pub async fn initialize(&self) -> EngineMode {
        *self
            .mode
            .get_or_init(|| async {
                let _loading = LoadingGuard::raise(&self.loading);
                match &self.engine {
                    None => {
                        log::info!("No codec engine configured, using simulation");
                        EngineMode::Simulated
                    }
                    Some(engine) => match engine.load().await {
                        Ok(()) => {
                            log::info!("Codec engine loaded");
                            EngineMode::Real
                        }
                        Err(e) => {
                            log::warn!("Codec engine unavailable, falling back to simulation: {}", e);
                            EngineMode::Simulated
                        }
                    },
                }
            })
            .await
    }

    pub fn state(&self) -> SessionState {
        match self.mode.get() {
            Some(mode) => (*mode).into(),
            None if self.loading.load(Ordering::Acquire) => SessionState::Loading,
            None => SessionState::Uninitialized,
        }
    }

    /// The loaded engine, or `None` while uninitialized or simulated.
    pub fn engine(&self) -> Option<&Arc<dyn CodecEngine>> {
        match self.mode.get() {
            Some(EngineMode::Real) => self.engine.as_ref(),
            _ => None,
        }
    }
}
