//! Shared test utilities for ghostpress integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring an orchestrator to a scripted engine
//! - `ScriptedEngine`, the crate's in-memory codec engine (`test-util`)
//! - Builders for configurations and source files

pub mod builders;
pub mod harness;

pub use builders::*;
pub use ghostpress::testing::{LoadBehavior, ScriptedEngine};
pub use harness::{scripted_compressor, TestHarness};
