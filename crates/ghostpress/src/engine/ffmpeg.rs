//! Codec engine backed by an `ffmpeg` executable and a private scratch directory.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as TokioCommand;

use super::progress::ProgressReporter;
use super::CodecEngine;
use crate::error::EngineError;

/// Number of stderr lines kept for error reporting.
const STDERR_TAIL: usize = 12;

pub struct FfmpegEngine {
    binary: PathBuf,
    scratch_root: Option<PathBuf>,
    scratch: OnceLock<TempDir>,
}

impl FfmpegEngine {
    pub fn new(binary: impl Into<PathBuf>, scratch_root: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            scratch_root,
            scratch: OnceLock::new(),
        }
    }

    /// Scratch directory, available once the engine is loaded.
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.get().map(|dir| dir.path())
    }

    fn scratch_path(&self, name: &str) -> Result<PathBuf, EngineError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == ".." {
            return Err(EngineError::File {
                name: name.to_string(),
                reason: "not a bare file name".to_string(),
            });
        }
        let dir = self
            .scratch_dir()
            .ok_or_else(|| EngineError::Init("engine is not loaded".to_string()))?;
        Ok(dir.join(name))
    }

    fn create_scratch(&self) -> Result<TempDir, EngineError> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("ghostpress-");
            b
        };
        let dir = match &self.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|e| {
                    EngineError::Init(format!(
                        "cannot create scratch root {}: {}",
                        root.display(),
                        e
                    ))
                })?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        };
        dir.map_err(|e| EngineError::Init(format!("cannot create scratch directory: {}", e)))
    }
}

#[async_trait]
impl CodecEngine for FfmpegEngine {
    async fn load(&self) -> Result<(), EngineError> {
        let output = TokioCommand::new(&self.binary)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                EngineError::Init(format!("cannot run {}: {}", self.binary.display(), e))
            })?;

        if !output.status.success() {
            return Err(EngineError::Init(format!(
                "{} -version exited with {}",
                self.binary.display(),
                output.status
            )));
        }

        let banner = String::from_utf8_lossy(&output.stdout);
        if let Some(first) = banner.lines().next() {
            log::info!("Codec engine: {}", first.trim());
        }

        if self.scratch.get().is_none() {
            let dir = self.create_scratch()?;
            log::debug!("Engine scratch directory: {}", dir.path().display());
            // A concurrent load may have won; its directory is kept and ours is dropped.
            let _ = self.scratch.set(dir);
        }
        Ok(())
    }

    async fn write_file(&self, name: &str, bytes: &[u8]) -> Result<(), EngineError> {
        let path = self.scratch_path(name)?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| EngineError::File {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    async fn exec(&self, args: &[String], progress: &dyn ProgressReporter) -> Result<(), EngineError> {
        let dir = self
            .scratch_dir()
            .ok_or_else(|| EngineError::Init("engine is not loaded".to_string()))?;

        let mut cmd = TokioCommand::new(&self.binary);
        cmd.current_dir(dir)
            .args(["-hide_banner", "-nostdin", "-nostats", "-y", "-progress", "pipe:2"])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::Exec(format!("failed to start engine: {}", e)))?;

        let mut parser = ProgressParser::default();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL);

        if let Some(stderr) = child.stderr.take() {
            // Metadata tags are printed unescaped, so lines are not always UTF-8.
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Stopped reading engine output: {}", e);
                        break;
                    }
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                match parser.parse_line(line) {
                    Some(percent) => progress.report(percent),
                    None if !ProgressParser::is_progress_key(line) => {
                        if tail.len() == STDERR_TAIL {
                            tail.pop_front();
                        }
                        tail.push_back(line.to_string());
                    }
                    None => {}
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| EngineError::Exec(format!("failed to wait for engine: {}", e)))?;

        if status.success() {
            Ok(())
        } else {
            let detail = tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
            Err(EngineError::Exec(if detail.trim().is_empty() {
                format!("engine exited with {}", status)
            } else {
                format!("engine exited with {}: {}", status, detail.trim())
            }))
        }
    }

    async fn read_file(&self, name: &str) -> Result<Vec<u8>, EngineError> {
        let path = self.scratch_path(name)?;
        tokio::fs::read(&path).await.map_err(|e| EngineError::File {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    async fn delete_file(&self, name: &str) -> Result<(), EngineError> {
        let path = self.scratch_path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::File {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Turns the engine's `-progress` key/value stream into percentages.
///
/// The total duration comes from the input banner. Until the final
/// `progress=end` marker, values are capped at 99.
#[derive(Debug, Default)]
pub struct ProgressParser {
    duration_us: Option<u64>,
}

impl ProgressParser {
    pub fn parse_line(&mut self, line: &str) -> Option<u8> {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix("Duration:") {
            if self.duration_us.is_none() {
                let stamp = rest.split(',').next().unwrap_or("").trim();
                self.duration_us = parse_timestamp_us(stamp).filter(|d| *d > 0);
            }
            return None;
        }

        let (key, value) = line.split_once('=')?;
        match key {
            // Both keys carry microseconds.
            "out_time_us" | "out_time_ms" => {
                let elapsed: u64 = value.trim().parse().ok()?;
                let total = self.duration_us?;
                let percent = (elapsed.saturating_mul(100) / total).min(99);
                Some(percent as u8)
            }
            "progress" if value.trim() == "end" => Some(100),
            _ => None,
        }
    }

    fn is_progress_key(line: &str) -> bool {
        match line.trim().split_once('=') {
            Some((key, _)) => !key.is_empty() && !key.contains(char::is_whitespace),
            None => false,
        }
    }
}

/// Parses `HH:MM:SS.frac` into microseconds.
fn parse_timestamp_us(stamp: &str) -> Option<u64> {
    let mut parts = stamp.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let whole = (hours * 3600 + minutes * 60) * 1_000_000;
    Some(whole + (seconds * 1_000_000.0).round() as u64)
}
