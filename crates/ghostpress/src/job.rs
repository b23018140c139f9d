//! Job identity, settings and lifecycle types shared by the store, the
//! orchestrator and the engine protocol.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, StoreError, ValidationError};

/// Opaque job identifier. Assigned once at submission and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(uuid::Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Short form used in scratch file names and log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

/// Broad media category, derived once from the source at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Other,
}

impl MediaKind {
    /// Classifies a file from its content type, falling back to the extension
    /// for containers that are often reported without a precise type.
    pub fn detect(mime_type: &str, name: &str) -> Self {
        if mime_type.starts_with("image/") {
            return MediaKind::Image;
        }
        if mime_type.starts_with("video/") {
            return MediaKind::Video;
        }
        let extension = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match extension.as_deref() {
            Some("mkv") | Some("mov") => MediaKind::Video,
            _ => MediaKind::Other,
        }
    }

    pub fn is_supported(self) -> bool {
        !matches!(self, MediaKind::Other)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Image => write!(f, "image"),
            MediaKind::Video => write!(f, "video"),
            MediaKind::Other => write!(f, "other"),
        }
    }
}

/// Immutable byte buffer shared between the store, the engine and blob handles.
/// Cloning it bumps a reference count; the bytes are never duplicated.
pub type SharedBytes = Arc<Vec<u8>>;

/// Target format value that keeps the source container.
pub const ORIGINAL_FORMAT: &str = "original";

/// Per-job compression settings. Frozen once compression starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompressionSettings {
    /// 0-100, higher keeps more quality.
    pub quality: u8,
    /// Output extension, or `original` to keep the source extension.
    pub target_format: String,
    pub strip_metadata: bool,
    /// Optional downscale multiplier in (0, 1].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<f32>,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            quality: 75,
            target_format: ORIGINAL_FORMAT.to_string(),
            strip_metadata: true,
            scale: Some(1.0),
        }
    }
}

impl CompressionSettings {
    /// Checks every field against its documented range.
    pub fn validate(&self) -> Result<(), StoreError> {
        check_quality(self.quality)?;
        check_format(&self.target_format)?;
        if let Some(scale) = self.scale {
            check_scale(scale)?;
        }
        Ok(())
    }

    /// Applies a single typed update after validating it.
    pub fn apply(&mut self, update: SettingsUpdate) -> Result<(), StoreError> {
        match update {
            SettingsUpdate::Quality(quality) => {
                check_quality(quality)?;
                self.quality = quality;
            }
            SettingsUpdate::TargetFormat(format) => {
                let format = format.trim().trim_start_matches('.').to_ascii_lowercase();
                check_format(&format)?;
                self.target_format = format;
            }
            SettingsUpdate::StripMetadata(strip) => self.strip_metadata = strip,
            SettingsUpdate::Scale(scale) => {
                if let Some(scale) = scale {
                    check_scale(scale)?;
                }
                self.scale = scale;
            }
        }
        Ok(())
    }

    /// True when the scale asks for an actual downscale.
    pub fn effective_scale(&self) -> Option<f32> {
        self.scale.filter(|s| *s < 1.0)
    }
}

fn check_quality(quality: u8) -> Result<(), StoreError> {
    if quality > 100 {
        return Err(StoreError::InvalidSetting {
            key: "quality",
            reason: format!("{} is outside 0-100", quality),
        });
    }
    Ok(())
}

fn check_format(format: &str) -> Result<(), StoreError> {
    if format.is_empty() || !format.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(StoreError::InvalidSetting {
            key: "targetFormat",
            reason: format!("'{}' is not a file extension", format),
        });
    }
    Ok(())
}

fn check_scale(scale: f32) -> Result<(), StoreError> {
    if !(scale > 0.0 && scale <= 1.0) {
        return Err(StoreError::InvalidSetting {
            key: "scale",
            reason: format!("{} is outside (0, 1]", scale),
        });
    }
    Ok(())
}

/// Typed replacement for the UI's `(key, value)` settings update.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsUpdate {
    Quality(u8),
    TargetFormat(String),
    StripMetadata(bool),
    Scale(Option<f32>),
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    /// Waiting for a free compression slot. Only entered when concurrency is bounded.
    Queued,
    Compressing,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }

    /// Queued jobs count as active: they will start without further input.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Compressing)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Idle => write!(f, "idle"),
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Compressing => write!(f, "compressing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

/// Why a job ended in `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Engine,
    Channel,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&EngineError> for JobFailure {
    fn from(error: &EngineError) -> Self {
        let kind = match error {
            EngineError::Cancelled => FailureKind::Cancelled,
            EngineError::Channel(_) => FailureKind::Channel,
            _ => FailureKind::Engine,
        };
        Self {
            kind,
            message: error.to_string(),
        }
    }
}

/// Start/end timestamps of the compressing phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTiming {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobTiming {
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// A file handed over by the acquisition layer.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    /// Declared content type. Guessed from the name when absent.
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, mime_type: Option<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type,
            bytes,
        }
    }

    /// Declared content type, or one guessed with `mime_guess`.
    pub fn resolved_mime_type(&self) -> String {
        self.mime_type
            .clone()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| {
                mime_guess::from_path(&self.name)
                    .first()
                    .map(|m| m.to_string())
            })
            .unwrap_or_else(|| "application/octet-stream".to_string())
    }

    /// Classifies the file, rejecting kinds the engine does not handle.
    pub fn classify(&self) -> Result<(String, MediaKind), ValidationError> {
        if self.bytes.is_empty() {
            return Err(ValidationError::Empty(self.name.clone()));
        }
        let mime_type = self.resolved_mime_type();
        let kind = MediaKind::detect(&mime_type, &self.name);
        if !kind.is_supported() {
            return Err(ValidationError::UnsupportedKind {
                name: self.name.clone(),
                mime_type,
            });
        }
        Ok((mime_type, kind))
    }
}

/// Everything the engine needs for one compression, frozen at start time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionRequest {
    pub job_id: JobId,
    pub file_name: String,
    pub media_kind: MediaKind,
    /// Shared with the job; never copied.
    pub source: SharedBytes,
    pub settings: CompressionSettings,
}

impl CompressionRequest {
    /// Extension of the source file name, lowercased.
    pub fn source_extension(&self) -> Option<String> {
        Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}
