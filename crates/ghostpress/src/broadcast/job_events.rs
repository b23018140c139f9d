//! Job event broadcaster for real-time status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{JobFailure, JobId, JobStatus};

/// What happened to a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Submitted,
    SettingsChanged,
    Queued,
    Started,
    Progress,
    Completed,
    Failed,
    Removed,
}

impl std::fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobEventKind::Submitted => write!(f, "Submitted"),
            JobEventKind::SettingsChanged => write!(f, "Settings changed"),
            JobEventKind::Queued => write!(f, "Queued"),
            JobEventKind::Started => write!(f, "Started"),
            JobEventKind::Progress => write!(f, "Progress"),
            JobEventKind::Completed => write!(f, "Completed"),
            JobEventKind::Failed => write!(f, "Failed"),
            JobEventKind::Removed => write!(f, "Removed"),
        }
    }
}

/// A change to one job, as seen by observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: JobId,
    pub filename: String,
    pub kind: JobEventKind,
    /// Job status after the change. Absent once the job is removed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    pub progress: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Compressed size (set on completion).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_size: Option<usize>,
    /// Failure details (set on failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

impl JobEvent {
    pub fn new(
        job_id: JobId,
        filename: &str,
        kind: JobEventKind,
        status: Option<JobStatus>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            filename: filename.to_string(),
            kind,
            status,
            progress: 0,
            message: message.into(),
            timestamp: Utc::now(),
            result_size: None,
            error: None,
        }
    }

    pub fn progress(job_id: JobId, filename: &str, percent: u8) -> Self {
        let mut event = Self::new(
            job_id,
            filename,
            JobEventKind::Progress,
            Some(JobStatus::Compressing),
            format!("{}%", percent),
        );
        event.progress = percent;
        event
    }

    pub fn completed(job_id: JobId, filename: &str, original_size: usize, result_size: usize) -> Self {
        let mut event = Self::new(
            job_id,
            filename,
            JobEventKind::Completed,
            Some(JobStatus::Completed),
            format!("Compressed {} → {} bytes", original_size, result_size),
        );
        event.progress = 100;
        event.result_size = Some(result_size);
        event
    }

    pub fn failed(job_id: JobId, filename: &str, progress: u8, failure: JobFailure) -> Self {
        let mut event = Self::new(
            job_id,
            filename,
            JobEventKind::Failed,
            Some(JobStatus::Error),
            failure.message.clone(),
        );
        event.progress = progress;
        event.error = Some(failure);
        event
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, JobEventKind::Completed | JobEventKind::Failed)
    }
}

/// Broadcasts job events to any number of subscribers.
#[derive(Clone)]
pub struct JobEventBroadcaster {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl JobEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: JobEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FailureKind;

    #[test]
    fn test_send_without_subscribers() {
        let broadcaster = JobEventBroadcaster::new(4);
        broadcaster.send(JobEvent::progress(JobId::new(), "a.png", 10));
        assert_eq!(broadcaster.receiver_count(), 0);
    }

    #[test]
    fn test_send_receive() {
        let broadcaster = JobEventBroadcaster::new(10);
        let mut rx = broadcaster.subscribe();
        let id = JobId::new();

        broadcaster.send(JobEvent::progress(id, "clip.mp4", 42));
        broadcaster.send(JobEvent::completed(id, "clip.mp4", 1000, 700));

        let progress = rx.try_recv().unwrap();
        assert_eq!(progress.job_id, id);
        assert_eq!(progress.kind, JobEventKind::Progress);
        assert_eq!(progress.progress, 42);
        assert!(!progress.is_terminal());

        let done = rx.try_recv().unwrap();
        assert!(done.is_terminal());
        assert_eq!(done.status, Some(JobStatus::Completed));
        assert_eq!(done.result_size, Some(700));
    }

    #[test]
    fn test_failed_event_serialization() {
        let event = JobEvent::failed(
            JobId::new(),
            "a.png",
            30,
            JobFailure {
                kind: FailureKind::Engine,
                message: "bad input".to_string(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "failed");
        assert_eq!(json["status"], "error");
        assert_eq!(json["progress"], 30);
        assert_eq!(json["error"]["kind"], "engine");
        assert!(json.get("resultSize").is_none());
    }
}
