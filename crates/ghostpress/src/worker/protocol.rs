//! Messages exchanged with engine worker contexts.
//!
//! The JSON form is tagged by `type` with camelCase names and fields, so the
//! same contract works across a process boundary.

use serde::{Deserialize, Serialize};

use crate::job::{CompressionRequest, JobId};

/// Control context → worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerRequest {
    Load,
    Compress(CompressionRequest),
    Cancel { job_id: JobId },
    Shutdown,
}

/// Worker → control context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerEvent {
    Loaded {
        simulated: bool,
    },
    Progress {
        job_id: JobId,
        percent: u8,
    },
    /// The result buffer moves to the receiver.
    Done {
        job_id: JobId,
        result: Vec<u8>,
    },
    /// Job-scoped when `job_id` is set, otherwise the whole context failed.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<JobId>,
        message: String,
    },
    /// Sent once the cancelled job's scratch files are gone.
    Cancelled {
        job_id: JobId,
    },
}

impl WorkerEvent {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            WorkerEvent::Loaded { .. } => None,
            WorkerEvent::Progress { job_id, .. }
            | WorkerEvent::Done { job_id, .. }
            | WorkerEvent::Cancelled { job_id } => Some(*job_id),
            WorkerEvent::Error { job_id, .. } => *job_id,
        }
    }

    /// True for events that settle a job.
    pub fn is_terminal(&self) -> bool {
        match self {
            WorkerEvent::Done { .. } | WorkerEvent::Cancelled { .. } => true,
            WorkerEvent::Error { job_id, .. } => job_id.is_some(),
            _ => false,
        }
    }
}

/// An event tagged with the context that produced it.
#[derive(Debug)]
pub struct WorkerMessage {
    pub worker: usize,
    pub event: WorkerEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CompressionSettings, MediaKind};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_request_json_shape() {
        let job_id = JobId::new();
        let request = WorkerRequest::Compress(CompressionRequest {
            job_id,
            file_name: "a.png".to_string(),
            media_kind: MediaKind::Image,
            source: Arc::new(vec![1, 2]),
            settings: CompressionSettings::default(),
        });

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["type"], "compress");
        assert_eq!(value["jobId"], json!(job_id.to_string()));
        assert_eq!(value["mediaKind"], "image");
        assert_eq!(value["source"], json!([1, 2]));
        assert_eq!(value["settings"]["stripMetadata"], true);

        let cancel = serde_json::to_value(WorkerRequest::Cancel { job_id }).unwrap();
        assert_eq!(cancel, json!({ "type": "cancel", "jobId": job_id.to_string() }));
        assert_eq!(
            serde_json::to_value(WorkerRequest::Load).unwrap(),
            json!({ "type": "load" })
        );
    }

    #[test]
    fn test_event_json_shape() {
        let job_id = JobId::new();
        let global = WorkerEvent::Error {
            job_id: None,
            message: "boom".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&global).unwrap(),
            json!({ "type": "error", "message": "boom" })
        );

        let parsed: WorkerEvent = serde_json::from_value(json!({
            "type": "progress",
            "jobId": job_id.to_string(),
            "percent": 42
        }))
        .unwrap();
        assert_eq!(parsed, WorkerEvent::Progress { job_id, percent: 42 });
    }

    #[test]
    fn test_terminal_classification() {
        let job_id = JobId::new();
        assert!(WorkerEvent::Done { job_id, result: vec![] }.is_terminal());
        assert!(WorkerEvent::Cancelled { job_id }.is_terminal());
        assert!(WorkerEvent::Error { job_id: Some(job_id), message: String::new() }.is_terminal());
        assert!(!WorkerEvent::Error { job_id: None, message: String::new() }.is_terminal());
        assert!(!WorkerEvent::Progress { job_id, percent: 1 }.is_terminal());
        assert_eq!(WorkerEvent::Loaded { simulated: true }.job_id(), None);
    }
}
