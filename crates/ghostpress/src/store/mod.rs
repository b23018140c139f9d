//! Job store: the ordered job collection and its lifecycle transitions.
//!
//! Every mutation goes through a transition method that checks the current
//! status first; illegal transitions are refused, never applied.

pub mod blob;

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::broadcast::{JobEvent, JobEventBroadcaster, JobEventKind};
use crate::error::{StoreError, ValidationError};
use crate::job::{
    CompressionRequest, CompressionSettings, JobFailure, JobId, JobStatus, JobTiming, MediaKind,
    SettingsUpdate, SharedBytes, SourceFile,
};

pub use blob::{BlobHandle, BlobRegistry};

struct Job {
    id: JobId,
    name: String,
    mime_type: String,
    media_kind: MediaKind,
    source: SharedBytes,
    settings: CompressionSettings,
    status: JobStatus,
    progress: u8,
    result: Option<SharedBytes>,
    failure: Option<JobFailure>,
    timing: JobTiming,
    submitted_at: DateTime<Utc>,
    preview: Option<BlobHandle>,
    result_handle: Option<BlobHandle>,
}

impl Job {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            name: self.name.clone(),
            mime_type: self.mime_type.clone(),
            media_kind: self.media_kind,
            source_size: self.source.len(),
            settings: self.settings.clone(),
            status: self.status,
            progress: self.progress,
            result_size: self.result.as_ref().map(|r| r.len()),
            error: self.failure.clone(),
            timing: self.timing,
            submitted_at: self.submitted_at,
            preview_url: self.preview.as_ref().map(|h| h.url().to_string()),
            result_url: self.result_handle.as_ref().map(|h| h.url().to_string()),
        }
    }

    fn event(&self, kind: JobEventKind, message: impl Into<String>) -> JobEvent {
        let mut event = JobEvent::new(self.id, &self.name, kind, Some(self.status), message);
        event.progress = self.progress;
        event
    }

    fn release_handles(&mut self) {
        if let Some(handle) = self.preview.take() {
            handle.release();
        }
        if let Some(handle) = self.result_handle.take() {
            handle.release();
        }
    }
}

/// Read-only view of a job for presentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    pub name: String,
    pub mime_type: String,
    pub media_kind: MediaKind,
    pub source_size: usize,
    pub settings: CompressionSettings,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    pub timing: JobTiming,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
}

impl JobSnapshot {
    /// Bytes saved by this job. Zero unless completed; negative if it grew.
    pub fn bytes_saved(&self) -> i64 {
        match (self.status, self.result_size) {
            (JobStatus::Completed, Some(result)) => self.source_size as i64 - result as i64,
            _ => 0,
        }
    }
}

/// Outcome of a submission.
#[derive(Debug, Default)]
pub struct SubmitReport {
    pub accepted: Vec<JobId>,
    pub rejected: Vec<ValidationError>,
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub idle: usize,
    pub queued: usize,
    pub compressing: usize,
    pub completed: usize,
    pub error: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.idle + self.queued + self.compressing + self.completed + self.error
    }

    pub fn active(&self) -> usize {
        self.queued + self.compressing
    }
}

#[derive(Default)]
struct JobCollection {
    order: Vec<JobId>,
    entries: HashMap<JobId, Job>,
}

impl JobCollection {
    fn iter(&self) -> impl Iterator<Item = &Job> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }
}

/// Source of truth for submitted jobs.
pub struct JobStore {
    jobs: RwLock<JobCollection>,
    blobs: BlobRegistry,
    events: JobEventBroadcaster,
    defaults: CompressionSettings,
}

impl JobStore {
    pub fn new(defaults: CompressionSettings, events: JobEventBroadcaster) -> Self {
        Self {
            jobs: RwLock::new(JobCollection::default()),
            blobs: BlobRegistry::new(),
            events,
            defaults,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, JobCollection> {
        match self.jobs.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, JobCollection> {
        match self.jobs.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn defaults(&self) -> &CompressionSettings {
        &self.defaults
    }

    /// Creates an idle job per supported file, in order. Unsupported or empty
    /// files are reported back and not stored.
    pub fn submit(&self, files: Vec<SourceFile>) -> SubmitReport {
        let mut report = SubmitReport::default();
        let mut events = Vec::new();
        {
            let mut jobs = self.write();
            for file in files {
                let (mime_type, media_kind) = match file.classify() {
                    Ok(classified) => classified,
                    Err(e) => {
                        log::warn!("Rejected {}: {}", file.name, e);
                        report.rejected.push(e);
                        continue;
                    }
                };

                let source: SharedBytes = Arc::new(file.bytes);
                let job = Job {
                    id: JobId::new(),
                    name: file.name,
                    mime_type,
                    media_kind,
                    preview: Some(self.blobs.create(Arc::clone(&source))),
                    source,
                    settings: self.defaults.clone(),
                    status: JobStatus::Idle,
                    progress: 0,
                    result: None,
                    failure: None,
                    timing: JobTiming::default(),
                    submitted_at: Utc::now(),
                    result_handle: None,
                };
                log::debug!("Submitted {} as job {} ({})", job.name, job.id, job.media_kind);
                events.push(job.event(JobEventKind::Submitted, "Submitted"));
                report.accepted.push(job.id);
                jobs.order.push(job.id);
                jobs.entries.insert(job.id, job);
            }
        }
        for event in events {
            self.events.send(event);
        }
        report
    }

    /// Changes one setting of an idle job.
    pub fn update_settings(&self, id: JobId, update: SettingsUpdate) -> Result<JobSnapshot, StoreError> {
        let (snapshot, event) = {
            let mut jobs = self.write();
            let job = jobs.entries.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            if job.status != JobStatus::Idle {
                return Err(StoreError::SettingsFrozen {
                    id,
                    status: job.status.to_string(),
                });
            }
            job.settings.apply(update)?;
            (job.snapshot(), job.event(JobEventKind::SettingsChanged, "Settings changed"))
        };
        self.events.send(event);
        Ok(snapshot)
    }

    /// Removes a job in any status, releasing its handles first. Returns the
    /// job as it was just before removal.
    pub fn remove(&self, id: JobId) -> Result<JobSnapshot, StoreError> {
        let snapshot = {
            let mut jobs = self.write();
            let job = jobs.entries.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            let snapshot = job.snapshot();
            job.release_handles();
            jobs.entries.remove(&id);
            jobs.order.retain(|existing| *existing != id);
            snapshot
        };
        log::debug!("Removed job {} ({})", id, snapshot.status);
        self.events.send(JobEvent::new(
            id,
            &snapshot.name,
            JobEventKind::Removed,
            None,
            format!("Removed while {}", snapshot.status),
        ));
        Ok(snapshot)
    }

    /// Removes every job. Returns the removed ids in order.
    pub fn clear(&self) -> Vec<JobId> {
        let removed: Vec<Job> = {
            let mut jobs = self.write();
            let order = std::mem::take(&mut jobs.order);
            let mut entries = std::mem::take(&mut jobs.entries);
            order
                .into_iter()
                .filter_map(|id| entries.remove(&id))
                .map(|mut job| {
                    job.release_handles();
                    job
                })
                .collect()
        };
        for job in &removed {
            self.events.send(JobEvent::new(
                job.id,
                &job.name,
                JobEventKind::Removed,
                None,
                "Cleared",
            ));
        }
        removed.iter().map(|job| job.id).collect()
    }

    /// idle → queued.
    pub fn mark_queued(&self, id: JobId) -> bool {
        let event = {
            let mut jobs = self.write();
            match jobs.entries.get_mut(&id) {
                Some(job) if job.status == JobStatus::Idle => {
                    job.status = JobStatus::Queued;
                    job.event(JobEventKind::Queued, "Waiting for a free slot")
                }
                _ => return false,
            }
        };
        self.events.send(event);
        true
    }

    /// idle|queued → compressing. Freezes the settings and returns what the
    /// engine needs, or `None` if the job is gone or not startable.
    pub fn begin(&self, id: JobId) -> Option<CompressionRequest> {
        let (request, event) = {
            let mut jobs = self.write();
            let job = jobs.entries.get_mut(&id)?;
            if !matches!(job.status, JobStatus::Idle | JobStatus::Queued) {
                return None;
            }
            job.status = JobStatus::Compressing;
            job.progress = 0;
            job.timing = JobTiming {
                started_at: Some(Utc::now()),
                finished_at: None,
            };
            let request = CompressionRequest {
                job_id: job.id,
                file_name: job.name.clone(),
                media_kind: job.media_kind,
                source: Arc::clone(&job.source),
                settings: job.settings.clone(),
            };
            (request, job.event(JobEventKind::Started, "Compressing"))
        };
        self.events.send(event);
        Some(request)
    }

    /// Raises progress of a compressing job. Lower or equal values are ignored.
    pub fn update_progress(&self, id: JobId, percent: u8) -> bool {
        let event = {
            let mut jobs = self.write();
            match jobs.entries.get_mut(&id) {
                Some(job) if job.status == JobStatus::Compressing => {
                    let percent = percent.min(100);
                    if percent <= job.progress {
                        return false;
                    }
                    job.progress = percent;
                    JobEvent::progress(job.id, &job.name, percent)
                }
                _ => return false,
            }
        };
        self.events.send(event);
        true
    }

    /// compressing → completed. Ignored for any other status, which makes late
    /// or duplicate outcomes no-ops.
    pub fn complete(&self, id: JobId, result: Vec<u8>) -> bool {
        let event = {
            let mut jobs = self.write();
            let job = match jobs.entries.get_mut(&id) {
                Some(job) if job.status == JobStatus::Compressing => job,
                _ => return false,
            };
            let result: SharedBytes = Arc::new(result);
            job.status = JobStatus::Completed;
            job.progress = 100;
            job.timing.finished_at = Some(Utc::now());
            job.result_handle = Some(self.blobs.create(Arc::clone(&result)));
            job.result = Some(result);
            job.failure = None;
            JobEvent::completed(
                job.id,
                &job.name,
                job.source.len(),
                job.result.as_ref().map_or(0, |r| r.len()),
            )
        };
        self.events.send(event);
        true
    }

    /// compressing|queued → error.
    pub fn fail(&self, id: JobId, failure: JobFailure) -> bool {
        self.fail_if(id, failure, JobStatus::is_active)
    }

    fn fail_if(&self, id: JobId, failure: JobFailure, allowed: impl Fn(JobStatus) -> bool) -> bool {
        let event = {
            let mut jobs = self.write();
            let job = match jobs.entries.get_mut(&id) {
                Some(job) if allowed(job.status) => job,
                _ => return false,
            };
            job.status = JobStatus::Error;
            job.timing.finished_at = Some(Utc::now());
            job.result = None;
            job.failure = Some(failure.clone());
            JobEvent::failed(job.id, &job.name, job.progress, failure)
        };
        self.events.send(event);
        true
    }

    /// queued → error, for jobs that never reached the engine.
    pub fn fail_queued(&self, id: JobId, failure: JobFailure) -> bool {
        self.fail_if(id, failure, |status| status == JobStatus::Queued)
    }

    pub fn get(&self, id: JobId) -> Option<JobSnapshot> {
        self.read().entries.get(&id).map(Job::snapshot)
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.read().entries.get(&id).map(|job| job.status)
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.read().entries.contains_key(&id)
    }

    /// All jobs in submission order.
    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        self.read().iter().map(Job::snapshot).collect()
    }

    pub fn ids_with_status(&self, status: JobStatus) -> Vec<JobId> {
        self.read()
            .iter()
            .filter(|job| job.status == status)
            .map(|job| job.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for job in self.read().iter() {
            match job.status {
                JobStatus::Idle => counts.idle += 1,
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Compressing => counts.compressing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Error => counts.error += 1,
            }
        }
        counts
    }

    /// True iff any job is queued or compressing, read from the collection.
    pub fn any_active(&self) -> bool {
        self.read().iter().any(|job| job.status.is_active())
    }

    pub fn total_bytes_saved(&self) -> i64 {
        self.snapshot().iter().map(JobSnapshot::bytes_saved).sum()
    }

    pub fn source_bytes(&self, id: JobId) -> Option<SharedBytes> {
        self.read().entries.get(&id).map(|job| Arc::clone(&job.source))
    }

    pub fn result_bytes(&self, id: JobId) -> Option<SharedBytes> {
        self.read().entries.get(&id).and_then(|job| job.result.clone())
    }

    pub fn blobs(&self) -> &BlobRegistry {
        &self.blobs
    }

    /// Resolves a preview or result URL to its bytes.
    pub fn resolve(&self, url: &str) -> Option<SharedBytes> {
        self.blobs.resolve(url)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }
}
