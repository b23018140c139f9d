//! Bridge from job events to log lines.

use std::collections::HashMap;

use ghostpress::{JobEvent, JobEventKind, JobId, JobStore};
use log::{debug, error, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Progress is logged in steps of this many percent.
const PROGRESS_STEP: u8 = 25;

/// Starts a task that renders job events until the store's broadcaster closes
/// or the returned handle is aborted.
pub fn start_event_bridge(store: &JobStore) -> JoinHandle<()> {
    let mut rx = store.subscribe();
    tokio::spawn(async move {
        let mut renderer = ProgressRenderer::default();
        loop {
            match rx.recv().await {
                Ok(event) => renderer.render(&event),
                Err(RecvError::Lagged(n)) => {
                    warn!("Job event bridge lagged, missed {} events", n);
                }
                Err(RecvError::Closed) => {
                    debug!("Job event broadcaster closed, stopping event bridge");
                    break;
                }
            }
        }
    })
}

#[derive(Default)]
struct ProgressRenderer {
    last_step: HashMap<JobId, u8>,
}

impl ProgressRenderer {
    fn render(&mut self, event: &JobEvent) {
        match event.kind {
            JobEventKind::Started => {
                self.last_step.insert(event.job_id, 0);
                info!("{}: compressing", event.filename);
            }
            JobEventKind::Queued => info!("{}: queued", event.filename),
            JobEventKind::Progress => {
                if let Some(step) = self.next_step(event.job_id, event.progress) {
                    info!("{}: {}%", event.filename, step);
                }
            }
            JobEventKind::Completed => {
                self.last_step.remove(&event.job_id);
                info!("{}: {}", event.filename, event.message);
            }
            JobEventKind::Failed => {
                self.last_step.remove(&event.job_id);
                error!("{}: {}", event.filename, event.message);
            }
            JobEventKind::Submitted | JobEventKind::SettingsChanged | JobEventKind::Removed => {
                debug!("{}: {}", event.filename, event.kind);
            }
        }
    }

    /// Returns the step to print when `progress` crosses a new one.
    fn next_step(&mut self, id: JobId, progress: u8) -> Option<u8> {
        let step = progress / PROGRESS_STEP * PROGRESS_STEP;
        let last = self.last_step.entry(id).or_insert(0);
        if step > *last && step < 100 {
            *last = step;
            Some(step)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_steps_are_printed_once() {
        let mut renderer = ProgressRenderer::default();
        let id = JobId::new();

        assert_eq!(renderer.next_step(id, 10), None);
        assert_eq!(renderer.next_step(id, 26), Some(25));
        assert_eq!(renderer.next_step(id, 30), None);
        assert_eq!(renderer.next_step(id, 77), Some(75));
        assert_eq!(renderer.next_step(id, 100), None);
    }
}
