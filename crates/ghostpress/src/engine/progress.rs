use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Receives percent-complete notifications for one compression.
///
/// Reports are fire-and-forget: implementations must not block.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, percent: u8);
}

/// No-op reporter for callers that do not track progress.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _percent: u8) {}
}

/// Adapts a closure into a reporter.
pub struct FnProgress<F>(pub F);

impl<F> ProgressReporter for FnProgress<F>
where
    F: Fn(u8) + Send + Sync,
{
    fn report(&self, percent: u8) {
        (self.0)(percent)
    }
}

/// Clamps reports to 0-100 and drops any value that does not advance.
///
/// Engines report progress estimated from timestamps, which can jitter
/// backwards; observers only ever see a non-decreasing sequence.
pub struct MonotonicProgress {
    inner: Arc<dyn ProgressReporter>,
    last: AtomicU8,
}

impl MonotonicProgress {
    pub fn new(inner: Arc<dyn ProgressReporter>) -> Self {
        Self {
            inner,
            last: AtomicU8::new(0),
        }
    }

    pub fn last(&self) -> u8 {
        self.last.load(Ordering::Acquire)
    }
}

impl ProgressReporter for MonotonicProgress {
    fn report(&self, percent: u8) {
        let percent = percent.min(100);
        let previous = self.last.fetch_max(percent, Ordering::AcqRel);
        if percent > previous {
            self.inner.report(percent);
        }
    }
}
