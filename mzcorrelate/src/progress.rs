/*! Progress reporting and cooperative cancellation */
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Receives monotone progress updates from the engine and tells it when to stop.
///
/// Implementations are shared across rayon worker threads.
pub trait ProgressSink: Send + Sync {
    /// Report the overall completed fraction, between 0 and 1
    fn set_progress(&self, fraction: f64);

    /// Whether the work should stop at the next opportunity
    fn is_cancelled(&self) -> bool;
}

/// A sink that ignores progress and never cancels
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn set_progress(&self, _fraction: f64) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// A lock-free [`ProgressSink`] that can be polled and cancelled from another thread
#[derive(Debug, Default)]
pub struct AtomicProgress {
    fraction: AtomicU64,
    cancelled: AtomicBool,
}

impl AtomicProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(&self) -> f64 {
        f64::from_bits(self.fraction.load(Ordering::Acquire))
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl ProgressSink for AtomicProgress {
    fn set_progress(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        // never move backwards
        let _ = self
            .fraction
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if fraction > f64::from_bits(current) {
                    Some(fraction.to_bits())
                } else {
                    None
                }
            });
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Maps the completion of `total` units of one stage onto the `[start, end]`
/// slice of the overall progress
pub(crate) struct StageProgress<'a> {
    sink: &'a dyn ProgressSink,
    start: f64,
    end: f64,
    total: usize,
    done: AtomicUsize,
}

impl<'a> StageProgress<'a> {
    pub(crate) fn new(sink: &'a dyn ProgressSink, start: f64, end: f64, total: usize) -> Self {
        Self {
            sink,
            start,
            end,
            total: total.max(1),
            done: AtomicUsize::new(0),
        }
    }

    pub(crate) fn tick(&self) {
        let done = self.done.fetch_add(1, Ordering::AcqRel) + 1;
        let frac = (done.min(self.total) as f64) / self.total as f64;
        self.sink
            .set_progress(self.start + (self.end - self.start) * frac);
    }

    pub(crate) fn finish(&self) {
        self.sink.set_progress(self.end);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.sink.is_cancelled()
    }
}
