use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info};

use mzcorrelate::progress::ProgressSink;

pub(crate) const PROGRESS_BUFFER_SIZE: usize = 256;

/// Forwards engine progress to a reporting thread.
///
/// Updates are dropped rather than blocking a worker when the reporter falls behind.
#[derive(Debug)]
pub(crate) struct ChannelProgress {
    sender: Sender<f64>,
    cancelled: AtomicBool,
}

impl ChannelProgress {
    pub(crate) fn new(sender: Sender<f64>) -> Self {
        Self {
            sender,
            cancelled: AtomicBool::new(false),
        }
    }

    #[allow(unused)]
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl ProgressSink for ChannelProgress {
    fn set_progress(&self, fraction: f64) {
        match self.sender.try_send(fraction) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                debug!("Progress reporter disconnected");
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A running record of what the reporter has seen
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub(crate) struct ProgressRecord {
    pub fraction: f64,
    pub updates: usize,
}

impl ProgressRecord {
    /// Fold in an update, returning the new tenth of the work reached if it advanced
    fn receive(&mut self, fraction: f64) -> Option<u32> {
        self.updates += 1;
        let before = (self.fraction * 10.0).floor() as u32;
        self.fraction = self.fraction.max(fraction);
        let after = (self.fraction * 10.0).floor() as u32;
        (after > before).then_some(after)
    }
}

/// Log progress in steps of ten percent until every sender has been dropped
pub(crate) fn report_progress(receiver: Receiver<f64>) -> ProgressRecord {
    let start = Instant::now();
    let mut record = ProgressRecord::default();
    loop {
        match receiver.recv_timeout(std::time::Duration::from_secs(30)) {
            Ok(fraction) => {
                if let Some(step) = record.receive(fraction) {
                    info!(
                        "{}% complete after {:0.3?}",
                        step * 10,
                        Instant::now() - start
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                info!(
                    "Still working, {:0.1}% complete after {:0.3?}",
                    record.fraction * 100.0,
                    Instant::now() - start
                );
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Progress channel closed after {} updates", record.updates);
                break;
            }
        }
    }
    record
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    #[test_log::test]
    fn test_report() {
        let (sender, receiver) = crossbeam_channel::bounded(PROGRESS_BUFFER_SIZE);
        let progress = ChannelProgress::new(sender);
        let task = thread::spawn(move || report_progress(receiver));
        for i in 0..=20 {
            progress.set_progress(i as f64 / 20.0);
        }
        progress.set_progress(0.3);
        assert!(!progress.is_cancelled());
        progress.cancel();
        assert!(progress.is_cancelled());
        drop(progress);
        let record = task.join().unwrap();
        assert_eq!(record.fraction, 1.0);
        assert_eq!(record.updates, 22);
    }
}
