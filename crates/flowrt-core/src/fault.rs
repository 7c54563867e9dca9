//! Process-wide fault channel.
//!
//! Some failures are discovered on a worker thread after the caller that
//! started the operation has already moved on, e.g. a host-to-device marker
//! wait failing inside the keep-alive task. Those errors have no completion
//! value to land in; they are logged and retained here instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::FlowError;

/// A retained background fault.
#[derive(Debug, Clone)]
pub struct Fault {
    /// Component that reported the fault.
    pub source: &'static str,
    /// The error itself.
    pub error: FlowError,
    /// When the fault was reported.
    pub reported_at: Instant,
}

struct FaultLog {
    capacity: usize,
    faults: Mutex<VecDeque<Fault>>,
    total: AtomicU64,
}

/// Cloneable handle for reporting and inspecting background faults.
///
/// Retains the most recent `capacity` faults; older ones are dropped from
/// the log but still counted.
#[derive(Clone)]
pub struct FaultReporter {
    log: Arc<FaultLog>,
}

impl FaultReporter {
    /// Create a fault channel retaining up to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            log: Arc::new(FaultLog {
                capacity,
                faults: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
                total: AtomicU64::new(0),
            }),
        }
    }

    /// Report a fault.
    pub fn report(&self, source: &'static str, error: FlowError) {
        tracing::error!(source, error = %error, "Background fault with no caller to report to");

        self.log.total.fetch_add(1, Ordering::Relaxed);
        if self.log.capacity == 0 {
            return;
        }

        let mut faults = self.log.faults.lock();
        if faults.len() == self.log.capacity {
            faults.pop_front();
        }
        faults.push_back(Fault {
            source,
            error,
            reported_at: Instant::now(),
        });
    }

    /// Snapshot of the retained faults, oldest first.
    pub fn faults(&self) -> Vec<Fault> {
        self.log.faults.lock().iter().cloned().collect()
    }

    /// Remove and return the retained faults.
    pub fn take(&self) -> Vec<Fault> {
        self.log.faults.lock().drain(..).collect()
    }

    /// Total number of faults ever reported.
    pub fn total_reported(&self) -> u64 {
        self.log.total.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FaultReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultReporter")
            .field("capacity", &self.log.capacity)
            .field("total", &self.total_reported())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_and_take() {
        let reporter = FaultReporter::new(4);
        reporter.report("h2d", FlowError::sync("marker wait failed"));

        let faults = reporter.faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].source, "h2d");
        assert_eq!(faults[0].error, FlowError::sync("marker wait failed"));

        assert_eq!(reporter.take().len(), 1);
        assert!(reporter.faults().is_empty());
        assert_eq!(reporter.total_reported(), 1);
    }

    #[test]
    fn test_bounded_retention() {
        let reporter = FaultReporter::new(2);
        for i in 0..5 {
            reporter.report("test", FlowError::sync(format!("fault {i}")));
        }

        let faults = reporter.faults();
        assert_eq!(faults.len(), 2);
        assert_eq!(faults[0].error, FlowError::sync("fault 3"));
        assert_eq!(faults[1].error, FlowError::sync("fault 4"));
        assert_eq!(reporter.total_reported(), 5);
    }

    #[test]
    fn test_shared_between_clones() {
        let reporter = FaultReporter::new(8);
        let worker_side = reporter.clone();
        std::thread::spawn(move || worker_side.report("worker", FlowError::Cancelled))
            .join()
            .unwrap();
        assert_eq!(reporter.faults().len(), 1);
    }
}
