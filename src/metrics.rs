use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use crate::models::{AcquireOutcome, ReleaseOutcome};

/// Outcome counters for one lock manager.
///
/// Contention and backend trouble look identical to callers of `acquire`;
/// these counters keep them apart for operators.
pub struct LockMetrics {
    pub start_time: Instant,
    pub acquired: AtomicU64,
    pub held_elsewhere: AtomicU64,
    pub backend_unreachable: AtomicU64,
    pub backend_errors: AtomicU64,
    pub released: AtomicU64,
    pub release_not_owned: AtomicU64,
    pub release_not_held: AtomicU64,
    pub release_errors: AtomicU64,
    pub extended: AtomicU64,
    pub extend_rejected: AtomicU64,
    pub extend_errors: AtomicU64,
    pub runs: AtomicU64,
    pub skipped_runs: AtomicU64,
    pub failed_runs: AtomicU64,
}

impl Default for LockMetrics {
    fn default() -> Self {
        Self {
            start_time: Instant::now(),
            acquired: AtomicU64::new(0),
            held_elsewhere: AtomicU64::new(0),
            backend_unreachable: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
            released: AtomicU64::new(0),
            release_not_owned: AtomicU64::new(0),
            release_not_held: AtomicU64::new(0),
            release_errors: AtomicU64::new(0),
            extended: AtomicU64::new(0),
            extend_rejected: AtomicU64::new(0),
            extend_errors: AtomicU64::new(0),
            runs: AtomicU64::new(0),
            skipped_runs: AtomicU64::new(0),
            failed_runs: AtomicU64::new(0),
        }
    }
}

impl LockMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_acquire(&self, outcome: AcquireOutcome) {
        let counter = match outcome {
            AcquireOutcome::Acquired => &self.acquired,
            AcquireOutcome::HeldElsewhere => &self.held_elsewhere,
            AcquireOutcome::BackendUnreachable => &self.backend_unreachable,
            AcquireOutcome::BackendError => &self.backend_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self, outcome: ReleaseOutcome) {
        let counter = match outcome {
            ReleaseOutcome::Released => &self.released,
            ReleaseOutcome::NotOwned => &self.release_not_owned,
            ReleaseOutcome::NotHeld => &self.release_not_held,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release_error(&self) {
        self.release_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_extend(&self, extended: bool) {
        if extended {
            self.extended.fetch_add(1, Ordering::Relaxed);
        } else {
            self.extend_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_extend_error(&self) {
        self.extend_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one `with_lock` invocation.
    pub fn record_run(&self, ran: bool, failed: bool) {
        if !ran {
            self.skipped_runs.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.runs.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failed_runs.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "uptime_seconds": self.start_time.elapsed().as_secs(),
            "acquire": {
                "acquired": self.acquired.load(Ordering::Relaxed),
                "held_elsewhere": self.held_elsewhere.load(Ordering::Relaxed),
                "backend_unreachable": self.backend_unreachable.load(Ordering::Relaxed),
                "backend_errors": self.backend_errors.load(Ordering::Relaxed),
            },
            "release": {
                "released": self.released.load(Ordering::Relaxed),
                "not_owned": self.release_not_owned.load(Ordering::Relaxed),
                "not_held": self.release_not_held.load(Ordering::Relaxed),
                "errors": self.release_errors.load(Ordering::Relaxed),
            },
            "extend": {
                "extended": self.extended.load(Ordering::Relaxed),
                "rejected": self.extend_rejected.load(Ordering::Relaxed),
                "errors": self.extend_errors.load(Ordering::Relaxed),
            },
            "runs": {
                "executed": self.runs.load(Ordering::Relaxed),
                "skipped": self.skipped_runs.load(Ordering::Relaxed),
                "failed": self.failed_runs.load(Ordering::Relaxed),
            }
        })
    }
}
