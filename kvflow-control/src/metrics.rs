//! Flow-control counters and point-in-time snapshots.
//!
//! Counters are cumulative over the controller's lifetime and across every
//! range it has ever led. At any quiescent point, for each work class:
//!
//! ```text
//! deducted == returned + unaccounted + Σ tracked tokens (active and retired streams)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use kvflow_core::{PerClass, WorkClass};
use serde::Serialize;

/// Cumulative counters for one work class.
#[derive(Debug, Default)]
pub(crate) struct ClassCounters {
    deducted: AtomicU64,
    returned: AtomicU64,
    unaccounted: AtomicU64,
    unmatched_admissions: AtomicU64,
    requests_admitted: AtomicU64,
    requests_errored: AtomicU64,
    wait_duration_us: AtomicU64,
}

/// Node-wide flow-control counters, shared by the controller and its handles.
#[derive(Debug, Default)]
pub struct FlowMetrics {
    classes: PerClass<ClassCounters>,
}

impl FlowMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_deducted(&self, class: WorkClass, tokens: u64) {
        self.classes[class]
            .deducted
            .fetch_add(tokens, Ordering::Relaxed);
    }

    pub(crate) fn record_returned(&self, class: WorkClass, tokens: u64) {
        self.classes[class]
            .returned
            .fetch_add(tokens, Ordering::Relaxed);
    }

    pub(crate) fn record_unaccounted(&self, class: WorkClass, tokens: u64) {
        self.classes[class]
            .unaccounted
            .fetch_add(tokens, Ordering::Relaxed);
    }

    pub(crate) fn record_unmatched_admission(&self, class: WorkClass) {
        self.classes[class]
            .unmatched_admissions
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_admitted(&self, class: WorkClass, waited: Duration) {
        let counters = &self.classes[class];
        counters.requests_admitted.fetch_add(1, Ordering::Relaxed);
        let waited_us = u64::try_from(waited.as_micros()).unwrap_or(u64::MAX);
        counters
            .wait_duration_us
            .fetch_add(waited_us, Ordering::Relaxed);
    }

    pub(crate) fn record_request_errored(&self, class: WorkClass) {
        self.classes[class]
            .requests_errored
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Fills the counter fields of a class snapshot.
    ///
    /// Bucket gauges (`capacity`, `available`, `clamped`, `requests_waiting`)
    /// are left for the caller, which owns the buckets.
    pub(crate) fn snapshot_counters(&self, class: WorkClass) -> ClassMetrics {
        let counters = &self.classes[class];
        ClassMetrics {
            deducted: counters.deducted.load(Ordering::Relaxed),
            returned: counters.returned.load(Ordering::Relaxed),
            unaccounted: counters.unaccounted.load(Ordering::Relaxed),
            unmatched_admissions: counters.unmatched_admissions.load(Ordering::Relaxed),
            requests_admitted: counters.requests_admitted.load(Ordering::Relaxed),
            requests_errored: counters.requests_errored.load(Ordering::Relaxed),
            wait_duration_us: counters.wait_duration_us.load(Ordering::Relaxed),
            ..ClassMetrics::default()
        }
    }
}

/// Point-in-time metrics for one work class. All token values are bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ClassMetrics {
    /// Bucket capacity.
    pub capacity: u64,
    /// Tokens currently available in the bucket.
    pub available: u64,
    /// Tokens ever deducted, summed over every stream.
    pub deducted: u64,
    /// Tokens returned by admission.
    pub returned: u64,
    /// Tokens released without an admission (handle teardown).
    pub unaccounted: u64,
    /// Tokens dropped by the bucket's return clamp.
    pub clamped: u64,
    /// Admissions that found no tracker to release from.
    pub unmatched_admissions: u64,
    /// Deductions currently blocked on the bucket.
    pub requests_waiting: u64,
    /// Deductions that completed.
    pub requests_admitted: u64,
    /// Deductions that were cancelled or rejected.
    pub requests_errored: u64,
    /// Total time completed deductions spent blocked, in microseconds.
    pub wait_duration_us: u64,
}

impl ClassMetrics {
    /// Tokens deducted but neither returned nor written off.
    #[must_use]
    pub const fn outstanding(&self) -> u64 {
        self.deducted
            .saturating_sub(self.returned.saturating_add(self.unaccounted))
    }
}

/// Point-in-time metrics for the whole node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlowMetricsSnapshot {
    /// Regular class metrics.
    pub regular: ClassMetrics,
    /// Elastic class metrics.
    pub elastic: ClassMetrics,
    /// Number of ranges with a registered handle.
    pub handles: u64,
}

impl FlowMetricsSnapshot {
    /// Returns the metrics for one class.
    #[must_use]
    pub const fn class(&self, class: WorkClass) -> &ClassMetrics {
        match class {
            WorkClass::Regular => &self.regular,
            WorkClass::Elastic => &self.elastic,
        }
    }
}
