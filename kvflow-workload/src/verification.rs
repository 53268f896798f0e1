//! End-of-run checks for a drained workload.
//!
//! Once every writer has finished and every follower has admitted everything
//! it was sent, the controller must be back where it started:
//! - Nothing outstanding (deducted == returned + unaccounted)
//! - Buckets full again
//! - No tokens dropped on return
//! - No admission that missed its ledger

use kvflow_control::FlowMetricsSnapshot;
use kvflow_core::{RangeId, WorkClass};

/// A violation found after a workload run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Tokens remain deducted after every admission was delivered.
    Outstanding {
        /// The work class.
        class: WorkClass,
        /// Tokens neither returned nor written off.
        outstanding: u64,
    },
    /// A bucket did not return to capacity.
    BucketNotRefilled {
        /// The work class.
        class: WorkClass,
        /// Available tokens.
        available: u64,
        /// Bucket capacity.
        capacity: u64,
    },
    /// The bucket dropped tokens on return.
    Clamped {
        /// The work class.
        class: WorkClass,
        /// Tokens dropped.
        clamped: u64,
    },
    /// Admissions arrived for a stream with no ledger.
    UnmatchedAdmissions {
        /// The work class.
        class: WorkClass,
        /// Number of unmatched admissions.
        count: u64,
    },
    /// A write failed to deduct.
    WriteFailed {
        /// The range written to.
        range_id: RangeId,
        /// Log position of the write.
        position: u64,
        /// The error, rendered.
        error: String,
    },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Outstanding { class, outstanding } => {
                write!(f, "{class}: {outstanding} tokens still outstanding after drain")
            }
            Self::BucketNotRefilled {
                class,
                available,
                capacity,
            } => write!(
                f,
                "{class}: bucket holds {available} of {capacity} tokens after drain"
            ),
            Self::Clamped { class, clamped } => {
                write!(f, "{class}: {clamped} tokens clamped on return")
            }
            Self::UnmatchedAdmissions { class, count } => {
                write!(f, "{class}: {count} admissions found no ledger")
            }
            Self::WriteFailed {
                range_id,
                position,
                error,
            } => write!(f, "Write to {range_id}@{position} failed: {error}"),
        }
    }
}

/// Verifier for drained controller state.
pub struct Verification;

impl Verification {
    /// Checks a metrics snapshot taken after the workload drained.
    #[must_use]
    pub fn verify(metrics: &FlowMetricsSnapshot) -> Vec<Violation> {
        let mut violations = Vec::new();
        for class in WorkClass::ALL {
            let m = metrics.class(class);
            let outstanding = m.outstanding();
            if outstanding > 0 {
                violations.push(Violation::Outstanding { class, outstanding });
            }
            if m.available != m.capacity {
                violations.push(Violation::BucketNotRefilled {
                    class,
                    available: m.available,
                    capacity: m.capacity,
                });
            }
            if m.clamped > 0 {
                violations.push(Violation::Clamped {
                    class,
                    clamped: m.clamped,
                });
            }
            if m.unmatched_admissions > 0 {
                violations.push(Violation::UnmatchedAdmissions {
                    class,
                    count: m.unmatched_admissions,
                });
            }
        }
        violations
    }
}
