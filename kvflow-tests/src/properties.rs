//! Property definitions and checkers for flow-control tests.
//!
//! Properties are invariants that must hold whenever the controller is
//! quiescent, that is when no deduction is between its bucket grant and its
//! ledger commit. Tests record the controller's state after each step and
//! collect every violation instead of stopping at the first.

use std::collections::BTreeMap;

use kvflow_control::{FlowController, FlowMetricsSnapshot};
use kvflow_core::{PerClass, RangeId, WorkClass};

// ============================================================================
// Property Violation Types
// ============================================================================

/// A violation of a flow-control accounting property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Deducted tokens do not equal returned plus unaccounted plus tracked.
    Conservation {
        /// The work class.
        class: WorkClass,
        /// Tokens ever deducted.
        deducted: u64,
        /// Tokens returned by admission.
        returned: u64,
        /// Tokens written off on close.
        unaccounted: u64,
        /// Tokens still tracked across every ledger.
        tracked: u64,
    },
    /// Bucket holds more tokens than its capacity.
    AvailableExceedsCapacity {
        /// The work class.
        class: WorkClass,
        /// Available tokens.
        available: u64,
        /// Bucket capacity.
        capacity: u64,
    },
    /// Available plus outstanding tokens do not add up to capacity.
    CapacityMismatch {
        /// The work class.
        class: WorkClass,
        /// Available tokens.
        available: u64,
        /// Tokens still tracked across every ledger.
        tracked: u64,
        /// Bucket capacity.
        capacity: u64,
    },
    /// A cumulative counter went backwards between two observations.
    CounterDecreased {
        /// The work class.
        class: WorkClass,
        /// Counter name.
        counter: &'static str,
        /// Previously observed value.
        old: u64,
        /// Newly observed value.
        new: u64,
    },
    /// The bucket dropped tokens on return.
    Clamped {
        /// The work class.
        class: WorkClass,
        /// Tokens dropped.
        clamped: u64,
    },
    /// A handle reports more tracked tokens on an active stream than on its ledger.
    InspectionMismatch {
        /// The range.
        range_id: RangeId,
        /// The work class.
        class: WorkClass,
        /// Sum over the inspection's active streams.
        inspected: u64,
        /// Sum over every ledger of the handle.
        tracked: u64,
    },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conservation {
                class,
                deducted,
                returned,
                unaccounted,
                tracked,
            } => write!(
                f,
                "{class}: deducted {deducted} != returned {returned} + \
                 unaccounted {unaccounted} + tracked {tracked}"
            ),
            Self::AvailableExceedsCapacity {
                class,
                available,
                capacity,
            } => write!(f, "{class}: available {available} exceeds capacity {capacity}"),
            Self::CapacityMismatch {
                class,
                available,
                tracked,
                capacity,
            } => write!(
                f,
                "{class}: available {available} + tracked {tracked} != capacity {capacity}"
            ),
            Self::CounterDecreased {
                class,
                counter,
                old,
                new,
            } => write!(f, "{class}: {counter} decreased from {old} to {new}"),
            Self::Clamped { class, clamped } => {
                write!(f, "{class}: {clamped} tokens clamped on return")
            }
            Self::InspectionMismatch {
                range_id,
                class,
                inspected,
                tracked,
            } => write!(
                f,
                "{range_id} {class}: inspected {inspected} exceeds tracked {tracked}"
            ),
        }
    }
}

// ============================================================================
// Conservation Checker
// ============================================================================

/// Tracks controller state across a test for property verification.
#[derive(Debug)]
pub struct ConservationChecker {
    /// Whether `available + tracked == capacity` must hold.
    ///
    /// Only true while capacity has never been changed at runtime and no
    /// deduction is blocked.
    expect_full_accounting: bool,
    /// Last observed snapshot, for monotonicity checks.
    last: Option<FlowMetricsSnapshot>,
    /// Violations found.
    violations: Vec<Violation>,
}

impl Default for ConservationChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConservationChecker {
    /// Creates a checker that also expects available plus tracked tokens to
    /// equal capacity.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            expect_full_accounting: true,
            last: None,
            violations: Vec::new(),
        }
    }

    /// Creates a checker for runs that resize buckets at runtime.
    #[must_use]
    pub const fn without_capacity_check() -> Self {
        Self {
            expect_full_accounting: false,
            last: None,
            violations: Vec::new(),
        }
    }

    /// Records the controller's current state and checks every property.
    ///
    /// Call this only at quiescent points.
    pub fn record(&mut self, controller: &FlowController) {
        let snapshot = controller.metrics();
        let tracked = tracked_tokens(controller, &mut self.violations);

        for class in WorkClass::ALL {
            let metrics = snapshot.class(class);
            let tracked = tracked[class];

            if metrics.deducted != metrics.returned + metrics.unaccounted + tracked {
                self.violations.push(Violation::Conservation {
                    class,
                    deducted: metrics.deducted,
                    returned: metrics.returned,
                    unaccounted: metrics.unaccounted,
                    tracked,
                });
            }

            if metrics.available > metrics.capacity {
                self.violations.push(Violation::AvailableExceedsCapacity {
                    class,
                    available: metrics.available,
                    capacity: metrics.capacity,
                });
            }

            if self.expect_full_accounting && metrics.available + tracked != metrics.capacity {
                self.violations.push(Violation::CapacityMismatch {
                    class,
                    available: metrics.available,
                    tracked,
                    capacity: metrics.capacity,
                });
            }

            if metrics.clamped > 0 {
                self.violations.push(Violation::Clamped {
                    class,
                    clamped: metrics.clamped,
                });
            }

            if let Some(last) = &self.last {
                let old = last.class(class);
                let counters = [
                    ("deducted", old.deducted, metrics.deducted),
                    ("returned", old.returned, metrics.returned),
                    ("unaccounted", old.unaccounted, metrics.unaccounted),
                    ("requests_admitted", old.requests_admitted, metrics.requests_admitted),
                    ("requests_errored", old.requests_errored, metrics.requests_errored),
                ];
                for (counter, old, new) in counters {
                    if new < old {
                        self.violations.push(Violation::CounterDecreased {
                            class,
                            counter,
                            old,
                            new,
                        });
                    }
                }
            }
        }

        self.last = Some(snapshot);
    }

    /// Returns all violations found so far.
    #[must_use]
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// Returns true if no violations were found.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    /// Panics with every violation if any was found.
    ///
    /// # Panics
    ///
    /// Panics if a property was violated.
    pub fn assert_ok(&self) {
        if !self.is_ok() {
            let report: Vec<String> = self.violations.iter().map(ToString::to_string).collect();
            panic!("property violations:\n  {}", report.join("\n  "));
        }
    }
}

/// Sums tracked tokens over every registered handle, active and retired
/// streams alike, and cross-checks each handle's inspection.
fn tracked_tokens(controller: &FlowController, violations: &mut Vec<Violation>) -> PerClass<u64> {
    let mut total = PerClass::<u64>::default();
    for range_id in controller.ranges() {
        let Some(handle) = controller.handle(range_id) else {
            continue;
        };
        let tracked = handle.total_tracked();
        let inspection = handle.inspect();
        for class in WorkClass::ALL {
            let inspected: u64 = inspection
                .streams
                .iter()
                .map(|stream| stream.tracked_tokens[class])
                .sum();
            if inspected > tracked[class] {
                violations.push(Violation::InspectionMismatch {
                    range_id,
                    class,
                    inspected,
                    tracked: tracked[class],
                });
            }
            total[class] += tracked[class];
        }
    }
    total
}

/// Returns tracked tokens per range, for diagnostics in failing tests.
#[must_use]
pub fn tracked_by_range(controller: &FlowController) -> BTreeMap<RangeId, PerClass<u64>> {
    controller
        .ranges()
        .into_iter()
        .filter_map(|range_id| {
            controller
                .handle(range_id)
                .map(|handle| (range_id, handle.total_tracked()))
        })
        .collect()
}
