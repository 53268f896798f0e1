//! Per-stream ledger of outstanding deductions.
//!
//! A `StreamTracker` records, for one (range, store) stream and one work class,
//! every replicated write whose tokens have been deducted but not yet returned.
//! Entries are kept in log order so that a single cumulative admission
//! ("everything up to position N has been applied") releases a prefix.

use std::collections::VecDeque;

use kvflow_core::{LogPosition, WorkClass};

/// One outstanding deduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedDeduction {
    /// Log position of the replicated write.
    pub position: LogPosition,
    /// Tokens deducted for it.
    pub tokens: u64,
}

/// Ordered ledger of outstanding deductions for one stream and work class.
///
/// # Invariants
///
/// - Positions are strictly increasing.
/// - `tracked_tokens()` equals the sum of all entries' tokens.
#[derive(Debug)]
pub struct StreamTracker {
    class: WorkClass,
    entries: VecDeque<TrackedDeduction>,
    tracked: u64,
    last_tracked: Option<LogPosition>,
}

impl StreamTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub const fn new(class: WorkClass) -> Self {
        Self {
            class,
            entries: VecDeque::new(),
            tracked: 0,
            last_tracked: None,
        }
    }

    /// Returns the work class of this ledger.
    #[must_use]
    pub const fn class(&self) -> WorkClass {
        self.class
    }

    /// Records tokens deducted for the write at `position`.
    ///
    /// # Panics
    ///
    /// Panics if `position` is not greater than the last tracked position.
    /// The replication layer delivers writes to a stream in log order; a
    /// violation means the caller is broken.
    pub fn track(&mut self, position: LogPosition, tokens: u64) {
        if let Some(last) = self.last_tracked {
            assert!(
                position > last,
                "{} deduction at {position} not after last tracked {last}",
                self.class
            );
        }
        self.last_tracked = Some(position);
        self.entries.push_back(TrackedDeduction {
            position,
            tokens,
        });
        self.tracked += tokens;
    }

    /// Releases every entry at or below `upto` and returns their total tokens.
    ///
    /// An admission at or below a previously admitted position releases nothing.
    pub fn admit(&mut self, upto: LogPosition) -> u64 {
        let mut released = 0;
        while self
            .entries
            .front()
            .is_some_and(|entry| entry.position <= upto)
        {
            if let Some(entry) = self.entries.pop_front() {
                released += entry.tokens;
            }
        }
        self.tracked -= released;
        released
    }

    /// Releases every remaining entry and returns their total tokens.
    pub fn drain(&mut self) -> u64 {
        let released = self.tracked;
        self.entries.clear();
        self.tracked = 0;
        released
    }

    /// Returns the sum of outstanding tokens.
    #[must_use]
    pub const fn tracked_tokens(&self) -> u64 {
        self.tracked
    }

    /// Returns the outstanding entries in log order.
    pub fn entries(&self) -> impl Iterator<Item = &TrackedDeduction> {
        self.entries.iter()
    }

    /// Returns the number of outstanding entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the highest position ever tracked, including released ones.
    #[must_use]
    pub const fn last_tracked(&self) -> Option<LogPosition> {
        self.last_tracked
    }
}
