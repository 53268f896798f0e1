//! System limits for flow-control bookkeeping.
//!
//! Following TigerStyle: put limits on everything.
//! Every per-range table and per-stream ledger has an explicit maximum size.

/// Bounds applied by the flow controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of streams (voters plus non-voters) in a range's active set.
    pub max_streams_per_range: u32,
    /// Maximum size in bytes of a single replicated write.
    pub max_entry_bytes: u64,
    /// Maximum number of outstanding entries tracked for one stream and class.
    pub max_tracked_entries_per_stream: u64,
}

impl Limits {
    /// Creates limits with safe defaults.
    ///
    /// Sixteen replicas per range, 8MB writes, one million outstanding entries.
    /// A maximal write to a full range (128MB) fits the default elastic bucket.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_streams_per_range: 16,
            max_entry_bytes: 8 * 1024 * 1024,
            max_tracked_entries_per_stream: 1_000_000,
        }
    }

    /// Creates small limits for tests.
    ///
    /// Eight streams of 1MB writes, sized for the 8MB testing elastic bucket.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            max_streams_per_range: 8,
            max_entry_bytes: 1024 * 1024,
            max_tracked_entries_per_stream: 10_000,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limit is zero.
    pub const fn validate(&self) -> crate::Result<()> {
        if self.max_streams_per_range == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_streams_per_range",
                reason: "must be positive",
            });
        }

        if self.max_entry_bytes == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_entry_bytes",
                reason: "must be positive",
            });
        }

        if self.max_tracked_entries_per_stream == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_tracked_entries_per_stream",
                reason: "must be positive",
            });
        }

        Ok(())
    }

    /// Checks a replicated write size against `max_entry_bytes`.
    ///
    /// # Errors
    /// Returns `Error::LimitExceeded` if the write is too large.
    pub const fn check_entry_bytes(&self, size: u64) -> crate::Result<()> {
        if size > self.max_entry_bytes {
            return Err(crate::Error::LimitExceeded {
                limit: "max_entry_bytes",
                max: self.max_entry_bytes,
                actual: size,
            });
        }
        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_valid() {
        assert!(Limits::new().validate().is_ok());
        assert!(Limits::for_testing().validate().is_ok());
    }

    #[test]
    fn test_zero_streams_rejected() {
        let mut limits = Limits::new();
        limits.max_streams_per_range = 0;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_zero_entry_bytes_rejected() {
        let mut limits = Limits::new();
        limits.max_entry_bytes = 0;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_check_entry_bytes() {
        let limits = Limits::for_testing();
        assert!(limits.check_entry_bytes(limits.max_entry_bytes).is_ok());
        assert_eq!(
            limits.check_entry_bytes(limits.max_entry_bytes + 1),
            Err(crate::Error::LimitExceeded {
                limit: "max_entry_bytes",
                max: limits.max_entry_bytes,
                actual: limits.max_entry_bytes + 1,
            })
        );
    }
}
