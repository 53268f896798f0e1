//! Reusable test scenarios for flow-control tests.
//!
//! Scenarios define common replica sets, write sizes, and seeds that tests
//! compose into larger runs.

/// Standard replica sets, as raw store IDs.
pub mod stores {
    use kvflow_core::StoreId;

    /// Three voters.
    pub const THREE_REPLICAS: &[u64] = &[1, 2, 3];

    /// Five voters.
    pub const FIVE_REPLICAS: &[u64] = &[1, 2, 3, 4, 5];

    /// Store pool that randomized membership changes draw from.
    pub const STORE_POOL: &[u64] = &[1, 2, 3, 4, 5, 6, 7];

    /// Converts raw IDs to store IDs.
    #[must_use]
    pub fn ids(raw: &[u64]) -> Vec<StoreId> {
        raw.iter().copied().map(StoreId::new).collect()
    }
}

/// Standard write sizes.
pub mod sizes {
    /// One kilobyte.
    pub const KIB: u64 = 1024;

    /// One megabyte.
    pub const MIB: u64 = 1024 * KIB;

    /// Typical small write.
    pub const SMALL_WRITE: u64 = 4 * KIB;

    /// Large write, still under the test entry limit.
    pub const LARGE_WRITE: u64 = MIB;
}

/// Seeds for reproducible testing.
pub mod seeds {
    /// Standard test seeds that have historically found bugs.
    pub const REGRESSION_SEEDS: &[u64] = &[
        42,
        12345,
        0xDEAD_BEEF,
        999,
        7777,
        0x1337,
        0xCAFE_BABE,
        1,
        u64::MAX,
        0,
    ];

    /// Number of extra seeds derived from the base seed in CI runs.
    pub const CI_SEED_COUNT: u64 = 20;
}
