//! Flow control error types.

use kvflow_core::{RangeId, StoreId, WorkClass};

/// Flow control error type.
///
/// Only deduction can fail. Admission and membership bookkeeping never return
/// errors; anomalies there are counted in metrics instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// A blocked deduction was cancelled before tokens were granted.
    #[error("deduction of {requested} {class} tokens cancelled")]
    Cancelled {
        /// The work class of the deduction.
        class: WorkClass,
        /// Tokens requested.
        requested: u64,
    },

    /// The request can never fit in the bucket, even when it is full.
    #[error("{requested} {class} tokens requested exceeds bucket capacity {capacity}")]
    ExceedsCapacity {
        /// The work class of the deduction.
        class: WorkClass,
        /// Tokens requested.
        requested: u64,
        /// Bucket capacity at the time of the request.
        capacity: u64,
    },

    /// A single replicated write is larger than the configured maximum.
    #[error("entry of {size} bytes exceeds max {max}")]
    EntryTooLarge {
        /// Write size in bytes.
        size: u64,
        /// Maximum allowed size in bytes.
        max: u64,
    },

    /// The handle for this range has been closed.
    #[error("flow handle for {range_id} is closed")]
    HandleClosed {
        /// The range whose handle was closed.
        range_id: RangeId,
    },

    /// A membership change names more streams than allowed.
    #[error("too many streams for {range_id}: {count} > {max}")]
    TooManyStreams {
        /// The range being reconfigured.
        range_id: RangeId,
        /// Requested stream count.
        count: u32,
        /// Maximum allowed.
        max: u32,
    },

    /// A stream's ledger is at its entry limit.
    #[error("too many outstanding entries for {range_id}/{store_id}: max {max}")]
    TooManyEntries {
        /// The range of the stream.
        range_id: RangeId,
        /// The store of the stream.
        store_id: StoreId,
        /// Maximum allowed.
        max: u64,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },
}

impl From<kvflow_core::Error> for FlowError {
    fn from(err: kvflow_core::Error) -> Self {
        match err {
            kvflow_core::Error::LimitExceeded {
                limit: "max_entry_bytes",
                max,
                actual,
            } => Self::EntryTooLarge { size: actual, max },
            other => Self::InvalidConfig {
                message: other.to_string(),
            },
        }
    }
}

/// Result type for flow control operations.
pub type FlowResult<T> = Result<T, FlowError>;
