//! Replication flow control for kvflow.
//!
//! This crate throttles how much replicated write traffic a range leader may
//! have outstanding toward each follower before the follower's admission
//! control has applied it. It includes:
//!
//! - **Token buckets**: One node-wide bucket per work class, shared by every
//!   range led on the node. Deductions block (FIFO) when the bucket is empty.
//! - **Stream trackers**: Per (range, store, class) ledgers of outstanding
//!   deductions, keyed by log position.
//! - **Flow handles**: Per-range routing of deductions to the active replica
//!   set and of admissions back to the ledger that recorded them, across
//!   membership changes.
//! - **Flow controller**: The node-wide registry of handles and the metrics
//!   surface.
//!
//! # Token Flow
//!
//! ```text
//! proposal ──▶ FlowController::deduct(range, class, size, pos)
//!                  │  size × active streams taken from the class bucket
//!                  ▼
//!              StreamTracker per active store records (pos, size)
//!                  │
//!     follower applies entries up to pos
//!                  ▼
//! FlowController::admit(range, store, class, pos)
//!                  │  prefix released from that store's tracker
//!                  ▼
//!              tokens credited back to the class bucket
//! ```
//!
//! # Accounting
//!
//! For each work class, at every quiescent point:
//!
//! ```text
//! deducted == returned + unaccounted + Σ tracked tokens
//! ```
//!
//! where the sum covers streams that have since left the range. Tokens are
//! only counted as returned on an admission; closing a handle writes the
//! remainder off as unaccounted.
//!
//! # Example
//!
//! ```rust
//! use kvflow_control::{FlowConfig, FlowController};
//! use kvflow_core::{LogPosition, RangeId, StoreId, WorkClass};
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let controller = FlowController::new(FlowConfig::for_testing()).unwrap();
//! let range = RangeId::new(1);
//!
//! let handle = controller.get_or_create_handle(range);
//! handle
//!     .on_membership_change(&[StoreId::new(1), StoreId::new(2), StoreId::new(3)])
//!     .unwrap();
//!
//! // A 1KB write replicated to three stores deducts 3KB.
//! handle
//!     .deduct(WorkClass::Regular, 1024, LogPosition::new(7), &CancellationToken::new())
//!     .await
//!     .unwrap();
//! assert_eq!(controller.metrics().regular.deducted, 3 * 1024);
//!
//! // Each follower admits the entry.
//! for store in 1..=3 {
//!     controller.admit(range, StoreId::new(store), WorkClass::Regular, LogPosition::new(7));
//! }
//! assert_eq!(controller.metrics().regular.returned, 3 * 1024);
//! # });
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod controller;
pub mod error;
pub mod handle;
pub mod metrics;
pub mod token_bucket;
pub mod tracker;

// Re-export main types for convenience.
pub use config::FlowConfig;
pub use controller::FlowController;
pub use error::{FlowError, FlowResult};
pub use handle::{FlowHandle, HandleInspection, HandleState, StreamInspection};
pub use metrics::{ClassMetrics, FlowMetrics, FlowMetricsSnapshot};
pub use token_bucket::TokenBucket;
pub use tracker::{StreamTracker, TrackedDeduction};
