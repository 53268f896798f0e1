//! kvflow Workload: verifiable load for replication flow control.
//!
//! Runs a seeded, concurrent replicated-write workload against a
//! `FlowController` and checks that the controller drains back to full
//! buckets with nothing outstanding. Each range gets:
//!
//! - A **writer** that deducts for every write in log order and now and then
//!   replaces a replica.
//! - A **follower** that admits every write on each store it reached after a
//!   random delay.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kvflow_control::{FlowConfig, FlowController};
//! use kvflow_workload::Workload;
//!
//! let controller = Arc::new(FlowController::new(FlowConfig::default())?);
//! let stats = Workload::builder()
//!     .seed(42)
//!     .ranges(16)
//!     .writes_per_range(1000)
//!     .build()
//!     .run(&controller)
//!     .await;
//!
//! assert!(stats.violations.is_empty());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod verification;
mod workload;

pub use verification::{Verification, Violation};
pub use workload::{SizeDistribution, Workload, WorkloadBuilder, WorkloadConfig, WorkloadStats};
