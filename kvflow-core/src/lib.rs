//! kvflow core - Strongly-typed identifiers and limits for replication flow control.
//!
//! This crate holds the vocabulary shared by every kvflow crate: range, store
//! and log position identifiers, the two admission work classes, and the
//! explicit resource bounds. It does no I/O and has no async code.
//!
//! # Design Principles (TigerStyle)
//!
//! - **Strongly-typed IDs**: Prevent mixing up `RangeId` with `StoreId`
//! - **Explicit limits**: Every per-range resource has a bounded maximum
//! - **Explicit types**: Use u32/u64, not usize
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod class;
mod error;
mod limits;
mod types;

pub use class::{PerClass, WorkClass};
pub use error::{Error, Result};
pub use limits::Limits;
pub use types::{LogPosition, RangeId, StoreId};
