//! kvflow Tests - simulation and integration testing for kvflow.
//!
//! This crate contains the cross-component tests for replication flow
//! control. Tests are organized by type:
//!
//! ## Test Organization
//!
//! **DST Tests** (`*_dst.rs`): Seeded randomized simulation
//! - `flow_dst`: Random writes, admissions, membership changes, and
//!   leadership losses checked against a reference model
//!
//! **Integration Tests** (`*_tests.rs`): Multi-component integration
//! - `flow_tests`: Membership, shared buckets, leadership, capacity changes
//! - `concurrency_tests`: Concurrent writers, followers, and cancellation
//!
//! **Support Modules**:
//! - `properties`: Accounting properties and the `ConservationChecker`
//! - `scenarios`: Reusable replica sets, sizes, and seeds
//!
//! ## Naming Conventions
//!
//! - DST tests: `test_dst_<component>_<scenario>`
//! - Integration tests: `test_<scenario>`
//! - Unit tests: Inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod properties;
pub mod scenarios;

// DST test modules.
#[cfg(test)]
mod flow_dst;

// Integration test modules.
#[cfg(test)]
mod concurrency_tests;
#[cfg(test)]
mod flow_tests;
