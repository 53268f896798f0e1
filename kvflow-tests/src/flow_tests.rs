//! Flow-control integration tests.
//!
//! Multi-component scenarios driven through the `FlowController` surface:
//! - Membership changes with writes in flight
//! - Several ranges sharing one node bucket
//! - Leadership loss and handle re-creation
//! - Runtime capacity changes

// Test-specific lint allowances.
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;
use std::time::Duration;

use kvflow_control::{FlowConfig, FlowController, FlowError, HandleState};
use kvflow_core::{LogPosition, RangeId, StoreId, WorkClass};
use tokio_util::sync::CancellationToken;

use crate::properties::ConservationChecker;
use crate::scenarios::sizes::{KIB, MIB, SMALL_WRITE};
use crate::scenarios::stores::{ids, FIVE_REPLICAS, THREE_REPLICAS};

fn controller() -> FlowController {
    FlowController::new(FlowConfig::for_testing()).unwrap()
}

fn pos(p: u64) -> LogPosition {
    LogPosition::new(p)
}

fn store(s: u64) -> StoreId {
    StoreId::new(s)
}

async fn write(controller: &FlowController, range: RangeId, class: WorkClass, size: u64, p: u64) {
    controller
        .deduct(range, class, size, pos(p), &CancellationToken::new())
        .await
        .unwrap();
}

// ============================================================================
// Membership
// ============================================================================

#[tokio::test]
async fn test_membership_changes_with_writes_in_flight() {
    let controller = controller();
    let range = RangeId::new(1);
    let handle = controller.get_or_create_handle(range);
    let mut checker = ConservationChecker::new();

    handle.on_membership_change(&ids(THREE_REPLICAS)).unwrap();
    write(&controller, range, WorkClass::Regular, MIB, 1).await;
    checker.record(&controller);

    let metrics = controller.metrics();
    assert_eq!(metrics.regular.deducted, 3 * MIB);
    assert_eq!(metrics.regular.returned, 0);
    for s in 1..=3 {
        assert_eq!(handle.tracked_tokens(store(s), WorkClass::Regular), Some(MIB));
    }

    // Store 4 joins as a voter.
    assert_eq!(handle.tracked_tokens(store(4), WorkClass::Regular), None);
    handle.on_membership_change(&ids(&[1, 2, 3, 4])).unwrap();
    write(&controller, range, WorkClass::Regular, MIB, 2).await;
    checker.record(&controller);

    for s in 1..=3 {
        assert_eq!(handle.tracked_tokens(store(s), WorkClass::Regular), Some(2 * MIB));
    }
    assert_eq!(handle.tracked_tokens(store(4), WorkClass::Regular), Some(MIB));

    // Store 3 leaves; store 5 joins as a non-voter.
    handle.on_membership_change(&ids(&[1, 2, 4, 5])).unwrap();
    write(&controller, range, WorkClass::Regular, MIB, 3).await;
    checker.record(&controller);

    let inspection = controller.inspect(range).unwrap();
    assert_eq!(inspection.stores(), ids(&[1, 2, 4, 5]));
    assert_eq!(inspection.tracked_tokens(store(1), WorkClass::Regular), Some(3 * MIB));
    assert_eq!(inspection.tracked_tokens(store(2), WorkClass::Regular), Some(3 * MIB));
    assert_eq!(inspection.tracked_tokens(store(4), WorkClass::Regular), Some(2 * MIB));
    assert_eq!(inspection.tracked_tokens(store(5), WorkClass::Regular), Some(MIB));
    assert_eq!(inspection.tracked_tokens(store(3), WorkClass::Regular), None);
    assert_eq!(handle.tracked_tokens(store(3), WorkClass::Regular), Some(2 * MIB));

    // Every follower, including the removed one, admits everything.
    for s in 1..=5 {
        controller.admit(range, store(s), WorkClass::Regular, pos(3));
    }
    checker.record(&controller);
    checker.assert_ok();

    let inspection = controller.inspect(range).unwrap();
    for stream in &inspection.streams {
        assert_eq!(stream.tracked_tokens[WorkClass::Regular], 0);
    }
    assert!(handle.retired_streams().is_empty());

    let metrics = controller.metrics();
    assert_eq!(metrics.regular.deducted, 11 * MIB);
    assert_eq!(metrics.regular.returned, 11 * MIB);
    assert_eq!(metrics.regular.unaccounted, 0);
    assert_eq!(metrics.regular.unmatched_admissions, 0);
    assert_eq!(metrics.regular.available, metrics.regular.capacity);
}

#[tokio::test]
async fn test_removed_store_admits_after_many_changes() {
    let controller = controller();
    let range = RangeId::new(7);
    let handle = controller.get_or_create_handle(range);
    handle.on_membership_change(&ids(FIVE_REPLICAS)).unwrap();

    write(&controller, range, WorkClass::Elastic, SMALL_WRITE, 10).await;
    handle.on_membership_change(&ids(&[1, 2, 3, 4])).unwrap();
    handle.on_membership_change(&ids(&[1, 2, 3, 6])).unwrap();
    write(&controller, range, WorkClass::Elastic, SMALL_WRITE, 11).await;

    assert_eq!(handle.retired_streams(), ids(&[4, 5]));
    assert_eq!(
        controller.admit(range, store(5), WorkClass::Elastic, pos(11)),
        SMALL_WRITE
    );
    assert_eq!(
        controller.admit(range, store(4), WorkClass::Elastic, pos(10)),
        SMALL_WRITE
    );
    assert!(handle.retired_streams().is_empty());

    for s in [1, 2, 3, 6] {
        controller.admit(range, store(s), WorkClass::Elastic, pos(11));
    }
    let mut checker = ConservationChecker::new();
    checker.record(&controller);
    checker.assert_ok();
    assert_eq!(controller.metrics().elastic.outstanding(), 0);
}

// ============================================================================
// Shared Buckets
// ============================================================================

#[tokio::test]
async fn test_ranges_share_node_bucket() {
    let controller = controller();
    let capacity = controller.config().elastic_tokens;
    let a = RangeId::new(1);
    let b = RangeId::new(2);
    let six_replicas = ids(&[1, 2, 3, 4, 5, 6]);
    for range in [a, b] {
        controller
            .get_or_create_handle(range)
            .on_membership_change(&six_replicas)
            .unwrap();
    }

    // Range A takes three quarters of the elastic budget.
    let per_stream = capacity / 8;
    write(&controller, a, WorkClass::Elastic, per_stream, 1).await;

    // Range B cannot fit a write of the same size until A is admitted.
    let handle_b = controller.handle(b).unwrap();
    assert!(!handle_b
        .try_deduct(WorkClass::Elastic, per_stream, pos(1))
        .unwrap());

    let blocked = {
        let handle_b = Arc::clone(&handle_b);
        tokio::spawn(async move {
            handle_b
                .deduct(WorkClass::Elastic, per_stream, pos(1), &CancellationToken::new())
                .await
        })
    };
    while controller.metrics().elastic.requests_waiting == 0 {
        tokio::task::yield_now().await;
    }

    // Regular traffic from other ranges is unaffected.
    write(&controller, a, WorkClass::Regular, KIB, 2).await;

    for s in 1..=6 {
        controller.admit(a, store(s), WorkClass::Elastic, pos(1));
    }
    tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(
        handle_b.tracked_tokens(store(1), WorkClass::Elastic),
        Some(per_stream)
    );
    let mut checker = ConservationChecker::new();
    checker.record(&controller);
    checker.assert_ok();
}

// ============================================================================
// Leadership
// ============================================================================

#[tokio::test]
async fn test_leadership_loss_writes_off_outstanding() {
    let controller = controller();
    let range = RangeId::new(3);
    let handle = controller.get_or_create_handle(range);
    handle.on_membership_change(&ids(THREE_REPLICAS)).unwrap();

    write(&controller, range, WorkClass::Regular, SMALL_WRITE, 1).await;
    write(&controller, range, WorkClass::Elastic, SMALL_WRITE, 2).await;
    controller.admit(range, store(1), WorkClass::Regular, pos(1));

    let drained = controller.remove_handle(range).unwrap();
    assert_eq!(drained[WorkClass::Regular], 2 * SMALL_WRITE);
    assert_eq!(drained[WorkClass::Elastic], 3 * SMALL_WRITE);
    assert_eq!(handle.state(), HandleState::Closed);
    assert!(controller.ranges().is_empty());

    // Late admissions after the loss are counted but change nothing.
    assert_eq!(controller.admit(range, store(2), WorkClass::Regular, pos(1)), 0);

    let metrics = controller.metrics();
    assert_eq!(metrics.regular.unaccounted, 2 * SMALL_WRITE);
    assert_eq!(metrics.regular.returned, SMALL_WRITE);
    assert_eq!(metrics.regular.unmatched_admissions, 1);
    assert_eq!(metrics.regular.available, metrics.regular.capacity);
    assert_eq!(metrics.elastic.available, metrics.elastic.capacity);

    let mut checker = ConservationChecker::new();
    checker.record(&controller);
    checker.assert_ok();

    // Regaining leadership starts from a clean handle.
    let handle = controller.get_or_create_handle(range);
    assert_eq!(handle.state(), HandleState::Active);
    assert!(handle.active_streams().is_empty());
    assert_eq!(
        controller
            .deduct(range, WorkClass::Regular, KIB, pos(1), &CancellationToken::new())
            .await,
        Ok(())
    );
}

#[tokio::test]
async fn test_stale_handle_after_removal_rejects_deductions() {
    let controller = controller();
    let range = RangeId::new(4);
    let stale = controller.get_or_create_handle(range);
    stale.on_membership_change(&ids(THREE_REPLICAS)).unwrap();
    controller.remove_handle(range);

    let result = stale
        .deduct(WorkClass::Regular, KIB, pos(1), &CancellationToken::new())
        .await;
    assert_eq!(result, Err(FlowError::HandleClosed { range_id: range }));
    assert_eq!(
        controller
            .deduct(range, WorkClass::Regular, KIB, pos(1), &CancellationToken::new())
            .await,
        Err(FlowError::HandleClosed { range_id: range })
    );
    assert_eq!(controller.metrics().regular.requests_errored, 2);
}

#[tokio::test]
async fn test_shutdown_closes_every_range() {
    let controller = controller();
    for r in 1..=4 {
        let range = RangeId::new(r);
        controller
            .get_or_create_handle(range)
            .on_membership_change(&ids(THREE_REPLICAS))
            .unwrap();
        write(&controller, range, WorkClass::Regular, KIB, r).await;
    }

    let drained = controller.close_all();
    assert_eq!(drained[WorkClass::Regular], 4 * 3 * KIB);
    assert_eq!(controller.metrics().handles, 0);

    let mut checker = ConservationChecker::new();
    checker.record(&controller);
    checker.assert_ok();
}

// ============================================================================
// Capacity Changes
// ============================================================================

#[tokio::test]
async fn test_shrink_and_grow_capacity_under_load() {
    let controller = controller();
    let range = RangeId::new(1);
    let handle = controller.get_or_create_handle(range);
    handle.on_membership_change(&ids(&[1])).unwrap();
    let capacity = controller.config().regular_tokens;

    write(&controller, range, WorkClass::Regular, MIB, 1).await;
    controller.set_capacity(WorkClass::Regular, MIB / 2);
    assert_eq!(controller.metrics().regular.available, 0);

    // The returned 1MB first pays down the rest of the shrink.
    controller.admit(range, store(1), WorkClass::Regular, pos(1));
    assert_eq!(controller.metrics().regular.available, MIB / 2);

    let result = controller
        .deduct(range, WorkClass::Regular, MIB, pos(2), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(FlowError::ExceedsCapacity { .. })));

    controller.set_capacity(WorkClass::Regular, capacity);
    write(&controller, range, WorkClass::Regular, MIB, 2).await;
    controller.admit(range, store(1), WorkClass::Regular, pos(2));

    let mut checker = ConservationChecker::without_capacity_check();
    checker.record(&controller);
    checker.assert_ok();
    let metrics = controller.metrics();
    assert_eq!(metrics.regular.available, capacity);
    assert_eq!(metrics.regular.clamped, 0);
}
