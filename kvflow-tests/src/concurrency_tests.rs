//! Multi-task flow-control tests.
//!
//! Writers, followers, and membership changes run as concurrent tasks on a
//! multi-threaded runtime. Buckets are kept small so that writers block and
//! rely on admissions from other tasks to make progress.

// Test-specific lint allowances.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::too_many_lines)]

use std::sync::Arc;
use std::time::Duration;

use kvflow_control::{FlowConfig, FlowController, FlowError};
use kvflow_core::{Limits, LogPosition, RangeId, StoreId, WorkClass};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::properties::ConservationChecker;
use crate::scenarios::seeds::REGRESSION_SEEDS;
use crate::scenarios::sizes::KIB;
use crate::scenarios::stores::{ids, THREE_REPLICAS};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

const EIGHT_STORES: &[u64] = &[1, 2, 3, 4, 5, 6, 7, 8];

fn small_controller(tokens: u64) -> Arc<FlowController> {
    let mut limits = Limits::for_testing();
    // A maximal write to a full range must still fit the bucket.
    limits.max_entry_bytes = tokens / u64::from(limits.max_streams_per_range);
    let config = FlowConfig::new(tokens, tokens).with_limits(limits);
    Arc::new(FlowController::new(config).unwrap())
}

/// A write that every listed store must admit.
#[derive(Debug, Clone)]
struct Replicated {
    class: WorkClass,
    position: u64,
    stores: Vec<StoreId>,
}

/// Follower side of one range: admits each write on every store it was sent
/// to, after a short random delay.
async fn follow(
    controller: Arc<FlowController>,
    range_id: RangeId,
    seed: u64,
    mut rx: mpsc::UnboundedReceiver<Replicated>,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    while let Some(write) = rx.recv().await {
        let delay = Duration::from_micros(rng.gen_range(0..200));
        tokio::time::sleep(delay).await;
        for store_id in &write.stores {
            controller.admit(
                range_id,
                *store_id,
                write.class,
                LogPosition::new(write.position),
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_drain_to_full_buckets() {
    let controller = small_controller(64 * KIB);
    let ranges = 8;
    let writes_per_range = 200;

    let mut tasks = JoinSet::new();
    for r in 0..ranges {
        let range_id = RangeId::new(r);
        let handle = controller.get_or_create_handle(range_id);
        handle.on_membership_change(&ids(THREE_REPLICAS)).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(follow(Arc::clone(&controller), range_id, r, rx));

        tasks.spawn(async move {
            let mut rng = StdRng::seed_from_u64(REGRESSION_SEEDS[r as usize % REGRESSION_SEEDS.len()]);
            let stores = handle.active_streams();
            let cancel = CancellationToken::new();
            for position in 1..=writes_per_range {
                let class = if rng.gen_bool(0.3) {
                    WorkClass::Elastic
                } else {
                    WorkClass::Regular
                };
                let size = rng.gen_range(1..=4 * KIB);
                handle
                    .deduct(class, size, LogPosition::new(position), &cancel)
                    .await
                    .unwrap();
                tx.send(Replicated {
                    class,
                    position,
                    stores: stores.clone(),
                })
                .unwrap();
            }
        });
    }

    tokio::time::timeout(TEST_TIMEOUT, async {
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }
    })
    .await
    .expect("writers stalled");

    // Followers finish asynchronously; wait until everything is admitted.
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let metrics = controller.metrics();
            if metrics.regular.outstanding() == 0 && metrics.elastic.outstanding() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("admissions stalled");

    let mut checker = ConservationChecker::new();
    checker.record(&controller);
    checker.assert_ok();

    let metrics = controller.metrics();
    assert_eq!(
        metrics.regular.requests_admitted + metrics.elastic.requests_admitted,
        ranges * writes_per_range
    );
    assert_eq!(metrics.regular.requests_errored + metrics.elastic.requests_errored, 0);
    assert_eq!(metrics.regular.unmatched_admissions, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_membership_churn_during_writes() {
    let controller = small_controller(128 * KIB);
    let range_id = RangeId::new(1);
    let handle = controller.get_or_create_handle(range_id);
    handle.on_membership_change(&ids(THREE_REPLICAS)).unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    let follower = tokio::spawn(follow(Arc::clone(&controller), range_id, 7, rx));

    let writer = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            // The active set can change between any two calls, so every
            // store in the pool admits every write. Stores that never
            // received it have nothing to release.
            let stores = ids(&[1, 2, 3, 4, 5]);
            for position in 1..=500 {
                handle
                    .deduct(WorkClass::Regular, 2 * KIB, LogPosition::new(position), &cancel)
                    .await
                    .unwrap();
                tx.send(Replicated {
                    class: WorkClass::Regular,
                    position,
                    stores: stores.clone(),
                })
                .unwrap();
            }
        })
    };

    let churn = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move {
            let sets: [&[u64]; 4] = [&[1, 2, 3], &[1, 2, 4], &[2, 4, 5], &[1, 2, 3, 4, 5]];
            for i in 0..100 {
                handle.on_membership_change(&ids(sets[i % sets.len()])).unwrap();
                tokio::task::yield_now().await;
            }
            handle.on_membership_change(&ids(THREE_REPLICAS)).unwrap();
        })
    };

    tokio::time::timeout(TEST_TIMEOUT, async {
        writer.await.unwrap();
        churn.await.unwrap();
        follower.await.unwrap();
    })
    .await
    .expect("churn test stalled");

    let mut checker = ConservationChecker::new();
    checker.record(&controller);
    checker.assert_ok();
    assert_eq!(controller.metrics().regular.outstanding(), 0);
    assert!(handle.retired_streams().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancellation_storm_leaves_no_residue() {
    let controller = small_controller(32 * KIB);
    let ranges = 16;
    for r in 0..ranges {
        controller
            .get_or_create_handle(RangeId::new(r))
            .on_membership_change(&ids(THREE_REPLICAS))
            .unwrap();
    }

    // Fill the regular bucket from range 0 so every other write blocks.
    let filler = controller.handle(RangeId::new(0)).unwrap();
    filler.on_membership_change(&ids(EIGHT_STORES)).unwrap();
    assert!(filler
        .try_deduct(WorkClass::Regular, 4 * KIB, LogPosition::new(1))
        .unwrap());

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    for r in 1..ranges {
        let controller = Arc::clone(&controller);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            controller
                .deduct(
                    RangeId::new(r),
                    WorkClass::Regular,
                    KIB,
                    LogPosition::new(1),
                    &cancel,
                )
                .await
        });
    }

    tokio::time::timeout(TEST_TIMEOUT, async {
        while controller.metrics().regular.requests_waiting < ranges - 1 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("writers never queued");

    cancel.cancel();
    let mut cancelled = 0;
    while let Some(result) = tasks.join_next().await {
        if let Err(FlowError::Cancelled { .. }) = result.unwrap() {
            cancelled += 1;
        }
    }
    assert_eq!(cancelled, ranges - 1);

    for store in 1..=8 {
        filler.admit(StoreId::new(store), WorkClass::Regular, LogPosition::new(1));
    }
    let mut checker = ConservationChecker::new();
    checker.record(&controller);
    checker.assert_ok();

    let metrics = controller.metrics();
    assert_eq!(metrics.regular.requests_waiting, 0);
    assert_eq!(metrics.regular.requests_errored, ranges - 1);
    assert_eq!(metrics.regular.available, metrics.regular.capacity);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leadership_loss_releases_blocked_writers() {
    let controller = small_controller(16 * KIB);
    let range_id = RangeId::new(1);
    let handle = controller.get_or_create_handle(range_id);
    handle.on_membership_change(&ids(EIGHT_STORES)).unwrap();
    assert!(handle
        .try_deduct(WorkClass::Elastic, 2 * KIB, LogPosition::new(1))
        .unwrap());

    // Several writers queue on the same range, behind the proposal lane and
    // the bucket.
    let mut tasks = JoinSet::new();
    for position in 2..=5 {
        let controller = Arc::clone(&controller);
        tasks.spawn(async move {
            controller
                .deduct(
                    range_id,
                    WorkClass::Elastic,
                    KIB,
                    LogPosition::new(position),
                    &CancellationToken::new(),
                )
                .await
        });
    }
    tokio::time::timeout(TEST_TIMEOUT, async {
        while controller.metrics().elastic.requests_waiting == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("writer never queued");

    controller.remove_handle(range_id);

    let results = tokio::time::timeout(TEST_TIMEOUT, async {
        let mut results = Vec::new();
        while let Some(result) = tasks.join_next().await {
            results.push(result.unwrap());
        }
        results
    })
    .await
    .expect("blocked writers not released");

    assert!(results
        .iter()
        .all(|result| *result == Err(FlowError::HandleClosed { range_id })));

    let mut checker = ConservationChecker::new();
    checker.record(&controller);
    checker.assert_ok();
    let metrics = controller.metrics();
    assert_eq!(metrics.elastic.unaccounted, 16 * KIB);
    assert_eq!(metrics.elastic.available, metrics.elastic.capacity);
}
