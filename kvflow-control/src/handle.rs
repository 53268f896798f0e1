//! Per-range flow handle.
//!
//! A `FlowHandle` exists for every range whose leader lives on this node. It
//! routes deductions to the streams of the range's current replicas, routes
//! admissions back to the ledger that recorded them, and follows membership
//! changes.
//!
//! # Active set vs ledgers
//!
//! ```text
//!   active set:  {s1, s2, s4}          ◀── new deductions go here
//!   ledgers:     {s1, s2, s3, s4}      ◀── admissions resolve here
//!                          │
//!                          └── s3 was removed but still has outstanding
//!                              tokens; it is forgotten once they are admitted
//! ```
//!
//! Removing a replica takes its stream out of the active set only. Its ledger
//! stays reachable by store so that admissions arriving after the removal
//! still return their tokens.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use kvflow_core::{LogPosition, PerClass, RangeId, StoreId, WorkClass};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::NodeTokens;
use crate::error::{FlowError, FlowResult};
use crate::tracker::{StreamTracker, TrackedDeduction};

/// Forgotten stores remembered per handle for quieting stale admissions.
const MAX_FORGOTTEN_STREAMS: usize = 64;

/// Lifecycle of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Routing deductions and admissions.
    Active,
    /// Leadership was lost; every outstanding token has been written off.
    Closed,
}

/// Both class ledgers of one stream.
#[derive(Debug)]
struct StreamLedger {
    trackers: PerClass<StreamTracker>,
}

impl StreamLedger {
    fn new() -> Self {
        Self {
            trackers: PerClass::from_fn(StreamTracker::new),
        }
    }

    fn tracked_tokens(&self) -> PerClass<u64> {
        PerClass::from_fn(|class| self.trackers[class].tracked_tokens())
    }

    fn is_settled(&self) -> bool {
        WorkClass::ALL
            .into_iter()
            .all(|class| self.trackers[class].is_empty())
    }

    /// Highest position ever tracked on the stream, in either class.
    fn last_tracked(&self) -> Option<LogPosition> {
        WorkClass::ALL
            .into_iter()
            .filter_map(|class| self.trackers[class].last_tracked())
            .max()
    }
}

#[derive(Debug)]
struct HandleInner {
    state: HandleState,
    /// Streams that receive new deductions.
    active: BTreeSet<StoreId>,
    /// Every stream with a ledger, active or retired.
    ledgers: BTreeMap<StoreId, StreamLedger>,
    /// Retired streams whose settled ledger was dropped, with the last
    /// position tracked on them. Bounded by `MAX_FORGOTTEN_STREAMS`.
    forgotten: BTreeMap<StoreId, LogPosition>,
}

impl HandleInner {
    /// Forgets a retired stream once nothing is outstanding on it.
    fn maybe_forget(&mut self, range_id: RangeId, store_id: StoreId) {
        if self.active.contains(&store_id) {
            return;
        }
        if !self.ledgers.get(&store_id).is_some_and(StreamLedger::is_settled) {
            return;
        }
        let last_tracked = self
            .ledgers
            .remove(&store_id)
            .and_then(|ledger| ledger.last_tracked());
        if let Some(position) = last_tracked {
            self.forgotten.insert(store_id, position);
            while self.forgotten.len() > MAX_FORGOTTEN_STREAMS {
                self.forgotten.pop_first();
            }
        }
        debug!(range_id = %range_id, store_id = %store_id, "Forgot settled retired stream");
    }

    /// Whether an admission targets entries already released on a stream
    /// whose ledger was forgotten.
    fn is_stale_admission(&self, store_id: StoreId, upto: LogPosition) -> bool {
        self.forgotten
            .get(&store_id)
            .is_some_and(|last_tracked| upto <= *last_tracked)
    }
}

/// Flow-control state for one range led on this node.
///
/// # Thread Safety
///
/// Deductions on the same handle are serialized by a proposal lane so that
/// ledgers receive positions in order even while a deduction is blocked on
/// the bucket. The stream table has its own short-lived lock, which admissions
/// and membership changes take without waiting on the lane.
#[derive(Debug)]
pub struct FlowHandle {
    range_id: RangeId,
    node: Arc<NodeTokens>,
    /// Serializes deductions on this range.
    proposals: tokio::sync::Mutex<()>,
    /// Fired on close to release deductions blocked on the bucket.
    closed: CancellationToken,
    inner: Mutex<HandleInner>,
}

impl FlowHandle {
    pub(crate) fn new(range_id: RangeId, node: Arc<NodeTokens>) -> Self {
        Self {
            range_id,
            node,
            proposals: tokio::sync::Mutex::new(()),
            closed: CancellationToken::new(),
            inner: Mutex::new(HandleInner {
                state: HandleState::Active,
                active: BTreeSet::new(),
                ledgers: BTreeMap::new(),
                forgotten: BTreeMap::new(),
            }),
        }
    }

    /// Returns the range this handle belongs to.
    #[must_use]
    pub const fn range_id(&self) -> RangeId {
        self.range_id
    }

    /// Returns the lifecycle state.
    ///
    /// # Panics
    ///
    /// Panics if the handle mutex is poisoned.
    #[must_use]
    pub fn state(&self) -> HandleState {
        self.lock().state
    }

    /// Deducts `size` tokens of `class` for every active stream and records the
    /// write at `position` in each stream's ledger.
    ///
    /// Blocks until the bucket can cover all streams at once. Either every
    /// active stream gets an entry or none does. With no active streams the
    /// call succeeds without deducting anything.
    ///
    /// # Errors
    ///
    /// - `FlowError::EntryTooLarge` if `size` exceeds the entry limit.
    /// - `FlowError::ExceedsCapacity` if `size` times the stream count can
    ///   never fit the bucket. A validated configuration only gets here after
    ///   the capacity was shrunk at runtime.
    /// - `FlowError::TooManyEntries` if a stream's ledger is full.
    /// - `FlowError::Cancelled` if `cancel` fires first.
    /// - `FlowError::HandleClosed` if the handle is or becomes closed.
    ///
    /// # Panics
    ///
    /// Panics if `position` is not after the last position tracked on an
    /// active stream, or if the handle mutex is poisoned. No ledger is touched
    /// and the granted tokens are returned before an ordering panic.
    pub async fn deduct(
        &self,
        class: WorkClass,
        size: u64,
        position: LogPosition,
        cancel: &CancellationToken,
    ) -> FlowResult<()> {
        match self.deduct_blocking(class, size, position, cancel).await {
            Ok(waited) => {
                self.node.metrics.record_request_admitted(class, waited);
                Ok(())
            }
            Err(err) => {
                self.node.metrics.record_request_errored(class);
                debug!(
                    range_id = %self.range_id,
                    %class,
                    size,
                    position = %position,
                    error = %err,
                    "Deduction failed"
                );
                Err(err)
            }
        }
    }

    async fn deduct_blocking(
        &self,
        class: WorkClass,
        size: u64,
        position: LogPosition,
        cancel: &CancellationToken,
    ) -> FlowResult<Duration> {
        self.node.config.limits.check_entry_bytes(size)?;

        let _lane = tokio::select! {
            biased;
            lane = self.proposals.lock() => lane,
            () = cancel.cancelled() => {
                return Err(FlowError::Cancelled { class, requested: size });
            }
            () = self.closed.cancelled() => {
                return Err(FlowError::HandleClosed { range_id: self.range_id });
            }
        };

        let streams = self.snapshot_streams(class)?;
        if streams.is_empty() || size == 0 {
            return Ok(Duration::ZERO);
        }
        let total = Self::total_tokens(size, streams.len());

        let bucket = &self.node.buckets[class];
        let waited = tokio::select! {
            result = bucket.deduct(total, cancel) => result?,
            () = self.closed.cancelled() => {
                return Err(FlowError::HandleClosed { range_id: self.range_id });
            }
        };

        self.commit(class, size, position, &streams)?;
        Ok(waited)
    }

    /// Deducts without waiting.
    ///
    /// Returns `Ok(false)` if another deduction holds the proposal lane or the
    /// bucket cannot cover every active stream right now.
    ///
    /// # Errors
    ///
    /// Same as [`Self::deduct`], except it never returns `Cancelled`.
    ///
    /// # Panics
    ///
    /// Panics if `position` is not after the last position tracked on an
    /// active stream, or if the handle mutex is poisoned.
    pub fn try_deduct(&self, class: WorkClass, size: u64, position: LogPosition) -> FlowResult<bool> {
        let result = self.deduct_now(class, size, position);
        match &result {
            Ok(true) => self.node.metrics.record_request_admitted(class, Duration::ZERO),
            Ok(false) => {}
            Err(_) => self.node.metrics.record_request_errored(class),
        }
        result
    }

    fn deduct_now(&self, class: WorkClass, size: u64, position: LogPosition) -> FlowResult<bool> {
        self.node.config.limits.check_entry_bytes(size)?;

        let Ok(_lane) = self.proposals.try_lock() else {
            return Ok(false);
        };

        let streams = self.snapshot_streams(class)?;
        if streams.is_empty() || size == 0 {
            return Ok(true);
        }
        let total = Self::total_tokens(size, streams.len());

        let bucket = &self.node.buckets[class];
        let capacity = bucket.capacity();
        if total > capacity {
            return Err(FlowError::ExceedsCapacity {
                class,
                requested: total,
                capacity,
            });
        }
        if !bucket.try_deduct(total) {
            return Ok(false);
        }

        self.commit(class, size, position, &streams)?;
        Ok(true)
    }

    /// Takes the active set for a deduction, checking state and ledger limits.
    fn snapshot_streams(&self, class: WorkClass) -> FlowResult<Vec<StoreId>> {
        let inner = self.lock();
        if inner.state == HandleState::Closed {
            return Err(FlowError::HandleClosed {
                range_id: self.range_id,
            });
        }

        let max = self.node.config.limits.max_tracked_entries_per_stream;
        for store_id in &inner.active {
            let len = inner
                .ledgers
                .get(store_id)
                .map_or(0, |ledger| ledger.trackers[class].len());
            if len as u64 >= max {
                return Err(FlowError::TooManyEntries {
                    range_id: self.range_id,
                    store_id: *store_id,
                    max,
                });
            }
        }

        Ok(inner.active.iter().copied().collect())
    }

    /// Records granted tokens in each stream's ledger.
    ///
    /// Streams removed while the deduction was blocked still get their entry;
    /// the write was proposed to them.
    ///
    /// # Panics
    ///
    /// Panics if `position` is not after the last position tracked on one of
    /// `streams`. Every ledger is checked before any is touched, and the
    /// granted tokens go back to the bucket before the panic.
    fn commit(
        &self,
        class: WorkClass,
        size: u64,
        position: LogPosition,
        streams: &[StoreId],
    ) -> FlowResult<()> {
        let total = Self::total_tokens(size, streams.len());
        let mut inner = self.lock();
        if inner.state == HandleState::Closed {
            drop(inner);
            self.node.buckets[class].return_tokens(total);
            return Err(FlowError::HandleClosed {
                range_id: self.range_id,
            });
        }

        let out_of_order = streams.iter().find_map(|store_id| {
            let last = inner.ledgers.get(store_id)?.trackers[class].last_tracked()?;
            (position <= last).then_some((*store_id, last))
        });
        if let Some((store_id, last)) = out_of_order {
            drop(inner);
            self.node.buckets[class].return_tokens(total);
            panic!(
                "{class} deduction at {position} on range {} store {store_id} \
                 not after last tracked {last}",
                self.range_id
            );
        }

        for store_id in streams {
            inner.forgotten.remove(store_id);
            inner
                .ledgers
                .entry(*store_id)
                .or_insert_with(StreamLedger::new)
                .trackers[class]
                .track(position, size);
        }
        self.node.metrics.record_deducted(class, total);
        Ok(())
    }

    fn total_tokens(size: u64, streams: usize) -> u64 {
        size.saturating_mul(u64::try_from(streams).unwrap_or(u64::MAX))
    }

    /// Releases every entry at or below `upto` on the stream to `store_id`
    /// and returns the tokens to the bucket.
    ///
    /// The stream may have left the active set. An admission for a store with
    /// no ledger is counted as unmatched, unless the store's settled ledger
    /// was forgotten and `upto` is at or below its last tracked position.
    /// Returns the tokens released.
    ///
    /// # Panics
    ///
    /// Panics if the handle mutex is poisoned.
    pub fn admit(&self, store_id: StoreId, class: WorkClass, upto: LogPosition) -> u64 {
        let mut inner = self.lock();
        if !inner.ledgers.contains_key(&store_id) && inner.is_stale_admission(store_id, upto) {
            debug!(
                range_id = %self.range_id,
                store_id = %store_id,
                %class,
                upto = %upto,
                "Repeated admission for a forgotten stream"
            );
            return 0;
        }
        let Some(ledger) = inner.ledgers.get_mut(&store_id) else {
            self.node.metrics.record_unmatched_admission(class);
            warn!(
                range_id = %self.range_id,
                store_id = %store_id,
                %class,
                upto = %upto,
                "Admission for a stream with no ledger"
            );
            return 0;
        };

        let released = ledger.trackers[class].admit(upto);
        if released > 0 {
            self.node.buckets[class].return_tokens(released);
            self.node.metrics.record_returned(class, released);
            debug!(
                range_id = %self.range_id,
                store_id = %store_id,
                %class,
                upto = %upto,
                released,
                "Returned admitted tokens"
            );
        }

        if self.node.config.gc_retired_streams {
            inner.maybe_forget(self.range_id, store_id);
        }
        released
    }

    /// Replaces the active set with `streams` (voters and non-voters).
    ///
    /// New stores get empty ledgers. Removed stores keep theirs until their
    /// outstanding tokens are admitted. A store that rejoins picks up its
    /// retained ledger.
    ///
    /// # Errors
    ///
    /// - `FlowError::TooManyStreams` if `streams` exceeds the per-range limit.
    /// - `FlowError::HandleClosed` if the handle is closed.
    ///
    /// # Panics
    ///
    /// Panics if the handle mutex is poisoned.
    pub fn on_membership_change(&self, streams: &[StoreId]) -> FlowResult<()> {
        let next: BTreeSet<StoreId> = streams.iter().copied().collect();
        let max = self.node.config.limits.max_streams_per_range;
        let count = u32::try_from(next.len()).unwrap_or(u32::MAX);
        if count > max {
            return Err(FlowError::TooManyStreams {
                range_id: self.range_id,
                count,
                max,
            });
        }

        let mut inner = self.lock();
        if inner.state == HandleState::Closed {
            return Err(FlowError::HandleClosed {
                range_id: self.range_id,
            });
        }

        let added: Vec<StoreId> = next.difference(&inner.active).copied().collect();
        let removed: Vec<StoreId> = inner.active.difference(&next).copied().collect();
        if added.is_empty() && removed.is_empty() {
            return Ok(());
        }

        for store_id in &added {
            inner.forgotten.remove(store_id);
            inner.ledgers.entry(*store_id).or_insert_with(StreamLedger::new);
        }
        inner.active = next;
        if self.node.config.gc_retired_streams {
            for store_id in &removed {
                inner.maybe_forget(self.range_id, *store_id);
            }
        }

        debug!(
            range_id = %self.range_id,
            ?added,
            ?removed,
            active = inner.active.len(),
            retained = inner.ledgers.len(),
            "Applied membership change"
        );
        Ok(())
    }

    /// Closes the handle, writing off every outstanding token.
    ///
    /// Drained tokens go back to the buckets, so capacity is not lost, but are
    /// counted as unaccounted rather than returned. Blocked deductions fail
    /// with `HandleClosed`. Closing twice is a no-op. Returns the tokens
    /// drained per class.
    ///
    /// # Panics
    ///
    /// Panics if the handle mutex is poisoned.
    pub fn close(&self) -> PerClass<u64> {
        let mut drained = PerClass::<u64>::default();
        let mut inner = self.lock();
        if inner.state == HandleState::Closed {
            return drained;
        }
        inner.state = HandleState::Closed;
        self.closed.cancel();

        for ledger in inner.ledgers.values_mut() {
            for class in WorkClass::ALL {
                drained[class] += ledger.trackers[class].drain();
            }
        }
        inner.ledgers.clear();
        inner.forgotten.clear();
        inner.active.clear();

        for (class, tokens) in drained.iter() {
            if *tokens == 0 {
                continue;
            }
            self.node.buckets[class].return_tokens(*tokens);
            self.node.metrics.record_unaccounted(class, *tokens);
            warn!(
                range_id = %self.range_id,
                %class,
                tokens = *tokens,
                "Wrote off outstanding tokens on close"
            );
        }

        info!(range_id = %self.range_id, "Closed flow handle");
        drained
    }

    /// Returns the active set in store order.
    ///
    /// # Panics
    ///
    /// Panics if the handle mutex is poisoned.
    #[must_use]
    pub fn active_streams(&self) -> Vec<StoreId> {
        self.lock().active.iter().copied().collect()
    }

    /// Returns stores that left the active set but still have a ledger.
    ///
    /// # Panics
    ///
    /// Panics if the handle mutex is poisoned.
    #[must_use]
    pub fn retired_streams(&self) -> Vec<StoreId> {
        let inner = self.lock();
        inner
            .ledgers
            .keys()
            .filter(|store_id| !inner.active.contains(*store_id))
            .copied()
            .collect()
    }

    /// Returns the tokens outstanding on one stream, active or retired.
    ///
    /// # Panics
    ///
    /// Panics if the handle mutex is poisoned.
    #[must_use]
    pub fn tracked_tokens(&self, store_id: StoreId, class: WorkClass) -> Option<u64> {
        self.lock()
            .ledgers
            .get(&store_id)
            .map(|ledger| ledger.trackers[class].tracked_tokens())
    }

    /// Returns the tokens outstanding across every ledger, active or retired.
    ///
    /// # Panics
    ///
    /// Panics if the handle mutex is poisoned.
    #[must_use]
    pub fn total_tracked(&self) -> PerClass<u64> {
        let inner = self.lock();
        let mut total = PerClass::<u64>::default();
        for ledger in inner.ledgers.values() {
            for (class, tokens) in ledger.tracked_tokens().iter() {
                total[class] += *tokens;
            }
        }
        total
    }

    /// Returns the active streams with their outstanding deductions.
    ///
    /// Retired streams are not listed even if tokens are still outstanding
    /// on them.
    ///
    /// # Panics
    ///
    /// Panics if the handle mutex is poisoned.
    #[must_use]
    pub fn inspect(&self) -> HandleInspection {
        let inner = self.lock();
        let streams = inner
            .active
            .iter()
            .map(|store_id| {
                inner.ledgers.get(store_id).map_or_else(
                    || StreamInspection {
                        store_id: *store_id,
                        tracked_tokens: PerClass::default(),
                        deductions: PerClass::default(),
                    },
                    |ledger| StreamInspection {
                        store_id: *store_id,
                        tracked_tokens: ledger.tracked_tokens(),
                        deductions: PerClass::from_fn(|class| {
                            ledger.trackers[class].entries().copied().collect()
                        }),
                    },
                )
            })
            .collect();

        HandleInspection {
            range_id: self.range_id,
            state: inner.state,
            streams,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandleInner> {
        self.inner.lock().expect("flow handle lock poisoned")
    }
}

/// Snapshot of one active stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInspection {
    /// Destination store.
    pub store_id: StoreId,
    /// Outstanding tokens per class.
    pub tracked_tokens: PerClass<u64>,
    /// Outstanding deductions per class, in log order.
    pub deductions: PerClass<Vec<TrackedDeduction>>,
}

/// Snapshot of a handle's active streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleInspection {
    /// The range.
    pub range_id: RangeId,
    /// Lifecycle state at the time of the snapshot.
    pub state: HandleState,
    /// Active streams in store order.
    pub streams: Vec<StreamInspection>,
}

impl HandleInspection {
    /// Returns the outstanding tokens of an active stream, or `None` if the
    /// store is not in the active set.
    #[must_use]
    pub fn tracked_tokens(&self, store_id: StoreId, class: WorkClass) -> Option<u64> {
        self.streams
            .iter()
            .find(|stream| stream.store_id == store_id)
            .map(|stream| stream.tracked_tokens[class])
    }

    /// Returns the stores listed, in order.
    #[must_use]
    pub fn stores(&self) -> Vec<StoreId> {
        self.streams.iter().map(|stream| stream.store_id).collect()
    }
}
