//! Node-wide flow controller.
//!
//! The `FlowController` owns the two node-wide token buckets and a registry of
//! flow handles, one per range led on this node. Every handle deducts from the
//! same pair of buckets, so all replicated write traffic of a class leaving this
//! node shares one budget.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         FlowController                           │
//! │                                                                  │
//! │   ┌──────────────┐  ┌──────────────┐       ┌──────────────────┐  │
//! │   │ regular      │  │ elastic      │◀──────│ handles          │  │
//! │   │ TokenBucket  │  │ TokenBucket  │       │ range → FlowHandle│ │
//! │   └──────────────┘  └──────────────┘       └──────────────────┘  │
//! │          ▲                  ▲                       │            │
//! │          └──── deduct / return per stream ──────────┘            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kvflow_core::{LogPosition, PerClass, RangeId, StoreId, WorkClass};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::FlowConfig;
use crate::error::{FlowError, FlowResult};
use crate::handle::{FlowHandle, HandleInspection};
use crate::metrics::{ClassMetrics, FlowMetrics, FlowMetricsSnapshot};
use crate::token_bucket::TokenBucket;

/// State shared by the controller and every handle it creates.
#[derive(Debug)]
pub(crate) struct NodeTokens {
    pub(crate) config: FlowConfig,
    pub(crate) buckets: PerClass<TokenBucket>,
    pub(crate) metrics: FlowMetrics,
}

/// Registry of flow handles and owner of the node's token buckets.
///
/// # Thread Safety
///
/// The registry lock is held only to look up, insert, or remove a handle.
/// All per-range work happens on the handle itself.
#[derive(Debug)]
pub struct FlowController {
    node: Arc<NodeTokens>,
    handles: RwLock<HashMap<RangeId, Arc<FlowHandle>>>,
}

impl FlowController {
    /// Creates a controller with full buckets.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidConfig` if the configuration is invalid.
    pub fn new(config: FlowConfig) -> FlowResult<Self> {
        config.validate()?;

        let buckets = PerClass::from_fn(|class| TokenBucket::new(class, config.capacity(class)));
        info!(
            regular_tokens = config.regular_tokens,
            elastic_tokens = config.elastic_tokens,
            "Created flow controller"
        );

        Ok(Self {
            node: Arc::new(NodeTokens {
                config,
                buckets,
                metrics: FlowMetrics::new(),
            }),
            handles: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the configuration the controller was created with.
    #[must_use]
    pub fn config(&self) -> &FlowConfig {
        &self.node.config
    }

    /// Returns the node-wide bucket for a class.
    #[must_use]
    pub fn bucket(&self, class: WorkClass) -> &TokenBucket {
        &self.node.buckets[class]
    }

    /// Returns the handle for a range, creating it on first use.
    ///
    /// Repeated calls return the same handle with its accumulated state.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock is poisoned.
    pub fn get_or_create_handle(&self, range_id: RangeId) -> Arc<FlowHandle> {
        if let Some(handle) = self.read_handles().get(&range_id) {
            return Arc::clone(handle);
        }

        let mut handles = self.write_handles();
        let handle = handles.entry(range_id).or_insert_with(|| {
            info!(range_id = %range_id, "Created flow handle");
            Arc::new(FlowHandle::new(range_id, Arc::clone(&self.node)))
        });
        Arc::clone(handle)
    }

    /// Returns the handle for a range if one is registered.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock is poisoned.
    #[must_use]
    pub fn handle(&self, range_id: RangeId) -> Option<Arc<FlowHandle>> {
        self.read_handles().get(&range_id).cloned()
    }

    /// Closes the handle for a range and removes it from the registry.
    ///
    /// Outstanding tokens are written off as unaccounted. Returns the tokens
    /// drained per class, or `None` if no handle was registered.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock is poisoned.
    pub fn remove_handle(&self, range_id: RangeId) -> Option<PerClass<u64>> {
        let handle = self.write_handles().remove(&range_id)?;
        Some(handle.close())
    }

    /// Closes and removes every handle, as on node shutdown.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock is poisoned.
    pub fn close_all(&self) -> PerClass<u64> {
        let handles: Vec<_> = self.write_handles().drain().map(|(_, h)| h).collect();
        let mut drained = PerClass::<u64>::default();
        for handle in handles {
            for (class, tokens) in handle.close().iter() {
                drained[class] += *tokens;
            }
        }
        drained
    }

    /// Deducts tokens for a write on a registered range.
    ///
    /// # Errors
    ///
    /// `FlowError::HandleClosed` if no handle is registered for the range,
    /// otherwise as [`FlowHandle::deduct`].
    pub async fn deduct(
        &self,
        range_id: RangeId,
        class: WorkClass,
        size: u64,
        position: LogPosition,
        cancel: &CancellationToken,
    ) -> FlowResult<()> {
        let Some(handle) = self.handle(range_id) else {
            self.node.metrics.record_request_errored(class);
            return Err(FlowError::HandleClosed { range_id });
        };
        handle.deduct(class, size, position, cancel).await
    }

    /// Routes an admission to the range's handle.
    ///
    /// Admissions for a range with no handle are counted as unmatched.
    /// Returns the tokens released.
    pub fn admit(
        &self,
        range_id: RangeId,
        store_id: StoreId,
        class: WorkClass,
        upto: LogPosition,
    ) -> u64 {
        if let Some(handle) = self.handle(range_id) {
            return handle.admit(store_id, class, upto);
        }
        self.node.metrics.record_unmatched_admission(class);
        warn!(
            range_id = %range_id,
            store_id = %store_id,
            %class,
            upto = %upto,
            "Admission for a range with no flow handle"
        );
        0
    }

    /// Resizes a class bucket at runtime.
    pub fn set_capacity(&self, class: WorkClass, capacity: u64) {
        self.node.buckets[class].set_capacity(capacity);
    }

    /// Returns the registered ranges in order.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock is poisoned.
    #[must_use]
    pub fn ranges(&self) -> Vec<RangeId> {
        let mut ranges: Vec<_> = self.read_handles().keys().copied().collect();
        ranges.sort_unstable();
        ranges
    }

    /// Returns the active streams of a range with their outstanding tokens.
    #[must_use]
    pub fn inspect(&self, range_id: RangeId) -> Option<HandleInspection> {
        self.handle(range_id).map(|handle| handle.inspect())
    }

    /// Returns inspections for every registered range, in range order.
    #[must_use]
    pub fn inspect_all(&self) -> Vec<HandleInspection> {
        self.ranges()
            .into_iter()
            .filter_map(|range_id| self.inspect(range_id))
            .collect()
    }

    /// Returns a point-in-time snapshot of every counter and gauge.
    #[must_use]
    pub fn metrics(&self) -> FlowMetricsSnapshot {
        let class_metrics = |class: WorkClass| {
            let bucket = &self.node.buckets[class];
            ClassMetrics {
                capacity: bucket.capacity(),
                available: bucket.available(),
                clamped: bucket.clamped(),
                requests_waiting: bucket.waiters() as u64,
                ..self.node.metrics.snapshot_counters(class)
            }
        };

        FlowMetricsSnapshot {
            regular: class_metrics(WorkClass::Regular),
            elastic: class_metrics(WorkClass::Elastic),
            handles: self.read_handles().len() as u64,
        }
    }

    fn read_handles(&self) -> RwLockReadGuard<'_, HashMap<RangeId, Arc<FlowHandle>>> {
        self.handles.read().expect("handle registry lock poisoned")
    }

    fn write_handles(&self) -> RwLockWriteGuard<'_, HashMap<RangeId, Arc<FlowHandle>>> {
        self.handles.write().expect("handle registry lock poisoned")
    }
}
