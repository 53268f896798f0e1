//! Workload generation and execution.
//!
//! A workload drives one writer task and one follower task per range against
//! a shared `FlowController`. Writers deduct for each replicated write and
//! occasionally change their range's membership. Followers admit each write on
//! every store it was replicated to after a random delay, which is what lets
//! blocked writers make progress.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use kvflow_control::{FlowController, FlowMetricsSnapshot};
use kvflow_core::{LogPosition, RangeId, StoreId, WorkClass};
use rand::seq::{IteratorRandom, SliceRandom};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::verification::{Verification, Violation};

/// Distribution for write sizes.
#[derive(Debug, Clone)]
pub enum SizeDistribution {
    /// Fixed size for all writes.
    Fixed(u64),
    /// Uniform distribution between min and max.
    Uniform {
        /// Minimum size.
        min: u64,
        /// Maximum size.
        max: u64,
    },
}

impl SizeDistribution {
    /// Samples a size from the distribution.
    #[must_use]
    pub fn sample<R: Rng>(&self, rng: &mut R) -> u64 {
        match self {
            Self::Fixed(size) => *size,
            Self::Uniform { min, max } => rng.gen_range(*min..=*max),
        }
    }
}

impl Default for SizeDistribution {
    fn default() -> Self {
        Self::Uniform {
            min: 1024,
            max: 64 * 1024,
        }
    }
}

/// Workload configuration.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Random seed for deterministic generation.
    pub seed: u64,
    /// Number of ranges written concurrently.
    pub ranges: u64,
    /// Writes issued per range.
    pub writes_per_range: u64,
    /// Replicas per range.
    pub replicas: usize,
    /// Stores that replicas are drawn from.
    pub store_pool: u64,
    /// Write size distribution.
    pub write_size: SizeDistribution,
    /// Probability that a write is elastic (0.0 to 1.0).
    pub elastic_ratio: f64,
    /// Probability of replacing one replica before a write (0.0 to 1.0).
    pub churn_ratio: f64,
    /// Upper bound on a follower's delay before admitting a write.
    pub admit_delay_max: Duration,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            ranges: 16,
            writes_per_range: 1000,
            replicas: 3,
            store_pool: 5,
            write_size: SizeDistribution::default(),
            elastic_ratio: 0.2,
            churn_ratio: 0.01,
            admit_delay_max: Duration::from_micros(500),
        }
    }
}

/// Builder for creating workloads.
#[derive(Debug, Default)]
pub struct WorkloadBuilder {
    config: WorkloadConfig,
}

impl WorkloadBuilder {
    /// Creates a new workload builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the random seed.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Sets the number of ranges.
    #[must_use]
    pub const fn ranges(mut self, ranges: u64) -> Self {
        self.config.ranges = ranges;
        self
    }

    /// Sets the writes issued per range.
    #[must_use]
    pub const fn writes_per_range(mut self, writes: u64) -> Self {
        self.config.writes_per_range = writes;
        self
    }

    /// Sets the replica count and the store pool they are drawn from.
    #[must_use]
    pub const fn replicas(mut self, replicas: usize, store_pool: u64) -> Self {
        self.config.replicas = replicas;
        self.config.store_pool = store_pool;
        self
    }

    /// Sets the write size distribution.
    #[must_use]
    pub const fn write_size(mut self, size: SizeDistribution) -> Self {
        self.config.write_size = size;
        self
    }

    /// Sets the elastic share of writes.
    #[must_use]
    pub const fn elastic_ratio(mut self, ratio: f64) -> Self {
        self.config.elastic_ratio = ratio;
        self
    }

    /// Sets the per-write membership churn probability.
    #[must_use]
    pub const fn churn_ratio(mut self, ratio: f64) -> Self {
        self.config.churn_ratio = ratio;
        self
    }

    /// Sets the maximum follower admission delay.
    #[must_use]
    pub const fn admit_delay_max(mut self, delay: Duration) -> Self {
        self.config.admit_delay_max = delay;
        self
    }

    /// Builds the workload.
    #[must_use]
    pub fn build(self) -> Workload {
        Workload::new(self.config)
    }
}

/// A write the follower must admit on each listed store.
#[derive(Debug)]
struct Replicated {
    class: WorkClass,
    position: LogPosition,
    stores: Vec<StoreId>,
}

/// What one writer task observed.
#[derive(Debug)]
struct WriterReport {
    writes_ok: u64,
    bytes_written: u64,
    membership_changes: u64,
    wait_latencies: Histogram<u64>,
    violations: Vec<Violation>,
}

/// A verifiable flow-control workload.
#[derive(Debug)]
pub struct Workload {
    config: WorkloadConfig,
}

impl Workload {
    /// Creates a new workload from configuration.
    #[must_use]
    pub const fn new(config: WorkloadConfig) -> Self {
        Self { config }
    }

    /// Creates a workload builder.
    #[must_use]
    pub fn builder() -> WorkloadBuilder {
        WorkloadBuilder::new()
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &WorkloadConfig {
        &self.config
    }

    /// Runs the workload to completion and verifies the drained controller.
    ///
    /// Every range's handle is removed once its follower has admitted
    /// everything, so a clean run leaves no registered ranges behind.
    ///
    /// # Panics
    ///
    /// Panics if histogram creation fails (should not happen with valid
    /// parameters) or a writer or follower task panics.
    #[allow(clippy::cast_precision_loss)]
    #[allow(clippy::cast_possible_truncation)] // duration_ms won't overflow u64.
    pub async fn run(&self, controller: &Arc<FlowController>) -> WorkloadStats {
        let start = Instant::now();
        info!(
            seed = self.config.seed,
            ranges = self.config.ranges,
            writes_per_range = self.config.writes_per_range,
            "Starting workload"
        );

        let mut writers = JoinSet::new();
        let mut followers = JoinSet::new();
        for r in 0..self.config.ranges {
            let range_id = RangeId::new(r);
            let (tx, rx) = mpsc::unbounded_channel();
            let rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(r));
            let follower_rng = ChaCha8Rng::seed_from_u64(!self.config.seed.wrapping_add(r));

            writers.spawn(write_range(
                Arc::clone(controller),
                range_id,
                self.config.clone(),
                rng,
                tx,
            ));
            followers.spawn(follow_range(
                Arc::clone(controller),
                range_id,
                self.config.admit_delay_max,
                follower_rng,
                rx,
            ));
        }

        let mut wait_latencies = Histogram::<u64>::new(3).expect("histogram creation");
        let mut writes_ok = 0;
        let mut bytes_written = 0;
        let mut membership_changes = 0;
        let mut violations = Vec::new();
        while let Some(report) = writers.join_next().await {
            let report = report.expect("writer task panicked");
            writes_ok += report.writes_ok;
            bytes_written += report.bytes_written;
            membership_changes += report.membership_changes;
            let _ = wait_latencies.add(&report.wait_latencies);
            violations.extend(report.violations);
        }
        while let Some(result) = followers.join_next().await {
            result.expect("follower task panicked");
        }

        let metrics = controller.metrics();
        violations.extend(Verification::verify(&metrics));
        for range_id in controller.ranges() {
            controller.remove_handle(range_id);
        }

        let duration = start.elapsed();
        let writes_total = self.config.ranges * self.config.writes_per_range;
        let stats = WorkloadStats {
            writes_total,
            writes_ok,
            writes_failed: writes_total - writes_ok,
            bytes_written,
            membership_changes,
            wait_latency_p50: wait_latencies.value_at_percentile(50.0) as f64 / 1000.0,
            wait_latency_p99: wait_latencies.value_at_percentile(99.0) as f64 / 1000.0,
            wait_latency_max: wait_latencies.max() as f64 / 1000.0,
            throughput_bytes: bytes_written as f64 / duration.as_secs_f64(),
            duration_ms: duration.as_millis() as u64,
            metrics,
            violations,
        };
        info!(
            writes_ok = stats.writes_ok,
            writes_failed = stats.writes_failed,
            violations = stats.violations.len(),
            "Workload finished"
        );
        stats
    }
}

/// Writer side of one range: changes membership now and then and deducts
/// for each write in log order.
async fn write_range(
    controller: Arc<FlowController>,
    range_id: RangeId,
    config: WorkloadConfig,
    mut rng: ChaCha8Rng,
    tx: mpsc::UnboundedSender<Replicated>,
) -> WriterReport {
    let pool: Vec<u64> = (1..=config.store_pool).collect();
    let mut members: Vec<u64> = pool
        .choose_multiple(&mut rng, config.replicas)
        .copied()
        .collect();
    let mut report = WriterReport {
        writes_ok: 0,
        bytes_written: 0,
        membership_changes: 0,
        wait_latencies: Histogram::<u64>::new(3).expect("histogram creation"),
        violations: Vec::new(),
    };

    let handle = controller.get_or_create_handle(range_id);
    if let Err(err) = handle.on_membership_change(&store_ids(&members)) {
        report.violations.push(Violation::WriteFailed {
            range_id,
            position: 0,
            error: err.to_string(),
        });
        return report;
    }

    let cancel = CancellationToken::new();
    for position in 1..=config.writes_per_range {
        if rng.gen_bool(config.churn_ratio) && replace_member(&mut rng, &pool, &mut members) {
            if let Err(err) = handle.on_membership_change(&store_ids(&members)) {
                report.violations.push(Violation::WriteFailed {
                    range_id,
                    position,
                    error: err.to_string(),
                });
                continue;
            }
            report.membership_changes += 1;
            debug!(range_id = %range_id, ?members, "Replaced replica");
        }

        let class = if rng.gen_bool(config.elastic_ratio) {
            WorkClass::Elastic
        } else {
            WorkClass::Regular
        };
        let size = config.write_size.sample(&mut rng);
        let log_position = LogPosition::new(position);

        let started = Instant::now();
        match handle.deduct(class, size, log_position, &cancel).await {
            Ok(()) => {
                let us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
                let _ = report.wait_latencies.record(us);
                report.writes_ok += 1;
                report.bytes_written += size;
                // The writer is the only one changing membership, so the
                // members it holds are exactly the streams that were charged.
                let _ = tx.send(Replicated {
                    class,
                    position: log_position,
                    stores: store_ids(&members),
                });
            }
            Err(err) => report.violations.push(Violation::WriteFailed {
                range_id,
                position,
                error: err.to_string(),
            }),
        }
    }
    report
}

/// Follower side of one range.
async fn follow_range(
    controller: Arc<FlowController>,
    range_id: RangeId,
    delay_max: Duration,
    mut rng: ChaCha8Rng,
    mut rx: mpsc::UnboundedReceiver<Replicated>,
) {
    let delay_max_us = u64::try_from(delay_max.as_micros()).unwrap_or(u64::MAX);
    while let Some(write) = rx.recv().await {
        if delay_max_us > 0 {
            let delay = rng.gen_range(0..=delay_max_us);
            tokio::time::sleep(Duration::from_micros(delay)).await;
        }
        for store_id in write.stores {
            controller.admit(range_id, store_id, write.class, write.position);
        }
    }
}

/// Swaps one member for a store outside the set. Returns false if the set is
/// empty or every store in the pool is already a member.
fn replace_member(rng: &mut ChaCha8Rng, pool: &[u64], members: &mut [u64]) -> bool {
    if members.is_empty() {
        return false;
    }
    let Some(incoming) = pool
        .iter()
        .filter(|store| !members.contains(store))
        .copied()
        .choose(rng)
    else {
        return false;
    };
    let slot = rng.gen_range(0..members.len());
    members[slot] = incoming;
    true
}

fn store_ids(raw: &[u64]) -> Vec<StoreId> {
    raw.iter().copied().map(StoreId::new).collect()
}

/// Statistics from a workload execution.
#[derive(Debug, Clone)]
pub struct WorkloadStats {
    /// Writes attempted.
    pub writes_total: u64,
    /// Writes whose deduction succeeded.
    pub writes_ok: u64,
    /// Writes whose deduction failed.
    pub writes_failed: u64,
    /// Payload bytes of successful writes, counted once per write.
    pub bytes_written: u64,
    /// Replica replacements applied.
    pub membership_changes: u64,

    /// Deduction latency p50 in milliseconds.
    pub wait_latency_p50: f64,
    /// Deduction latency p99 in milliseconds.
    pub wait_latency_p99: f64,
    /// Deduction latency max in milliseconds.
    pub wait_latency_max: f64,

    /// Write throughput in payload bytes per second.
    pub throughput_bytes: f64,
    /// Total duration in milliseconds.
    pub duration_ms: u64,

    /// Controller metrics after the drain, before handles were removed.
    pub metrics: FlowMetricsSnapshot,
    /// Verification violations found.
    pub violations: Vec<Violation>,
}

impl WorkloadStats {
    /// Prints a human-readable summary.
    pub fn print_summary(&self) {
        println!("=== Workload Statistics ===");
        println!(
            "Writes: {} total, {} ok, {} failed ({} membership changes)",
            self.writes_total, self.writes_ok, self.writes_failed, self.membership_changes
        );
        println!(
            "Deduct latency: p50={:.2}ms p99={:.2}ms max={:.2}ms",
            self.wait_latency_p50, self.wait_latency_p99, self.wait_latency_max
        );
        for class in WorkClass::ALL {
            let m = self.metrics.class(class);
            println!(
                "{class}: deducted={} returned={} unaccounted={} admitted={} errored={}",
                m.deducted, m.returned, m.unaccounted, m.requests_admitted, m.requests_errored
            );
        }
        println!("Throughput: {:.0} bytes/sec", self.throughput_bytes);
        println!("Duration: {}ms", self.duration_ms);
        println!("Violations: {}", self.violations.len());
        for v in &self.violations {
            println!("  - {v}");
        }
    }
}
