//! Flow-control workload driver.
//!
//! Runs a seeded replicated-write workload against an in-process
//! `FlowController`, prints a summary, and exits non-zero on any violation.
//!
//! ```bash
//! kvflow-workload --seed 7 --ranges 32 --writes-per-range 5000 --churn-ratio 0.02
//!
//! # Tight budget, with per-operation logging.
//! RUST_LOG=kvflow_control=debug kvflow-workload --regular-tokens 1048576 --elastic-tokens 524288
//! ```
//!
//! Bucket sizes default to `KVFLOW_REGULAR_TOKENS` / `KVFLOW_ELASTIC_TOKENS`
//! when set, and to the built-in defaults otherwise.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kvflow_control::{FlowConfig, FlowController};
use kvflow_workload::{SizeDistribution, Workload};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Replication flow-control workload driver.
#[derive(Parser, Debug)]
#[command(name = "kvflow-workload")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Random seed.
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Number of ranges written concurrently.
    #[arg(long, default_value = "16")]
    ranges: u64,

    /// Writes issued per range.
    #[arg(long, default_value = "1000")]
    writes_per_range: u64,

    /// Replicas per range.
    #[arg(long, default_value = "3")]
    replicas: usize,

    /// Number of stores replicas are drawn from.
    #[arg(long, default_value = "5")]
    store_pool: u64,

    /// Minimum write size in bytes.
    #[arg(long, default_value = "1024")]
    min_write_bytes: u64,

    /// Maximum write size in bytes.
    #[arg(long, default_value = "65536")]
    max_write_bytes: u64,

    /// Share of writes in the elastic class.
    #[arg(long, default_value = "0.2")]
    elastic_ratio: f64,

    /// Probability of replacing a replica before each write.
    #[arg(long, default_value = "0.01")]
    churn_ratio: f64,

    /// Maximum follower delay before admitting a write, in microseconds.
    #[arg(long, default_value = "500")]
    admit_delay_us: u64,

    /// Regular bucket capacity in bytes.
    #[arg(long)]
    regular_tokens: Option<u64>,

    /// Elastic bucket capacity in bytes.
    #[arg(long)]
    elastic_tokens: Option<u64>,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    log_filter: String,

    /// Print the final metrics snapshot as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_filter))?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = FlowConfig::from_env();
    if let Some(tokens) = args.regular_tokens {
        config.regular_tokens = tokens;
    }
    if let Some(tokens) = args.elastic_tokens {
        config.elastic_tokens = tokens;
    }
    // No write is larger than the workload's own maximum, and no range has
    // more streams than its replica count. Both bound what a bucket must hold.
    let largest_write = args.max_write_bytes.max(args.min_write_bytes);
    config.limits.max_entry_bytes = config.limits.max_entry_bytes.min(largest_write);
    let replicas = u32::try_from(args.replicas.max(1)).unwrap_or(u32::MAX);
    config.limits.max_streams_per_range = config.limits.max_streams_per_range.min(replicas);
    let controller = Arc::new(FlowController::new(config)?);

    let write_size = if args.min_write_bytes == args.max_write_bytes {
        SizeDistribution::Fixed(args.min_write_bytes)
    } else {
        SizeDistribution::Uniform {
            min: args.min_write_bytes.min(args.max_write_bytes),
            max: args.max_write_bytes.max(args.min_write_bytes),
        }
    };

    let workload = Workload::builder()
        .seed(args.seed)
        .ranges(args.ranges)
        .writes_per_range(args.writes_per_range)
        .replicas(args.replicas, args.store_pool)
        .write_size(write_size)
        .elastic_ratio(args.elastic_ratio)
        .churn_ratio(args.churn_ratio)
        .admit_delay_max(Duration::from_micros(args.admit_delay_us))
        .build();

    info!(?args, "Running workload");
    let stats = workload.run(&controller).await;
    stats.print_summary();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats.metrics)?);
    }

    if !stats.violations.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
