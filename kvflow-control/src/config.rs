//! Flow controller configuration.

use kvflow_core::{Limits, PerClass, WorkClass};

use crate::error::{FlowError, FlowResult};

/// Default capacity of the node-wide regular bucket (256MB).
pub const DEFAULT_REGULAR_TOKENS: u64 = 256 * 1024 * 1024;

/// Default capacity of the node-wide elastic bucket (128MB).
pub const DEFAULT_ELASTIC_TOKENS: u64 = 128 * 1024 * 1024;

/// Environment override for the regular bucket capacity, in bytes.
pub const REGULAR_TOKENS_ENV: &str = "KVFLOW_REGULAR_TOKENS";

/// Environment override for the elastic bucket capacity, in bytes.
pub const ELASTIC_TOKENS_ENV: &str = "KVFLOW_ELASTIC_TOKENS";

/// Configuration for the flow controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowConfig {
    /// Capacity of the node-wide regular bucket.
    pub regular_tokens: u64,

    /// Capacity of the node-wide elastic bucket.
    pub elastic_tokens: u64,

    /// Bookkeeping limits.
    pub limits: Limits,

    /// Whether retired streams are forgotten once their ledger is empty.
    pub gc_retired_streams: bool,
}

impl FlowConfig {
    /// Creates a configuration with explicit bucket capacities.
    #[must_use]
    pub const fn new(regular_tokens: u64, elastic_tokens: u64) -> Self {
        Self {
            regular_tokens,
            elastic_tokens,
            limits: Limits::new(),
            gc_retired_streams: true,
        }
    }

    /// Creates a configuration for testing: 16MB regular, 8MB elastic.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            regular_tokens: 16 * 1024 * 1024,
            elastic_tokens: 8 * 1024 * 1024,
            limits: Limits::for_testing(),
            gc_retired_streams: true,
        }
    }

    /// Starts from the defaults and applies environment overrides.
    ///
    /// Unset or unparseable variables leave the default in place.
    #[must_use]
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().and_then(|v| v.parse().ok());

        let mut config = Self::default();
        if let Some(tokens) = read(REGULAR_TOKENS_ENV) {
            config.regular_tokens = tokens;
        }
        if let Some(tokens) = read(ELASTIC_TOKENS_ENV) {
            config.elastic_tokens = tokens;
        }
        config
    }

    /// Sets the bookkeeping limits.
    #[must_use]
    pub const fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Enables or disables garbage collection of settled retired streams.
    #[must_use]
    pub const fn with_gc_retired_streams(mut self, enabled: bool) -> Self {
        self.gc_retired_streams = enabled;
        self
    }

    /// Returns the configured capacity for a class.
    #[must_use]
    pub const fn capacity(&self, class: WorkClass) -> u64 {
        match class {
            WorkClass::Regular => self.regular_tokens,
            WorkClass::Elastic => self.elastic_tokens,
        }
    }

    /// Returns both capacities.
    #[must_use]
    pub const fn capacities(&self) -> PerClass<u64> {
        PerClass::new(self.regular_tokens, self.elastic_tokens)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidConfig` if a capacity is zero, the limits are
    /// inconsistent, or a maximal write replicated to the largest allowed
    /// active set could never fit a bucket.
    pub fn validate(&self) -> FlowResult<()> {
        self.limits.validate()?;

        for class in WorkClass::ALL {
            let capacity = self.capacity(class);
            if capacity == 0 {
                return Err(FlowError::InvalidConfig {
                    message: format!("{class} token capacity must be positive"),
                });
            }
            // A maximal write to a full range deducts this much at once.
            let largest = self
                .limits
                .max_entry_bytes
                .saturating_mul(u64::from(self.limits.max_streams_per_range));
            if largest > capacity {
                return Err(FlowError::InvalidConfig {
                    message: format!(
                        "max_entry_bytes {} x max_streams_per_range {} = {largest} \
                         exceeds {class} token capacity {capacity}",
                        self.limits.max_entry_bytes, self.limits.max_streams_per_range
                    ),
                });
            }
        }

        Ok(())
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self::new(DEFAULT_REGULAR_TOKENS, DEFAULT_ELASTIC_TOKENS)
    }
}
