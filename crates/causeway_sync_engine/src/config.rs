//! Configuration for the sync engine.

use crate::queue::Priority;
use causeway_sync_protocol::{EntityType, ReplicaId};
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

/// Default limit on one encoded operation, well inside a journal frame.
pub const DEFAULT_MAX_OPERATION_SIZE: usize = 8 * 1024 * 1024;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// This replica's id. Only this slot is ever incremented locally.
    pub replica_id: ReplicaId,
    /// Maximum operations per push or pull round trip.
    pub batch_size: usize,
    /// Maximum concurrent push round trips.
    ///
    /// Each round trip carries one priority-ordered chunk of `batch_size`
    /// items. Concurrent chunks may reach the authority in any order, so
    /// priority order across chunks only holds with `strict_priority`.
    pub max_in_flight: usize,
    /// Send push chunks one at a time, highest priority first.
    pub strict_priority: bool,
    /// Largest encoded operation accepted for queueing or push. Larger
    /// operations are quarantined.
    pub max_operation_size: usize,
    /// Maximum entities applied concurrently.
    pub apply_parallelism: usize,
    /// Timeout for every round trip.
    pub round_trip_timeout: Duration,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// How long completed queue items are kept before pruning.
    pub completed_retention: Duration,
    /// Interval between cycles in the background loop.
    pub sync_interval: Duration,
    /// Interval between reachability probes while offline.
    pub offline_probe_interval: Duration,
    /// Queue priority by entity type.
    pub priorities: HashMap<EntityType, Priority>,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(replica_id: impl Into<ReplicaId>) -> Self {
        Self {
            replica_id: replica_id.into(),
            batch_size: 100,
            max_in_flight: 2,
            strict_priority: false,
            max_operation_size: DEFAULT_MAX_OPERATION_SIZE,
            apply_parallelism: 8,
            round_trip_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            completed_retention: Duration::from_secs(24 * 60 * 60),
            sync_interval: Duration::from_secs(30),
            offline_probe_interval: Duration::from_secs(60),
            priorities: HashMap::new(),
        }
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the maximum concurrent push round trips.
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    /// Sends push chunks strictly in priority order.
    pub fn with_strict_priority(mut self, strict: bool) -> Self {
        self.strict_priority = strict;
        self
    }

    /// Sets the largest accepted encoded operation.
    pub fn with_max_operation_size(mut self, size: usize) -> Self {
        self.max_operation_size = size;
        self
    }

    /// Number of push round trips allowed at once.
    pub fn push_window(&self) -> usize {
        if self.strict_priority {
            1
        } else {
            self.max_in_flight
        }
    }

    /// Sets the apply fan-out.
    pub fn with_apply_parallelism(mut self, parallelism: usize) -> Self {
        self.apply_parallelism = parallelism.max(1);
        self
    }

    /// Sets the round-trip timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.round_trip_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the completed item retention window.
    pub fn with_completed_retention(mut self, retention: Duration) -> Self {
        self.completed_retention = retention;
        self
    }

    /// Sets the sync interval for the background loop.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the offline probe interval.
    pub fn with_offline_probe_interval(mut self, interval: Duration) -> Self {
        self.offline_probe_interval = interval;
        self
    }

    /// Sets the queue priority for an entity type.
    pub fn with_priority(mut self, entity_type: impl Into<EntityType>, priority: Priority) -> Self {
        self.priorities.insert(entity_type.into(), priority);
        self
    }

    /// Returns the queue priority for an entity type.
    pub fn priority_for(&self, entity_type: &EntityType) -> Priority {
        self.priorities
            .get(entity_type)
            .copied()
            .unwrap_or(Priority::Normal)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("local")
    }
}

/// Configuration for per-item retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Failed attempts after which an item becomes `Failed`.
    pub max_retries: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no backoff delay.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Calculates the delay before attempt `retry_count` (0 = first try).
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }

        let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        let delay_secs = if base_delay.is_finite() {
            base_delay.min(max_secs)
        } else {
            max_secs
        };

        if self.add_jitter && delay_secs > 0.0 {
            // Up to 25% jitter, never past the cap.
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64((delay_secs + jitter).min(max_secs))
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}
