//! Observability hooks for booking reconciliation.
//!
//! Implement [`SyncMetrics`] to forward counters and timings to your
//! monitoring system:
//!
//! ```ignore
//! use booking_sync::observability::SyncMetrics;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl SyncMetrics for PrometheusMetrics {
//!     fn record_conversion(&self, booking_id: &str, duration: Duration) {
//!         // counter!("booking_conversions").inc();
//!         // histogram!("booking_conversion_seconds").record(duration);
//!     }
//! }
//! ```
//!
//! Every method has a default body that logs through the `log` crate, so an
//! implementation only overrides what it forwards. [`NoOpMetrics`] discards
//! everything and is the default.

use std::time::Duration;

/// Trait for booking metrics collection.
pub trait SyncMetrics: Send + Sync {
    /// A booking was converted into an appointment.
    fn record_conversion(&self, booking_id: &str, duration: Duration) {
        debug!("Booking CONVERTED: {} took {:?}", booking_id, duration);
    }

    /// A store write failed mid-workflow.
    fn record_write_error(&self, step: &str, error: &str) {
        warn!("Booking WRITE ERROR at {}: {}", step, error);
    }

    /// A realtime reconnect was scheduled.
    fn record_retry(&self, attempt: u32, delay: Duration) {
        debug!("Realtime RETRY #{} in {:?}", attempt, delay);
    }

    /// A change-feed event was received.
    fn record_change_event(&self, table: &str) {
        trace!("Realtime EVENT on {}", table);
    }

    /// A refetch was merged into the cache.
    fn record_merge(&self, rows: usize, duration: Duration) {
        debug!("Cache MERGE: {} rows took {:?}", rows, duration);
    }
}

/// Default metrics implementation (no-op).
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl SyncMetrics for NoOpMetrics {
    fn record_conversion(&self, _booking_id: &str, _duration: Duration) {}
    fn record_write_error(&self, _step: &str, _error: &str) {}
    fn record_retry(&self, _attempt: u32, _delay: Duration) {}
    fn record_change_event(&self, _table: &str) {}
    fn record_merge(&self, _rows: usize, _duration: Duration) {}
}

/// Metrics implementation that only logs (the trait's default bodies).
#[derive(Clone, Default)]
pub struct LogMetrics;

impl SyncMetrics for LogMetrics {}
