//! Metric name constants.
//!
//! The driver records through the `metrics` facade only; the embedding
//! process owns the recorder/exporter.

/// Total remote API calls (counter). Labels: op, outcome.
pub const REMOTE_CALLS_TOTAL: &str = "nimbus_driver_remote_calls_total";

/// Transient list failures that triggered a page retry (counter).
pub const LIST_RETRIES_TOTAL: &str = "nimbus_driver_list_retries_total";

/// CDN refresh attempts that failed at the worker (counter).
pub const INVALIDATION_FAILURES_TOTAL: &str = "nimbus_driver_invalidation_failures_total";

/// Keys enqueued for CDN invalidation (counter).
pub const INVALIDATIONS_ENQUEUED_TOTAL: &str = "nimbus_driver_invalidations_enqueued_total";
