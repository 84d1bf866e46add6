//! Prometheus metrics for the health-sync operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `health_sync_reconcile_duration_seconds` (histogram): handler duration labeled by controller.
//! - `health_sync_reconcile_errors_total` (counter): handler errors labeled by controller and kind.
//! - `health_sync_retries_total` (counter): keys requeued after a failure.
//! - `health_sync_dropped_total` (counter): keys dropped after exhausting their retries.
//! - `health_sync_queue_depth` (gauge): keys ready to be handed to a worker.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "pod-health"
    pub controller: String,
}

/// Labels for reconcile error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error category, e.g. "kube", "consul", "http"
    pub kind: String,
}

/// Histogram tracking handler duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking handler errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking rate-limited requeues
pub static RETRIES_TOTAL: Lazy<Family<ReconcileLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking keys dropped at the retry ceiling
pub static DROPPED_TOTAL: Lazy<Family<ReconcileLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Gauge tracking keys waiting for a worker
pub static QUEUE_DEPTH: Lazy<Family<ReconcileLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "health_sync_reconcile_duration_seconds",
        "Duration of per-key reconciliation in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    // Counters get their `_total` suffix from the encoder
    registry.register(
        "health_sync_reconcile_errors",
        "Total number of failed reconciliation attempts",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "health_sync_retries",
        "Total number of keys requeued with backoff",
        RETRIES_TOTAL.clone(),
    );
    registry.register(
        "health_sync_dropped",
        "Total number of keys dropped after exhausting retries",
        DROPPED_TOTAL.clone(),
    );
    registry.register(
        "health_sync_queue_depth",
        "Number of keys ready to be processed",
        QUEUE_DEPTH.clone(),
    );

    registry
});

fn labels(controller: &str) -> ReconcileLabels {
    ReconcileLabels {
        controller: controller.to_string(),
    }
}

pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels(controller))
        .observe(seconds);
}

pub fn inc_reconcile_error(controller: &str, kind: &str) {
    RECONCILE_ERRORS_TOTAL
        .get_or_create(&ErrorLabels {
            controller: controller.to_string(),
            kind: kind.to_string(),
        })
        .inc();
}

pub fn inc_retry(controller: &str) {
    RETRIES_TOTAL.get_or_create(&labels(controller)).inc();
}

pub fn inc_dropped(controller: &str) {
    DROPPED_TOTAL.get_or_create(&labels(controller)).inc();
}

pub fn set_queue_depth(controller: &str, depth: usize) {
    QUEUE_DEPTH
        .get_or_create(&labels(controller))
        .set(i64::try_from(depth).unwrap_or(i64::MAX));
}

/// Render the registry in the Prometheus text format
pub fn encode_text() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}
