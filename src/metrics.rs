//! Prometheus metrics for the directory index
//!
//! All metrics live in one process-wide registry. Several indexes opened in
//! the same process share the counters.

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    /// Foreground operations by kind and outcome
    pub static ref OPERATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("dirindex_operations_total", "Directory index operations"),
        &["op", "outcome"]
    ).unwrap();

    pub static ref OPERATION_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("dirindex_operation_duration_seconds", "Directory index operation latency")
            .buckets(vec![0.000_001, 0.000_005, 0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.01]),
        &["op"]
    ).unwrap();

    // Chain structure
    pub static ref NODE_SPLITS: IntCounter = IntCounter::new(
        "dirindex_node_splits_total",
        "Link nodes split because a record did not fit"
    ).unwrap();

    pub static ref NODE_MERGES: IntCounter = IntCounter::new(
        "dirindex_node_merges_total",
        "Underfull link nodes merged into a sibling"
    ).unwrap();

    // Table maintenance
    pub static ref PROMOTIONS: IntCounter = IntCounter::new(
        "dirindex_promotions_total",
        "First-level buckets promoted to second-level tables"
    ).unwrap();

    pub static ref RESIZES: IntCounter = IntCounter::new(
        "dirindex_resizes_total",
        "Completed bucket array resizes"
    ).unwrap();

    pub static ref BACKGROUND_FAILURES: IntCounter = IntCounter::new(
        "dirindex_background_failures_total",
        "Background promotion or resize tasks abandoned after an error"
    ).unwrap();

    // Allocator
    pub static ref ALLOCATED_SLABS: IntGauge = IntGauge::new(
        "dirindex_allocated_slabs",
        "Slabs currently marked used in the persistent region"
    ).unwrap();
}

/// Register all metrics with the global registry
///
/// Safe to call more than once; duplicate registrations are ignored.
pub fn init_metrics() {
    METRICS_REGISTRY.register(Box::new(OPERATIONS_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(OPERATION_DURATION.clone())).ok();
    METRICS_REGISTRY.register(Box::new(NODE_SPLITS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(NODE_MERGES.clone())).ok();
    METRICS_REGISTRY.register(Box::new(PROMOTIONS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(RESIZES.clone())).ok();
    METRICS_REGISTRY.register(Box::new(BACKGROUND_FAILURES.clone())).ok();
    METRICS_REGISTRY.register(Box::new(ALLOCATED_SLABS.clone())).ok();

    info!("Directory index metrics initialized");
}

/// Count one foreground operation
pub fn record_operation(op: &str, outcome: &str, seconds: f64) {
    OPERATIONS_TOTAL.with_label_values(&[op, outcome]).inc();
    OPERATION_DURATION.with_label_values(&[op]).observe(seconds);
}

/// Export all metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics\n"))
}
