//! Prometheus counters for fan-out and bulk-load activity
//!
//! Features:
//! - Fan-outs by mode (brief, blocking)
//! - Populate batches dispatched and keys written
//! - Command resolution failures during population

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    pub static ref FANOUTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("shardkv_fanouts_total", "Cross-shard fan-outs executed"),
        &["mode"]
    ).unwrap();

    pub static ref POPULATE_BATCHES_TOTAL: IntCounter = IntCounter::new(
        "shardkv_populate_batches_total",
        "Populate batches dispatched to shards"
    ).unwrap();

    pub static ref POPULATE_KEYS_TOTAL: IntCounter = IntCounter::new(
        "shardkv_populate_keys_total",
        "Keys written by populate"
    ).unwrap();

    pub static ref RESOLUTION_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "shardkv_command_resolution_failures_total",
        "Populate batches abandoned because their command could not be resolved"
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    info!("Initializing Prometheus metrics");

    METRICS_REGISTRY.register(Box::new(FANOUTS_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(POPULATE_BATCHES_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(POPULATE_KEYS_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(RESOLUTION_FAILURES_TOTAL.clone())).ok();
}

/// Render all registered metrics in text exposition format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
