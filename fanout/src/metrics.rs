//! Prometheus metrics instrumentation for fanout.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `fanout_tasks_submitted_total` - Tasks and actor calls submitted
//! - `fanout_tasks_failed_total` - Items whose task or call failed
//! - `fanout_objects_materialized_total` - Objects copied out of shared memory
//! - `fanout_actors_spawned_total` - Actors started
//!
//! ## Histograms
//! - `fanout_map_duration_seconds` - Map call duration in seconds
#![cfg(feature = "metrics")]

use prometheus::{
    Counter, CounterVec, HistogramVec, Opts, Registry, exponential_buckets,
};
use std::sync::LazyLock;

/// Global Prometheus registry for fanout metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for submitted tasks.
///
/// Labels:
/// - `pool`: `worker` or `actor`
pub static TASKS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "fanout_tasks_submitted_total",
        "Total number of tasks and actor calls submitted",
    );
    CounterVec::new(opts, &["pool"]).expect("fanout_tasks_submitted_total metric creation failed")
});

/// Counter for failed items.
///
/// Labels:
/// - `pool`: `worker` or `actor`
pub static TASKS_FAILED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "fanout_tasks_failed_total",
        "Total number of items whose task failed",
    );
    CounterVec::new(opts, &["pool"]).expect("fanout_tasks_failed_total metric creation failed")
});

/// Counter for objects copied into process memory.
pub static OBJECTS_MATERIALIZED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "fanout_objects_materialized_total",
        "Total number of objects copied out of shared memory",
    )
    .expect("fanout_objects_materialized_total metric creation failed")
});

/// Counter for spawned actors.
pub static ACTORS_SPAWNED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new("fanout_actors_spawned_total", "Total number of actors spawned")
        .expect("fanout_actors_spawned_total metric creation failed")
});

/// Histogram for map call duration in seconds.
///
/// Labels:
/// - `pool`: `worker` or `actor`
/// - `status`: `success` or `failure`
pub static MAP_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "fanout_map_duration_seconds",
        "Map call duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["pool", "status"])
        .expect("fanout_map_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry.
///
/// Idempotent.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(TASKS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(TASKS_FAILED_TOTAL.clone()),
        Box::new(OBJECTS_MATERIALIZED_TOTAL.clone()),
        Box::new(ACTORS_SPAWNED_TOTAL.clone()),
        Box::new(MAP_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_tasks_submitted(pool: &str, count: u64) {
    TASKS_SUBMITTED_TOTAL
        .with_label_values(&[pool])
        .inc_by(count as f64);
}

pub fn record_task_failed(pool: &str) {
    TASKS_FAILED_TOTAL.with_label_values(&[pool]).inc();
}

pub fn record_materialized(count: u64) {
    OBJECTS_MATERIALIZED_TOTAL.inc_by(count as f64);
}

pub fn record_actor_spawned() {
    ACTORS_SPAWNED_TOTAL.inc();
}

pub fn observe_map_duration(pool: &str, status: &str, duration_secs: f64) {
    MAP_DURATION_SECONDS
        .with_label_values(&[pool, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
