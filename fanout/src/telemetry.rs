//! Tracing and telemetry instrumentation for fanout.
//!
//! Span constructors for map calls, materialization and shutdown, plus
//! `record_*` helpers that log an event and, with the `metrics` feature,
//! update the Prometheus metrics in [`crate::metrics`]. Everything here
//! works with and without the feature.
//!
//! # Example
//!
//! ```ignore
//! use fanout::telemetry::{map_span, MapTimer};
//!
//! let span = map_span("square", 100, 10);
//! let timer = MapTimer::start("worker", "square");
//! // ... submit and collect
//! timer.finish("success");
//! ```

use std::time::{Duration, Instant};

use tracing::{Span, info_span};

/// Pool label for stateless worker maps.
pub const WORKER_POOL: &str = "worker";
/// Pool label for actor pool maps.
pub const ACTOR_POOL: &str = "actor";

/// Create a tracing span for a worker pool map call.
///
/// # Arguments
/// * `name` - Task name
/// * `items` - Number of input items
/// * `chunks` - Number of submitted tasks
#[must_use]
pub fn map_span(name: impl AsRef<str>, items: usize, chunks: usize) -> Span {
    info_span!(
        "fanout.map",
        task = %name.as_ref(),
        items = items,
        chunks = chunks,
    )
}

/// Create a tracing span for an actor pool map call.
#[must_use]
pub fn actor_map_span(name: impl AsRef<str>, items: usize, pool_size: usize) -> Span {
    info_span!(
        "fanout.actor_map",
        actor = %name.as_ref(),
        items = items,
        pool_size = pool_size,
    )
}

/// Create a tracing span for draining results before shutdown.
#[must_use]
pub fn materialize_span(session: impl AsRef<str>) -> Span {
    info_span!("fanout.materialize", session = %session.as_ref())
}

/// Create a tracing span for session shutdown.
#[must_use]
pub fn shutdown_span(session: impl AsRef<str>) -> Span {
    info_span!("fanout.shutdown", session = %session.as_ref())
}

/// Record submitted tasks or actor calls.
pub fn record_tasks_submitted(pool: &str, count: usize) {
    tracing::debug!(pool, count, "tasks submitted");

    #[cfg(feature = "metrics")]
    crate::metrics::record_tasks_submitted(pool, count as u64);
}

/// Record a failed item. Logged at error level with the item index.
pub fn record_task_failed(pool: &str, task: &str, item: Option<usize>, error: &dyn std::fmt::Display) {
    tracing::error!(pool, task, item = ?item, error = %error, "error while processing item");

    #[cfg(feature = "metrics")]
    crate::metrics::record_task_failed(pool);
}

/// Log collection progress of a map call.
pub fn record_progress(pool: &str, done: usize, total: usize) {
    tracing::debug!(pool, done, total, "map progress");
}

/// Record objects copied out of shared memory.
pub fn record_materialized(count: usize) {
    tracing::trace!(count, "objects materialized");

    #[cfg(feature = "metrics")]
    crate::metrics::record_materialized(count as u64);
}

/// Record an actor spawn.
pub fn record_actor_spawned(name: &str) {
    tracing::debug!(actor = name, "actor spawned");

    #[cfg(feature = "metrics")]
    crate::metrics::record_actor_spawned();
}

/// Observe the duration of a map call.
pub fn observe_map_duration(pool: &str, name: &str, status: &str, duration_secs: f64) {
    tracing::info!(pool, task = name, status, duration_secs, "map finished");

    #[cfg(feature = "metrics")]
    crate::metrics::observe_map_duration(pool, status, duration_secs);
}

/// Measures how long a map call takes.
#[derive(Debug)]
pub struct MapTimer {
    pool: &'static str,
    name: String,
    start: Instant,
}

impl MapTimer {
    /// Start timing a map call.
    pub fn start(pool: &'static str, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
            start: Instant::now(),
        }
    }

    /// Elapsed time since the call started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and record the duration under `status`.
    pub fn finish(self, status: &str) {
        observe_map_duration(self.pool, &self.name, status, self.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        assert_eq!(map_span("square", 4, 2).metadata().unwrap().name(), "fanout.map");
        assert_eq!(
            actor_map_span("model", 40, 4).metadata().unwrap().name(),
            "fanout.actor_map"
        );
        assert_eq!(
            materialize_span("s-1").metadata().unwrap().name(),
            "fanout.materialize"
        );
        assert_eq!(shutdown_span("s-1").metadata().unwrap().name(), "fanout.shutdown");
    }

    #[test]
    fn test_map_timer() {
        let timer = MapTimer::start(WORKER_POOL, "square");
        std::thread::sleep(Duration::from_millis(1));
        assert!(timer.elapsed().as_nanos() > 0);
        timer.finish("success");
    }

    #[test]
    fn test_record_helpers() {
        record_tasks_submitted(WORKER_POOL, 3);
        record_task_failed(ACTOR_POOL, "predict", Some(7), &"boom");
        record_progress(WORKER_POOL, 1, 3);
        record_materialized(2);
        record_actor_spawned("model");
    }
}
