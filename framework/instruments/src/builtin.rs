//! Metrics that the runner records on its own, without the iteration body asking for them.

use crate::metrics::{MetricKind, MetricsError, MetricsRegistry};

pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const GROUP_DURATION: &str = "group_duration";
pub const CHECKS: &str = "checks";
pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const ITERATIONS_FAILED: &str = "iterations_failed";
pub const ITERATIONS_ABORTED: &str = "iterations_aborted";
pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
pub const VUS: &str = "vus";
pub const VUS_MAX: &str = "vus_max";
pub const RETRY_ATTEMPTS: &str = "retry_attempts";

pub const BUILTIN_METRICS: &[(&str, MetricKind)] = &[
    (HTTP_REQS, MetricKind::Counter),
    (HTTP_REQ_DURATION, MetricKind::Trend),
    (HTTP_REQ_FAILED, MetricKind::Rate),
    (GROUP_DURATION, MetricKind::Trend),
    (CHECKS, MetricKind::Rate),
    (ITERATIONS, MetricKind::Counter),
    (ITERATION_DURATION, MetricKind::Trend),
    (ITERATIONS_FAILED, MetricKind::Rate),
    (ITERATIONS_ABORTED, MetricKind::Counter),
    (DROPPED_ITERATIONS, MetricKind::Counter),
    (VUS, MetricKind::Gauge),
    (VUS_MAX, MetricKind::Gauge),
    (RETRY_ATTEMPTS, MetricKind::Trend),
];

/// Register every builtin metric so that thresholds can reference them before any sample exists.
pub fn register_builtin(registry: &MetricsRegistry) -> Result<(), MetricsError> {
    for (name, kind) in BUILTIN_METRICS {
        registry.register(name, *kind)?;
    }
    Ok(())
}
