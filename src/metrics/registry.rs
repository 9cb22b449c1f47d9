use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering scrapes.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called once at startup, before any macro use.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "gateway_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "gateway_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_counter!(
            "gateway_upstream_retries_total",
            Unit::Count,
            "Upstream requests retried after a 429"
        );
        describe_counter!(
            "gateway_upstream_failures_total",
            Unit::Count,
            "Transport-level upstream failures reported to the cluster health signal"
        );
        describe_counter!(
            "gateway_throttle_wait_total",
            Unit::Count,
            "Traffic-control admission waits, by cluster and kind (qps/bps)"
        );
        describe_counter!(
            "gateway_topology_refresh_total",
            Unit::Count,
            "Client pool rebuilds from cluster metadata"
        );
        describe_counter!(
            "gateway_bulk_items_total",
            Unit::Count,
            "Bulk response items, by item status"
        );
        describe_counter!(
            "gateway_bulk_requests_failed_total",
            Unit::Count,
            "Bulk requests with at least one failed item"
        );
        describe_counter!(
            "gateway_bulk_partition_bytes_total",
            Unit::Bytes,
            "Bytes routed into bulk partition buffers, by class"
        );
        describe_counter!(
            "gateway_queue_pushes_total",
            Unit::Count,
            "Records pushed to named queues"
        );
        describe_counter!(
            "gateway_queue_backpressure_total",
            Unit::Count,
            "Push attempts that had to wait on a full bounded queue"
        );
        describe_counter!(
            "gateway_rate_limit_rejected_total",
            Unit::Count,
            "Requests rejected by the pipeline rate limiter"
        );
        describe_counter!("gateway_cache_hits_total", Unit::Count, "Response cache hits");
        describe_counter!(
            "gateway_cache_misses_total",
            Unit::Count,
            "Response cache misses"
        );

        Self { handle }
    }

    /// Render the current metric snapshot in Prometheus exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
