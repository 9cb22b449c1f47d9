use crate::proxy::context::RequestContext;
use tracing::info;

/// Response-side access log: one structured line per request.
pub struct LoggingFilter;

impl LoggingFilter {
    pub fn new() -> Self {
        Self
    }

    pub fn filter(&self, ctx: &mut RequestContext) {
        let status = ctx.response.status.as_u16();
        let mut buf = itoa::Buffer::new();
        metrics::counter!(
            "gateway_http_requests_total",
            "status_code" => buf.format(status).to_owned(),
            "upstream" => ctx.destination.clone(),
        )
        .increment(1);
        metrics::histogram!("gateway_http_request_duration_seconds")
            .record(ctx.start.elapsed().as_secs_f64());

        info!(
            method = %ctx.request.method,
            path = %ctx.request.path(),
            status = status,
            upstream = %ctx.destination,
            tags = ?ctx.tags(),
            latency_ms = %ctx.start.elapsed().as_millis(),
            "access"
        );
    }
}

impl Default for LoggingFilter {
    fn default() -> Self {
        Self::new()
    }
}
