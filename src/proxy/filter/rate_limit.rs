use crate::config::RateLimitConfig;
use crate::limiter::LimiterRegistry;
use crate::proxy::context::RequestContext;
use bytes::Bytes;
use http::StatusCode;
use std::sync::Arc;
use tracing::debug;

/// Pipeline-level QPS gate. Unlike the proxy engine's traffic control this
/// filter rejects instead of waiting: the client gets a 429 and the chain
/// stops.
pub struct RateLimitFilter {
    config: RateLimitConfig,
    limiters: Arc<LimiterRegistry>,
}

impl RateLimitFilter {
    pub fn new(config: RateLimitConfig, limiters: Arc<LimiterRegistry>) -> Self {
        Self { config, limiters }
    }

    pub fn filter(&self, ctx: &mut RequestContext) {
        let key = match self.config.key.as_str() {
            "global" => "global",
            _ => ctx.request.path(),
        };

        if self
            .limiters
            .per_second("rate_limit", key, self.config.max_qps)
            .allow()
        {
            return;
        }

        debug!("rate_limit: rejected, key={}", key);
        metrics::counter!("gateway_rate_limit_rejected_total").increment(1);
        ctx.response.status = StatusCode::TOO_MANY_REQUESTS;
        ctx.response.body = Bytes::from_static(b"too many requests");
        ctx.finish();
    }
}
