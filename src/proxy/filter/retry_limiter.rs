use crate::config::RetryLimiterConfig;
use crate::proxy::context::RequestContext;
use crate::queue::QueueRegistry;
use http::header::HeaderName;
use http::HeaderValue;
use std::sync::Arc;
use tracing::debug;

pub const RETRY_HEADER: HeaderName = HeaderName::from_static("retried_times");

/// Bounds how often a request may loop through retry flows. Requests that
/// exhaust the budget are dead-lettered with the counter header stripped, so
/// a later replay starts from zero.
pub struct RetryLimiterFilter {
    config: RetryLimiterConfig,
    queues: Arc<QueueRegistry>,
}

impl RetryLimiterFilter {
    pub fn new(config: RetryLimiterConfig, queues: Arc<QueueRegistry>) -> Self {
        Self { config, queues }
    }

    pub async fn filter(&self, ctx: &mut RequestContext) {
        let times: i64 = ctx
            .request
            .headers
            .get(&RETRY_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        if times >= self.config.max_retry_times {
            debug!(
                "retry_limiter: hit max retry times, max={}",
                self.config.max_retry_times
            );
            ctx.request.headers.remove(&RETRY_HEADER);
            if !self.config.queue_name.is_empty() {
                let record = ctx.request.encode();
                self.queues.push(&self.config.queue_name, record).await;
            }
            ctx.finish();
            return;
        }

        let next = (times + 1).to_string();
        if let Ok(v) = HeaderValue::from_str(&next) {
            ctx.request.headers.insert(&RETRY_HEADER, v);
        }
    }
}
