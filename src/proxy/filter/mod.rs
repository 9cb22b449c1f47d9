pub mod bulk_response;
pub mod cache;
pub mod elasticsearch;
pub mod hash_mod;
pub mod header_format;
pub mod logging;
pub mod rate_limit;
pub mod retry_limiter;

use crate::bufpool::BufferPools;
use crate::config::{FilterConfig, FlowConfig};
use crate::error::GatewayError;
use crate::limiter::LimiterRegistry;
use crate::proxy::context::RequestContext;
use crate::queue::QueueRegistry;
use crate::upstream::ReverseProxy;
use cache::ResponseCache;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Process-wide services the filters share. Built once at bootstrap and
/// handed to every flow.
pub struct SharedServices {
    pub queues: Arc<QueueRegistry>,
    pub buffers: Arc<BufferPools>,
    pub limiters: Arc<LimiterRegistry>,
    pub cache: Arc<ResponseCache>,
    pub proxies: HashMap<String, Arc<ReverseProxy>>,
}

impl SharedServices {
    pub fn new(proxies: HashMap<String, Arc<ReverseProxy>>, limiters: Arc<LimiterRegistry>) -> Self {
        Self {
            queues: Arc::new(QueueRegistry::new()),
            buffers: Arc::new(BufferPools::new()),
            limiters,
            cache: Arc::new(ResponseCache::new()),
            proxies,
        }
    }
}

/// Enum-based filter — static dispatch, exhaustive match. Each variant holds
/// the config/state it needs; filters are pre-built once when the flow is
/// compiled, not per request.
pub enum Filter {
    Elasticsearch(elasticsearch::ElasticsearchFilter),
    BulkResponseProcess(bulk_response::BulkResponseFilter),
    HashMod(hash_mod::HashModFilter),
    RetryLimiter(retry_limiter::RetryLimiterFilter),
    RateLimit(rate_limit::RateLimitFilter),
    RequestCacheGet(cache::CacheGetFilter),
    RequestCacheSet(cache::CacheSetFilter),
    RequestLogging(logging::LoggingFilter),
    ResponseHeaderFormat(header_format::HeaderFormatFilter),
}

impl Filter {
    pub fn name(&self) -> &'static str {
        match self {
            Filter::Elasticsearch(_) => "elasticsearch",
            Filter::BulkResponseProcess(_) => "bulk_response_process",
            Filter::HashMod(_) => "hash_mod",
            Filter::RetryLimiter(_) => "retry_limiter",
            Filter::RateLimit(_) => "rate_limit",
            Filter::RequestCacheGet(_) => "request_cache_get",
            Filter::RequestCacheSet(_) => "request_cache_set",
            Filter::RequestLogging(_) => "request_logging",
            Filter::ResponseHeaderFormat(_) => "response_header_format",
        }
    }

    pub async fn filter(&self, ctx: &mut RequestContext) {
        match self {
            Filter::Elasticsearch(f) => f.filter(ctx).await,
            Filter::BulkResponseProcess(f) => f.filter(ctx).await,
            Filter::HashMod(f) => f.filter(ctx),
            Filter::RetryLimiter(f) => f.filter(ctx).await,
            Filter::RateLimit(f) => f.filter(ctx),
            Filter::RequestCacheGet(f) => f.filter(ctx),
            Filter::RequestCacheSet(f) => f.filter(ctx),
            Filter::RequestLogging(f) => f.filter(ctx),
            Filter::ResponseHeaderFormat(f) => f.filter(ctx),
        }
    }
}

/// A named, ordered filter chain.
///
/// `run` visits filters in order, recording each in the flow trace, and
/// stops as soon as a filter marks the context finished. The boxed future
/// breaks the async recursion cycle: the bulk splitter invokes a sub-flow
/// which again runs filters.
pub struct FilterFlow {
    pub id: String,
    filters: Vec<Filter>,
}

impl FilterFlow {
    pub fn new(id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            id: id.into(),
            filters,
        }
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn run<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            for filter in &self.filters {
                ctx.record_flow(filter.name());
                filter.filter(ctx).await;
                if ctx.is_finished() {
                    break;
                }
            }
        })
    }
}

/// Compile one flow from config. `built_flows` holds the flows declared
/// earlier in the config; a bulk splitter's retry flow must be among them.
pub fn build_flow(
    cfg: &FlowConfig,
    shared: &SharedServices,
    built_flows: &HashMap<String, Arc<FilterFlow>>,
) -> Result<FilterFlow, GatewayError> {
    let mut filters = Vec::with_capacity(cfg.filters.len());
    for filter_cfg in &cfg.filters {
        let filter = match filter_cfg {
            FilterConfig::Elasticsearch(c) => {
                let proxy = shared.proxies.get(&c.elasticsearch).ok_or_else(|| {
                    GatewayError::Config(format!(
                        "flow [{}] references unknown cluster [{}]",
                        cfg.name, c.elasticsearch
                    ))
                })?;
                Filter::Elasticsearch(elasticsearch::ElasticsearchFilter::new(proxy.clone()))
            }
            FilterConfig::BulkResponseProcess(c) => {
                let retry_flow = if c.partial_failure_retry && !c.retry_flow.is_empty() {
                    Some(built_flows.get(&c.retry_flow).cloned().ok_or_else(|| {
                        GatewayError::Config(format!(
                            "flow [{}] references retry flow [{}] which is not defined earlier",
                            cfg.name, c.retry_flow
                        ))
                    })?)
                } else {
                    None
                };
                Filter::BulkResponseProcess(bulk_response::BulkResponseFilter::new(
                    c.clone(),
                    shared.queues.clone(),
                    shared.buffers.clone(),
                    shared.limiters.clone(),
                    retry_flow,
                ))
            }
            FilterConfig::HashMod(c) => {
                Filter::HashMod(hash_mod::HashModFilter::new(c.clone())?)
            }
            FilterConfig::RetryLimiter(c) => Filter::RetryLimiter(
                retry_limiter::RetryLimiterFilter::new(c.clone(), shared.queues.clone()),
            ),
            FilterConfig::RateLimit(c) => Filter::RateLimit(rate_limit::RateLimitFilter::new(
                c.clone(),
                shared.limiters.clone(),
            )),
            FilterConfig::RequestCacheGet(c) => Filter::RequestCacheGet(
                cache::CacheGetFilter::new(c.clone(), shared.cache.clone()),
            ),
            FilterConfig::RequestCacheSet(_) => {
                Filter::RequestCacheSet(cache::CacheSetFilter::new(shared.cache.clone()))
            }
            FilterConfig::RequestLogging => Filter::RequestLogging(logging::LoggingFilter::new()),
            FilterConfig::ResponseHeaderFormat => {
                Filter::ResponseHeaderFormat(header_format::HeaderFormatFilter::new())
            }
        };
        filters.push(filter);
    }
    Ok(FilterFlow::new(cfg.name.clone(), filters))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::context::{StoredRequest, Value};
    use bytes::Bytes;
    use http::{HeaderMap, Method};

    fn ctx() -> RequestContext {
        RequestContext::new(StoredRequest {
            method: Method::GET,
            uri: "/".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        })
    }

    fn shared() -> SharedServices {
        SharedServices::new(HashMap::new(), Arc::new(LimiterRegistry::new()))
    }

    #[tokio::test]
    async fn test_flow_runs_filters_in_order_and_records_trace() {
        let flow = FilterFlow::new(
            "t",
            vec![
                Filter::RequestLogging(logging::LoggingFilter::new()),
                Filter::ResponseHeaderFormat(header_format::HeaderFormatFilter::new()),
            ],
        );
        let mut ctx = ctx();
        flow.run(&mut ctx).await;
        assert_eq!(
            ctx.flow_trace(),
            &["request_logging".to_string(), "response_header_format".into()]
        );
    }

    #[tokio::test]
    async fn test_finished_short_circuits_later_filters() {
        // a 1-qps limiter admits the first request and rejects the second
        let services = shared();
        let limit = rate_limit::RateLimitFilter::new(
            crate::config::RateLimitConfig {
                max_qps: 1,
                key: "global".to_string(),
            },
            services.limiters.clone(),
        );
        let flow = FilterFlow::new(
            "t",
            vec![
                Filter::RateLimit(limit),
                Filter::RequestLogging(logging::LoggingFilter::new()),
            ],
        );

        let mut first = ctx();
        flow.run(&mut first).await;
        assert!(!first.is_finished());
        assert_eq!(first.flow_trace().len(), 2);

        // second request within the same second trips the limiter
        let mut second = ctx();
        flow.run(&mut second).await;
        assert!(second.is_finished());
        assert_eq!(second.flow_trace(), &["rate_limit".to_string()]);
    }

    #[tokio::test]
    async fn test_build_flow_resolves_filters() {
        let services = shared();
        let cfg: FlowConfig = serde_json::from_str(
            r#"{"name": "f", "filters": [
                {"filter": "request_logging"},
                {"filter": "hash_mod", "source": "$[[k]]", "mod": 4}
            ]}"#,
        )
        .unwrap();
        let flow = build_flow(&cfg, &services, &HashMap::new()).unwrap();
        assert_eq!(flow.filters().len(), 2);
        assert_eq!(flow.filters()[1].name(), "hash_mod");

        let mut ctx = ctx();
        ctx.set_value("k", Value::String("fixed".to_string()));
        flow.run(&mut ctx).await;
        assert!(ctx.get_value("partition_id").is_some());
    }

    #[test]
    fn test_build_flow_unknown_cluster_is_config_error() {
        let services = shared();
        let cfg: FlowConfig = serde_json::from_str(
            r#"{"name": "f", "filters": [
                {"filter": "elasticsearch", "elasticsearch": "missing"}
            ]}"#,
        )
        .unwrap();
        assert!(build_flow(&cfg, &services, &HashMap::new()).is_err());
    }
}
