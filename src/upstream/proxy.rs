use crate::config::ClusterConfig;
use crate::error::GatewayError;
use crate::limiter::LimiterRegistry;
use crate::proxy::context::{RequestContext, StoredRequest, StoredResponse};
use crate::upstream::pool::{ClientPool, HttpClient};
use crate::upstream::topology::TopologyProvider;
use bytes::Bytes;
use http::header::HeaderName;
use http::{HeaderValue, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Hop-by-hop headers, removed before the request is sent upstream.
/// Per RFC 7230 these apply to a single transport hop only;
/// `Proxy-Connection` is non-standard but still emitted by old clients.
const HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Error-text fragments that mean the node itself is unhealthy, as opposed
/// to a request-level problem.
const TRANSPORT_FAILURE_MARKERS: [&str; 5] = [
    "connection refused",
    "connection reset",
    "no such host",
    "timed out",
    "Connection: close",
];

const THROTTLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub fn scrub_hop_headers(headers: &mut http::HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

pub fn is_transport_failure(text: &str) -> bool {
    // OS error strings differ in capitalization across platforms
    let text = text.to_ascii_lowercase();
    TRANSPORT_FAILURE_MARKERS
        .iter()
        .any(|m| text.contains(&m.to_ascii_lowercase()))
}

/// Write-aware reverse proxy for one upstream cluster.
///
/// Owns the per-cluster client pool; `delegate` is the terminal step of the
/// filter chain and fills the context's response in place.
pub struct ReverseProxy {
    config: Arc<ClusterConfig>,
    pool: ClientPool,
    limiters: Arc<LimiterRegistry>,
}

impl ReverseProxy {
    pub fn new(
        config: Arc<ClusterConfig>,
        provider: Arc<dyn TopologyProvider>,
        limiters: Arc<LimiterRegistry>,
    ) -> Result<Self, GatewayError> {
        let pool = ClientPool::new(config.clone(), provider)?;
        Ok(Self {
            config,
            pool,
            limiters,
        })
    }

    pub fn cluster_name(&self) -> &str {
        &self.config.name
    }

    pub fn pool(&self) -> &ClientPool {
        &self.pool
    }

    pub fn refresh(&self, force: bool) -> Result<(), GatewayError> {
        self.pool.refresh(force)
    }

    /// Proxy the context's request to a cluster node.
    ///
    /// Transport failures are classified against the marker set and reported
    /// to the cluster health signal; a 429 from upstream is retried up to
    /// `max_retry_times` with `retry_delay_in_ms` backoff, re-entering node
    /// selection so the retry may land elsewhere. Every other status passes
    /// through verbatim.
    pub async fn delegate(&self, ctx: &mut RequestContext) {
        let cluster = self.config.name.as_str();
        let mut retry: u32 = 0;

        let endpoint = loop {
            let Some((client, endpoint)) = self.pool.get_client() else {
                ctx.response
                    .set_error(StatusCode::SERVICE_UNAVAILABLE, "no upstream available");
                return;
            };

            scrub_hop_headers(&mut ctx.request.headers);
            trace!(
                "proxy: sending request, cluster={}, upstream={}, uri={}",
                cluster,
                endpoint,
                ctx.request.uri
            );

            if let Some(tc) = &self.config.traffic_control {
                self.admit(&endpoint, ctx.request.body.len(), tc.max_qps_per_node, tc.max_bytes_per_node)
                    .await;
            }

            match self.send(&client, &endpoint, &ctx.request).await {
                Ok(response) => {
                    if response.status == StatusCode::TOO_MANY_REQUESTS
                        && self.config.max_retry_times > 0
                        && retry < self.config.max_retry_times
                    {
                        retry += 1;
                        debug!(
                            "proxy: upstream throttled, cluster={}, upstream={}, retry={}/{}",
                            cluster, endpoint, retry, self.config.max_retry_times
                        );
                        metrics::counter!(
                            "gateway_upstream_retries_total",
                            "cluster" => cluster.to_string(),
                        )
                        .increment(1);
                        if self.config.retry_delay_in_ms > 0 {
                            tokio::time::sleep(Duration::from_millis(self.config.retry_delay_in_ms))
                                .await;
                        }
                        continue;
                    }
                    ctx.response.status = response.status;
                    for (name, value) in response.headers.iter() {
                        ctx.response.headers.insert(name.clone(), value.clone());
                    }
                    ctx.response.body = response.body;
                    break endpoint;
                }
                Err(err) => {
                    let text = err.to_string();
                    warn!(
                        "proxy: failed to proxy request, cluster={}, upstream={}, error={}, retried={}",
                        cluster, endpoint, text, retry
                    );
                    if is_transport_failure(&text) {
                        self.pool.report_failure();
                    }
                    ctx.response.status = StatusCode::BAD_GATEWAY;
                    ctx.response.body = Bytes::from(text);
                    break endpoint;
                }
            }
        };

        let cluster_header = HeaderName::from_static("cluster");
        let upstream_header = HeaderName::from_static("upstream");
        if let Ok(v) = HeaderValue::from_str(cluster) {
            ctx.response.headers.insert(cluster_header, v);
        }
        if let Ok(v) = HeaderValue::from_str(&endpoint) {
            ctx.response.headers.insert(upstream_header, v);
        }
        ctx.append_string_value("elastic_cluster_name", cluster.to_string());
        ctx.destination = endpoint;
    }

    /// Block until the per-node traffic-control limiters admit the request,
    /// polling every 10 ms.
    async fn admit(&self, endpoint: &str, request_len: usize, max_qps: u64, max_bps: u64) {
        let cluster = self.config.name.as_str();
        loop {
            if max_qps > 0 {
                let key = format!("{}:qps", endpoint);
                if !self.limiters.per_second(cluster, &key, max_qps).allow() {
                    trace!(
                        "proxy: qps throttled, cluster={}, upstream={}",
                        cluster,
                        endpoint
                    );
                    metrics::counter!(
                        "gateway_throttle_wait_total",
                        "cluster" => cluster.to_string(),
                        "kind" => "qps",
                    )
                    .increment(1);
                    tokio::time::sleep(THROTTLE_POLL_INTERVAL).await;
                    continue;
                }
            }
            if max_bps > 0 {
                let key = format!("{}:bps", endpoint);
                if !self
                    .limiters
                    .per_second(cluster, &key, max_bps)
                    .allow_n(request_len)
                {
                    trace!(
                        "proxy: bps throttled, cluster={}, upstream={}",
                        cluster,
                        endpoint
                    );
                    metrics::counter!(
                        "gateway_throttle_wait_total",
                        "cluster" => cluster.to_string(),
                        "kind" => "bps",
                    )
                    .increment(1);
                    tokio::time::sleep(THROTTLE_POLL_INTERVAL).await;
                    continue;
                }
            }
            return;
        }
    }

    async fn send(
        &self,
        client: &HttpClient,
        endpoint: &str,
        request: &StoredRequest,
    ) -> Result<StoredResponse, GatewayError> {
        let scheme = if self.config.tls { "https" } else { "http" };
        let uri = format!("{}://{}{}", scheme, endpoint, request.uri);

        let mut builder = Request::builder().method(request.method.clone()).uri(&uri);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        let upstream_req = builder
            .body(Full::new(request.body.clone()))
            .map_err(|e| GatewayError::Internal(format!("failed to build upstream request: {}", e)))?;

        // The in-flight call covers writing the request and waiting for the
        // response head, so it gets the sum of both timeouts; the body read
        // alone is bounded by read_timeout.
        let pending = client.request(upstream_req);
        let send_budget = self.config.write_timeout + self.config.read_timeout;
        let result = if send_budget > 0.0 {
            match tokio::time::timeout(Duration::from_secs_f64(send_budget), pending).await {
                Ok(r) => r,
                Err(_) => {
                    return Err(GatewayError::UpstreamTransport(format!(
                        "request to {} timed out",
                        endpoint
                    )))
                }
            }
        } else {
            pending.await
        };

        let response = result.map_err(|e| GatewayError::UpstreamTransport(error_chain_text(&e)))?;
        let status = response.status();
        let headers = response.headers().clone();

        let collect = response.into_body().collect();
        let collected = if self.config.read_timeout > 0.0 {
            match tokio::time::timeout(Duration::from_secs_f64(self.config.read_timeout), collect)
                .await
            {
                Ok(c) => c,
                Err(_) => {
                    return Err(GatewayError::UpstreamTransport(format!(
                        "response body from {} timed out",
                        endpoint
                    )))
                }
            }
        } else {
            collect.await
        };
        let body = collected
            .map_err(|e| GatewayError::UpstreamTransport(error_chain_text(&e)))?
            .to_bytes();

        if self.config.max_response_size > 0 && body.len() > self.config.max_response_size {
            return Err(GatewayError::ResponseTooLarge {
                limit: self.config.max_response_size,
                actual: body.len(),
            });
        }

        Ok(StoredResponse {
            status,
            headers,
            body,
        })
    }
}

/// Flatten an error and its source chain into one searchable string; the
/// markers we classify on (`connection refused`, ...) live in the inner
/// causes, not the top-level display.
fn error_chain_text(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut cursor = err.source();
    while let Some(cause) = cursor {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        cursor = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    #[test]
    fn test_scrub_removes_every_hop_header() {
        let mut headers = HeaderMap::new();
        for name in HOP_HEADERS {
            headers.insert(
                HeaderName::from_static(name),
                HeaderValue::from_static("x"),
            );
        }
        headers.insert("x-app", HeaderValue::from_static("keep"));
        scrub_hop_headers(&mut headers);
        for name in HOP_HEADERS {
            assert!(!headers.contains_key(name), "{} survived scrub", name);
        }
        assert!(headers.contains_key("x-app"));
    }

    #[test]
    fn test_transport_failure_classification() {
        assert!(is_transport_failure(
            "client error (Connect): tcp connect error: connection refused"
        ));
        assert!(is_transport_failure("request to 10.0.0.1:9200 timed out"));
        assert!(is_transport_failure("peer sent Connection: close"));
        assert!(!is_transport_failure("upstream returned 500"));
    }

    #[test]
    fn test_error_chain_text_includes_sources() {
        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        let outer = GatewayError::Internal(format!("send failed: {}", inner));
        assert!(error_chain_text(&outer).contains("connection refused"));
    }
}
