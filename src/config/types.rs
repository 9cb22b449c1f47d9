use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub clusters: Vec<ClusterConfig>,

    /// Named filter chains. The entry flow handles every accepted request;
    /// the rest are branch targets (e.g. a bulk splitter retry flow).
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub flows: Vec<FlowConfig>,

    #[serde(default = "default_entry_flow")]
    pub entry_flow: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            clusters: Vec::new(),
            flows: Vec::new(),
            entry_flow: default_entry_flow(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_entry_flow() -> String {
    "default".to_string()
}

/// Upstream cluster definition: seed host, node filters, discovery refresh,
/// traffic control, and the per-node HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,

    /// Seed `host:port`, used until discovery yields nodes and as the
    /// fallback when every discovered node is filtered out.
    #[serde(default = "default_seed_host")]
    pub host: String,

    #[serde(default)]
    pub tls: bool,

    /// Default `true` — clusters commonly run self-signed certificates.
    #[serde(default = "default_true")]
    pub tls_insecure_skip_verify: bool,

    /// Balancer weight per endpoint address. Unset or non-positive means 1.
    #[serde(default)]
    pub weights: HashMap<String, u32>,

    #[serde(default)]
    pub filter: NodeFilterConfig,

    #[serde(default)]
    pub refresh: RefreshConfig,

    #[serde(default)]
    pub traffic_control: Option<TrafficControlConfig>,

    /// 429 retry budget for the proxy engine.
    #[serde(default = "default_max_retry_times")]
    pub max_retry_times: u32,

    #[serde(default = "default_retry_delay_in_ms")]
    pub retry_delay_in_ms: u64,

    #[serde(default = "default_max_connection")]
    pub max_connection: usize,

    /// Cap on a buffered upstream response body. 0 disables the check.
    #[serde(default = "default_max_response_size")]
    pub max_response_size: usize,

    #[serde(default = "default_io_buffer_size")]
    pub read_buffer_size: usize,

    #[serde(default = "default_io_buffer_size")]
    pub write_buffer_size: usize,

    /// Seconds; 0 means no limit.
    #[serde(default)]
    pub max_conn_wait_timeout: f64,

    #[serde(default = "default_idle_conn_duration")]
    pub max_idle_conn_duration: f64,

    /// Seconds; 0 means no limit.
    #[serde(default)]
    pub read_timeout: f64,

    /// Seconds; 0 means no limit.
    #[serde(default)]
    pub write_timeout: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: default_seed_host(),
            tls: false,
            tls_insecure_skip_verify: default_true(),
            weights: HashMap::new(),
            filter: NodeFilterConfig::default(),
            refresh: RefreshConfig::default(),
            traffic_control: None,
            max_retry_times: default_max_retry_times(),
            retry_delay_in_ms: default_retry_delay_in_ms(),
            max_connection: default_max_connection(),
            max_response_size: default_max_response_size(),
            read_buffer_size: default_io_buffer_size(),
            write_buffer_size: default_io_buffer_size(),
            max_conn_wait_timeout: 0.0,
            max_idle_conn_duration: default_idle_conn_duration(),
            read_timeout: 0.0,
            write_timeout: 0.0,
        }
    }
}

fn default_seed_host() -> String {
    "127.0.0.1:9200".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_retry_times() -> u32 {
    3
}

fn default_retry_delay_in_ms() -> u64 {
    100
}

fn default_max_connection() -> usize {
    1000
}

fn default_max_response_size() -> usize {
    100 * 1024 * 1024
}

fn default_io_buffer_size() -> usize {
    4096 * 4
}

fn default_idle_conn_duration() -> f64 {
    10.0
}

/// Node allow/deny rules applied during topology refresh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeFilterConfig {
    #[serde(default)]
    pub hosts: ListRule,

    #[serde(default)]
    pub roles: ListRule,

    #[serde(default)]
    pub tags: TagRule,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRule {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub include: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub exclude: Vec<String>,
}

/// Tag rules are attribute maps: a node matches a rule when any `k: v` pair
/// equals one of its attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagRule {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub include: Vec<HashMap<String, String>>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub exclude: Vec<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Seconds between topology refreshes.
    #[serde(default = "default_refresh_interval")]
    pub interval: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_refresh_interval(),
        }
    }
}

fn default_refresh_interval() -> u64 {
    10
}

/// Per-node admission limits enforced by the proxy engine. 0 disables a limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrafficControlConfig {
    #[serde(default)]
    pub max_qps_per_node: u64,

    #[serde(default)]
    pub max_bytes_per_node: u64,
}

/// A named, ordered filter chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    pub name: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub filters: Vec<FilterConfig>,
}

/// One filter entry in a flow, dispatched on the `filter` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "filter", rename_all = "snake_case")]
pub enum FilterConfig {
    Elasticsearch(ElasticsearchFilterConfig),
    BulkResponseProcess(BulkProcessorConfig),
    HashMod(HashModConfig),
    RetryLimiter(RetryLimiterConfig),
    RateLimit(RateLimitConfig),
    RequestCacheGet(CacheConfig),
    RequestCacheSet(CacheConfig),
    RequestLogging,
    ResponseHeaderFormat,
}

impl FilterConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            FilterConfig::Elasticsearch(_) => "elasticsearch",
            FilterConfig::BulkResponseProcess(_) => "bulk_response_process",
            FilterConfig::HashMod(_) => "hash_mod",
            FilterConfig::RetryLimiter(_) => "retry_limiter",
            FilterConfig::RateLimit(_) => "rate_limit",
            FilterConfig::RequestCacheGet(_) => "request_cache_get",
            FilterConfig::RequestCacheSet(_) => "request_cache_set",
            FilterConfig::RequestLogging => "request_logging",
            FilterConfig::ResponseHeaderFormat => "response_header_format",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticsearchFilterConfig {
    /// Cluster name this terminal filter proxies to.
    #[serde(default = "default_cluster_ref")]
    pub elasticsearch: String,
}

fn default_cluster_ref() -> String {
    "default".to_string()
}

/// Bulk splitter settings. Queue names are opt-in: an empty name disables
/// that destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkProcessorConfig {
    /// Abort the bulk walk on a malformed meta line instead of skipping it.
    #[serde(default = "default_true")]
    pub safety_parse: bool,

    #[serde(default = "default_doc_buffer_size")]
    pub doc_buffer_size: usize,

    #[serde(default)]
    pub success_queue: String,

    #[serde(default)]
    pub invalid_queue: String,

    #[serde(default)]
    pub failure_queue: String,

    #[serde(default = "default_message_truncate_size")]
    pub message_truncate_size: usize,

    /// Synchronously re-inject retryable items through `retry_flow`.
    #[serde(default)]
    pub partial_failure_retry: bool,

    /// Budget consumed by a `retry_limiter` placed inside the retry flow.
    #[serde(default)]
    pub partial_failure_max_retry_times: u32,

    #[serde(default)]
    pub partial_failure_retry_latency_in_ms: u64,

    /// Keep the flow running when the whole bulk request failed (non-2xx).
    #[serde(default)]
    pub continue_on_all_error: bool,

    /// Keep the flow running when any item failed.
    #[serde(default)]
    pub continue_on_any_error: bool,

    /// Keep the flow running when every item succeeded.
    #[serde(default)]
    pub continue_on_success: bool,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub tag_on_all_success: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub tag_on_none_2xx: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub tag_on_all_invalid: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub tag_on_all_failure: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub tag_on_any_error: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub tag_on_partial_success: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub tag_on_partial_failure: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub tag_on_partial_invalid: Vec<String>,

    #[serde(default)]
    pub retry_flow: String,
}

impl Default for BulkProcessorConfig {
    fn default() -> Self {
        Self {
            safety_parse: true,
            doc_buffer_size: default_doc_buffer_size(),
            success_queue: String::new(),
            invalid_queue: String::new(),
            failure_queue: String::new(),
            message_truncate_size: default_message_truncate_size(),
            partial_failure_retry: false,
            partial_failure_max_retry_times: 0,
            partial_failure_retry_latency_in_ms: 0,
            continue_on_all_error: false,
            continue_on_any_error: false,
            continue_on_success: false,
            tag_on_all_success: Vec::new(),
            tag_on_none_2xx: Vec::new(),
            tag_on_all_invalid: Vec::new(),
            tag_on_all_failure: Vec::new(),
            tag_on_any_error: Vec::new(),
            tag_on_partial_success: Vec::new(),
            tag_on_partial_failure: Vec::new(),
            tag_on_partial_invalid: Vec::new(),
            retry_flow: String::new(),
        }
    }
}

fn default_doc_buffer_size() -> usize {
    256 * 1024
}

fn default_message_truncate_size() -> usize {
    1024
}

/// Request-fingerprint partitioner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashModConfig {
    /// Template expanded against the context; `$[[key]]` resolves to the
    /// context value under `key`.
    #[serde(default)]
    pub source: String,

    #[serde(default = "default_target_context_name")]
    pub target_context_name: String,

    #[serde(rename = "mod", default = "default_partition_size")]
    pub partition_size: u32,

    #[serde(default = "default_true")]
    pub add_to_request_header: bool,

    #[serde(default = "default_true")]
    pub add_to_response_header: bool,
}

impl Default for HashModConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            target_context_name: default_target_context_name(),
            partition_size: default_partition_size(),
            add_to_request_header: true,
            add_to_response_header: true,
        }
    }
}

fn default_target_context_name() -> String {
    "partition_id".to_string()
}

fn default_partition_size() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryLimiterConfig {
    #[serde(default = "default_limiter_retry_times")]
    pub max_retry_times: i64,

    /// Dead-letter queue for requests that exhausted the budget.
    #[serde(default)]
    pub queue_name: String,
}

impl Default for RetryLimiterConfig {
    fn default() -> Self {
        Self {
            max_retry_times: default_limiter_retry_times(),
            queue_name: String::new(),
        }
    }
}

fn default_limiter_retry_times() -> i64 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_qps")]
    pub max_qps: u64,

    /// "uri" (per request path) or "global".
    #[serde(default = "default_rate_limit_key")]
    pub key: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_qps: default_max_qps(),
            key: default_rate_limit_key(),
        }
    }
}

fn default_max_qps() -> u64 {
    1000
}

fn default_rate_limit_key() -> String {
    "uri".to_string()
}

/// In-memory response cache settings, shared by the get/set pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    /// URIs matching any pattern bypass the cache entirely, as does any
    /// request carrying a `refresh` query parameter.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub passthrough_patterns: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            passthrough_patterns: Vec::new(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    10
}
