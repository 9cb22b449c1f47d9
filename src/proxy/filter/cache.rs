use crate::config::CacheConfig;
use crate::proxy::context::{RequestContext, StoredRequest, Value};
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use std::time::{Duration, Instant};
use std::sync::Arc;
use tracing::debug;

const CACHE_KEY_CONTEXT: &str = "response_cache_key";

/// In-memory response cache shared by the get/set filter pair. Entries live
/// for the configured TTL and never survive a restart.
pub struct ResponseCache {
    entries: DashMap<u64, CachedEntry>,
}

#[derive(Clone)]
struct CachedEntry {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    stored_at: Instant,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprint of method + uri + body. POST searches with different
    /// bodies must not collide, so the body is part of the key.
    pub fn key_for(request: &StoredRequest) -> u64 {
        let mut input = Vec::with_capacity(
            request.method.as_str().len() + request.uri.len() + request.body.len() + 2,
        );
        input.extend_from_slice(request.method.as_str().as_bytes());
        input.push(b' ');
        input.extend_from_slice(request.uri.as_bytes());
        input.push(b' ');
        input.extend_from_slice(&request.body);
        twox_hash::XxHash64::oneshot(0, &input)
    }

    fn get(&self, key: u64, ttl: Duration) -> Option<CachedEntry> {
        let entry = self.entries.get(&key)?;
        if entry.stored_at.elapsed() > ttl {
            drop(entry);
            self.entries.remove(&key);
            return None;
        }
        Some(entry.clone())
    }

    fn put(&self, key: u64, status: StatusCode, headers: HeaderMap, body: Bytes) {
        self.entries.insert(
            key,
            CachedEntry {
                status,
                headers,
                body,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whether this request participates in the response cache at all.
/// Writes go through the write path; URIs matching a passthrough pattern
/// and requests carrying `refresh` are routed around the cache.
fn is_cacheable(request: &StoredRequest, config: &CacheConfig) -> bool {
    if request.has_query_param("refresh") {
        return false;
    }
    if config
        .passthrough_patterns
        .iter()
        .any(|p| !p.is_empty() && request.uri.contains(p))
    {
        return false;
    }
    match request.method {
        Method::GET | Method::HEAD => true,
        Method::POST => request.path().contains("_search"),
        _ => false,
    }
}

/// Serves cached responses; on a miss it leaves the computed key in the
/// context for the set filter that runs on the response side.
pub struct CacheGetFilter {
    config: CacheConfig,
    cache: Arc<ResponseCache>,
}

impl CacheGetFilter {
    pub fn new(config: CacheConfig, cache: Arc<ResponseCache>) -> Self {
        Self { config, cache }
    }

    pub fn filter(&self, ctx: &mut RequestContext) {
        if !is_cacheable(&ctx.request, &self.config) {
            return;
        }
        let key = ResponseCache::key_for(&ctx.request);
        let ttl = Duration::from_secs(self.config.ttl_secs);
        if let Some(entry) = self.cache.get(key, ttl) {
            debug!("request_cache_get: hit, uri={}", ctx.request.uri);
            metrics::counter!("gateway_cache_hits_total").increment(1);
            ctx.response.status = entry.status;
            ctx.response.headers = entry.headers;
            ctx.response.body = entry.body;
            ctx.response
                .headers
                .insert("x-cache", HeaderValue::from_static("hit"));
            ctx.finish();
            return;
        }
        metrics::counter!("gateway_cache_misses_total").increment(1);
        ctx.set_value(CACHE_KEY_CONTEXT, Value::Int(key as i64));
    }
}

/// Response-side companion of `CacheGetFilter`: stores 200 responses under
/// the key the get filter computed.
pub struct CacheSetFilter {
    cache: Arc<ResponseCache>,
}

impl CacheSetFilter {
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self { cache }
    }

    pub fn filter(&self, ctx: &mut RequestContext) {
        let Some(key) = ctx.get_value(CACHE_KEY_CONTEXT).and_then(|v| v.as_int()) else {
            return;
        };
        if ctx.response.status != StatusCode::OK {
            return;
        }
        self.cache.put(
            key as u64,
            ctx.response.status,
            ctx.response.headers.clone(),
            ctx.response.body.clone(),
        );
    }
}
