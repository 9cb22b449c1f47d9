use crate::bufpool::BufferPools;
use crate::bulk::{has_top_level_errors, BulkEvent, BulkResponse, BulkWalker, PartitionClass};
use crate::config::BulkProcessorConfig;
use crate::limiter::LimiterRegistry;
use crate::proxy::context::{RequestContext, Value};
use crate::proxy::filter::FilterFlow;
use crate::queue::QueueRegistry;
use bytes::Bytes;
use http::{HeaderValue, Method, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

const ENVELOPE_BODY_CAP: usize = 4096;

/// Splits a partially failed bulk response.
///
/// The response body always passes through to the client byte-for-byte;
/// this filter only adds side effects: each request action is routed into a
/// success / retryable / non-retryable buffer by its response item's status,
/// the buffers are re-encoded as standalone bulk requests and pushed to the
/// configured queues, and the retryable subset may be re-injected through a
/// retry flow before it is queued.
pub struct BulkResponseFilter {
    config: BulkProcessorConfig,
    queues: Arc<QueueRegistry>,
    buffers: Arc<BufferPools>,
    limiters: Arc<LimiterRegistry>,
    retry_flow: Option<Arc<FilterFlow>>,
}

impl BulkResponseFilter {
    pub fn new(
        config: BulkProcessorConfig,
        queues: Arc<QueueRegistry>,
        buffers: Arc<BufferPools>,
        limiters: Arc<LimiterRegistry>,
        retry_flow: Option<Arc<FilterFlow>>,
    ) -> Self {
        Self {
            config,
            queues,
            buffers,
            limiters,
            retry_flow,
        }
    }

    pub async fn filter(&self, ctx: &mut RequestContext) {
        if ctx.request.method != Method::POST || !ctx.request.path().contains("_bulk") {
            return;
        }

        let status = ctx.response.status;
        if status == StatusCode::OK || status == StatusCode::CREATED {
            if has_top_level_errors(&ctx.response.body) {
                self.handle_partial_failure(ctx).await;
            } else {
                self.handle_all_success(ctx).await;
            }
        } else {
            self.handle_request_failure(ctx).await;
        }
    }

    async fn handle_all_success(&self, ctx: &mut RequestContext) {
        if !self.config.tag_on_all_success.is_empty() {
            ctx.add_tags(&self.config.tag_on_all_success);
        }
        if !self.config.success_queue.is_empty() {
            let record = ctx.request.encode();
            self.queues.push(&self.config.success_queue, record).await;
        }
        if !self.config.continue_on_success {
            ctx.finish();
        }
    }

    async fn handle_partial_failure(&self, ctx: &mut RequestContext) {
        let request_body = ctx.request.body.clone();
        let response_body = ctx.response.body.clone();

        let response: BulkResponse = match serde_json::from_slice(&response_body) {
            Ok(r) => r,
            Err(e) => {
                error!("bulk_response_process: unparseable bulk response: {}", e);
                return;
            }
        };

        // per-status histogram + offsets of failed items
        let mut status_histogram: HashMap<String, Value> = HashMap::new();
        let mut invalid_offset: HashMap<usize, u16> = HashMap::new();
        for (i, item) in response.items.iter().enumerate() {
            let Some(detail) = item.detail() else {
                continue;
            };
            let entry = status_histogram
                .entry(detail.status.to_string())
                .or_insert(Value::Int(0));
            if let Value::Int(count) = entry {
                *count += 1;
            }
            metrics::counter!(
                "gateway_bulk_items_total",
                "status" => detail.status.to_string(),
            )
            .increment(1);
            if detail.error.is_some() {
                invalid_offset.insert(i, detail.status);
            }
        }
        if !invalid_offset.is_empty() {
            debug!("bulk_response_process: status histogram: {:?}", status_histogram);
        }
        ctx.set_value("bulk_response_status", Value::Map(status_histogram));
        ctx.response
            .headers
            .insert("x-bulkrequest-failed", HeaderValue::from_static("true"));
        metrics::counter!("gateway_bulk_requests_failed_total").increment(1);

        // the error log itself is throttled: one report per url per period
        if self
            .limiters
            .get("bulk_error", &ctx.request.uri, 1, 1, Duration::from_secs(5))
            .allow()
        {
            error!(
                "error in bulk requests, {}, {}, {}",
                ctx.request.uri,
                ctx.response.status,
                truncate_lossy(&response_body, self.config.message_truncate_size)
            );
        }

        if !self.config.tag_on_any_error.is_empty() {
            ctx.add_tags(&self.config.tag_on_any_error);
        }

        let mut non_retryable = self
            .buffers
            .acquire("bulk_request_docs", self.config.doc_buffer_size);
        let mut retryable = self
            .buffers
            .acquire("bulk_request_docs", self.config.doc_buffer_size);
        let mut success = self
            .buffers
            .acquire("bulk_request_docs", self.config.doc_buffer_size);

        let mut offset = 0usize;
        let mut current = PartitionClass::Success;
        for event in BulkWalker::new(&request_body, self.config.safety_parse) {
            match event {
                Ok(BulkEvent::Meta { raw, .. }) => {
                    current = match invalid_offset.get(&offset) {
                        Some(&item_status) => PartitionClass::classify_error(item_status),
                        None => PartitionClass::Success,
                    };
                    let buffer = match current {
                        PartitionClass::Success => &mut success,
                        PartitionClass::Retryable => &mut retryable,
                        PartitionClass::NonRetryable => &mut non_retryable,
                    };
                    append_line(buffer, raw);
                    offset += 1;
                }
                Ok(BulkEvent::Payload { raw }) => {
                    if raw.is_empty() {
                        continue;
                    }
                    let buffer = match current {
                        PartitionClass::Success => &mut success,
                        PartitionClass::Retryable => &mut retryable,
                        PartitionClass::NonRetryable => &mut non_retryable,
                    };
                    append_line(buffer, raw);
                }
                Err(e) => {
                    // emit what was parsed; unparsed bytes remain only in the
                    // response pass-through
                    warn!("bulk_response_process: walk aborted: {}", e);
                    break;
                }
            }
        }

        if !non_retryable.is_empty() {
            if !self.config.invalid_queue.is_empty() {
                non_retryable.push(b'\n');
                let record = ctx.request.override_body_encode(&non_retryable);
                self.queues.push(&self.config.invalid_queue, record).await;

                // the request body now holds the non-retryable subset, which
                // is exactly what the diagnostic should show
                let envelope = bulk_error_envelope(ctx, &response_body);
                self.queues
                    .push(
                        &format!("{}-bulk-error-messages", self.config.invalid_queue),
                        envelope,
                    )
                    .await;
            }
            metrics::counter!("gateway_bulk_partition_bytes_total", "class" => "non_retryable")
                .increment(non_retryable.len() as u64);

            if !self.config.tag_on_partial_invalid.is_empty() {
                ctx.add_tags(&self.config.tag_on_partial_invalid);
            }
            if success.is_empty() && retryable.is_empty() && !self.config.tag_on_all_invalid.is_empty()
            {
                ctx.add_tags(&self.config.tag_on_all_invalid);
            }
        }

        if !retryable.is_empty() {
            if !self.config.failure_queue.is_empty() {
                retryable.push(b'\n');
                let record = ctx.request.override_body_encode(&retryable);

                if self.config.partial_failure_retry {
                    if let Some(flow) = &self.retry_flow {
                        if self.config.partial_failure_retry_latency_in_ms > 0 {
                            tokio::time::sleep(Duration::from_millis(
                                self.config.partial_failure_retry_latency_in_ms,
                            ))
                            .await;
                        }
                        ctx.record_flow(format!("retry_flow:{}", flow.id));
                        flow.run(ctx).await;
                    }
                }

                self.queues.push(&self.config.failure_queue, record).await;
            }
            metrics::counter!("gateway_bulk_partition_bytes_total", "class" => "retryable")
                .increment(retryable.len() as u64);

            if !self.config.tag_on_partial_failure.is_empty() {
                ctx.add_tags(&self.config.tag_on_partial_failure);
            }
            if success.is_empty() && non_retryable.is_empty() && !self.config.tag_on_all_failure.is_empty()
            {
                ctx.add_tags(&self.config.tag_on_all_failure);
            }
        }

        if !success.is_empty() {
            if !self.config.success_queue.is_empty() {
                success.push(b'\n');
                let record = ctx.request.override_body_encode(&success);
                self.queues.push(&self.config.success_queue, record).await;
            }
            metrics::counter!("gateway_bulk_partition_bytes_total", "class" => "success")
                .increment(success.len() as u64);

            if !self.config.tag_on_partial_success.is_empty() {
                ctx.add_tags(&self.config.tag_on_partial_success);
            }
        }

        if !self.config.continue_on_any_error {
            ctx.finish();
        }
    }

    async fn handle_request_failure(&self, ctx: &mut RequestContext) {
        if !self.config.tag_on_none_2xx.is_empty() {
            ctx.add_tags(&self.config.tag_on_none_2xx);
        }

        let envelope = request_error_envelope(ctx);
        self.queues
            .push(
                &format!("{}-req-error-messages", self.config.invalid_queue),
                envelope,
            )
            .await;

        if !self.config.failure_queue.is_empty() {
            let record = ctx.request.encode();
            self.queues.push(&self.config.failure_queue, record).await;
        }

        if !self.config.continue_on_all_error {
            ctx.finish();
        }
    }
}

fn append_line(buffer: &mut Vec<u8>, line: &[u8]) {
    if !buffer.is_empty() {
        buffer.push(b'\n');
    }
    buffer.extend_from_slice(line);
}

fn truncate_lossy(bytes: &[u8], cap: usize) -> String {
    String::from_utf8_lossy(&bytes[..bytes.len().min(cap)]).into_owned()
}

/// Diagnostic record accompanying the non-retryable items.
fn bulk_error_envelope(ctx: &RequestContext, response_body: &[u8]) -> Bytes {
    let envelope = serde_json::json!({
        "request": {
            "uri": ctx.request.uri,
            "body": truncate_lossy(&ctx.request.body, ENVELOPE_BODY_CAP),
        },
        "response": {
            "status": ctx.response.status.as_u16(),
            "body": truncate_lossy(response_body, ENVELOPE_BODY_CAP),
        },
    });
    Bytes::from(envelope.to_string())
}

/// Diagnostic record for a bulk request that failed wholesale (non-2xx).
fn request_error_envelope(ctx: &RequestContext) -> Bytes {
    let envelope = serde_json::json!({
        "context": ctx.flow_trace(),
        "request": {
            "uri": ctx.request.uri,
            "body": truncate_lossy(&ctx.request.body, ENVELOPE_BODY_CAP),
        },
        "response": {
            "status": ctx.response.status.as_u16(),
            "body": truncate_lossy(&ctx.response.body, ENVELOPE_BODY_CAP),
        },
    });
    Bytes::from(envelope.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::context::StoredRequest;
    use http::HeaderMap;

    const REQUEST_BODY: &[u8] = b"{\"index\":{\"_index\":\"logs\",\"_id\":\"1\"}}\n{\"doc\":1}\n{\"index\":{\"_index\":\"logs\",\"_id\":\"2\"}}\n{\"doc\":2}\n{\"index\":{\"_index\":\"logs\",\"_id\":\"3\"}}\n{\"doc\":3}\n";

    const MIXED_RESPONSE: &[u8] = br#"{"took":5,"errors":true,"items":[
        {"index":{"_index":"logs","_id":"1","status":201}},
        {"index":{"_index":"logs","_id":"2","status":429,"error":{"type":"es_rejected_execution_exception"}}},
        {"index":{"_index":"logs","_id":"3","status":400,"error":{"type":"mapper_parsing_exception"}}}
    ]}"#;

    fn bulk_ctx(response_status: StatusCode, response_body: &'static [u8]) -> RequestContext {
        let mut ctx = RequestContext::new(StoredRequest {
            method: Method::POST,
            uri: "/_bulk".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(REQUEST_BODY),
        });
        ctx.response.status = response_status;
        ctx.response.body = Bytes::from_static(response_body);
        ctx
    }

    fn build(config: BulkProcessorConfig) -> (BulkResponseFilter, Arc<QueueRegistry>) {
        let queues = Arc::new(QueueRegistry::new());
        let filter = BulkResponseFilter::new(
            config,
            queues.clone(),
            Arc::new(BufferPools::new()),
            Arc::new(LimiterRegistry::new()),
            None,
        );
        (filter, queues)
    }

    fn queue_config() -> BulkProcessorConfig {
        BulkProcessorConfig {
            success_queue: "ok".to_string(),
            invalid_queue: "bad".to_string(),
            failure_queue: "retry".to_string(),
            tag_on_any_error: vec!["bulk_error".to_string()],
            tag_on_partial_success: vec!["partial_success".to_string()],
            tag_on_partial_failure: vec!["partial_failure".to_string()],
            tag_on_partial_invalid: vec!["partial_invalid".to_string()],
            tag_on_all_success: vec!["all_success".to_string()],
            tag_on_all_failure: vec!["all_failure".to_string()],
            tag_on_all_invalid: vec!["all_invalid".to_string()],
            tag_on_none_2xx: vec!["none_2xx".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_non_bulk_request_ignored() {
        let (filter, queues) = build(queue_config());
        let mut ctx = RequestContext::new(StoredRequest {
            method: Method::GET,
            uri: "/_search".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        });
        filter.filter(&mut ctx).await;
        assert!(!ctx.is_finished());
        assert!(queues.is_empty("ok"));
    }

    #[tokio::test]
    async fn test_all_success_path() {
        let (filter, queues) = build(queue_config());
        let mut ctx = bulk_ctx(StatusCode::OK, br#"{"took":3,"errors":false,"items":[]}"#);
        filter.filter(&mut ctx).await;

        assert!(ctx.has_tag("all_success"));
        assert!(!ctx.has_tag("bulk_error"));
        assert_eq!(queues.len("ok"), 1);
        assert!(queues.is_empty("bad"));
        assert!(queues.is_empty("retry"));
        // response body untouched
        assert_eq!(ctx.response.body, &br#"{"took":3,"errors":false,"items":[]}"#[..]);
        // continue_on_success defaults to false
        assert!(ctx.is_finished());
    }

    #[tokio::test]
    async fn test_all_success_without_queue_pushes_nothing() {
        let (filter, queues) = build(BulkProcessorConfig {
            continue_on_success: true,
            ..Default::default()
        });
        let mut ctx = bulk_ctx(StatusCode::OK, br#"{"took":3,"errors":false,"items":[]}"#);
        filter.filter(&mut ctx).await;
        assert!(!ctx.is_finished());
        assert!(queues.is_empty("ok"));
    }

    #[tokio::test]
    async fn test_mixed_response_partitions_items() {
        let (filter, queues) = build(queue_config());
        let mut ctx = bulk_ctx(StatusCode::OK, MIXED_RESPONSE);
        filter.filter(&mut ctx).await;

        // success buffer -> action 0
        let ok = queues.pop("ok").unwrap();
        let ok_text = std::str::from_utf8(&ok).unwrap();
        assert!(ok_text.contains("\"_id\":\"1\""));
        assert!(ok_text.contains("{\"doc\":1}"));
        assert!(!ok_text.contains("\"_id\":\"2\""));

        // retryable buffer -> action 1 (429)
        let retry = queues.pop("retry").unwrap();
        let retry_text = std::str::from_utf8(&retry).unwrap();
        assert!(retry_text.contains("\"_id\":\"2\""));
        assert!(retry_text.contains("{\"doc\":2}"));
        assert!(!retry_text.contains("\"_id\":\"3\""));

        // non-retryable buffer -> action 2 (400)
        let invalid = queues.pop("bad").unwrap();
        let invalid_text = std::str::from_utf8(&invalid).unwrap();
        assert!(invalid_text.contains("\"_id\":\"3\""));
        assert!(invalid_text.contains("{\"doc\":3}"));
        assert!(!invalid_text.contains("\"_id\":\"1\""));

        // diagnostic envelope alongside the invalid items
        let envelope = queues.pop("bad-bulk-error-messages").unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&envelope).unwrap();
        assert_eq!(parsed["response"]["status"], 200);
        assert_eq!(parsed["request"]["uri"], "/_bulk");

        // header + context histogram
        assert_eq!(
            ctx.response.headers.get("x-bulkrequest-failed").unwrap(),
            "true"
        );
        let histogram = ctx
            .get_value("bulk_response_status")
            .unwrap()
            .as_map()
            .unwrap();
        assert_eq!(histogram["201"], Value::Int(1));
        assert_eq!(histogram["429"], Value::Int(1));
        assert_eq!(histogram["400"], Value::Int(1));

        // tag matrix
        assert!(ctx.has_tag("bulk_error"));
        assert!(ctx.has_tag("partial_success"));
        assert!(ctx.has_tag("partial_failure"));
        assert!(ctx.has_tag("partial_invalid"));
        assert!(!ctx.has_tag("all_failure"));
        assert!(!ctx.has_tag("all_invalid"));

        // continue_on_any_error defaults to false
        assert!(ctx.is_finished());
    }

    #[tokio::test]
    async fn test_partition_is_disjoint_and_complete() {
        let (filter, queues) = build(queue_config());
        let mut ctx = bulk_ctx(StatusCode::OK, MIXED_RESPONSE);
        filter.filter(&mut ctx).await;

        let mut lines = Vec::new();
        for queue in ["ok", "retry", "bad"] {
            let record = queues.pop(queue).unwrap();
            let text = std::str::from_utf8(&record).unwrap().to_string();
            let body = text.split("\r\n\r\n").nth(1).unwrap().to_string();
            for line in body.lines().filter(|l| !l.is_empty()) {
                lines.push(line.to_string());
            }
        }
        let mut original: Vec<String> = std::str::from_utf8(REQUEST_BODY)
            .unwrap()
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .collect();
        lines.sort();
        original.sort();
        assert_eq!(lines, original);
    }

    #[tokio::test]
    async fn test_all_failure_tags() {
        let (filter, _queues) = build(queue_config());
        let body = b"{\"index\":{\"_id\":\"1\"}}\n{\"doc\":1}\n";
        let mut ctx = RequestContext::new(StoredRequest {
            method: Method::POST,
            uri: "/_bulk".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(body),
        });
        ctx.response.status = StatusCode::OK;
        ctx.response.body = Bytes::from_static(
            br#"{"took":1,"errors":true,"items":[{"index":{"_id":"1","status":503,"error":{"type":"unavailable"}}}]}"#,
        );
        filter.filter(&mut ctx).await;
        assert!(ctx.has_tag("partial_failure"));
        assert!(ctx.has_tag("all_failure"));
        assert!(!ctx.has_tag("partial_success"));
        assert!(!ctx.has_tag("partial_invalid"));
    }

    #[tokio::test]
    async fn test_retryable_override_rewrites_request_body() {
        // after the splitter runs, the request body holds the last written
        // class so a retry flow re-sends only that subset
        let (filter, _queues) = build(BulkProcessorConfig {
            failure_queue: "retry".to_string(),
            ..Default::default()
        });
        let mut ctx = bulk_ctx(StatusCode::OK, MIXED_RESPONSE);
        filter.filter(&mut ctx).await;
        let body = std::str::from_utf8(&ctx.request.body).unwrap();
        assert!(body.contains("\"_id\":\"2\""));
        assert!(!body.contains("\"_id\":\"3\""));
    }

    #[tokio::test]
    async fn test_continue_on_any_error_keeps_flow_running() {
        let (filter, _queues) = build(BulkProcessorConfig {
            continue_on_any_error: true,
            ..Default::default()
        });
        let mut ctx = bulk_ctx(StatusCode::OK, MIXED_RESPONSE);
        filter.filter(&mut ctx).await;
        assert!(!ctx.is_finished());
    }

    #[tokio::test]
    async fn test_non_2xx_response() {
        let (filter, queues) = build(queue_config());
        let mut ctx = bulk_ctx(StatusCode::SERVICE_UNAVAILABLE, b"upstream down");
        filter.filter(&mut ctx).await;

        assert!(ctx.has_tag("none_2xx"));
        assert!(ctx.is_finished());
        assert_eq!(queues.len("retry"), 1);

        let envelope = queues.pop("bad-req-error-messages").unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&envelope).unwrap();
        assert_eq!(parsed["response"]["status"], 503);
        assert_eq!(parsed["response"]["body"], "upstream down");
        assert!(parsed["context"].is_array());
    }

    #[tokio::test]
    async fn test_envelope_bodies_truncated() {
        let (filter, queues) = build(queue_config());
        let mut ctx = RequestContext::new(StoredRequest {
            method: Method::POST,
            uri: "/_bulk".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::from(vec![b'x'; 10_000]),
        });
        ctx.response.status = StatusCode::BAD_GATEWAY;
        ctx.response.body = Bytes::from(vec![b'y'; 10_000]);
        filter.filter(&mut ctx).await;

        let envelope = queues.pop("bad-req-error-messages").unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&envelope).unwrap();
        assert_eq!(parsed["request"]["body"].as_str().unwrap().len(), 4096);
        assert_eq!(parsed["response"]["body"].as_str().unwrap().len(), 4096);
    }
}
