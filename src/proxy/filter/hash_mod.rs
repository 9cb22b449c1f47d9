use crate::config::HashModConfig;
use crate::error::GatewayError;
use crate::proxy::context::RequestContext;
use http::header::HeaderName;
use http::HeaderValue;
use tracing::debug;

const PARTITION_ID_HEADER: HeaderName = HeaderName::from_static("x-partition-id");
const PARTITION_SIZE_HEADER: HeaderName = HeaderName::from_static("x-partition-size");

/// Request-fingerprint partitioner: expands the source template against the
/// context, hashes it with xxhash32 and takes the result mod the partition
/// count. Downstream consumers and filters read the id from the context key
/// and/or the `X-Partition-*` headers.
pub struct HashModFilter {
    config: HashModConfig,
    template: Option<Template>,
    partition_size_str: String,
}

impl HashModFilter {
    pub fn new(config: HashModConfig) -> Result<Self, GatewayError> {
        if config.partition_size == 0 {
            return Err(GatewayError::Config(
                "hash_mod partition size must be >= 1".to_string(),
            ));
        }
        let template = if config.source.contains("$[[") {
            Some(Template::parse(&config.source)?)
        } else {
            None
        };
        let partition_size_str = config.partition_size.to_string();
        Ok(Self {
            config,
            template,
            partition_size_str,
        })
    }

    pub fn filter(&self, ctx: &mut RequestContext) {
        let id_str = if self.config.partition_size == 1 {
            "0".to_string()
        } else {
            let source = match &self.template {
                Some(t) => t.render(ctx),
                None => self.config.source.clone(),
            };
            if source.is_empty() {
                String::new()
            } else {
                let hash = twox_hash::XxHash32::oneshot(0, source.as_bytes());
                let partition_id = hash as u64 % self.config.partition_size as u64;
                debug!(
                    "hash_mod: input={}, partition_id={}, partition_size={}",
                    source, partition_id, self.partition_size_str
                );
                partition_id.to_string()
            }
        };

        ctx.set_value(
            self.config.target_context_name.clone(),
            crate::proxy::context::Value::String(id_str.clone()),
        );

        if self.config.add_to_request_header {
            if let Ok(v) = HeaderValue::from_str(&id_str) {
                ctx.request.headers.insert(PARTITION_ID_HEADER, v);
            }
            if let Ok(v) = HeaderValue::from_str(&self.partition_size_str) {
                ctx.request.headers.insert(PARTITION_SIZE_HEADER, v);
            }
        }
        if self.config.add_to_response_header {
            if let Ok(v) = HeaderValue::from_str(&id_str) {
                ctx.response.headers.insert(PARTITION_ID_HEADER, v);
            }
            if let Ok(v) = HeaderValue::from_str(&self.partition_size_str) {
                ctx.response.headers.insert(PARTITION_SIZE_HEADER, v);
            }
        }
    }
}

enum Segment {
    Literal(String),
    Var(String),
}

/// Minimal `$[[key]]` template.
struct Template {
    segments: Vec<Segment>,
}

impl Template {
    fn parse(source: &str) -> Result<Self, GatewayError> {
        let mut segments = Vec::new();
        let mut rest = source;
        while let Some(start) = rest.find("$[[") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 3..];
            let end = after.find("]]").ok_or_else(|| {
                GatewayError::Config(format!("unterminated template tag in [{}]", source))
            })?;
            segments.push(Segment::Var(after[..end].to_string()));
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self { segments })
    }

    fn render(&self, ctx: &RequestContext) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Var(key) => match ctx.get_value(key) {
                    Some(value) => out.push_str(&value.render()),
                    None => debug!("hash_mod: context key [{}] not found", key),
                },
            }
        }
        out
    }
}
