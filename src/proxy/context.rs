use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use std::collections::HashMap;
use std::time::Instant;

/// Dynamically-typed context value. The filter chain is composed from
/// config, so producers and consumers of a key only meet at runtime; the
/// tagged variant keeps that boundary honest with typed accessors.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Bytes(Bytes),
    StringList(Vec<String>),
    Map(HashMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            Value::StringList(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Display form used by template expansion.
    pub fn render(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::StringList(l) => l.join(","),
            Value::Map(_) => String::new(),
        }
    }
}

/// Buffered client request. The body is fully collected before the filter
/// chain runs — the bulk splitter and the retry path both need to replay it.
#[derive(Debug, Clone)]
pub struct StoredRequest {
    pub method: Method,
    /// Origin-form URI as received (`/index/_bulk?refresh=true`).
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl StoredRequest {
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or(&self.uri)
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, q)| q)
    }

    pub fn has_query_param(&self, name: &str) -> bool {
        self.query()
            .map(|q| {
                q.split('&')
                    .any(|pair| pair == name || pair.starts_with(name) && pair[name.len()..].starts_with('='))
            })
            .unwrap_or(false)
    }

    /// Serialize the request to its HTTP/1.1 wire form. Queue records carry
    /// this encoding so replay tooling can resubmit verbatim.
    pub fn encode(&self) -> Bytes {
        encode_request(&self.method, &self.uri, &self.headers, &self.body)
    }

    /// Replace the body (fixing `content-length`) and return the wire
    /// encoding of the rewritten request. The mutation is intentional: the
    /// bulk splitter narrows the request to the subset it re-injects.
    pub fn override_body_encode(&mut self, body: &[u8]) -> Bytes {
        self.body = Bytes::copy_from_slice(body);
        self.encode()
    }
}

fn encode_request(method: &Method, uri: &str, headers: &HeaderMap, body: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(64 + uri.len() + headers.len() * 32 + body.len());
    out.extend_from_slice(method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(uri.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers {
        if name == &http::header::CONTENT_LENGTH {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    let mut buf = itoa::Buffer::new();
    out.extend_from_slice(b"content-length: ");
    out.extend_from_slice(buf.format(body.len()).as_bytes());
    out.extend_from_slice(b"\r\n\r\n");
    out.extend_from_slice(body);
    Bytes::from(out)
}

/// Buffered upstream response as it will be returned to the client.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Default for StoredResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

impl StoredResponse {
    pub fn set_error(&mut self, status: StatusCode, msg: &str) {
        self.status = status;
        self.body = Bytes::copy_from_slice(msg.as_bytes());
    }
}

/// Per-request context flowing through the filter chain.
///
/// Single-owner for the request's lifetime: created when the server accepts
/// the request, dropped after the response is written. Once `finished` is
/// set, the chain stops and no later filter runs.
pub struct RequestContext {
    pub request: StoredRequest,
    pub response: StoredResponse,
    values: HashMap<String, Value>,
    tags: Vec<String>,
    flow_trace: Vec<String>,
    finished: bool,
    /// Endpoint the proxy engine actually sent the request to.
    pub destination: String,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(request: StoredRequest) -> Self {
        Self {
            request,
            response: StoredResponse::default(),
            values: HashMap::new(),
            tags: Vec::new(),
            flow_trace: Vec::new(),
            finished: false,
            destination: String::new(),
            start: Instant::now(),
        }
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Append to a string-list value, creating a single-element list when the
    /// key is absent or holds a different variant.
    pub fn append_string_value(&mut self, key: &str, item: String) {
        match self.values.get_mut(key) {
            Some(Value::StringList(list)) => list.push(item),
            _ => {
                self.values
                    .insert(key.to_string(), Value::StringList(vec![item]));
            }
        }
    }

    pub fn add_tags(&mut self, tags: &[String]) {
        for tag in tags {
            if !self.tags.contains(tag) {
                self.tags.push(tag.clone());
            }
        }
    }

    pub fn remove_tags(&mut self, tags: &[String]) {
        self.tags.retain(|t| !tags.contains(t));
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn record_flow(&mut self, id: impl Into<String>) {
        self.flow_trace.push(id.into());
    }

    pub fn flow_trace(&self) -> &[String] {
        &self.flow_trace
    }

    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}
