use serde::Deserialize;
use std::collections::HashMap;

/// Window the quick-reject scan looks at. Elasticsearch emits `took` and
/// `errors` before the items array, so the marker lands early when present.
const ERRORS_SCAN_WINDOW: usize = 64;

/// True when the literal `"errors":true` appears within the first 64 bytes
/// of the response body.
pub fn has_top_level_errors(body: &[u8]) -> bool {
    const NEEDLE: &[u8] = b"\"errors\":true";
    let window = &body[..body.len().min(ERRORS_SCAN_WINDOW)];
    window.len() >= NEEDLE.len() && window.windows(NEEDLE.len()).any(|w| w == NEEDLE)
}

#[derive(Debug, Deserialize)]
pub struct BulkResponse {
    #[serde(default)]
    pub took: i64,
    #[serde(default)]
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<BulkResponseItem>,
}

/// One item of a bulk response: a single-key object keyed by the action
/// (`{"index": {...}}`, `{"delete": {...}}`, ...).
#[derive(Debug, Deserialize)]
pub struct BulkResponseItem(pub HashMap<String, BulkItemDetail>);

impl BulkResponseItem {
    pub fn detail(&self) -> Option<&BulkItemDetail> {
        self.0.values().next()
    }
}

#[derive(Debug, Deserialize)]
pub struct BulkItemDetail {
    #[serde(rename = "_index", default)]
    pub index: Option<String>,
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// Destination class for one request action, decided by its response item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionClass {
    Success,
    Retryable,
    NonRetryable,
}

impl PartitionClass {
    /// Classify an item that carried an error. Schema/auth/not-found style
    /// statuses will fail identically on resubmission; everything else is
    /// worth another attempt.
    pub fn classify_error(status: u16) -> Self {
        if (400..500).contains(&status) && status != 429 {
            PartitionClass::NonRetryable
        } else {
            PartitionClass::Retryable
        }
    }
}
