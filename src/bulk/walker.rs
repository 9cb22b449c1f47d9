use crate::error::GatewayError;
use serde::Deserialize;
use std::borrow::Cow;

/// One action kind from a bulk meta line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAction {
    Index,
    Create,
    Update,
    Delete,
}

impl BulkAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkAction::Index => "index",
            BulkAction::Create => "create",
            BulkAction::Update => "update",
            BulkAction::Delete => "delete",
        }
    }

    /// Every action except `delete` is followed by a document line.
    pub fn has_payload(&self) -> bool {
        !matches!(self, BulkAction::Delete)
    }
}

/// Event stream over a bulk body. `raw` slices preserve the exact bytes of
/// the source line (newline excluded) so callers can reassemble framing
/// without copies.
#[derive(Debug)]
pub enum BulkEvent<'a> {
    Meta {
        raw: &'a [u8],
        action: BulkAction,
        index: Option<Cow<'a, str>>,
        doc_type: Option<Cow<'a, str>>,
        id: Option<Cow<'a, str>>,
    },
    Payload {
        raw: &'a [u8],
    },
}

#[derive(Deserialize, Default)]
struct ActionTarget<'a> {
    #[serde(rename = "_index", borrow, default)]
    index: Option<Cow<'a, str>>,
    #[serde(rename = "_type", borrow, default)]
    doc_type: Option<Cow<'a, str>>,
    #[serde(rename = "_id", borrow, default)]
    id: Option<Cow<'a, str>>,
}

#[derive(Deserialize)]
struct MetaLine<'a> {
    #[serde(borrow, default)]
    index: Option<ActionTarget<'a>>,
    #[serde(borrow, default)]
    create: Option<ActionTarget<'a>>,
    #[serde(borrow, default)]
    update: Option<ActionTarget<'a>>,
    #[serde(borrow, default)]
    delete: Option<ActionTarget<'a>>,
}

/// Line filter hook: invoked on every raw line before interpretation.
/// Returning `true` skips the following line entirely.
pub type LineFilter<'a> = Box<dyn FnMut(&[u8]) -> bool + Send + 'a>;

/// Pull-style iterator over `\n`-separated bulk NDJSON.
///
/// Yields exactly one `Meta` per action and, for non-delete actions, exactly
/// one `Payload` before the next `Meta`. With `safety_parse` a malformed meta
/// line ends the walk with an error; otherwise the line is skipped.
pub struct BulkWalker<'a> {
    body: &'a [u8],
    pos: usize,
    safety_parse: bool,
    expect_payload: bool,
    line_filter: Option<LineFilter<'a>>,
    skip_next: bool,
    failed: bool,
}

impl<'a> BulkWalker<'a> {
    pub fn new(body: &'a [u8], safety_parse: bool) -> Self {
        Self {
            body,
            pos: 0,
            safety_parse,
            expect_payload: false,
            line_filter: None,
            skip_next: false,
            failed: false,
        }
    }

    pub fn with_line_filter(mut self, filter: impl FnMut(&[u8]) -> bool + Send + 'a) -> Self {
        self.line_filter = Some(Box::new(filter));
        self
    }

    fn next_line(&mut self) -> Option<&'a [u8]> {
        let body = self.body;
        while self.pos < body.len() {
            let rest = &body[self.pos..];
            let (line, advance) = match rest.iter().position(|&b| b == b'\n') {
                Some(nl) => (&rest[..nl], nl + 1),
                None => (rest, rest.len()),
            };
            self.pos += advance;
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }

    fn parse_meta(line: &'a [u8]) -> Result<BulkEvent<'a>, GatewayError> {
        let meta: MetaLine<'a> = serde_json::from_slice(line)
            .map_err(|e| GatewayError::BulkParse(format!("invalid meta line: {}", e)))?;

        let (action, target) = if let Some(t) = meta.index {
            (BulkAction::Index, t)
        } else if let Some(t) = meta.create {
            (BulkAction::Create, t)
        } else if let Some(t) = meta.update {
            (BulkAction::Update, t)
        } else if let Some(t) = meta.delete {
            (BulkAction::Delete, t)
        } else {
            return Err(GatewayError::BulkParse(
                "meta line carries no known action".to_string(),
            ));
        };

        Ok(BulkEvent::Meta {
            raw: line,
            action,
            index: target.index,
            doc_type: target.doc_type,
            id: target.id,
        })
    }
}

impl<'a> Iterator for BulkWalker<'a> {
    type Item = Result<BulkEvent<'a>, GatewayError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let line = self.next_line()?;

            if self.skip_next {
                self.skip_next = false;
                continue;
            }
            if let Some(filter) = self.line_filter.as_mut() {
                if filter(line) {
                    self.skip_next = true;
                }
            }

            if self.expect_payload {
                self.expect_payload = false;
                return Some(Ok(BulkEvent::Payload { raw: line }));
            }

            match Self::parse_meta(line) {
                Ok(event) => {
                    if let BulkEvent::Meta { action, .. } = &event {
                        self.expect_payload = action.has_payload();
                    }
                    return Some(Ok(event));
                }
                Err(e) => {
                    if self.safety_parse {
                        self.failed = true;
                        return Some(Err(e));
                    }
                    // tolerant mode: drop the unparseable line and move on
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"{\"index\":{\"_index\":\"logs\",\"_type\":\"doc\",\"_id\":\"1\"}}\n{\"field\":1}\n{\"delete\":{\"_index\":\"logs\",\"_id\":\"2\"}}\n{\"create\":{\"_index\":\"logs\",\"_id\":\"3\"}}\n{\"field\":3}\n";

    fn collect(body: &[u8], safety_parse: bool) -> Vec<Result<BulkEvent<'_>, GatewayError>> {
        BulkWalker::new(body, safety_parse).collect()
    }

    #[test]
    fn test_meta_payload_pairing() {
        let events = collect(BODY, true);
        assert_eq!(events.len(), 5);

        match events[0].as_ref().unwrap() {
            BulkEvent::Meta {
                action, index, id, ..
            } => {
                assert_eq!(*action, BulkAction::Index);
                assert_eq!(index.as_deref(), Some("logs"));
                assert_eq!(id.as_deref(), Some("1"));
            }
            other => panic!("expected meta, got {:?}", other),
        }
        assert!(matches!(
            events[1].as_ref().unwrap(),
            BulkEvent::Payload { .. }
        ));
        // delete has no payload: next event is the create meta
        match events[2].as_ref().unwrap() {
            BulkEvent::Meta { action, .. } => assert_eq!(*action, BulkAction::Delete),
            other => panic!("expected delete meta, got {:?}", other),
        }
        match events[3].as_ref().unwrap() {
            BulkEvent::Meta { action, .. } => assert_eq!(*action, BulkAction::Create),
            other => panic!("expected create meta, got {:?}", other),
        }
        assert!(matches!(
            events[4].as_ref().unwrap(),
            BulkEvent::Payload { .. }
        ));
    }

    #[test]
    fn test_round_trip_reassembly() {
        let mut out = Vec::new();
        for event in BulkWalker::new(BODY, true) {
            let raw = match event.unwrap() {
                BulkEvent::Meta { raw, .. } => raw,
                BulkEvent::Payload { raw } => raw,
            };
            out.extend_from_slice(raw);
            out.push(b'\n');
        }
        assert_eq!(out.as_slice(), BODY);
    }

    #[test]
    fn test_optional_fields_absent() {
        let body = b"{\"index\":{}}\n{\"f\":1}\n";
        let events = collect(body, true);
        match events[0].as_ref().unwrap() {
            BulkEvent::Meta {
                index,
                doc_type,
                id,
                ..
            } => {
                assert!(index.is_none());
                assert!(doc_type.is_none());
                assert!(id.is_none());
            }
            other => panic!("expected meta, got {:?}", other),
        }
    }

    #[test]
    fn test_escaped_id_is_unescaped() {
        let body = b"{\"index\":{\"_id\":\"a\\\"b\"}}\n{\"f\":1}\n";
        let events = collect(body, true);
        match events[0].as_ref().unwrap() {
            BulkEvent::Meta { id, .. } => assert_eq!(id.as_deref(), Some("a\"b")),
            other => panic!("expected meta, got {:?}", other),
        }
    }

    #[test]
    fn test_safety_parse_aborts_on_malformed_meta() {
        let body = b"not-json\n{\"index\":{}}\n{\"f\":1}\n";
        let mut walker = BulkWalker::new(body, true);
        assert!(walker.next().unwrap().is_err());
        assert!(walker.next().is_none());
    }

    #[test]
    fn test_tolerant_mode_skips_malformed_meta() {
        let body = b"not-json\n{\"index\":{\"_id\":\"1\"}}\n{\"f\":1}\n";
        let events = collect(body, false);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            BulkEvent::Meta { .. }
        ));
    }

    #[test]
    fn test_line_filter_skips_next_line() {
        // the filter flags the first meta, so its payload line is dropped raw
        let mut seen = 0;
        let walker = BulkWalker::new(BODY, true).with_line_filter(move |_line| {
            seen += 1;
            seen == 1
        });
        let events: Vec<_> = walker.collect();
        // first meta still yields an event; its payload line was consumed by
        // the skip, so the walker then expects a payload and takes the delete
        // meta line as raw payload bytes
        assert!(matches!(
            events[0].as_ref().unwrap(),
            BulkEvent::Meta { .. }
        ));
        assert!(matches!(
            events[1].as_ref().unwrap(),
            BulkEvent::Payload { .. }
        ));
    }

    #[test]
    fn test_missing_trailing_newline() {
        let body = b"{\"delete\":{\"_id\":\"9\"}}";
        let events = collect(body, true);
        assert_eq!(events.len(), 1);
        match events[0].as_ref().unwrap() {
            BulkEvent::Meta { action, id, .. } => {
                assert_eq!(*action, BulkAction::Delete);
                assert_eq!(id.as_deref(), Some("9"));
            }
            other => panic!("expected meta, got {:?}", other),
        }
    }
}
