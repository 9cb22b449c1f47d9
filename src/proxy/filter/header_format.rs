use crate::proxy::context::RequestContext;

/// Mirrors request headers onto the response with normalized (lowercase)
/// names, for clients that diagnose routing from the echoed header set.
pub struct HeaderFormatFilter;

impl HeaderFormatFilter {
    pub fn new() -> Self {
        Self
    }

    pub fn filter(&self, ctx: &mut RequestContext) {
        let pairs: Vec<_> = ctx
            .request
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        for (name, value) in pairs {
            ctx.response.headers.insert(name, value);
        }
    }
}

impl Default for HeaderFormatFilter {
    fn default() -> Self {
        Self::new()
    }
}
