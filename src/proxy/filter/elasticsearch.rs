use crate::proxy::context::RequestContext;
use crate::upstream::ReverseProxy;
use std::sync::Arc;

/// Terminal filter: hands the request to the cluster's reverse proxy.
pub struct ElasticsearchFilter {
    proxy: Arc<ReverseProxy>,
}

impl ElasticsearchFilter {
    pub fn new(proxy: Arc<ReverseProxy>) -> Self {
        Self { proxy }
    }

    pub async fn filter(&self, ctx: &mut RequestContext) {
        self.proxy.delegate(ctx).await;
    }
}
