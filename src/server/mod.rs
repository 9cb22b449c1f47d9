pub mod bootstrap;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::limiter::LimiterRegistry;
use crate::proxy::context::{RequestContext, StoredRequest};
use crate::proxy::filter::{build_flow, FilterFlow, SharedServices};
use crate::upstream::{ReverseProxy, SharedTopology, TopologyProvider};
use anyhow::Result;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Shared gateway state, cheaply cloneable. Built once at bootstrap; the
/// flows and cluster proxies it holds live for the process lifetime.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub services: Arc<SharedServices>,
    pub flows: Arc<HashMap<String, Arc<FilterFlow>>>,
    pub entry: Arc<FilterFlow>,
    pub topologies: Arc<HashMap<String, Arc<SharedTopology>>>,
}

impl GatewayState {
    /// Compile clusters and flows from config. Fails on any construction
    /// error — a gateway with a half-built pipeline must not start.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        config.validate()?;
        let config = Arc::new(config);
        let limiters = Arc::new(LimiterRegistry::new());

        let mut proxies = HashMap::new();
        let mut topologies = HashMap::new();
        for cluster_cfg in &config.clusters {
            let topology = Arc::new(SharedTopology::new());
            let proxy = ReverseProxy::new(
                Arc::new(cluster_cfg.clone()),
                topology.clone() as Arc<dyn TopologyProvider>,
                limiters.clone(),
            )?;
            topologies.insert(cluster_cfg.name.clone(), topology);
            proxies.insert(cluster_cfg.name.clone(), Arc::new(proxy));
        }

        let services = Arc::new(SharedServices::new(proxies, limiters));

        // flows are compiled in declaration order so a retry flow can only
        // reference an earlier definition (no cycles by construction)
        let mut flows: HashMap<String, Arc<FilterFlow>> = HashMap::new();
        for flow_cfg in &config.flows {
            let flow = build_flow(flow_cfg, &services, &flows)?;
            flows.insert(flow_cfg.name.clone(), Arc::new(flow));
        }

        let entry = flows
            .get(&config.entry_flow)
            .cloned()
            .unwrap_or_else(|| Arc::new(FilterFlow::new(config.entry_flow.clone(), Vec::new())));

        Ok(Self {
            config,
            services,
            flows: Arc::new(flows),
            entry,
            topologies: Arc::new(topologies),
        })
    }
}

/// One request end-to-end: buffer the body, run the entry flow, emit the
/// context's response.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let body = body.collect().await?.to_bytes();

    let mut ctx = RequestContext::new(StoredRequest {
        method: parts.method,
        uri,
        headers: parts.headers,
        body,
    });

    state.entry.run(&mut ctx).await;

    let mut builder = Response::builder().status(ctx.response.status);
    for (name, value) in ctx.response.headers.iter() {
        builder = builder.header(name, value);
    }
    let response = builder
        .body(Full::new(ctx.response.body.clone()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())));
    Ok(response)
}

/// Accept loop with graceful shutdown: on notify, stop accepting and let
/// in-flight connections run out.
pub async fn run_proxy_server(
    listen: &str,
    state: GatewayState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: proxy listening, addr={}", addr);

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: stop accepting new connections");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: accept failed, error={}", e);
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let state_inner = state.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state_inner.clone();
                async move { handle_request(req, state).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: connection error, peer={}, error={}", peer_addr, e);
                }
            }
        });
    }

    Ok(())
}
