use crate::config::ClusterConfig;
use crate::error::GatewayError;
use crate::upstream::balancer::WeightedBalancer;
use crate::upstream::topology::{node_passes_filter, TopologyProvider};
use arc_swap::ArcSwap;
use bytes::Bytes;
use http_body_util::Full;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rand::Rng;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// A rustls `ServerCertVerifier` that accepts any certificate without
/// validation. Used when `tls_insecure_skip_verify` is set — the common case
/// for clusters running self-signed certificates.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Immutable endpoint descriptor discovered from metadata or config.
#[derive(Debug, Clone)]
pub struct UpstreamEndpoint {
    pub address: String,
    pub is_tls: bool,
    pub weight: u32,
}

/// One generation of the pool. Published wholesale through an atomic store;
/// `clients`, `endpoints` and the balancer always describe the same node set.
#[derive(Debug)]
pub struct PoolState {
    pub clients: Vec<HttpClient>,
    pub endpoints: Vec<UpstreamEndpoint>,
    pub balancer: WeightedBalancer,
}

/// Per-cluster pool of long-lived upstream HTTP clients.
///
/// `refresh` rebuilds the pool from the metadata provider; in-flight
/// requests keep the client they captured, readers observe either the old
/// or the new generation, never a mix.
pub struct ClientPool {
    config: Arc<ClusterConfig>,
    provider: Arc<dyn TopologyProvider>,
    state: ArcSwap<PoolState>,
    last_version: AtomicI64,
    failures: AtomicU64,
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("last_version", &self.last_version)
            .field("failures", &self.failures)
            .finish_non_exhaustive()
    }
}

impl ClientPool {
    pub fn new(
        config: Arc<ClusterConfig>,
        provider: Arc<dyn TopologyProvider>,
    ) -> Result<Self, GatewayError> {
        if config.host.is_empty() {
            return Err(GatewayError::Config(format!(
                "cluster [{}] has no seed host",
                config.name
            )));
        }
        let pool = Self {
            config,
            provider,
            state: ArcSwap::from_pointee(PoolState {
                clients: Vec::new(),
                endpoints: Vec::new(),
                balancer: WeightedBalancer::new(&[1]),
            }),
            last_version: AtomicI64::new(i64::MIN),
            failures: AtomicU64::new(0),
        };
        pool.refresh(true)?;
        Ok(pool)
    }

    /// Rebuild the pool from current metadata.
    ///
    /// No metadata and `!force` is a no-op. An unchanged topology version
    /// leaves the current generation untouched (pointer identity). A rebuild
    /// that would yield zero clients reports an upstream failure and keeps
    /// the previous generation in force.
    pub fn refresh(&self, force: bool) -> Result<(), GatewayError> {
        trace!("upstream: refreshing nodes, cluster={}", self.config.name);
        let metadata = self.provider.metadata();
        if metadata.is_none() && !force {
            trace!("upstream: no metadata and not forced, skipping refresh");
            return Ok(());
        }

        let mut endpoints: Vec<String> = Vec::new();
        let mut checked_metadata = false;
        if let Some(meta) = &metadata {
            if !meta.nodes.is_empty() {
                if self.last_version.load(Ordering::Acquire) == meta.version {
                    trace!(
                        "upstream: topology version unchanged, cluster={}, version={}",
                        self.config.name,
                        meta.version
                    );
                    return Ok(());
                }
                checked_metadata = true;
                for node in &meta.nodes {
                    if !node_passes_filter(node, &self.config.filter) {
                        continue;
                    }
                    if let Some(addr) = node.http_publish_address.as_deref() {
                        endpoints.push(addr.to_string());
                    }
                }
                debug!(
                    "upstream: discovered {} node(s), cluster={}",
                    endpoints.len(),
                    self.config.name
                );
            }
        }

        if endpoints.is_empty() {
            endpoints.push(self.config.host.clone());
            if checked_metadata {
                warn!(
                    "upstream: no valid endpoint for cluster [{}], fallback to seed [{}]",
                    self.config.name, self.config.host
                );
            }
        }

        let mut clients = Vec::with_capacity(endpoints.len());
        let mut resolved = Vec::with_capacity(endpoints.len());
        let mut weights = Vec::with_capacity(endpoints.len());
        for address in endpoints {
            let weight = self
                .config
                .weights
                .get(&address)
                .copied()
                .filter(|&w| w > 0)
                .unwrap_or(1);
            clients.push(build_node_client(&self.config));
            weights.push(weight);
            resolved.push(UpstreamEndpoint {
                address,
                is_tls: self.config.tls,
                weight,
            });
        }

        if clients.is_empty() {
            error!("upstream: pool rebuild yielded no clients, cluster={}", self.config.name);
            self.report_failure();
            return Err(GatewayError::NoUpstream);
        }

        let old: Vec<String> = self
            .state
            .load()
            .endpoints
            .iter()
            .map(|e| e.address.clone())
            .collect();
        let new: Vec<&str> = resolved.iter().map(|e| e.address.as_str()).collect();
        info!(
            "upstream: cluster [{}] endpoints: [{}] => [{}]",
            self.config.name,
            old.join(", "),
            new.join(", ")
        );

        self.state.store(Arc::new(PoolState {
            balancer: WeightedBalancer::new(&weights),
            clients,
            endpoints: resolved,
        }));
        if checked_metadata {
            if let Some(meta) = &metadata {
                self.last_version.store(meta.version, Ordering::Release);
            }
        }
        metrics::counter!(
            "gateway_topology_refresh_total",
            "cluster" => self.config.name.clone(),
        )
        .increment(1);
        Ok(())
    }

    /// Pick a client by weight. Falls back to a uniform random pick when the
    /// balancer's index and the client list disagree (a bug-class guard, not
    /// an expected path).
    pub fn get_client(&self) -> Option<(HttpClient, String)> {
        let state = self.state.load();
        if state.clients.is_empty() {
            error!("upstream: no upstream found, cluster={}", self.config.name);
            return None;
        }

        let mut idx = state.balancer.distribute();
        if idx >= state.clients.len() || state.clients.len() != state.endpoints.len() {
            warn!(
                "upstream: balancer offset desynchronized ({} vs {}), random pick, cluster={}",
                idx,
                state.clients.len(),
                self.config.name
            );
            idx = rand::thread_rng().gen_range(0..state.clients.len());
        }

        let endpoint = state
            .endpoints
            .get(idx)
            .map(|e| e.address.clone())
            .unwrap_or_default();
        Some((state.clients[idx].clone(), endpoint))
    }

    /// Current generation, for inspection and pointer-identity assertions.
    pub fn state(&self) -> Arc<PoolState> {
        self.state.load_full()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Signal consumed by the circuit breaker sitting above this component.
    pub fn report_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "gateway_upstream_failures_total",
            "cluster" => self.config.name.clone(),
        )
        .increment(1);
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// One pooled client per endpoint, configured from the cluster's pool and
/// timeout settings. Plain and TLS upstreams share the connector stack; TLS
/// verification is skipped when the cluster says so.
fn build_node_client(cfg: &ClusterConfig) -> HttpClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    if cfg.max_conn_wait_timeout > 0.0 {
        http.set_connect_timeout(Some(Duration::from_secs_f64(cfg.max_conn_wait_timeout)));
    }
    http.enforce_http(false);

    let https = if !cfg.tls_insecure_skip_verify {
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    } else {
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();

        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    };

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs_f64(cfg.max_idle_conn_duration.max(1.0)))
        .pool_max_idle_per_host(cfg.max_connection)
        .build(https)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListRule;
    use crate::upstream::topology::{NodeInfo, SharedTopology, TopologySnapshot};

    fn cluster(name: &str) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            host: "127.0.0.1:9200".to_string(),
            ..Default::default()
        }
    }

    fn data_node(addr: &str, role: &str) -> NodeInfo {
        NodeInfo {
            http_publish_address: Some(addr.to_string()),
            roles: vec![role.to_string()],
            attributes: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_seed_fallback_without_metadata() {
        let pool = ClientPool::new(Arc::new(cluster("c1")), Arc::new(SharedTopology::new())).unwrap();
        let state = pool.state();
        assert_eq!(state.endpoints.len(), 1);
        assert_eq!(state.endpoints[0].address, "127.0.0.1:9200");
        assert_eq!(state.clients.len(), state.endpoints.len());
    }

    #[tokio::test]
    async fn test_refresh_without_metadata_not_forced_is_noop() {
        let pool = ClientPool::new(Arc::new(cluster("c1")), Arc::new(SharedTopology::new())).unwrap();
        let before = pool.state();
        pool.refresh(false).unwrap();
        assert!(Arc::ptr_eq(&before, &pool.state()));
    }

    #[tokio::test]
    async fn test_unchanged_topology_version_keeps_pool_pointer() {
        let topology = Arc::new(SharedTopology::new());
        topology.publish(TopologySnapshot {
            nodes: vec![data_node("10.0.0.1:9200", "data")],
            version: 5,
        });
        let pool = ClientPool::new(Arc::new(cluster("c1")), topology.clone()).unwrap();
        let before = pool.state();

        // same version again: pool pointer must be identical
        pool.refresh(false).unwrap();
        assert!(Arc::ptr_eq(&before, &pool.state()));

        topology.publish(TopologySnapshot {
            nodes: vec![
                data_node("10.0.0.1:9200", "data"),
                data_node("10.0.0.2:9200", "data"),
            ],
            version: 6,
        });
        pool.refresh(false).unwrap();
        let after = pool.state();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.endpoints.len(), 2);
    }

    #[tokio::test]
    async fn test_role_allow_list_filters_pool() {
        let topology = Arc::new(SharedTopology::new());
        topology.publish(TopologySnapshot {
            nodes: vec![
                data_node("10.0.0.1:9200", "data"),
                data_node("10.0.0.2:9200", "master"),
            ],
            version: 1,
        });
        let mut cfg = cluster("c1");
        cfg.filter.roles = ListRule {
            include: vec!["data".to_string()],
            exclude: vec![],
        };
        let pool = ClientPool::new(Arc::new(cfg), topology).unwrap();
        let state = pool.state();
        assert_eq!(state.endpoints.len(), 1);
        assert_eq!(state.endpoints[0].address, "10.0.0.1:9200");
    }

    #[tokio::test]
    async fn test_all_nodes_filtered_falls_back_to_seed() {
        let topology = Arc::new(SharedTopology::new());
        topology.publish(TopologySnapshot {
            nodes: vec![data_node("10.0.0.2:9200", "master")],
            version: 1,
        });
        let mut cfg = cluster("c1");
        cfg.filter.roles = ListRule {
            include: vec!["data".to_string()],
            exclude: vec![],
        };
        let pool = ClientPool::new(Arc::new(cfg), topology).unwrap();
        let state = pool.state();
        assert_eq!(state.endpoints.len(), 1);
        assert_eq!(state.endpoints[0].address, "127.0.0.1:9200");
    }

    #[tokio::test]
    async fn test_weights_default_to_one_when_unset_or_nonpositive() {
        let topology = Arc::new(SharedTopology::new());
        topology.publish(TopologySnapshot {
            nodes: vec![
                data_node("10.0.0.1:9200", "data"),
                data_node("10.0.0.2:9200", "data"),
            ],
            version: 1,
        });
        let mut cfg = cluster("c1");
        cfg.weights.insert("10.0.0.1:9200".to_string(), 3);
        cfg.weights.insert("10.0.0.2:9200".to_string(), 0);
        let pool = ClientPool::new(Arc::new(cfg), topology).unwrap();
        let state = pool.state();
        assert_eq!(state.endpoints[0].weight, 3);
        assert_eq!(state.endpoints[1].weight, 1);
    }

    #[tokio::test]
    async fn test_get_client_returns_endpoint() {
        let pool = ClientPool::new(Arc::new(cluster("c1")), Arc::new(SharedTopology::new())).unwrap();
        let (_client, endpoint) = pool.get_client().unwrap();
        assert_eq!(endpoint, "127.0.0.1:9200");
    }

    #[tokio::test]
    async fn test_empty_seed_is_config_error() {
        let mut cfg = cluster("c1");
        cfg.host.clear();
        let err = ClientPool::new(Arc::new(cfg), Arc::new(SharedTopology::new())).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
