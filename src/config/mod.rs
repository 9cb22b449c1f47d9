pub mod types;

pub use types::*;

use crate::error::GatewayError;
use std::collections::HashSet;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — the gateway can start with zero configuration for local
    /// development.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| GatewayError::Config(format!("failed to read {}: {}", path.display(), e)))?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)
                    .map_err(|e| GatewayError::Config(format!("invalid toml: {}", e)))?,
                Some("json") => serde_json::from_str(&content)
                    .map_err(|e| GatewayError::Config(format!("invalid json: {}", e)))?,
                Some(ext) => {
                    return Err(GatewayError::Config(format!(
                        "unsupported config format: .{ext}, use .toml or .json"
                    )))
                }
                None => {
                    return Err(GatewayError::Config(
                        "config file has no extension, use .toml or .json".to_string(),
                    ))
                }
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!("loaded gateway configuration");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SEARCHGATE_LISTEN") {
            self.listen = v;
        }
        if let Ok(v) = std::env::var("SEARCHGATE_ENTRY_FLOW") {
            self.entry_flow = v;
        }
    }

    /// Construction-time validation. Any failure here is fatal: a flow that
    /// does not validate is never registered.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let mut cluster_names = HashSet::new();
        for cluster in &self.clusters {
            if cluster.name.is_empty() {
                return Err(GatewayError::Config("cluster without a name".to_string()));
            }
            if cluster.host.is_empty() {
                return Err(GatewayError::Config(format!(
                    "cluster [{}] has no seed host",
                    cluster.name
                )));
            }
            if !cluster_names.insert(cluster.name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate cluster name [{}]",
                    cluster.name
                )));
            }
        }

        let mut flow_names = HashSet::new();
        for flow in &self.flows {
            if flow.name.is_empty() {
                return Err(GatewayError::Config("flow without a name".to_string()));
            }
            if !flow_names.insert(flow.name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate flow name [{}]",
                    flow.name
                )));
            }
        }

        for flow in &self.flows {
            for filter in &flow.filters {
                match filter {
                    FilterConfig::Elasticsearch(cfg) => {
                        if !cluster_names.contains(cfg.elasticsearch.as_str()) {
                            return Err(GatewayError::Config(format!(
                                "flow [{}] references unknown cluster [{}]",
                                flow.name, cfg.elasticsearch
                            )));
                        }
                    }
                    FilterConfig::BulkResponseProcess(cfg) => {
                        if cfg.partial_failure_retry
                            && !cfg.retry_flow.is_empty()
                            && !flow_names.contains(cfg.retry_flow.as_str())
                        {
                            return Err(GatewayError::Config(format!(
                                "flow [{}] references unknown retry flow [{}]",
                                flow.name, cfg.retry_flow
                            )));
                        }
                    }
                    FilterConfig::HashMod(cfg) => {
                        if cfg.partition_size == 0 {
                            return Err(GatewayError::Config(format!(
                                "flow [{}]: hash_mod partition size must be >= 1",
                                flow.name
                            )));
                        }
                    }
                    _ => {}
                }
            }
        }

        if !self.flows.is_empty() && !flow_names.contains(self.entry_flow.as_str()) {
            return Err(GatewayError::Config(format!(
                "entry flow [{}] is not defined",
                self.entry_flow
            )));
        }

        Ok(())
    }
}
