use crate::config::NodeFilterConfig;
use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// One cluster node as reported by the metadata source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    /// `http.publish_address`; nodes without one never receive traffic.
    #[serde(default)]
    pub http_publish_address: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Point-in-time view of the cluster published by the metadata source.
/// `version` is monotone; an unchanged version short-circuits pool rebuilds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologySnapshot {
    #[serde(default)]
    pub nodes: Vec<NodeInfo>,
    #[serde(default)]
    pub version: i64,
}

/// Source of cluster metadata. The polling that feeds it belongs to the
/// external scheduler; the pool only ever reads the latest snapshot.
pub trait TopologyProvider: Send + Sync {
    fn metadata(&self) -> Option<TopologySnapshot>;
}

/// Provider backed by an atomically swapped snapshot slot.
pub struct SharedTopology {
    snapshot: ArcSwapOption<TopologySnapshot>,
}

impl Default for SharedTopology {
    fn default() -> Self {
        Self {
            snapshot: ArcSwapOption::empty(),
        }
    }
}

impl SharedTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: TopologySnapshot) {
        self.snapshot.store(Some(Arc::new(snapshot)));
    }

    pub fn clear(&self) {
        self.snapshot.store(None);
    }
}

impl TopologyProvider for SharedTopology {
    fn metadata(&self) -> Option<TopologySnapshot> {
        self.snapshot.load_full().map(|s| (*s).clone())
    }
}

/// Decide whether a node may receive proxied traffic.
///
/// Three rule families run in order (hosts, roles, tags); within each:
/// any exclude match rejects, any include match accepts, and a family with
/// includes but no excludes rejects everything unmatched (allow-list mode).
/// A family that stays silent passes the node to the next one.
pub fn node_passes_filter(node: &NodeInfo, filter: &NodeFilterConfig) -> bool {
    let endpoint = match node.http_publish_address.as_deref() {
        Some(addr) if !addr.is_empty() => addr,
        _ => return false,
    };

    for v in &filter.hosts.exclude {
        if endpoint == v {
            tracing::debug!("topology: host in exclude list, endpoint={}", endpoint);
            return false;
        }
    }
    for v in &filter.hosts.include {
        if endpoint == v {
            tracing::debug!("topology: host in include list, endpoint={}", endpoint);
            return true;
        }
    }
    if filter.hosts.exclude.is_empty() && !filter.hosts.include.is_empty() {
        return false;
    }

    for v in &filter.roles.exclude {
        if node.roles.iter().any(|r| r == v) {
            tracing::debug!(
                "topology: role matches exclude rule, endpoint={}, role={}",
                endpoint,
                v
            );
            return false;
        }
    }
    for v in &filter.roles.include {
        if node.roles.iter().any(|r| r == v) {
            tracing::debug!(
                "topology: role matches include rule, endpoint={}, role={}",
                endpoint,
                v
            );
            return true;
        }
    }
    if filter.roles.exclude.is_empty() && !filter.roles.include.is_empty() {
        return false;
    }

    for rule in &filter.tags.exclude {
        for (k, v) in rule {
            if node.attributes.get(k) == Some(v) {
                tracing::debug!(
                    "topology: tag in exclude list, endpoint={}, tag={}:{}",
                    endpoint,
                    k,
                    v
                );
                return false;
            }
        }
    }
    for rule in &filter.tags.include {
        for (k, v) in rule {
            if node.attributes.get(k) == Some(v) {
                tracing::debug!(
                    "topology: tag in include list, endpoint={}, tag={}:{}",
                    endpoint,
                    k,
                    v
                );
                return true;
            }
        }
    }
    if filter.tags.exclude.is_empty() && !filter.tags.include.is_empty() {
        return false;
    }

    true
}
