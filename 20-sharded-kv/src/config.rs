//! Fixed cluster topology shared by every router process.
//!
//! The position of an endpoint in [`ClusterConfig::nodes`] is its [`NodeId`]. Reordering
//! or resizing the list changes where keys route, so it must stay fixed for the lifetime
//! of the stored data.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{NodeId, error::ConfigError};

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

const DEFAULT_NODES: [&str; 3] = ["127.0.0.1:5000", "127.0.0.1:5001", "127.0.0.1:5002"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// `host:port` per node, indexed by node id.
    pub nodes: Vec<String>,

    /// Bound on connect, write, and read when the router talks to a node.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: DEFAULT_NODES.iter().map(|node| node.to_string()).collect(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl ClusterConfig {
    pub fn new(nodes: Vec<String>) -> Result<Self, ConfigError> {
        let config = Self {
            nodes,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads a JSON config such as `{"nodes": ["127.0.0.1:5000"], "timeout_ms": 2000}`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::NoNodes);
        }
        for node in &self.nodes {
            endpoint_port(node)?;
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn endpoint(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(node.0).map(String::as_str)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Extracts the port from a `host:port` endpoint.
pub fn endpoint_port(endpoint: &str) -> Result<u16, ConfigError> {
    endpoint
        .rsplit_once(':')
        .filter(|(host, _)| !host.is_empty())
        .and_then(|(_, port)| port.parse().ok())
        .ok_or_else(|| ConfigError::InvalidEndpoint(endpoint.to_string()))
}
