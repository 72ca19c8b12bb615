//! Client-side key router.
//!
//! The router owns the only copy of the assignment cache for its process. A key is
//! assigned once: after a node accepts it, the `(key, node)` pair is cached and appended
//! to the mapping file, and any later write of the same key is refused locally without
//! touching the network.
//!
//! The cache is not reconciled with node state. If it is lost (fresh mapping file) a
//! repeated key still reaches its node and comes back as
//! [`NodeError::DuplicateKey`], which is reported rather than repaired.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};

use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    Key, NodeId,
    config::{ClusterConfig, endpoint_port},
    error::{NodeError, RouterError},
    protocol::{Request, Response, read_line, write_line},
};

pub const DEFAULT_MAPPINGS_FILE: &str = "mappings.txt";

/// Result of relaying one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Stored(NodeId),
    Rejected(RouteRejection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteRejection {
    /// The key is already in this router's cache.
    AlreadyAssigned { node: NodeId },
    /// The value contains a line break and cannot be framed.
    InvalidValue,
    NodeError(NodeError),
}

/// Owning node of `key` in a cluster of `node_count` nodes.
///
/// The hash is the key's two's-complement bit pattern, so the result depends only on
/// the key and the cluster size and never on the process, platform, or toolchain.
///
/// # Panics
///
/// Panics if `node_count` is zero. [`Router`] only calls this with the size of a
/// validated [`ClusterConfig`], which always has at least one node.
pub fn route(key: Key, node_count: usize) -> NodeId {
    assert!(node_count > 0, "cluster must have at least one node");
    NodeId((key as u64 % node_count as u64) as usize)
}

pub struct Router {
    config: ClusterConfig,
    ports: Vec<u16>,
    assignments: HashMap<Key, NodeId>,
    mappings_path: PathBuf,
}

impl Router {
    /// Creates a router for `config` and replays the mapping file at `mappings_path`.
    pub async fn open(
        config: ClusterConfig,
        mappings_path: impl AsRef<Path>,
    ) -> Result<Self, RouterError> {
        config.validate()?;
        let ports = config
            .nodes
            .iter()
            .map(|node| endpoint_port(node))
            .collect::<Result<Vec<_>, _>>()?;

        let mut router = Self {
            config,
            ports,
            assignments: HashMap::new(),
            mappings_path: mappings_path.as_ref().to_path_buf(),
        };
        router.load_mappings().await?;

        info!(
            nodes = router.node_count(),
            assignments = router.assignments.len(),
            mappings = %router.mappings_path.display(),
            "router ready"
        );
        Ok(router)
    }

    pub fn route(&self, key: Key) -> NodeId {
        route(key, self.config.node_count())
    }

    /// Relays `key`/`value` to the owning node and records the assignment on success.
    ///
    /// Node-side refusals and network faults come back as
    /// [`RouteRejection::NodeError`] and leave the cache and mapping file unchanged.
    /// An `Err` means the node accepted the key but the mapping could not be
    /// persisted; the key stays cached so this process will not resend it.
    pub async fn put(&mut self, key: Key, value: &str) -> Result<RouteOutcome, RouterError> {
        if let Some(&node) = self.assignments.get(&key) {
            debug!(key, node = %node, "key already assigned");
            return Ok(RouteOutcome::Rejected(RouteRejection::AlreadyAssigned {
                node,
            }));
        }

        let Ok(request) = Request::new(key, value) else {
            return Ok(RouteOutcome::Rejected(RouteRejection::InvalidValue));
        };

        let node = self.route(key);
        if let Err(err) = self.send(node, &request).await {
            warn!(key, node = %node, error = %err, "node did not store key");
            return Ok(RouteOutcome::Rejected(RouteRejection::NodeError(err)));
        }

        self.assignments.insert(key, node);
        self.append_mapping(key, node)
            .await
            .map_err(|source| RouterError::Io {
                path: self.mappings_path.clone(),
                source,
            })?;

        info!(key, node = %node, "assignment recorded");
        Ok(RouteOutcome::Stored(node))
    }

    /// One request/response exchange with `node`, bounded by the configured timeout.
    async fn send(&self, node: NodeId, request: &Request) -> Result<(), NodeError> {
        let endpoint = self.endpoint(node).to_string();
        let io_timeout = self.config.timeout();

        let exchange = async {
            let connection_error = |err: io::Error| NodeError::Connection {
                endpoint: endpoint.clone(),
                message: err.to_string(),
            };

            let stream = TcpStream::connect(endpoint.as_str())
                .await
                .map_err(connection_error)?;
            let (reader, mut writer) = stream.into_split();
            write_line(&mut writer, &request.encode())
                .await
                .map_err(connection_error)?;

            let mut reader = BufReader::new(reader);
            let line = read_line(&mut reader).await.map_err(connection_error)?;
            line.ok_or_else(|| NodeError::Protocol {
                endpoint: endpoint.clone(),
                message: "connection closed without a response".to_string(),
            })
        };

        let line = timeout(io_timeout, exchange)
            .await
            .map_err(|_| NodeError::Timeout {
                endpoint: endpoint.clone(),
                timeout_ms: self.config.timeout_ms,
            })??;

        match Response::parse(&line) {
            Ok(Response::Stored { key, .. }) if key == request.key => Ok(()),
            Ok(Response::DuplicateKey { .. }) => Err(NodeError::DuplicateKey { endpoint }),
            Ok(Response::Stored { .. }) => Err(NodeError::Protocol {
                endpoint,
                message: format!("acknowledged a different key: '{line}'"),
            }),
            Ok(other) => Err(NodeError::Remote {
                endpoint,
                message: other.encode(),
            }),
            Err(err) => Err(NodeError::Protocol {
                endpoint,
                message: err.to_string(),
            }),
        }
    }

    async fn append_mapping(&self, key: Key, node: NodeId) -> io::Result<()> {
        let line = format!("{key} Node {node} {}\n", self.ports[node.0]);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.mappings_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await
    }

    /// Rebuilds the cache from the mapping file.
    ///
    /// The file should never map a key twice, so a repeated key is treated as
    /// corruption rather than resolved by last-write-wins. A node id outside the
    /// cluster is rejected too. A node id that disagrees with [`Router::route`] means
    /// the file was written for a different cluster size; it is loaded as recorded and
    /// logged.
    pub async fn load_mappings(&mut self) -> Result<(), RouterError> {
        let path = self.mappings_path.clone();
        let io_error = |source| RouterError::Io {
            path: path.clone(),
            source,
        };

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.assignments.clear();
                return Ok(());
            }
            Err(err) => return Err(io_error(err)),
        };

        let mut assignments = HashMap::new();
        let mut lines = BufReader::new(file).lines();
        let mut line_no = 0;
        while let Some(line) = lines.next_line().await.map_err(io_error)? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            let (key, node) =
                parse_mapping(&line).map_err(|reason| RouterError::CorruptMappings {
                    path: path.clone(),
                    line: line_no,
                    reason,
                })?;

            if node.0 >= self.node_count() {
                return Err(RouterError::UnknownNode {
                    key,
                    node,
                    node_count: self.node_count(),
                });
            }
            if assignments.insert(key, node).is_some() {
                return Err(RouterError::DuplicateMapping { key, line: line_no });
            }
            if node != self.route(key) {
                warn!(
                    key,
                    recorded = %node,
                    expected = %self.route(key),
                    "mapping was written for a different cluster size"
                );
            }
        }

        self.assignments = assignments;
        Ok(())
    }

    pub fn node_for(&self, key: Key) -> Option<NodeId> {
        self.assignments.get(&key).copied()
    }

    pub fn assignments(&self) -> &HashMap<Key, NodeId> {
        &self.assignments
    }

    pub fn endpoint(&self, node: NodeId) -> &str {
        &self.config.nodes[node.0]
    }

    pub fn port(&self, node: NodeId) -> u16 {
        self.ports[node.0]
    }

    pub fn node_count(&self) -> usize {
        self.config.node_count()
    }
}

/// Parses `"<key> Node <nodeId> <port>"`.
fn parse_mapping(line: &str) -> Result<(Key, NodeId), String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let [key, "Node", node, port] = parts.as_slice() else {
        return Err(format!("expected '<key> Node <id> <port>', got '{line}'"));
    };

    let key = key
        .parse()
        .map_err(|_| format!("key '{key}' is not an integer"))?;
    let node = node
        .parse()
        .map_err(|_| format!("node id '{node}' is not an integer"))?;
    port.parse::<u16>()
        .map_err(|_| format!("port '{port}' is not a valid port"))?;

    Ok((key, NodeId(node)))
}
