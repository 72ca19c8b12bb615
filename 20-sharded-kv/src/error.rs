//! Error types for each component boundary.
//!
//! Per-request failures that a caller is expected to handle (a duplicate key, an
//! unreachable node) are not errors here; they are the `Rejected` arms of
//! [`crate::store::PutOutcome`] and [`crate::router::RouteOutcome`]. The enums below
//! cover malformed wire data and local faults that must not be silently swallowed.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{Key, NodeId};

/// A line on the wire (or in a log) did not follow the request/response grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("line has no space between key and value")]
    MissingSeparator,

    #[error("key '{0}' is not an integer")]
    InvalidKey(String),

    #[error("value must not contain line breaks")]
    InvalidValue,

    #[error("unrecognized response line '{0}'")]
    UnknownResponse(String),
}

/// Faults raised by a node's durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("log file {} is not usable: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("key {key} appears twice in the log (line {line})")]
    DuplicateOnReplay { key: Key, line: usize },

    #[error("log file {} is corrupt at line {line}: {reason}", path.display())]
    CorruptLog {
        path: PathBuf,
        line: usize,
        reason: ProtocolError,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Why a node did not accept a write the router relayed to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("node at {endpoint} already holds this key")]
    DuplicateKey { endpoint: String },

    #[error("failed to reach node at {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    #[error("node at {endpoint} did not answer within {timeout_ms} ms")]
    Timeout { endpoint: String, timeout_ms: u64 },

    #[error("node at {endpoint} sent an unexpected reply: {message}")]
    Protocol { endpoint: String, message: String },

    #[error("node at {endpoint} refused the write: {message}")]
    Remote { endpoint: String, message: String },
}

/// Local faults raised by the router. These are fatal for the call that hit them.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("mapping file {} is not usable: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("key {key} is mapped twice in the mapping file (line {line})")]
    DuplicateMapping { key: Key, line: usize },

    #[error("mapping for key {key} names node {node} but the cluster has {node_count} nodes")]
    UnknownNode {
        key: Key,
        node: NodeId,
        node_count: usize,
    },

    #[error("mapping file {} is corrupt at line {line}: {reason}", path.display())]
    CorruptMappings {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// The cluster configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read cluster config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse cluster config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cluster must contain at least one node")]
    NoNodes,

    #[error("node endpoint '{0}' must look like host:port")]
    InvalidEndpoint(String),
}
