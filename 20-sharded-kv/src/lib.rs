//! Hash-sharded key-value store built from a client-side router and single-write nodes.
//!
//! Each node owns one shard: an in-memory map backed by an append-only log, served over
//! a plain-text TCP protocol that carries exactly one write per connection. The router
//! picks the owning node with `hash(key) mod N`, relays the write, and remembers every
//! successful assignment in its own append-only mapping file.
//!
//! - [`protocol`] defines the request/response lines and async framing helpers.
//! - [`store`] holds a node's records and enforces at-most-once writes per key.
//! - [`server`] runs the accept loop that exposes a store over TCP.
//! - [`router`] computes assignments, talks to nodes, and persists mappings.
//! - [`config`] describes the fixed cluster topology.
//! - [`cli`] and [`shell`] drive the `node` and `router` subcommands of the binary.
//!
//! Keys are never updated or deleted, and the cluster size is fixed for the lifetime of
//! the data: changing N makes previously stored keys unreachable through the router.

use std::fmt;

pub mod cli;
pub mod config;
pub mod error;
pub mod protocol;
pub mod router;
pub mod server;
pub mod shell;
pub mod store;

/// Keys are signed integers, unique across the whole cluster once accepted.
pub type Key = i64;

/// Index of a node in the cluster configuration, in `[0, N)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
