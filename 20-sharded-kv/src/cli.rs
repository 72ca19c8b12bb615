use std::{net::IpAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::router::DEFAULT_MAPPINGS_FILE;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a storage node that accepts one write per connection.
    Node(NodeArgs),
    /// Read "<key> <value>" lines from stdin and route each write to its node.
    Router(RouterArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// TCP port to listen on. Also names the log file, node_<PORT>.log.
    pub port: u16,

    /// Interface to bind. Defaults to all interfaces.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Directory holding the node's log file.
    #[arg(long, default_value = ".")]
    pub data_dir: PathBuf,

    /// Serve each connection on its own task instead of one at a time.
    #[arg(long)]
    pub concurrent: bool,

    /// Per-connection read/write timeout in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    pub io_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct RouterArgs {
    /// Node endpoint (host:port), repeated in node-id order. Overrides --config.
    #[arg(long = "node", value_name = "HOST:PORT")]
    pub nodes: Vec<String>,

    /// JSON cluster config: {"nodes": ["host:port", ...], "timeout_ms": 5000}.
    #[arg(long, conflicts_with = "nodes")]
    pub config: Option<PathBuf>,

    /// Append-only file recording every key-to-node assignment.
    #[arg(long, default_value = DEFAULT_MAPPINGS_FILE)]
    pub mappings: PathBuf,

    /// Connect/read/write timeout for node requests in milliseconds. Overrides the
    /// config file value; the fallback is 5000.
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}
