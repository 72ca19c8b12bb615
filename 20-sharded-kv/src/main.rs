use std::{io::IsTerminal, net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{io::BufReader, net::TcpListener};
use tracing::{info, warn};

use sharded_kv::{
    cli::{Cli, Command, NodeArgs, RouterArgs},
    config::ClusterConfig,
    router::Router,
    server::{NodeServer, ServeMode, ServerOptions},
    shell,
    store::{NodeStore, log_file_name},
};

fn init_tracing(to_stderr: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = if to_stderr {
        builder.with_writer(std::io::stderr).try_init()
    } else {
        builder.try_init()
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Node(args) => {
            init_tracing(false);
            run_node(args).await
        }
        Command::Router(args) => {
            // Stdout belongs to the shell; keep logs off it.
            init_tracing(true);
            run_router(args).await
        }
    }
}

async fn run_node(args: NodeArgs) -> Result<()> {
    let log_path = args.data_dir.join(log_file_name(args.port));
    let store = NodeStore::open(&log_path)
        .await
        .with_context(|| format!("failed to load {}", log_path.display()))?;
    let records = store.len();

    let bind_addr = SocketAddr::new(args.host, args.port);
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    let options = ServerOptions {
        mode: if args.concurrent {
            ServeMode::PerConnection
        } else {
            ServeMode::Sequential
        },
        io_timeout: Duration::from_millis(args.io_timeout_ms),
    };
    let server = NodeServer::new(listener, store, options);
    let addr = server.local_addr()?;
    info!(records, mode = ?options.mode, log = %log_path.display(), "node ready");
    info!("node listening on {}", addr);

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("node exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

async fn run_router(args: RouterArgs) -> Result<()> {
    let config = if !args.nodes.is_empty() {
        ClusterConfig::new(args.nodes)?
    } else if let Some(path) = &args.config {
        ClusterConfig::from_file(path)?
    } else {
        ClusterConfig::default()
    };
    let config = match args.timeout_ms {
        Some(ms) => config.with_timeout(Duration::from_millis(ms)),
        None => config,
    };

    let mut router = Router::open(config, &args.mappings)
        .await
        .with_context(|| format!("failed to load {}", args.mappings.display()))?;

    let interactive = std::io::stdin().is_terminal();
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    shell::run(&mut router, &mut stdin, &mut stdout, interactive).await
}
