//! TCP front end for a [`NodeStore`].
//!
//! Every connection carries exactly one request line and one response line. By default
//! connections are served one at a time: the accept loop does not take the next
//! connection until the current one has been answered and closed. [`ServeMode::PerConnection`]
//! hands each connection to its own task instead; the store's mutex keeps the duplicate
//! check and the log append in a single critical section either way.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::Mutex,
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{
    protocol::{Request, Response, write_line},
    store::{NodeStore, PutOutcome, Rejection},
};

pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServeMode {
    /// One in-flight request at a time.
    #[default]
    Sequential,
    /// One task per accepted connection.
    PerConnection,
}

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub mode: ServeMode,
    /// Bound on reading the request and writing the response of one connection.
    pub io_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            mode: ServeMode::Sequential,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}

pub struct NodeServer {
    listener: TcpListener,
    store: Arc<Mutex<NodeStore>>,
    options: ServerOptions,
}

impl NodeServer {
    pub fn new(listener: TcpListener, store: NodeStore, options: ServerOptions) -> Self {
        Self {
            listener,
            store: Arc::new(Mutex::new(store)),
            options,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared handle to the store, mainly for inspecting state in tests.
    pub fn store(&self) -> Arc<Mutex<NodeStore>> {
        Arc::clone(&self.store)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let NodeServer {
            listener,
            store,
            options,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("node shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &store, options).await;
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    store: &Arc<Mutex<NodeStore>>,
    options: ServerOptions,
) {
    let (stream, peer) = match result {
        Ok(accepted) => accepted,
        Err(err) => {
            warn!(error = ?err, "failed to accept connection");
            return;
        }
    };

    match options.mode {
        ServeMode::Sequential => serve_and_log(stream, peer, store, options.io_timeout).await,
        ServeMode::PerConnection => {
            let store = Arc::clone(store);
            tokio::spawn(async move {
                serve_and_log(stream, peer, &store, options.io_timeout).await;
            });
        }
    }
}

async fn serve_and_log(
    stream: TcpStream,
    peer: SocketAddr,
    store: &Mutex<NodeStore>,
    io_timeout: Duration,
) {
    if let Err(err) = handle_connection(stream, store, io_timeout).await {
        warn!(peer = %peer, error = ?err, "connection closed with error");
    }
}

async fn handle_connection(
    stream: TcpStream,
    store: &Mutex<NodeStore>,
    io_timeout: Duration,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // Raw bytes: a request that is not UTF-8 still deserves an answer.
    let mut request = Vec::new();
    let bytes = timeout(io_timeout, reader.read_until(b'\n', &mut request))
        .await
        .context("timed out waiting for request")?
        .context("failed to read request")?;
    if bytes == 0 {
        debug!("connection closed before sending a request");
        return Ok(());
    }

    let response = match String::from_utf8(request) {
        Ok(line) => respond(&line, store).await,
        Err(err) => {
            warn!(error = %err, "request is not valid UTF-8");
            Response::Malformed
        }
    };
    timeout(io_timeout, write_line(&mut writer, &response.encode()))
        .await
        .context("timed out writing response")?
        .context("failed to write response")?;
    writer.shutdown().await.ok();

    Ok(())
}

async fn respond(line: &str, store: &Mutex<NodeStore>) -> Response {
    let request = match Request::parse(line) {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "malformed request");
            return Response::Malformed;
        }
    };

    let Request { key, value } = request;
    let outcome = store.lock().await.put(key, value.clone()).await;
    match outcome {
        Ok(PutOutcome::Accepted) => {
            info!(key, value = %value, "stored");
            Response::Stored { key, value }
        }
        Ok(PutOutcome::Rejected(Rejection::DuplicateKey)) => {
            info!(key, "duplicate key attempt");
            Response::DuplicateKey { key }
        }
        Err(err) => {
            error!(key, error = %err, "failed to persist record");
            Response::StorageFailure
        }
    }
}
