//! Router and nodes talking over real loopback sockets.

use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::Result;
use sharded_kv::{
    NodeId,
    config::ClusterConfig,
    error::NodeError,
    protocol::{Response, read_line, write_line},
    router::{RouteOutcome, RouteRejection, Router},
    server::{NodeServer, ServeMode, ServerOptions},
    store::{NodeStore, log_file_name},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{Mutex, oneshot},
    task::JoinHandle,
    time::timeout,
};

const NODE_COUNT: usize = 3;

struct TestNode {
    addr: SocketAddr,
    log_path: std::path::PathBuf,
    store: Arc<Mutex<NodeStore>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestNode {
    async fn spawn(data_dir: &Path, label: u16, mode: ServeMode) -> Result<Self> {
        let log_path = data_dir.join(log_file_name(label));
        let store = NodeStore::open(&log_path).await?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = NodeServer::new(
            listener,
            store,
            ServerOptions {
                mode,
                io_timeout: Duration::from_secs(2),
            },
        );
        let addr = server.local_addr()?;
        let store = server.store();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = server.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            log_path,
            store,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.task.await;
    }
}

struct TestCluster {
    nodes: Vec<TestNode>,
}

impl TestCluster {
    async fn spawn(data_dir: &Path) -> Result<Self> {
        let mut nodes = Vec::new();
        for label in 0..NODE_COUNT as u16 {
            nodes.push(TestNode::spawn(data_dir, 5000 + label, ServeMode::Sequential).await?);
        }
        Ok(Self { nodes })
    }

    fn config(&self) -> ClusterConfig {
        ClusterConfig::new(self.nodes.iter().map(|node| node.addr.to_string()).collect())
            .expect("valid cluster config")
            .with_timeout(Duration::from_secs(2))
    }

    fn node(&self, id: NodeId) -> &TestNode {
        &self.nodes[id.0]
    }

    async fn shutdown(self) {
        for node in self.nodes {
            node.stop().await;
        }
    }
}

async fn raw_request(addr: SocketAddr, line: &str) -> Result<Option<String>> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    write_line(&mut writer, line).await?;
    let mut reader = BufReader::new(reader);
    Ok(timeout(Duration::from_secs(2), read_line(&mut reader)).await??)
}

#[tokio::test]
async fn put_routes_to_the_hashed_node_and_persists() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cluster = TestCluster::spawn(dir.path()).await?;
    let mappings = dir.path().join("mappings.txt");
    let mut router = Router::open(cluster.config(), &mappings).await?;

    let outcome = router.put(42, "hello").await?;

    // 42 mod 3
    assert_eq!(outcome, RouteOutcome::Stored(NodeId(0)));
    let owner = cluster.node(NodeId(0));
    assert_eq!(owner.store.lock().await.get(42), Some("hello"));
    assert_eq!(tokio::fs::read_to_string(&owner.log_path).await?, "42 hello\n");
    for other in [NodeId(1), NodeId(2)] {
        assert!(!cluster.node(other).store.lock().await.contains(42));
    }

    let expected = format!("42 Node 0 {}\n", owner.addr.port());
    assert_eq!(tokio::fs::read_to_string(&mappings).await?, expected);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn repeated_key_is_refused_by_the_router_cache() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cluster = TestCluster::spawn(dir.path()).await?;
    let mappings = dir.path().join("mappings.txt");
    let mut router = Router::open(cluster.config(), &mappings).await?;

    router.put(42, "hello").await?;
    let mappings_before = tokio::fs::read_to_string(&mappings).await?;

    // Stop the owner: the rejection must not depend on reaching it.
    let mut nodes = cluster.nodes;
    nodes.remove(0).stop().await;

    let outcome = router.put(42, "world").await?;
    assert_eq!(
        outcome,
        RouteOutcome::Rejected(RouteRejection::AlreadyAssigned { node: NodeId(0) })
    );
    assert_eq!(tokio::fs::read_to_string(&mappings).await?, mappings_before);

    TestCluster { nodes }.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn lost_cache_surfaces_the_node_duplicate() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cluster = TestCluster::spawn(dir.path()).await?;

    let mut first = Router::open(cluster.config(), dir.path().join("first.txt")).await?;
    first.put(42, "hello").await?;

    let fresh_mappings = dir.path().join("fresh.txt");
    let mut fresh = Router::open(cluster.config(), &fresh_mappings).await?;
    let outcome = fresh.put(42, "world").await?;

    assert!(matches!(
        outcome,
        RouteOutcome::Rejected(RouteRejection::NodeError(NodeError::DuplicateKey { .. }))
    ));
    assert_eq!(fresh.node_for(42), None);
    assert!(!fresh_mappings.exists());
    assert_eq!(
        cluster.node(NodeId(0)).store.lock().await.get(42),
        Some("hello")
    );

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn router_restart_replays_its_assignments() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cluster = TestCluster::spawn(dir.path()).await?;
    let mappings = dir.path().join("mappings.txt");

    {
        let mut router = Router::open(cluster.config(), &mappings).await?;
        for key in 10..16 {
            assert!(matches!(
                router.put(key, &format!("v{key}")).await?,
                RouteOutcome::Stored(_)
            ));
        }
    }

    let mut router = Router::open(cluster.config(), &mappings).await?;
    assert_eq!(router.assignments().len(), 6);
    for key in 10..16 {
        assert_eq!(router.node_for(key), Some(router.route(key)));
    }
    assert!(matches!(
        router.put(12, "again").await?,
        RouteOutcome::Rejected(RouteRejection::AlreadyAssigned { .. })
    ));

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn node_restart_keeps_every_accepted_record() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let node = TestNode::spawn(dir.path(), 6000, ServeMode::Sequential).await?;

    for key in 0..5 {
        let reply = raw_request(node.addr, &format!("{key} value {key}")).await?;
        assert_eq!(reply, Some(format!("Stored: {key} -> value {key}")));
    }
    node.stop().await;

    let restarted = TestNode::spawn(dir.path(), 6000, ServeMode::Sequential).await?;
    {
        let store = restarted.store.lock().await;
        assert_eq!(store.len(), 5);
        for key in 0..5 {
            assert_eq!(store.get(key), Some(format!("value {key}").as_str()));
        }
    }

    let reply = raw_request(restarted.addr, "3 other").await?;
    assert_eq!(reply.as_deref(), Some("Error: Key 3 already exists!"));

    restarted.stop().await;
    Ok(())
}

#[tokio::test]
async fn malformed_requests_get_an_error_line_and_the_node_keeps_serving() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let node = TestNode::spawn(dir.path(), 6001, ServeMode::Sequential).await?;

    let reply = raw_request(node.addr, "abc hello").await?;
    assert_eq!(
        reply.as_deref().map(Response::parse),
        Some(Ok(Response::Malformed))
    );

    // A client that connects and leaves without a request does not wedge the loop.
    drop(TcpStream::connect(node.addr).await?);

    let reply = raw_request(node.addr, "1 fine").await?;
    assert_eq!(reply.as_deref(), Some("Stored: 1 -> fine"));

    node.stop().await;
    Ok(())
}

#[tokio::test]
async fn non_utf8_request_is_answered_as_malformed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let node = TestNode::spawn(dir.path(), 6003, ServeMode::Sequential).await?;

    let mut stream = TcpStream::connect(node.addr).await?;
    stream.write_all(b"7 caf\xe9\n").await?;
    let mut reply = String::new();
    timeout(Duration::from_secs(2), stream.read_to_string(&mut reply)).await??;

    assert_eq!(reply, "Error: malformed request\n");
    assert!(!node.store.lock().await.contains(7));
    assert_eq!(tokio::fs::read_to_string(&node.log_path).await?, "");

    let reply = raw_request(node.addr, "7 cafe").await?;
    assert_eq!(reply.as_deref(), Some("Stored: 7 -> cafe"));

    node.stop().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_writers_of_one_key_get_exactly_one_acceptance() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let node = TestNode::spawn(dir.path(), 6002, ServeMode::PerConnection).await?;

    let mut writers = Vec::new();
    for writer in 0..16 {
        let addr = node.addr;
        writers.push(tokio::spawn(async move {
            raw_request(addr, &format!("77 writer {writer}")).await
        }));
    }

    let mut accepted = 0;
    let mut duplicates = 0;
    for writer in writers {
        match writer.await??.as_deref().map(Response::parse) {
            Some(Ok(Response::Stored { key: 77, .. })) => accepted += 1,
            Some(Ok(Response::DuplicateKey { key: 77 })) => duplicates += 1,
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    assert_eq!(accepted, 1);
    assert_eq!(duplicates, 15);
    let log = tokio::fs::read_to_string(&node.log_path).await?;
    assert_eq!(log.lines().count(), 1);

    node.stop().await;
    Ok(())
}
