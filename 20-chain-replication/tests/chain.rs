//! End-to-end tests of a chain of real nodes talking over TCP, each with its
//! own encrypted sled store.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chain_replication::frontend::{Client, Replies};
use chain_replication::node::{NodeHandle, Position, ReplicaNode};
use chain_replication::storage::crypto::{decrypt, generate_key_pair};
use chain_replication::storage::{EncryptedStore, Sealer, SledBackend};
use chain_replication::transport::Channel;
use chain_replication::{ChainError, Request};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::timeout;

const BITS: usize = 1024;
const RECONNECT: Duration = Duration::from_millis(20);
const WAIT: Duration = Duration::from_secs(10);

fn keys() -> &'static (RsaPrivateKey, RsaPublicKey) {
    static KEYS: OnceLock<(RsaPrivateKey, RsaPublicKey)> = OnceLock::new();
    KEYS.get_or_init(|| generate_key_pair(BITS).expect("generate test key"))
}

/// Chain of nodes on localhost. Node 0 is the head, the last node the tail.
struct TestChain {
    nodes: Vec<NodeHandle>,
    replies: Arc<Replies>,
    _dir: TempDir,
}

impl TestChain {
    async fn spawn(n: usize) -> Result<Self> {
        let dir = TempDir::new()?;
        let replies = Arc::new(Replies::new());

        let mut nodes: Vec<ReplicaNode> = (0..n)
            .map(|i| open_node(&dir, i, replies.clone()))
            .collect::<Result<_>>()?;

        // Node i listens for node i - 1; node i - 1 dials it.
        for i in 1..n {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let addr = listener.local_addr()?;
            let token = nodes[i].shutdown_token().child_token();
            nodes[i].set_previous(Channel::listen(listener, token));
            let token = nodes[i - 1].shutdown_token().child_token();
            nodes[i - 1].set_next(Channel::connect(addr, RECONNECT, token));
        }

        let nodes = nodes.into_iter().map(ReplicaNode::start).collect();
        Ok(Self {
            nodes,
            replies,
            _dir: dir,
        })
    }

    fn head(&self) -> &NodeHandle {
        &self.nodes[0]
    }

    fn tail(&self) -> &NodeHandle {
        &self.nodes[self.nodes.len() - 1]
    }

    fn client(&self) -> Client {
        Client::new(self.replies.clone(), self.head().requests(), self.tail().requests())
    }

    async fn shutdown(self) -> Result<()> {
        for node in self.nodes {
            node.shutdown().await?;
        }
        Ok(())
    }
}

fn open_node(dir: &TempDir, index: usize, replies: Arc<Replies>) -> Result<ReplicaNode> {
    let sealer = Sealer::new(keys().1.clone(), BITS)?;
    let backend = SledBackend::open(dir.path().join(format!("node-{index}")))?;
    let mut node = ReplicaNode::new(format!("node-{index}"), EncryptedStore::with_backend(sealer, backend));
    node.set_query_interface(replies);
    Ok(node)
}

#[tokio::test]
async fn three_node_chain_commits_and_serves_latest_value() -> Result<()> {
    let chain = TestChain::spawn(3).await?;
    let client = chain.client();
    assert_eq!(chain.head().position(), Position::Head);
    assert_eq!(chain.nodes[1].position(), Position::Middle);
    assert_eq!(chain.tail().position(), Position::Tail);

    let committed = timeout(WAIT, client.submit(Request::update("u1", "k", b"v1".to_vec())))
        .await
        .context("u1 never committed")??;
    assert_eq!(committed.id, "u1");
    let read = timeout(WAIT, client.submit(Request::query("q1", "k"))).await??;
    assert_eq!(read.value, Some(b"v1".to_vec()));

    timeout(WAIT, client.submit(Request::update("u2", "k", b"v2".to_vec()))).await??;
    let read = timeout(WAIT, client.submit(Request::query("q2", "k"))).await??;
    assert_eq!(read.id, "q2");
    assert_eq!(read.value, Some(b"v2".to_vec()));

    for node in &chain.nodes {
        let status = node.status();
        assert_eq!(status.in_memory, 1, "{}", status.name);
        assert_eq!(status.pending, 0, "{}", status.name);
        assert_eq!(status.dirty, 0, "{}", status.name);

        // Every node holds the latest value durably.
        let blob = node.storage().get_stored("k").await?.context("durable record")?;
        assert_eq!(decrypt(&keys().0, &blob, BITS)?, b"v2");
    }

    chain.shutdown().await
}

#[tokio::test]
async fn queries_outside_the_tail_are_rejected() -> Result<()> {
    let chain = TestChain::spawn(3).await?;
    let client = chain.client();
    timeout(WAIT, client.update("k", b"v".to_vec())).await??;

    for (index, id) in [(0, "q-head"), (1, "q-middle")] {
        let node = &chain.nodes[index];
        let err = timeout(WAIT, client.submit_at(&node.requests(), Request::query(id, "k")))
            .await?
            .expect_err("query must be refused");
        assert!(matches!(err, ChainError::ProtocolViolation { .. }));

        let status = node.status();
        assert_eq!(status.violations, 1);
        assert_eq!(status.pending, 0);
        assert_eq!(status.in_memory, 1);
        assert!(!status.requests.stalled);
    }

    // The chain keeps working afterwards.
    timeout(WAIT, client.update("k", b"after".to_vec())).await??;
    let read = timeout(WAIT, client.query("k")).await??;
    assert_eq!(read.value, Some(b"after".to_vec()));

    chain.shutdown().await
}

#[tokio::test]
async fn last_write_wins_under_pipelined_updates() -> Result<()> {
    let chain = TestChain::spawn(3).await?;
    let client = chain.client();

    let mut replies = Vec::new();
    for i in 0..20 {
        let id = format!("u{i}");
        replies.push(chain.replies.register(id.clone()));
        let key = if i % 2 == 0 { "even" } else { "odd" };
        chain.head().handle_request(Request::update(id, key, format!("v{i}").into_bytes()))?;
    }
    for reply in replies {
        timeout(WAIT, reply).await??.map_err(anyhow::Error::from)?;
    }

    let even = timeout(WAIT, client.query("even")).await??;
    let odd = timeout(WAIT, client.query("odd")).await??;
    assert_eq!(even.value, Some(b"v18".to_vec()));
    assert_eq!(odd.value, Some(b"v19".to_vec()));
    assert_eq!(chain.head().status().in_memory, 2);

    chain.shutdown().await
}

#[tokio::test]
async fn update_survives_a_tail_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let replies = Arc::new(Replies::new());
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr: SocketAddr = listener.local_addr()?;

    let mut tail = open_node(&dir, 1, replies.clone())?;
    let token = tail.shutdown_token().child_token();
    tail.set_previous(Channel::listen(listener, token));
    let tail = tail.start();

    let mut head = open_node(&dir, 0, replies.clone())?;
    let token = head.shutdown_token().child_token();
    head.set_next(Channel::connect(addr, RECONNECT, token));
    let head = head.start();

    let client = Client::new(replies.clone(), head.requests(), tail.requests());
    timeout(WAIT, client.update("k", b"before".to_vec())).await??;
    tail.shutdown().await?;

    // Submitted while the tail is down; delivered once it comes back.
    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.update("k", b"after".to_vec()).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!pending.is_finished());

    let listener = TcpListener::bind(addr).await?;
    let mut tail = open_node(&dir, 1, replies.clone())?;
    let token = tail.shutdown_token().child_token();
    tail.set_previous(Channel::listen(listener, token));
    let tail = tail.start();

    timeout(WAIT, pending).await???;
    let client = Client::new(replies, head.requests(), tail.requests());
    let read = timeout(WAIT, client.query("k")).await??;
    assert_eq!(read.value, Some(b"after".to_vec()));
    assert_eq!(head.status().pending, 0);

    head.shutdown().await?;
    tail.shutdown().await?;
    Ok(())
}
