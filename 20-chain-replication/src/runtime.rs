//! Starting a node from a [`NodeConfig`].
//!
//! Opens the encrypted sled store, binds or dials the neighbor endpoints and
//! hands everything to [`ReplicaNode::start`]. The neighbor channels are tied
//! to the node's shutdown token, so [`NodeHandle::shutdown`] also stops any
//! reconnect loop.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Endpoint, NodeConfig};
use crate::error::ChainError;
use crate::frontend::QueryInterface;
use crate::node::{NodeHandle, ReplicaNode};
use crate::storage::EncryptedStore;
use crate::transport::Channel;

pub async fn spawn_node(config: NodeConfig, query_interface: Arc<dyn QueryInterface>) -> Result<NodeHandle, ChainError> {
    let storage = EncryptedStore::open(&config.storage)?;
    let mut node = ReplicaNode::new(config.name.clone(), storage);
    let shutdown = node.shutdown_token();

    if let Some(endpoint) = config.previous {
        let channel = open_channel(endpoint, config.reconnect_delay, shutdown.child_token()).await?;
        node.set_previous(channel);
    }
    if let Some(endpoint) = config.next {
        let channel = open_channel(endpoint, config.reconnect_delay, shutdown.child_token()).await?;
        node.set_next(channel);
    }
    node.set_query_interface(query_interface);
    Ok(node.start())
}

/// Binds (for [`Endpoint::Listen`]) or starts dialing (for [`Endpoint::Connect`]).
pub async fn open_channel(endpoint: Endpoint, reconnect_delay: Duration, shutdown: CancellationToken) -> io::Result<Channel> {
    match endpoint {
        Endpoint::Listen(addr) => {
            let listener = TcpListener::bind(addr).await?;
            info!(addr = %listener.local_addr()?, "listening for neighbor");
            Ok(Channel::listen(listener, shutdown))
        }
        Endpoint::Connect(addr) => Ok(Channel::connect(addr, reconnect_delay, shutdown)),
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tempfile::TempDir;
    use tokio::time::timeout;

    use super::*;
    use crate::config::StorageConfig;
    use crate::frontend::{Client, Replies};
    use crate::node::Position;
    use crate::storage::crypto::encode_key_pair;
    use crate::storage::crypto::tests::{TEST_BITS, test_keys};

    async fn free_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("local addr")
    }

    fn storage(dir: &TempDir, name: &str) -> StorageConfig {
        let pems = encode_key_pair(&test_keys().0).expect("encode keys");
        let mut config = StorageConfig::new(dir.path().join(name), pems.public_pem);
        config.modulus_bits = TEST_BITS;
        config
    }

    #[tokio::test]
    async fn two_configured_nodes_replicate_over_tcp() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let addr = free_addr().await;
        let replies = Arc::new(Replies::new());

        let mut tail_config = NodeConfig::new("tail", storage(&dir, "tail")).with_previous(Endpoint::Listen(addr));
        tail_config.reconnect_delay = Duration::from_millis(20);
        let tail = spawn_node(tail_config, replies.clone()).await?;

        let mut head_config = NodeConfig::new("head", storage(&dir, "head")).with_next(Endpoint::Connect(addr));
        head_config.reconnect_delay = Duration::from_millis(20);
        let head = spawn_node(head_config, replies.clone()).await?;

        assert_eq!(head.position(), Position::Head);
        assert_eq!(tail.position(), Position::Tail);

        let client = Client::new(replies, head.requests(), tail.requests());
        timeout(Duration::from_secs(10), client.update("k", b"v".to_vec())).await??;
        let read = timeout(Duration::from_secs(10), client.query("k")).await??;
        assert_eq!(read.value, Some(b"v".to_vec()));

        head.shutdown().await?;
        tail.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_modulus_fails_to_start() {
        let dir = TempDir::new().expect("tempdir");
        let mut storage = storage(&dir, "node");
        storage.modulus_bits = 2048;
        let result = spawn_node(NodeConfig::new("node", storage), Arc::new(Replies::new())).await;
        assert!(matches!(result, Err(ChainError::Storage(_))));
    }
}
