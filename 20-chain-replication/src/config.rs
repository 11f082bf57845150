//! Node and storage configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Delay between reconnect attempts of a connecting endpoint. Fixed, not exponential.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// RSA modulus size assumed when none is configured.
pub const DEFAULT_MODULUS_BITS: usize = 1024;

/// Where the encrypted store keeps its records and which key protects them.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory of the sled database.
    pub path: PathBuf,
    /// PEM-encoded RSA public key (PKCS#1 or SPKI).
    pub public_key_pem: String,
    /// Must match the key; fixes the width of the wrapped-key prefix.
    pub modulus_bits: usize,
}

impl StorageConfig {
    pub fn new(path: impl Into<PathBuf>, public_key_pem: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            public_key_pem: public_key_pem.into(),
            modulus_bits: DEFAULT_MODULUS_BITS,
        }
    }
}

/// How a node reaches one of its neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Accept the neighbor's connection on this address.
    Listen(SocketAddr),
    /// Dial the neighbor at this address, reconnecting after every close.
    Connect(SocketAddr),
}

/// Everything needed to start one replica node.
///
/// A node without `previous` is the head, a node without `next` is the tail.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub storage: StorageConfig,
    pub previous: Option<Endpoint>,
    pub next: Option<Endpoint>,
    pub reconnect_delay: Duration,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, storage: StorageConfig) -> Self {
        Self {
            name: name.into(),
            storage,
            previous: None,
            next: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn with_previous(mut self, endpoint: Endpoint) -> Self {
        self.previous = Some(endpoint);
        self
    }

    pub fn with_next(mut self, endpoint: Endpoint) -> Self {
        self.next = Some(endpoint);
        self
    }
}
