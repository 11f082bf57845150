//! Error types shared across the replication, storage and transport layers.

use std::io;

use thiserror::Error;

/// Failures raised by [`crate::storage::EncryptedStore`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// `flush` was called while another flush on the same engine was running.
    #[error("storage is syncing")]
    FlushInProgress,
    /// `restore` was asked to admit a key that is already resident in memory.
    #[error("already stored")]
    AlreadyStored,
    /// `restore` found no durable record for the key.
    #[error("no such value")]
    NoSuchValue,
    /// `restore` was given a signature that does not verify against the engine key.
    #[error("invalid signature")]
    InvalidSignature,
    /// A key could not be loaded or does not match the configured modulus size.
    #[error("invalid key material: {0}")]
    Key(String),
    /// Encryption or decryption of a value failed.
    #[error("cipher failure: {0}")]
    Crypto(String),
    /// A flush aborted while writing `key`; every key in the batch stays dirty.
    #[error("failed to flush to storage (key {key})")]
    Flush {
        key: String,
        #[source]
        source: io::Error,
    },
    /// Any other backing store failure.
    #[error("backing store failure: {0}")]
    Backend(#[from] io::Error),
}

/// Failures raised by the reliable link and the raw channel beneath it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// No live connection exists right now.
    #[error("channel is not ready")]
    NotReady,
    /// The link or channel has been shut down.
    #[error("link is closed")]
    Closed,
}

/// Failures surfaced by a replica node or one of its operation queues.
#[derive(Debug, Error)]
pub enum ChainError {
    /// A query was routed to a node that is not the tail.
    #[error("query request {id} should be headed to the tail")]
    ProtocolViolation { id: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Link(#[from] LinkError),
    /// Binding or resolving a neighbor endpoint failed.
    #[error("transport setup failed: {0}")]
    Io(#[from] io::Error),
    /// A queue handler panicked while processing an element.
    #[error("queue handler panicked")]
    Panicked,
    /// The node (or the queue worker) is no longer running.
    #[error("node has stopped")]
    Stopped,
}
