//! Chain-replicated key-value store with encryption at rest.
//!
//! Nodes form a chain. Updates enter at the head and travel node by node to
//! the tail; the tail commits first and the acknowledgment travels back up,
//! each node flushing the value to its encrypted store before passing the
//! acknowledgment on. Queries are answered by the tail alone, so a read never
//! sees a write that is not durable on every node.
//!
//! # Architecture
//!
//! Everything runs on Tokio. Per node:
//!
//! - **Request queue worker**: handles updates and queries one at a time, in
//!   arrival order
//! - **Response queue worker**: stores, flushes and forwards commit responses
//! - **Link tasks**: one per neighbor, each driving a TCP channel that
//!   reconnects on its own and a single-outstanding-message ack protocol
//!
//! The two queues stall when a handler fails (a link closed, a flush failed)
//! and resume from the same element once the neighbor is ready again.
//!
//! # Modules
//!
//! - [`queue`]: single-flight FIFO operation queue with stall/resume
//! - [`node`]: replica node state machine and its running handle
//! - [`transport`]: JSON-lines frames, raw channel, reliable link
//! - [`storage`]: write-back cache with hybrid RSA/ChaCha20 encryption over sled
//! - [`frontend`]: query interface callbacks and an id-assigning client
//! - [`runtime`]: start a node from a [`config::NodeConfig`]
//! - [`protocol`], [`cli`]: console grammar and command line of `chain-node`

pub mod cli;
pub mod config;
pub mod error;
pub mod frontend;
pub mod node;
pub mod protocol;
pub mod queue;
pub mod runtime;
pub mod storage;
pub mod transport;
pub mod types;

pub use error::{ChainError, LinkError, StorageError};
pub use node::{NodeHandle, NodeStatus, Position, ReplicaNode};
pub use types::{Request, RequestKind, Response};
