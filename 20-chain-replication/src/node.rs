//! Replica node: the chain replication state machine.
//!
//! A node sits between an optional predecessor and an optional successor. Its
//! position in the chain follows from which of the two exist:
//!
//! | previous | next | position    |
//! |----------|------|-------------|
//! | no       | yes  | Head        |
//! | yes      | yes  | Middle      |
//! | yes      | no   | Tail        |
//! | no       | no   | Singleton   |
//!
//! Updates enter at the head and travel down through every node's request
//! queue. The tail turns each update into a response that travels back up
//! through the response queues; every node stores and flushes the value before
//! passing the response on, so by the time the head answers the caller, every
//! node has the write on disk. Queries are only served by the tail.
//!
//! Each node runs two independent [`queue`](crate::queue) workers, one for
//! requests and one for responses. Both stall on failure and are resumed when
//! the corresponding neighbor link becomes ready (or by [`NodeHandle::resume`]).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ChainError;
use crate::frontend::QueryInterface;
use crate::queue::{self, Handler, Policy, QueueHandle, QueueState};
use crate::storage::{Backend, EncryptedStore, SledBackend};
use crate::transport::{Channel, LinkSink, Message, ReliableLink};
use crate::types::{Request, RequestKind, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Head,
    Middle,
    Tail,
    Singleton,
}

impl Position {
    fn of(has_previous: bool, has_next: bool) -> Self {
        match (has_previous, has_next) {
            (false, true) => Position::Head,
            (true, true) => Position::Middle,
            (true, false) => Position::Tail,
            (false, false) => Position::Singleton,
        }
    }

    pub fn is_head(self) -> bool {
        matches!(self, Position::Head | Position::Singleton)
    }

    pub fn is_tail(self) -> bool {
        matches!(self, Position::Tail | Position::Singleton)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Position::Head => "head",
            Position::Middle => "middle",
            Position::Tail => "tail",
            Position::Singleton => "singleton",
        };
        f.write_str(label)
    }
}

/// Snapshot returned by [`NodeHandle::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub name: String,
    pub position: Position,
    /// Updates accepted by this node whose response has not come back yet.
    pub pending: usize,
    /// Distinct keys resident in memory.
    pub in_memory: usize,
    /// Keys written to memory but not yet flushed.
    pub dirty: usize,
    /// Queries refused because this node is not the tail.
    pub violations: u64,
    pub requests: QueueState,
    pub responses: QueueState,
}

/// A node that has not been started yet.
///
/// Neighbors and the query interface are wired here; the topology is fixed
/// once [`ReplicaNode::start`] runs.
pub struct ReplicaNode<B: Backend = SledBackend> {
    name: String,
    storage: EncryptedStore<B>,
    previous: Option<Channel>,
    next: Option<Channel>,
    query_interface: Option<Arc<dyn QueryInterface>>,
    shutdown: CancellationToken,
}

impl<B: Backend> ReplicaNode<B> {
    pub fn new(name: impl Into<String>, storage: EncryptedStore<B>) -> Self {
        Self {
            name: name.into(),
            storage,
            previous: None,
            next: None,
            query_interface: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Channel to the successor; requests are forwarded over it.
    pub fn set_next(&mut self, channel: Channel) {
        self.next = Some(channel);
    }

    /// Channel to the predecessor; responses are forwarded over it.
    pub fn set_previous(&mut self, channel: Channel) {
        self.previous = Some(channel);
    }

    pub fn set_query_interface(&mut self, query_interface: Arc<dyn QueryInterface>) {
        self.query_interface = Some(query_interface);
    }

    /// Cancelled when the node shuts down; useful as parent for the neighbor channels.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn start(self) -> NodeHandle<B> {
        let (requests, request_backlog) = queue::channel();
        let (responses, response_backlog) = queue::channel();

        let position = Position::of(self.previous.is_some(), self.next.is_some());
        let spawn_link = |side: Side, channel: Channel| {
            let sink = Arc::new(QueueSink {
                side,
                requests: requests.clone(),
                responses: responses.clone(),
            });
            let name = format!("{}/{}", self.name, side);
            ReliableLink::spawn(&name, channel, sink, self.shutdown.child_token())
        };
        let previous = self.previous.map(|channel| spawn_link(Side::Previous, channel));
        let next = self.next.map(|channel| spawn_link(Side::Next, channel));

        let core = Arc::new(NodeCore {
            name: self.name,
            position,
            storage: self.storage,
            pending: Mutex::new(HashMap::new()),
            violations: AtomicU64::new(0),
            previous,
            next,
            query_interface: self.query_interface,
            responses: responses.clone(),
        });

        let workers = vec![
            request_backlog.spawn(
                &format!("{}/requests", core.name),
                RequestHandler { core: Arc::clone(&core) },
                Policy::StallOnFailure,
                self.shutdown.child_token(),
            ),
            response_backlog.spawn(
                &format!("{}/responses", core.name),
                ResponseHandler { core: Arc::clone(&core) },
                Policy::StallOnFailure,
                self.shutdown.child_token(),
            ),
        ];
        info!(node = %core.name, %position, "replica node started");

        NodeHandle {
            core,
            requests,
            responses,
            shutdown: self.shutdown,
            workers,
        }
    }
}

/// Running node.
pub struct NodeHandle<B: Backend = SledBackend> {
    core: Arc<NodeCore<B>>,
    requests: QueueHandle<Request>,
    responses: QueueHandle<Response>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl<B: Backend> NodeHandle<B> {
    /// Enqueues `request` on the request queue.
    pub fn handle_request(&self, request: Request) -> Result<(), ChainError> {
        self.requests.enqueue(request)
    }

    /// Enqueues `response` on the response queue.
    pub fn handle_response(&self, response: Response) -> Result<(), ChainError> {
        self.responses.enqueue(response)
    }

    /// Producer handle of the request queue, for front ends.
    pub fn requests(&self) -> QueueHandle<Request> {
        self.requests.clone()
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn position(&self) -> Position {
        self.core.position
    }

    pub fn is_head(&self) -> bool {
        self.core.position.is_head()
    }

    pub fn is_tail(&self) -> bool {
        self.core.position.is_tail()
    }

    pub fn storage(&self) -> &EncryptedStore<B> {
        &self.core.storage
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.core.pending().contains_key(id)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            name: self.core.name.clone(),
            position: self.core.position,
            pending: self.core.pending().len(),
            in_memory: self.core.storage.count(),
            dirty: self.core.storage.dirty_count(),
            violations: self.core.violations.load(Ordering::SeqCst),
            requests: self.requests.state(),
            responses: self.responses.state(),
        }
    }

    /// Restarts both queues if either stalled on a failed element.
    pub fn resume(&self) {
        self.requests.resume();
        self.responses.resume();
    }

    /// Waits until both queues are empty. Never returns while one is stalled.
    pub async fn wait_idle(&self) {
        loop {
            self.requests.wait_idle().await;
            self.responses.wait_idle().await;
            if self.requests.state().backlog == 0 {
                return;
            }
        }
    }

    /// Stops reconnect loops and queue workers, then closes storage.
    pub async fn shutdown(self) -> Result<(), ChainError> {
        self.shutdown.cancel();
        for worker in self.workers {
            let _ = worker.await;
        }
        for link in [&self.core.previous, &self.core.next].into_iter().flatten() {
            link.close().await;
        }
        drop(self.requests);
        drop(self.responses);

        match Arc::try_unwrap(self.core) {
            Ok(core) => {
                info!(node = %core.name, "replica node stopped");
                core.storage.close().await?;
            }
            Err(core) => warn!(node = %core.name, "storage still shared at shutdown, not closed"),
        }
        Ok(())
    }
}

struct NodeCore<B> {
    name: String,
    position: Position,
    storage: EncryptedStore<B>,
    pending: Mutex<HashMap<String, Request>>,
    violations: AtomicU64,
    previous: Option<ReliableLink>,
    next: Option<ReliableLink>,
    query_interface: Option<Arc<dyn QueryInterface>>,
    responses: QueueHandle<Response>,
}

impl<B> NodeCore<B> {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, Request>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reply(&self, response: Response) {
        match &self.query_interface {
            Some(query_interface) => query_interface.on_response(response),
            None => debug!(node = %self.name, id = %response.id, "no query interface, dropping response"),
        }
    }
}

struct RequestHandler<B> {
    core: Arc<NodeCore<B>>,
}

impl<B: Backend> Handler<Request> for RequestHandler<B> {
    async fn handle(&mut self, request: &Request) -> Result<(), ChainError> {
        let core = &self.core;
        debug!(node = %core.name, id = %request.id, key = %request.key, "handling request");

        match &request.kind {
            RequestKind::Query => {
                if core.next.is_some() {
                    let err = ChainError::ProtocolViolation { id: request.id.clone() };
                    error!(node = %core.name, id = %request.id, "{err}");
                    core.violations.fetch_add(1, Ordering::SeqCst);
                    if let Some(query_interface) = &core.query_interface {
                        query_interface.on_rejected(request, err);
                    }
                    return Ok(());
                }
                let value = core.storage.get(&request.key);
                core.reply(Response::new(&request.id, &request.key, value));
            }
            RequestKind::Update { value } => {
                core.pending().insert(request.id.clone(), request.clone());
                match &core.next {
                    Some(next) => next.send(Message::Request(request.clone()))?,
                    None => core
                        .responses
                        .enqueue(Response::new(&request.id, &request.key, Some(value.clone())))?,
                }
            }
        }
        Ok(())
    }
}

struct ResponseHandler<B> {
    core: Arc<NodeCore<B>>,
}

impl<B: Backend> Handler<Response> for ResponseHandler<B> {
    async fn handle(&mut self, response: &Response) -> Result<(), ChainError> {
        let core = &self.core;
        debug!(node = %core.name, id = %response.id, key = %response.key, "handling response");

        match &response.value {
            Some(value) => core.storage.put(&response.key, value.clone()),
            None => warn!(node = %core.name, id = %response.id, "response carries no value"),
        }
        if let Err(err) = core.storage.flush().await {
            warn!(node = %core.name, id = %response.id, error = %err, "durable write failed");
            return Err(err.into());
        }
        core.pending().remove(&response.id);

        match &core.previous {
            Some(previous) => previous.send(Message::Response(response.clone()))?,
            None => core.reply(response.clone()),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Previous,
    Next,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Previous => f.write_str("previous"),
            Side::Next => f.write_str("next"),
        }
    }
}

/// Feeds one neighbor link into the node's queues.
struct QueueSink {
    side: Side,
    requests: QueueHandle<Request>,
    responses: QueueHandle<Response>,
}

impl LinkSink for QueueSink {
    fn on_request(&self, request: Request) {
        if let Err(err) = self.requests.enqueue(request) {
            warn!(side = %self.side, error = %err, "dropping inbound request");
        }
    }

    fn on_response(&self, response: Response) {
        if let Err(err) = self.responses.enqueue(response) {
            warn!(side = %self.side, error = %err, "dropping inbound response");
        }
    }

    fn on_ready(&self) {
        // Requests flow to `next`, responses to `previous`.
        match self.side {
            Side::Next => self.requests.resume(),
            Side::Previous => self.responses.resume(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::frontend::{Client, Replies};
    use crate::storage::MemoryBackend;
    use crate::storage::crypto::tests::{TEST_BITS, test_keys};
    use crate::storage::Sealer;
    use crate::transport::channel::ChannelProbe;
    use crate::transport::Ack;

    fn memory_storage() -> (EncryptedStore<Arc<MemoryBackend>>, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let sealer = Sealer::new(test_keys().1.clone(), TEST_BITS).expect("sealer");
        (EncryptedStore::with_backend(sealer, Arc::clone(&backend)), backend)
    }

    #[tokio::test]
    async fn singleton_commits_and_serves_queries() -> anyhow::Result<()> {
        let (storage, backend) = memory_storage();
        let replies = Arc::new(Replies::new());
        let mut node = ReplicaNode::new("solo", storage);
        node.set_query_interface(replies.clone());
        let node = node.start();
        assert_eq!(node.position(), Position::Singleton);

        let client = Client::new(replies, node.requests(), node.requests());
        let committed = timeout(Duration::from_secs(5), client.update("k", b"v1".to_vec())).await??;
        assert_eq!(committed.value, Some(b"v1".to_vec()));
        assert_eq!(backend.len(), 1);

        let read = timeout(Duration::from_secs(5), client.query("k")).await??;
        assert_eq!(read.value, Some(b"v1".to_vec()));
        let missing = timeout(Duration::from_secs(5), client.query("nope")).await??;
        assert_eq!(missing.value, None);

        let status = node.status();
        assert_eq!(status.pending, 0);
        assert_eq!(status.in_memory, 1);
        assert_eq!(status.dirty, 0);
        node.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn query_at_non_tail_is_reported_and_skipped() -> anyhow::Result<()> {
        let (storage, _backend) = memory_storage();
        let (channel, mut probe) = ChannelProbe::pair();
        let replies = Arc::new(Replies::new());
        let mut node = ReplicaNode::new("head", storage);
        node.set_next(channel);
        node.set_query_interface(replies.clone());
        let node = node.start();
        assert_eq!(node.position(), Position::Head);
        probe.ready();

        let client = Client::new(replies, node.requests(), node.requests());
        let err = timeout(Duration::from_secs(5), client.submit_at(&node.requests(), Request::query("q1", "k")))
            .await?
            .expect_err("query at head must be rejected");
        assert!(matches!(err, ChainError::ProtocolViolation { ref id } if id == "q1"));

        // The queue keeps going with the next element.
        node.handle_request(Request::update("u1", "k", b"v".to_vec()))?;
        assert_eq!(probe.next_sent().await, Message::Request(Request::update("u1", "k", b"v".to_vec())));

        let status = node.status();
        assert_eq!(status.violations, 1);
        assert_eq!(status.pending, 1);
        assert!(!status.requests.stalled);
        assert_eq!(status.in_memory, 0);
        Ok(())
    }

    #[tokio::test]
    async fn response_is_not_propagated_before_flush_succeeds() -> anyhow::Result<()> {
        let (storage, backend) = memory_storage();
        let (channel, mut probe) = ChannelProbe::pair();
        let mut node = ReplicaNode::new("tail", storage);
        node.set_previous(channel);
        let node = node.start();
        assert_eq!(node.position(), Position::Tail);
        probe.ready();

        backend.fail_writes(true);
        let update = Request::update("u1", "k", b"v".to_vec());
        probe.deliver(Message::Request(update));
        assert_eq!(probe.next_sent().await, Message::Ack(Ack { id: "u1".into() }));

        timeout(Duration::from_secs(5), async {
            while !node.status().responses.stalled {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        probe.assert_quiet().await;
        assert!(node.is_pending("u1"));
        assert!(node.storage().is_dirty("k"));

        backend.fail_writes(false);
        node.resume();
        let sent = probe.next_sent().await;
        assert_eq!(sent, Message::Response(Response::new("u1", "k", Some(b"v".to_vec()))));
        assert!(!node.is_pending("u1"));
        assert_eq!(backend.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn stalled_response_queue_resumes_when_previous_reconnects() -> anyhow::Result<()> {
        let (storage, backend) = memory_storage();
        let (channel, mut probe) = ChannelProbe::pair();
        let mut node = ReplicaNode::new("tail", storage);
        node.set_previous(channel);
        let node = node.start();
        probe.ready();

        backend.fail_writes(true);
        probe.deliver(Message::Request(Request::update("u1", "k", b"v".to_vec())));
        assert_eq!(probe.next_sent().await, Message::Ack(Ack { id: "u1".into() }));
        timeout(Duration::from_secs(5), async {
            while !node.status().responses.stalled {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        probe.assert_quiet().await;

        // No manual resume: the reconnect alone restarts the response queue.
        backend.fail_writes(false);
        probe.close();
        probe.ready();
        let sent = probe.next_sent().await;
        assert_eq!(sent, Message::Response(Response::new("u1", "k", Some(b"v".to_vec()))));

        let status = node.status();
        assert!(!status.responses.stalled);
        assert_eq!(status.pending, 0);
        assert_eq!(backend.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn middle_forwards_requests_down_and_responses_up() -> anyhow::Result<()> {
        let (storage, backend) = memory_storage();
        let (up, mut previous) = ChannelProbe::pair();
        let (down, mut next) = ChannelProbe::pair();
        let mut node = ReplicaNode::new("middle", storage);
        node.set_previous(up);
        node.set_next(down);
        let node = node.start();
        assert_eq!(node.position(), Position::Middle);
        previous.ready();
        next.ready();

        let update = Request::update("u1", "k", b"v".to_vec());
        previous.deliver(Message::Request(update.clone()));
        assert_eq!(previous.next_sent().await, Message::Ack(Ack { id: "u1".into() }));
        assert_eq!(next.next_sent().await, Message::Request(update));
        next.deliver(Message::Ack(Ack { id: "u1".into() }));

        let response = Response::new("u1", "k", Some(b"v".to_vec()));
        next.deliver(Message::Response(response.clone()));
        assert_eq!(next.next_sent().await, Message::Ack(Ack { id: "u1".into() }));
        assert_eq!(previous.next_sent().await, Message::Response(response));
        assert_eq!(backend.len(), 1);
        assert_eq!(node.storage().get("k"), Some(b"v".to_vec()));
        Ok(())
    }
}
