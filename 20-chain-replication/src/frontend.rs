//! Query-facing boundary of the chain.
//!
//! Callers hand requests to the head (updates) or the tail (queries) and get
//! the matching [`Response`] back through a [`QueryInterface`]. [`Replies`] is
//! the in-process implementation: it pairs each request id with a one-shot
//! reply slot, and [`Client`] builds on it to offer `update`/`query` calls
//! that wait for the chain to answer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ChainError;
use crate::queue::QueueHandle;
use crate::types::{Request, Response};

/// Callback a node uses to hand results back to whoever submitted a request.
pub trait QueryInterface: Send + Sync + 'static {
    /// Final response for a committed update (at the head) or a query (at the tail).
    fn on_response(&self, response: Response);

    /// `request` was refused by the node and will never get a response.
    fn on_rejected(&self, request: &Request, error: ChainError);
}

pub type Reply = Result<Response, ChainError>;

/// Pending replies keyed by request id. Each id is answered at most once.
#[derive(Default)]
pub struct Replies {
    waiting: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
}

impl Replies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the reply slot for `id`, replacing any earlier registration.
    pub fn register(&self, id: impl Into<String>) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.into(), tx);
        rx
    }

    /// Drops the reply slot for `id` without answering it.
    pub fn cancel(&self, id: &str) {
        self.lock().remove(id);
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn complete(&self, id: &str, reply: Reply) {
        let Some(tx) = self.lock().remove(id) else {
            debug!(%id, "no caller waiting for reply");
            return;
        };
        if tx.send(reply).is_err() {
            debug!(%id, "caller stopped waiting for reply");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Reply>>> {
        self.waiting
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl QueryInterface for Replies {
    fn on_response(&self, response: Response) {
        let id = response.id.clone();
        self.complete(&id, Ok(response));
    }

    fn on_rejected(&self, request: &Request, error: ChainError) {
        self.complete(&request.id, Err(error));
    }
}

/// Submits requests to a chain and waits for their replies.
///
/// Updates enter at `head`, queries at `tail`. Both nodes must report to the
/// same [`Replies`].
#[derive(Clone)]
pub struct Client {
    replies: Arc<Replies>,
    head: QueueHandle<Request>,
    tail: QueueHandle<Request>,
}

impl Client {
    pub fn new(replies: Arc<Replies>, head: QueueHandle<Request>, tail: QueueHandle<Request>) -> Self {
        Self { replies, head, tail }
    }

    pub async fn update(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Reply {
        self.submit(Request::update(nanoid::nanoid!(), key, value)).await
    }

    pub async fn query(&self, key: impl Into<String>) -> Reply {
        self.submit(Request::query(nanoid::nanoid!(), key)).await
    }

    /// Routes `request` to the head or the tail according to its kind.
    pub async fn submit(&self, request: Request) -> Reply {
        let target = if request.is_update() { &self.head } else { &self.tail };
        self.submit_at(target, request).await
    }

    /// Hands `request` to an arbitrary node's request queue.
    pub async fn submit_at(&self, node: &QueueHandle<Request>, request: Request) -> Reply {
        let id = request.id.clone();
        let reply = self.replies.register(id.clone());
        if let Err(err) = node.enqueue(request) {
            self.replies.cancel(&id);
            return Err(err);
        }
        reply.await.map_err(|_| ChainError::Stopped)?
    }
}
