//! Sequential, single-flight operation queue.
//!
//! Every replica node owns two of these: one for inbound requests and one for
//! inbound responses. A queue is split in two halves by [`channel`]:
//!
//! - [`QueueHandle`] is cheap to clone and is what producers (the node, its
//!   links, front ends) use to enqueue elements or trigger a resume.
//! - [`Backlog`] is consumed by [`Backlog::spawn`], which starts the single
//!   worker task that drains the FIFO through a [`Handler`].
//!
//! The worker never runs two handler invocations at once. Under
//! [`Policy::StallOnFailure`] a failed element stays at the head of the backlog
//! and draining stops until [`QueueHandle::resume`] is called.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::ChainError;

/// What the worker does with an element whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Drop the element and move on to the next one.
    AlwaysAdvance,
    /// Keep the element at the head and stop until resumed.
    StallOnFailure,
}

/// Processes one queue element at a time.
pub trait Handler<T>: Send + 'static {
    fn handle(&mut self, item: &T) -> impl Future<Output = Result<(), ChainError>> + Send;
}

/// Snapshot of a queue, published after every change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueState {
    /// Elements accepted but not yet completed, including the one in flight.
    pub backlog: usize,
    pub stalled: bool,
    pub completed: u64,
    pub failed: u64,
}

enum Command<T> {
    Push(T),
    Resume,
}

/// Producer side of an operation queue.
pub struct QueueHandle<T> {
    commands: mpsc::UnboundedSender<Command<T>>,
    state: Arc<watch::Sender<QueueState>>,
}

impl<T> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> QueueHandle<T> {
    /// Appends `item` to the backlog. Never waits for the worker.
    pub fn enqueue(&self, item: T) -> Result<(), ChainError> {
        self.state.send_modify(|state| state.backlog += 1);
        if self.commands.send(Command::Push(item)).is_err() {
            self.state.send_modify(|state| state.backlog -= 1);
            return Err(ChainError::Stopped);
        }
        Ok(())
    }

    /// Restarts draining of a stalled queue from the element that failed.
    ///
    /// Harmless when the queue is not stalled.
    pub fn resume(&self) {
        let _ = self.commands.send(Command::Resume);
    }

    pub fn state(&self) -> QueueState {
        *self.state.borrow()
    }

    /// Waits until every accepted element has been completed.
    ///
    /// Never returns while the queue is stalled on a failed element.
    pub async fn wait_idle(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| state.backlog == 0).await;
    }
}

/// Consumer side of an operation queue; see [`Backlog::spawn`].
pub struct Backlog<T> {
    commands: mpsc::UnboundedReceiver<Command<T>>,
    state: Arc<watch::Sender<QueueState>>,
}

/// Creates a queue and returns its producer and consumer halves.
pub fn channel<T>() -> (QueueHandle<T>, Backlog<T>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (state, _) = watch::channel(QueueState::default());
    let state = Arc::new(state);
    (
        QueueHandle {
            commands: commands_tx,
            state: Arc::clone(&state),
        },
        Backlog {
            commands: commands_rx,
            state,
        },
    )
}

impl<T: Send + Sync + 'static> Backlog<T> {
    /// Starts the worker that drains this queue through `handler`.
    ///
    /// The worker exits when `shutdown` is cancelled (after the element in
    /// flight, if any, finishes) or when every [`QueueHandle`] has been dropped
    /// and nothing runnable is left.
    pub fn spawn<H>(self, name: &str, handler: H, policy: Policy, shutdown: CancellationToken) -> JoinHandle<()>
    where
        H: Handler<T>,
    {
        let worker = Worker {
            name: name.to_string(),
            commands: self.commands,
            state: self.state,
            items: VecDeque::new(),
            stalled: false,
            closed: false,
            handler,
            policy,
        };
        tokio::spawn(worker.run(shutdown))
    }
}

struct Worker<T, H> {
    name: String,
    commands: mpsc::UnboundedReceiver<Command<T>>,
    state: Arc<watch::Sender<QueueState>>,
    items: VecDeque<T>,
    stalled: bool,
    closed: bool,
    handler: H,
    policy: Policy,
}

impl<T, H> Worker<T, H>
where
    T: Send + Sync + 'static,
    H: Handler<T>,
{
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            while let Ok(command) = self.commands.try_recv() {
                self.apply(command);
            }
            if shutdown.is_cancelled() {
                break;
            }

            if !self.stalled && !self.items.is_empty() {
                self.process_front().await;
                continue;
            }

            if self.closed {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => self.closed = true,
                },
            }
        }
        debug!(queue = %self.name, remaining = self.items.len(), "queue worker stopped");
    }

    fn apply(&mut self, command: Command<T>) {
        match command {
            Command::Push(item) => self.items.push_back(item),
            Command::Resume => {
                if self.stalled {
                    debug!(queue = %self.name, "resuming stalled queue");
                    self.stalled = false;
                    self.state.send_modify(|state| state.stalled = false);
                }
            }
        }
    }

    async fn process_front(&mut self) {
        let Some(item) = self.items.front() else {
            return;
        };

        let outcome = AssertUnwindSafe(self.handler.handle(item)).catch_unwind().await;
        let result = outcome.unwrap_or_else(|_| {
            error!(queue = %self.name, "queue handler panicked");
            Err(ChainError::Panicked)
        });

        match result {
            Ok(()) => {
                self.items.pop_front();
                self.state.send_modify(|state| {
                    state.backlog -= 1;
                    state.completed += 1;
                });
            }
            Err(err) => match self.policy {
                Policy::AlwaysAdvance => {
                    warn!(queue = %self.name, error = %err, "handler failed, skipping element");
                    self.items.pop_front();
                    self.state.send_modify(|state| {
                        state.backlog -= 1;
                        state.failed += 1;
                    });
                }
                Policy::StallOnFailure => {
                    warn!(queue = %self.name, error = %err, "handler failed, queue stalled");
                    self.stalled = true;
                    self.state.send_modify(|state| {
                        state.stalled = true;
                        state.failed += 1;
                    });
                }
            },
        }
    }
}
