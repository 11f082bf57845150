//! Reliable link: in-order, at-least-once delivery over a [`Channel`].
//!
//! The link keeps an outbound backlog and allows exactly one unacknowledged
//! payload on the wire. The peer acknowledges every request or response it
//! receives with an [`Ack`] carrying the payload's business id; a matching ack
//! pops the backlog head and transmits the next entry. Acks that do not match
//! the outstanding head are stale and ignored.
//!
//! When the channel becomes ready again after a disconnect the head is
//! retransmitted, so the receiver may see the same payload twice. The link
//! remembers the last payload it delivered and re-acknowledges such a
//! duplicate without handing it to the node a second time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channel::{Channel, ChannelEvent};
use super::message::{Ack, Message};
use crate::error::LinkError;
use crate::types::{Request, Response};

/// Receives what arrives over a link.
///
/// Implementations must not block; they typically enqueue onto a node's
/// operation queues.
pub trait LinkSink: Send + Sync + 'static {
    fn on_request(&self, request: Request);
    fn on_response(&self, response: Response);
    /// The underlying channel has (re)connected.
    fn on_ready(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    /// Connected with nothing outstanding.
    Ready,
    /// Connected with one payload waiting for its ack.
    AwaitingAck,
}

pub struct ReliableLink {
    name: String,
    outbound: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<LinkState>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReliableLink {
    /// Starts the task that drives `channel` and delivers inbound payloads to `sink`.
    pub fn spawn(name: &str, channel: Channel, sink: Arc<dyn LinkSink>, shutdown: CancellationToken) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let driver = Driver {
            name: name.to_string(),
            channel,
            sink,
            outbound: outbound_rx,
            state: state_tx,
            backlog: VecDeque::new(),
            connected: false,
            outstanding: false,
            last_delivered: None,
        };
        let task = tokio::spawn(driver.run(shutdown.clone()));
        Self {
            name: name.to_string(),
            outbound: outbound_tx,
            state: state_rx,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Appends a request or response to the backlog.
    ///
    /// Returns as soon as the payload is queued; delivery is retried across
    /// reconnects until the peer acknowledges it.
    pub fn send(&self, message: Message) -> Result<(), LinkError> {
        if matches!(message, Message::Ack(_)) {
            warn!(link = %self.name, id = message.id(), "acks are not sent through the backlog");
            return Ok(());
        }
        self.outbound.send(message).map_err(|_| LinkError::Closed)
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Waits until the link reaches `state`.
    pub async fn wait_for(&self, state: LinkState) -> Result<(), LinkError> {
        let mut rx = self.state.clone();
        rx.wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| LinkError::Closed)
    }

    /// Stops the link and its channel, abandoning anything still in the backlog.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for ReliableLink {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Driver {
    name: String,
    channel: Channel,
    sink: Arc<dyn LinkSink>,
    outbound: mpsc::UnboundedReceiver<Message>,
    state: watch::Sender<LinkState>,
    backlog: VecDeque<Message>,
    /// Set between the channel's `Ready` and `Closed` events.
    connected: bool,
    outstanding: bool,
    last_delivered: Option<(&'static str, String)>,
}

impl Driver {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                queued = self.outbound.recv() => match queued {
                    Some(message) => {
                        self.backlog.push_back(message);
                        self.transmit_head();
                    }
                    None => break,
                },
                event = self.channel.next_event() => match event {
                    Some(event) => self.on_event(event),
                    None => break,
                },
            }
        }
        debug!(link = %self.name, abandoned = self.backlog.len(), "link stopped");
        self.state.send_replace(LinkState::Disconnected);
        self.channel.shutdown().await;
    }

    fn on_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connecting => {
                self.state.send_replace(LinkState::Connecting);
            }
            ChannelEvent::Ready => {
                info!(link = %self.name, backlog = self.backlog.len(), "link ready");
                self.connected = true;
                self.outstanding = false;
                self.state.send_replace(LinkState::Ready);
                self.transmit_head();
                self.sink.on_ready();
            }
            ChannelEvent::Closed => {
                self.connected = false;
                self.outstanding = false;
                self.state.send_replace(LinkState::Disconnected);
            }
            ChannelEvent::Message(Message::Ack(Ack { id })) => self.on_ack(&id),
            ChannelEvent::Message(message) => self.on_payload(message),
        }
    }

    fn on_ack(&mut self, id: &str) {
        let matches_head = self.outstanding && self.backlog.front().is_some_and(|head| head.id() == id);
        if !matches_head {
            debug!(link = %self.name, %id, "ignoring stale ack");
            return;
        }
        self.backlog.pop_front();
        self.outstanding = false;
        self.state.send_replace(LinkState::Ready);
        self.transmit_head();
    }

    fn on_payload(&mut self, message: Message) {
        let id = message.id().to_string();
        if let Err(error) = self.channel.send(Message::Ack(Ack { id: id.clone() })) {
            debug!(link = %self.name, %id, %error, "could not acknowledge payload");
        }

        let seen = (payload_kind(&message), id);
        if self.last_delivered.as_ref() == Some(&seen) {
            debug!(link = %self.name, id = %seen.1, "dropping duplicate payload");
            return;
        }
        self.last_delivered = Some(seen);

        match message {
            Message::Request(request) => self.sink.on_request(request),
            Message::Response(response) => self.sink.on_response(response),
            Message::Ack(_) => {}
        }
    }

    fn transmit_head(&mut self) {
        if !self.connected || self.outstanding {
            return;
        }
        let Some(head) = self.backlog.front() else {
            return;
        };
        match self.channel.send(head.clone()) {
            Ok(()) => {
                self.outstanding = true;
                self.state.send_replace(LinkState::AwaitingAck);
            }
            Err(error) => debug!(link = %self.name, id = head.id(), %error, "deferring transmit"),
        }
    }
}

fn payload_kind(message: &Message) -> &'static str {
    match message {
        Message::Request(_) => "request",
        Message::Response(_) => "response",
        Message::Ack(_) => "ack",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::transport::channel::ChannelProbe;

    #[derive(Default)]
    struct Collect {
        requests: Mutex<Vec<Request>>,
        responses: Mutex<Vec<Response>>,
        ready: AtomicUsize,
    }

    impl LinkSink for Collect {
        fn on_request(&self, request: Request) {
            self.requests.lock().unwrap().push(request);
        }

        fn on_response(&self, response: Response) {
            self.responses.lock().unwrap().push(response);
        }

        fn on_ready(&self) {
            self.ready.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn update(id: &str) -> Message {
        Message::Request(Request::update(id, "k", id.as_bytes().to_vec()))
    }

    fn ack(id: &str) -> Message {
        Message::Ack(Ack { id: id.into() })
    }

    fn link() -> (ReliableLink, ChannelProbe, Arc<Collect>) {
        let (channel, probe) = ChannelProbe::pair();
        let sink = Arc::new(Collect::default());
        let link = ReliableLink::spawn("test", channel, sink.clone(), CancellationToken::new());
        (link, probe, sink)
    }

    async fn connect(link: &ReliableLink, probe: &mut ChannelProbe) {
        probe.ready();
        timeout(Duration::from_secs(5), link.wait_for(LinkState::Ready))
            .await
            .expect("link should see the channel become ready")
            .unwrap();
    }

    #[tokio::test]
    async fn one_outstanding_message_at_a_time() {
        let (link, mut probe, _sink) = link();
        connect(&link, &mut probe).await;
        link.send(update("a")).unwrap();
        link.send(update("b")).unwrap();

        assert_eq!(probe.next_sent().await, update("a"));
        probe.assert_quiet().await;
        assert_eq!(link.state(), LinkState::AwaitingAck);

        probe.deliver(ack("a"));
        assert_eq!(probe.next_sent().await, update("b"));
        probe.deliver(ack("b"));
        timeout(Duration::from_secs(5), link.wait_for(LinkState::Ready))
            .await
            .expect("link should settle")
            .unwrap();
    }

    #[tokio::test]
    async fn stale_acks_are_ignored() {
        let (link, mut probe, _sink) = link();
        connect(&link, &mut probe).await;
        link.send(update("a")).unwrap();
        link.send(update("b")).unwrap();
        assert_eq!(probe.next_sent().await, update("a"));

        probe.deliver(ack("zzz"));
        probe.deliver(ack("b"));
        probe.assert_quiet().await;
        assert_eq!(link.state(), LinkState::AwaitingAck);

        probe.deliver(ack("a"));
        assert_eq!(probe.next_sent().await, update("b"));
    }

    #[tokio::test]
    async fn backlog_waits_for_ready_and_resends_after_reconnect() {
        let (link, mut probe, sink) = link();
        link.send(update("a")).unwrap();
        probe.assert_quiet().await;

        probe.ready();
        assert_eq!(probe.next_sent().await, update("a"));

        probe.close();
        probe.ready();
        assert_eq!(probe.next_sent().await, update("a"));
        probe.deliver(ack("a"));
        probe.assert_quiet().await;

        // An ack for a payload acknowledged already changes nothing.
        probe.deliver(ack("a"));
        probe.assert_quiet().await;
        assert_eq!(sink.ready.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn inbound_payloads_are_acked_and_delivered_once() {
        let (link, mut probe, sink) = link();
        connect(&link, &mut probe).await;

        probe.deliver(update("u1"));
        assert_eq!(probe.next_sent().await, ack("u1"));
        probe.deliver(update("u1"));
        assert_eq!(probe.next_sent().await, ack("u1"));

        let response = Message::Response(Response::new("u1", "k", Some(b"u1".to_vec())));
        probe.deliver(response.clone());
        assert_eq!(probe.next_sent().await, ack("u1"));

        probe.assert_quiet().await;
        assert_eq!(sink.requests.lock().unwrap().len(), 1);
        assert_eq!(sink.responses.lock().unwrap().len(), 1);
        link.close().await;
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (link, _probe, _sink) = link();
        link.close().await;
        assert_eq!(link.send(update("a")), Err(LinkError::Closed));
        assert_eq!(link.state(), LinkState::Disconnected);
    }
}
