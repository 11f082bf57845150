//! Raw duplex channel between two adjacent nodes.
//!
//! A [`Channel`] owns a background task that keeps one TCP connection alive
//! and reports what happens to it as [`ChannelEvent`]s:
//!
//! - [`Channel::listen`] accepts a peer. Only one connection is canonical; any
//!   further connection attempt while it is alive is rejected.
//! - [`Channel::connect`] dials a peer and, after any close or failed attempt,
//!   tries again after a fixed delay until the channel is shut down.
//!
//! Frames are JSON lines (see [`super::message`]). [`Channel::send`] only
//! succeeds while a connection is live; anything queued when a connection
//! dies is discarded, the reliable link above retransmits on the next
//! [`ChannelEvent::Ready`].

use std::future::pending;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::message::{Message, read_message, write_message};
use crate::error::LinkError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A connection attempt is under way.
    Connecting,
    /// A connection is live; `send` will now transmit.
    Ready,
    Message(Message),
    /// The live connection ended.
    Closed,
}

pub struct Channel {
    outbound: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Channel {
    /// Serves the first peer that connects to `listener`.
    pub fn listen(listener: TcpListener, shutdown: CancellationToken) -> Self {
        let (channel, io) = Self::parts(shutdown);
        let task = tokio::spawn(run_listener(listener, io));
        channel.with_task(task)
    }

    /// Dials `addr`, reconnecting after every close with a fixed `delay`.
    pub fn connect(addr: SocketAddr, delay: Duration, shutdown: CancellationToken) -> Self {
        let (channel, io) = Self::parts(shutdown);
        let task = tokio::spawn(run_connector(addr, delay, io));
        channel.with_task(task)
    }

    /// Transmits `message` on the live connection.
    pub fn send(&self, message: Message) -> Result<(), LinkError> {
        if self.shutdown.is_cancelled() {
            return Err(LinkError::Closed);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LinkError::NotReady);
        }
        self.outbound.send(message).map_err(|_| LinkError::Closed)
    }

    pub fn is_ready(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Next event, or `None` once the background task has stopped.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Stops the background task, including any pending reconnect.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn parts(shutdown: CancellationToken) -> (Self, ChannelIo) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let channel = Self {
            outbound: outbound_tx,
            events: events_rx,
            connected: Arc::clone(&connected),
            shutdown: shutdown.clone(),
            task: None,
        };
        let io = ChannelIo {
            outbound: outbound_rx,
            events: events_tx,
            connected,
            shutdown,
        };
        (channel, io)
    }

    fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// The background task's side of a [`Channel`].
struct ChannelIo {
    outbound: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl ChannelIo {
    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    /// Runs one connection until it closes or the channel shuts down.
    async fn serve(&mut self, stream: TcpStream, listener: Option<&TcpListener>) {
        let peer = stream.peer_addr().ok();
        let (reader, mut writer) = stream.into_split();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_frames(reader, inbound_tx));

        // Anything queued for a previous connection is stale.
        while self.outbound.try_recv().is_ok() {}
        self.connected.store(true, Ordering::SeqCst);
        self.emit(ChannelEvent::Ready);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                outgoing = self.outbound.recv() => {
                    let Some(message) = outgoing else { break };
                    if let Err(error) = write_message(&mut writer, &message).await {
                        warn!(?peer, %error, "failed to write frame");
                        break;
                    }
                }
                incoming = inbound_rx.recv() => match incoming {
                    Some(message) => self.emit(ChannelEvent::Message(message)),
                    None => break,
                },
                extra = accept_extra(listener) => {
                    if let Ok((_stream, other)) = extra {
                        warn!(%other, "rejecting connection, channel already has a peer");
                    }
                }
            }
        }

        reader_task.abort();
        self.connected.store(false, Ordering::SeqCst);
        info!(?peer, "connection closed");
        self.emit(ChannelEvent::Closed);
    }
}

async fn run_listener(listener: TcpListener, mut io: ChannelIo) {
    loop {
        let accepted = tokio::select! {
            _ = io.shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                info!(%peer, "accepted peer connection");
                io.serve(stream, Some(&listener)).await;
            }
            Err(error) => warn!(%error, "failed to accept connection"),
        }
    }
}

async fn run_connector(addr: SocketAddr, delay: Duration, mut io: ChannelIo) {
    loop {
        io.emit(ChannelEvent::Connecting);
        let connected = tokio::select! {
            _ = io.shutdown.cancelled() => return,
            connected = TcpStream::connect(addr) => connected,
        };
        match connected {
            Ok(stream) => {
                info!(%addr, "connected to peer");
                io.serve(stream, None).await;
            }
            Err(error) => debug!(%addr, %error, "connect attempt failed"),
        }

        tokio::select! {
            _ = io.shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => debug!(%addr, "reconnecting"),
        }
    }
}

async fn read_frames(reader: OwnedReadHalf, inbound: mpsc::UnboundedSender<Message>) {
    let mut reader = BufReader::new(reader);
    loop {
        match read_message::<_, Message>(&mut reader).await {
            Ok(Some(message)) => {
                if inbound.send(message).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(error) if error.kind() == io::ErrorKind::InvalidData => {
                warn!(%error, "dropping malformed frame");
            }
            Err(error) => {
                debug!(%error, "read failed");
                return;
            }
        }
    }
}

async fn accept_extra(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => pending().await,
    }
}

/// Test double: a [`Channel`] whose connection is driven by hand.
#[cfg(test)]
pub(crate) struct ChannelProbe {
    pub(crate) sent: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    connected: Arc<AtomicBool>,
}

#[cfg(test)]
impl ChannelProbe {
    pub(crate) fn pair() -> (Channel, ChannelProbe) {
        let (channel, io) = Channel::parts(CancellationToken::new());
        let probe = ChannelProbe {
            sent: io.outbound,
            events: io.events,
            connected: io.connected,
        };
        (channel, probe)
    }

    pub(crate) fn ready(&mut self) {
        while self.sent.try_recv().is_ok() {}
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(ChannelEvent::Ready);
    }

    pub(crate) fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(ChannelEvent::Closed);
    }

    pub(crate) fn deliver(&self, message: Message) {
        let _ = self.events.send(ChannelEvent::Message(message));
    }

    pub(crate) async fn next_sent(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(5), self.sent.recv())
            .await
            .expect("timed out waiting for a sent frame")
            .expect("channel dropped")
    }

    /// Lets spawned tasks run, then asserts nothing else was sent.
    pub(crate) async fn assert_quiet(&mut self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Ok(message) = self.sent.try_recv() {
            panic!("unexpected frame: {message:?}");
        }
    }
}
