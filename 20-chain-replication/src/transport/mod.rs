//! Node-to-node transport: JSON-lines frames over TCP, a raw [`Channel`] that
//! reconnects on its own, and a [`ReliableLink`] that adds acknowledgments.

pub mod channel;
pub mod link;
pub mod message;

pub use channel::{Channel, ChannelEvent};
pub use link::{LinkSink, LinkState, ReliableLink};
pub use message::{Ack, Message};
