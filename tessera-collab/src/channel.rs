//! Bidirectional message channels.
//!
//! A [`Channel`] is one endpoint of a message pipe: it sends [`Message`]s to
//! the remote end and receives the remote end's messages. Two endpoints can
//! be paired in-process ([`Channel::pipe`]) to link a model to a store
//! without a network; the WebSocket transport in [`crate::ws`] bridges the
//! same endpoint type over a real connection.

use tokio::sync::mpsc;

use crate::protocol::Message;

/// Messages buffered per direction before senders are backpressured.
pub const CHANNEL_CAPACITY: usize = 256;

/// One endpoint of a bidirectional message transport.
pub struct Channel {
    tx: mpsc::Sender<Message>,
    rx: Option<mpsc::Receiver<Message>>,
}

impl Channel {
    /// Create a cross-wired in-process pair: what one endpoint sends, the
    /// other receives.
    pub fn pipe() -> (Channel, Channel) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Channel {
                tx: b_tx,
                rx: Some(a_rx),
            },
            Channel {
                tx: a_tx,
                rx: Some(b_rx),
            },
        )
    }

    /// Assemble an endpoint from raw halves (used by transport bridges).
    pub fn from_parts(tx: mpsc::Sender<Message>, rx: mpsc::Receiver<Message>) -> Channel {
        Channel { tx, rx: Some(rx) }
    }

    /// Send a message to the remote end.
    pub async fn send(&self, message: Message) -> Result<(), ChannelError> {
        self.tx.send(message).await.map_err(|_| ChannelError::Closed)
    }

    /// A clonable handle for sending to the remote end.
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.tx.clone()
    }

    /// Take the incoming-message receiver (can only be taken once).
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<Message>> {
        self.rx.take()
    }
}

/// Channel errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The remote end is gone.
    Closed,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Closed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for ChannelError {}
