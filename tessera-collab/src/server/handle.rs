//! Server-side handle for one connected client.

use tokio::sync::{mpsc, Mutex};

use crate::protocol::Message;

use super::channel_session::ChannelSession;

/// Context handed to pre/after hooks alongside the message.
#[derive(Debug, Clone, Default)]
pub struct HookParams {
    /// True for in-process models created by `Store::create_model`.
    pub server: bool,
}

/// One accepted connection: its outgoing sender plus its cursor session.
///
/// Lock order: code may acquire a doc/query lock while holding the session
/// lock, never the other way around.
pub struct ClientHandle {
    pub id: u64,
    tx: mpsc::Sender<Message>,
    pub session: Mutex<ChannelSession>,
    pub params: HookParams,
}

impl ClientHandle {
    pub fn new(id: u64, tx: mpsc::Sender<Message>, params: HookParams) -> Self {
        Self {
            id,
            tx,
            session: Mutex::new(ChannelSession::new()),
            params,
        }
    }

    /// Send a message to this client.
    ///
    /// A failed send is logged and isolated to this channel: it never
    /// affects other connections or crashes the store.
    pub async fn send(&self, message: Message) -> bool {
        if self.tx.send(message).await.is_err() {
            log::warn!("send to client {} failed: channel closed", self.id);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_failure_isolation() {
        let (tx, mut rx) = mpsc::channel(4);
        let client = ClientHandle::new(1, tx, HookParams::default());

        assert!(client.send(Message::Handshake { id: "r".into() }).await);
        assert!(matches!(rx.recv().await, Some(Message::Handshake { .. })));

        drop(rx);
        // Closed channel: reported, not panicked.
        assert!(!client.send(Message::Handshake { id: "r".into() }).await);
    }
}
