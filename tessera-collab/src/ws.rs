//! WebSocket transport: the socket-based [`Channel`] implementation.
//!
//! The server side accepts connections and hands each one to the store as a
//! regular channel endpoint; the client side connects and returns the peer
//! endpoint for a [`crate::client::Model`]. Wire frames are the JSON
//! protocol messages as text.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use crate::channel::{Channel, CHANNEL_CAPACITY};
use crate::protocol::{Message, ProtocolError};
use crate::server::Store;

/// Bind and serve forever, accepting every connection into the store.
pub async fn serve(store: Arc<Store>, bind_addr: &str) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(bind_addr).await?;
    log::info!("store listening on {bind_addr}");
    accept_loop(store, listener).await
}

/// Bind, spawn the accept loop, and return the bound address (port 0 picks a
/// free one; useful for tests).
pub async fn listen(store: Arc<Store>, bind_addr: &str) -> Result<SocketAddr, std::io::Error> {
    let listener = TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(err) = accept_loop(store, listener).await {
            log::error!("accept loop failed: {err}");
        }
    });
    Ok(addr)
}

async fn accept_loop(store: Arc<Store>, listener: TcpListener) -> Result<(), std::io::Error> {
    loop {
        let (stream, addr) = listener.accept().await?;
        log::debug!("connection from {addr}");
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_socket(store, stream).await {
                log::warn!("connection {addr} ended: {err}");
            }
        });
    }
}

async fn handle_socket(store: Arc<Store>, stream: TcpStream) -> Result<(), ProtocolError> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)?;
    let channel = bridge(ws);
    store.on_channel(channel);
    Ok(())
}

/// Connect to a store and return the channel endpoint for a model.
pub async fn connect(url: &str) -> Result<Channel, ProtocolError> {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)?;
    Ok(bridge(ws))
}

/// Pump a WebSocket stream into a [`Channel`] endpoint: outgoing messages
/// encode to text frames, incoming text frames decode to messages. Either
/// pump ending closes the channel, which the owner observes as a close.
fn bridge<S>(ws: tokio_tungstenite::WebSocketStream<S>) -> Channel
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (incoming_tx, incoming_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);

    // Writer: channel -> socket.
    tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            let encoded = match message.encode() {
                Ok(bytes) => bytes,
                Err(err) => {
                    log::error!("encode failed: {err}");
                    continue;
                }
            };
            let text = match String::from_utf8(encoded) {
                Ok(text) => text,
                Err(err) => {
                    log::error!("non-utf8 frame: {err}");
                    continue;
                }
            };
            if sink.send(tungstenite::Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader: socket -> channel.
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(tungstenite::Message::Text(text)) => match Message::decode(text.as_bytes()) {
                    Ok(message) => {
                        if incoming_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => log::warn!("undecodable frame: {err}"),
                },
                Ok(tungstenite::Message::Binary(data)) => match Message::decode(&data) {
                    Ok(message) => {
                        if incoming_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => log::warn!("undecodable frame: {err}"),
                },
                Ok(tungstenite::Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
        // Dropping incoming_tx closes the channel for the owner.
    });

    Channel::from_parts(outgoing_tx, incoming_rx)
}
