//! Transport boundary between the supervisor and the network.
//!
//! A [`Transport`] owns one relay connection. The supervisor only ever
//! talks to relays through this trait, which keeps every other component
//! free of socket handling and lets tests swap in the in-memory transport.

use crate::config::validate_relay_url;
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage};
use crate::task::ScheduledTask;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

/// Something a connected transport reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A decoded relay frame
    Message(RelayMessage),
    /// The connection ended; no more frames follow
    Disconnected { reason: String },
}

pub type TransportReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// One relay connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection. The returned stream carries every inbound frame
    /// until the connection ends; a closed stream also means disconnected.
    async fn connect(&self) -> Result<TransportReceiver>;

    /// Send one protocol message.
    async fn send(&self, message: &ClientMessage) -> Result<()>;

    /// Tear the connection down. Idempotent.
    async fn close(&self);
}

/// Creates a transport for a relay address.
pub trait TransportFactory: Send + Sync {
    fn create(&self, url: &str) -> Result<Arc<dyn Transport>>;
}

/// Factory for [`WebSocketTransport`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketFactory;

impl TransportFactory for WebSocketFactory {
    fn create(&self, url: &str) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(WebSocketTransport::new(url)?))
    }
}

/// WebSocket transport built on tokio-tungstenite.
pub struct WebSocketTransport {
    url: Url,
    /// Outgoing frames, drained by the writer task
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    /// Receive loop
    reader: Mutex<Option<ScheduledTask>>,
}

impl WebSocketTransport {
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            url: validate_relay_url(url)?,
            outbound: Mutex::new(None),
            reader: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<TransportReceiver> {
        let url = self.url.to_string();
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientError::transport(&url, e))?;
        info!("WebSocket open: {}", url);

        let (mut sink, mut stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let writer_url = url.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    warn!("WebSocket send to {} failed: {}", writer_url, e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let pong_tx = out_tx.clone();
        let reader = ScheduledTask::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => match RelayMessage::from_json(&text) {
                        Ok(msg) => {
                            if in_tx.send(TransportEvent::Message(msg)).is_err() {
                                return;
                            }
                        }
                        Err(e) => debug!("Ignoring unparseable frame from {}: {}", url, e),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = pong_tx.send(Message::Pong(data));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("Relay {} closed connection", url);
                        break frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed by relay".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", url, e);
                        break e.to_string();
                    }
                    None => break "stream ended".to_string(),
                }
            };
            let _ = in_tx.send(TransportEvent::Disconnected { reason });
        });

        *self.outbound.lock() = Some(out_tx);
        *self.reader.lock() = Some(reader);
        Ok(in_rx)
    }

    async fn send(&self, message: &ClientMessage) -> Result<()> {
        let text = message.to_json()?;
        let outbound = self.outbound.lock().clone();
        let Some(tx) = outbound else {
            return Err(ClientError::NotConnected);
        };
        debug!("Sending to {}: {}", self.url, text);
        tx.send(Message::Text(text.into()))
            .map_err(|_| ClientError::NotConnected)
    }

    async fn close(&self) {
        // Queue a close frame; the writer exits once every sender is gone.
        if let Some(tx) = self.outbound.lock().take() {
            let _ = tx.send(Message::Close(None));
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.cancel();
        }
    }
}
