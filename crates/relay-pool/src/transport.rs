//! Transport abstraction for relay connections.
//!
//! A [`Transport`] opens one connection and hands back a frame sink and a frame
//! stream. The stream ending, or yielding an error, means the remote side went
//! away. [`WebSocketTransport`] is the production implementation; tests plug in
//! their own through a [`TransportFactory`].

use crate::error::Result;
use crate::relay::RelayConfig;
use crate::url::RelayUrl;
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::trace;

/// Transport level failures.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connection timeout after {0:?}")]
    Timeout(Duration),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("connection closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            other => TransportError::Send(other.to_string()),
        }
    }
}

/// Outgoing half of an open transport. Closing the sink closes the connection.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Incoming half of an open transport.
pub type FrameStream = Pin<Box<dyn Stream<Item = std::result::Result<String, TransportError>> + Send>>;

/// A connection to one relay that has not been opened yet.
#[async_trait]
pub trait Transport: Send {
    /// Open the connection. Must resolve eventually, either open or failed.
    async fn connect(
        self: Box<Self>,
    ) -> std::result::Result<(FrameSink, FrameStream), TransportError>;
}

/// Builds a [`Transport`] for a relay.
pub trait TransportFactory: Send + Sync {
    fn create(&self, url: &RelayUrl) -> Result<Box<dyn Transport>>;
}

impl<F> TransportFactory for F
where
    F: Fn(&RelayUrl) -> Result<Box<dyn Transport>> + Send + Sync,
{
    fn create(&self, url: &RelayUrl) -> Result<Box<dyn Transport>> {
        self(url)
    }
}

/// WebSocket transport over tokio-tungstenite.
pub struct WebSocketTransport {
    url: RelayUrl,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(url: RelayUrl, config: &RelayConfig) -> Self {
        Self {
            url,
            connect_timeout: config.connect_timeout,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        self: Box<Self>,
    ) -> std::result::Result<(FrameSink, FrameStream), TransportError> {
        let (ws_stream, _) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (sink, stream) = ws_stream.split();

        let sink = sink
            .sink_map_err(TransportError::from)
            .with(|frame: String| future::ready(Ok::<_, TransportError>(Message::text(frame))));

        let url = self.url;
        let stream = stream.filter_map(move |msg| {
            let frame = match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => String::from_utf8(data.to_vec()).ok().map(Ok),
                Ok(Message::Close(frame)) => {
                    trace!("Relay {} sent close frame: {:?}", url, frame);
                    None
                }
                // Ping/pong are answered by tungstenite itself
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::Receive(e.to_string()))),
            };
            future::ready(frame)
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Factory producing [`WebSocketTransport`]s.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransportFactory {
    config: RelayConfig,
}

impl WebSocketTransportFactory {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn create(&self, url: &RelayUrl) -> Result<Box<dyn Transport>> {
        Ok(Box::new(WebSocketTransport::new(url.clone(), &self.config)))
    }
}

/// The default factory used by pools and connections.
pub fn default_factory(config: RelayConfig) -> Arc<dyn TransportFactory> {
    Arc::new(WebSocketTransportFactory::new(config))
}
