//! Single relay connection management
//!
//! A [`RelayConnection`] owns one transport to one relay. Each connection runs a
//! driver task that opens the transport, writes queued frames, reads inbound
//! frames and hands parsed messages to every registered listener. The status
//! records whether the connection ended because we closed it or because the
//! relay went away; only the latter makes a relay eligible for reconnection.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Event, Filter, RelayMessage};
use crate::transport::{FrameSink, FrameStream, Transport, TransportFactory, default_factory};
use crate::url::RelayUrl;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, trace, warn};

/// Upper bound on flushing a close frame to the relay.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayStatus {
    /// Transport is still opening
    Connecting,
    /// Connected and ready
    Open,
    /// Closed by us
    ClosedLocal,
    /// Closed by the relay, or the connect attempt failed
    ClosedRemote,
}

impl RelayStatus {
    pub fn is_closed(self) -> bool {
        matches!(self, RelayStatus::ClosedLocal | RelayStatus::ClosedRemote)
    }
}

/// Relay connection configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

struct Shared {
    url: RelayUrl,
    status: watch::Sender<RelayStatus>,
    outbound: mpsc::UnboundedSender<String>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<RelayMessage>>>,
    connect_error: Mutex<Option<String>>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    /// Move to a closed status unless already closed.
    fn mark_closed(&self, status: RelayStatus) -> bool {
        self.status.send_if_modified(|current| {
            if current.is_closed() {
                return false;
            }
            *current = status;
            true
        })
    }

    fn dispatch(&self, text: &str) {
        let msg = match RelayMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Ignoring unparseable frame from {}: {}", self.url, e);
                return;
            }
        };
        trace!("{} from {}", msg.type_name(), self.url);
        self.listeners
            .lock()
            .retain(|listener| listener.send(msg.clone()).is_ok());
    }
}

/// Relay connection
///
/// Cloning yields another handle to the same connection. When every handle is
/// dropped the driver task stops.
#[derive(Clone)]
pub struct RelayConnection {
    shared: Arc<Shared>,
    _guard: Arc<DropGuard>,
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.shared.url)
            .field("status", &self.status())
            .finish()
    }
}

impl RelayConnection {
    /// Start connecting to a relay over WebSocket.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RelayConfig::default())
    }

    /// Start connecting over WebSocket with custom config
    pub fn with_config(url: &str, config: RelayConfig) -> Result<Self> {
        Self::connect(url, default_factory(config).as_ref())
    }

    /// Start connecting to `url` with a transport from `factory`.
    ///
    /// Returns as soon as the driver task is running; use [`until_open`] to
    /// wait for the outcome. Must be called inside a Tokio runtime.
    ///
    /// [`until_open`]: RelayConnection::until_open
    pub fn connect(url: &str, factory: &dyn TransportFactory) -> Result<Self> {
        let url = RelayUrl::parse(url)?;
        Self::connect_url(url, factory)
    }

    /// Like [`connect`](RelayConnection::connect) for an already normalized URL.
    pub fn connect_url(url: RelayUrl, factory: &dyn TransportFactory) -> Result<Self> {
        let transport = factory.create(&url).map_err(|e| match e {
            ClientError::ConnectFailed(reason) => ClientError::ConnectFailed(reason),
            other => ClientError::ConnectFailed(other.to_string()),
        })?;
        Ok(Self::spawn(url, transport))
    }

    fn spawn(url: RelayUrl, transport: Box<dyn Transport>) -> Self {
        let (status, _) = watch::channel(RelayStatus::Connecting);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let shared = Arc::new(Shared {
            url,
            status,
            outbound,
            listeners: Mutex::new(Vec::new()),
            connect_error: Mutex::new(None),
            cancel: cancel.clone(),
            driver: Mutex::new(None),
        });

        let handle = tokio::spawn(drive(Arc::clone(&shared), transport, outbound_rx));
        *shared.driver.lock() = Some(handle);

        Self {
            shared,
            _guard: Arc::new(cancel.drop_guard()),
        }
    }

    /// Normalized relay URL
    pub fn url(&self) -> &RelayUrl {
        &self.shared.url
    }

    /// Get current connection status
    pub fn status(&self) -> RelayStatus {
        *self.shared.status.borrow()
    }

    /// Check if open
    pub fn is_open(&self) -> bool {
        self.status() == RelayStatus::Open
    }

    /// Watch status transitions.
    pub fn watch_status(&self) -> watch::Receiver<RelayStatus> {
        self.shared.status.subscribe()
    }

    /// True if both handles refer to the same connection.
    pub fn same_connection(&self, other: &RelayConnection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Wait until the relay is open.
    ///
    /// Fails with [`ClientError::ConnectFailed`] when the connect attempt
    /// failed and [`ClientError::ConnectionClosed`] when the connection was
    /// closed instead.
    pub async fn until_open(&self) -> Result<()> {
        let mut status = self.watch_status();
        let reached = status
            .wait_for(|s| *s != RelayStatus::Connecting)
            .await
            .map(|s| *s)
            .map_err(|_| ClientError::ConnectionClosed(self.url().to_string()))?;

        match reached {
            RelayStatus::Open => Ok(()),
            _ => {
                let connect_error = self.shared.connect_error.lock().clone();
                match connect_error {
                    Some(reason) => Err(ClientError::ConnectFailed(format!(
                        "{}: {}",
                        self.url(),
                        reason
                    ))),
                    None => Err(ClientError::ConnectionClosed(self.url().to_string())),
                }
            }
        }
    }

    /// Queue a raw frame for the relay.
    pub fn send_frame(&self, frame: String) -> Result<()> {
        if !self.is_open() {
            return Err(ClientError::NotOpen(self.url().to_string()));
        }
        self.shared
            .outbound
            .send(frame)
            .map_err(|_| ClientError::NotOpen(self.url().to_string()))
    }

    /// Queue a protocol message for the relay.
    pub fn send(&self, msg: &ClientMessage) -> Result<()> {
        if !self.is_open() {
            return Err(ClientError::NotOpen(self.url().to_string()));
        }
        self.send_frame(msg.to_json()?)
    }

    /// Send a REQ.
    pub fn subscribe(&self, subscription_id: &str, filters: Vec<Filter>) -> Result<()> {
        self.send(&ClientMessage::req(subscription_id, filters))
    }

    /// Send a CLOSE.
    pub fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.send(&ClientMessage::close(subscription_id))
    }

    /// Send an EVENT.
    pub fn publish(&self, event: Event) -> Result<()> {
        self.send(&ClientMessage::Event(event))
    }

    /// Register a listener for inbound messages.
    ///
    /// Every message parsed after this call is delivered in arrival order. The
    /// receiver ends when the connection closes; on an already closed
    /// connection it ends immediately.
    pub fn subscribe_messages(&self) -> mpsc::UnboundedReceiver<RelayMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.shared.listeners.lock();
        if !self.status().is_closed() {
            listeners.push(tx);
        }
        rx
    }

    /// Close the connection from our side.
    ///
    /// The status becomes [`RelayStatus::ClosedLocal`], even if the relay had
    /// already dropped us. Closing twice is a no-op.
    pub async fn close(&self) {
        let changed = self.shared.status.send_if_modified(|current| {
            if *current == RelayStatus::ClosedLocal {
                return false;
            }
            *current = RelayStatus::ClosedLocal;
            true
        });
        self.shared.cancel.cancel();

        let driver = self.shared.driver.lock().take();
        if let Some(handle) = driver
            && let Err(e) = handle.await
        {
            warn!("Driver for {} ended abnormally: {}", self.url(), e);
        }

        if changed {
            info!("Disconnected from relay: {}", self.url());
        }
    }
}

async fn drive(
    shared: Arc<Shared>,
    transport: Box<dyn Transport>,
    outbound: mpsc::UnboundedReceiver<String>,
) {
    debug!("Connecting to relay: {}", shared.url);

    let connected = tokio::select! {
        _ = shared.cancel.cancelled() => None,
        res = transport.connect() => Some(res),
    };

    match connected {
        None => {
            debug!("Connect to {} cancelled", shared.url);
            shared.mark_closed(RelayStatus::ClosedLocal);
        }
        Some(Err(e)) => {
            warn!("Failed to connect to relay {}: {}", shared.url, e);
            *shared.connect_error.lock() = Some(e.to_string());
            shared.mark_closed(RelayStatus::ClosedRemote);
        }
        Some(Ok((sink, stream))) => {
            let opened = shared.status.send_if_modified(|current| {
                if *current != RelayStatus::Connecting {
                    return false;
                }
                *current = RelayStatus::Open;
                true
            });

            if opened {
                info!("Connected to relay: {}", shared.url);
                run_open(&shared, sink, stream, outbound).await;
            } else {
                close_sink(&shared.url, sink).await;
            }
        }
    }

    // Ends every listener's stream
    shared.listeners.lock().clear();
}

async fn run_open(
    shared: &Shared,
    mut sink: FrameSink,
    mut stream: FrameStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let remote = loop {
        tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => break false,

            frame = outbound.recv() => {
                let Some(frame) = frame else { break false };
                let sent = tokio::select! {
                    _ = shared.cancel.cancelled() => break false,
                    sent = sink.send(frame) => sent,
                };
                if let Err(e) = sent {
                    warn!("Failed to send to {}: {}", shared.url, e);
                    break true;
                }
            }

            incoming = stream.next() => match incoming {
                Some(Ok(text)) => shared.dispatch(&text),
                Some(Err(e)) => {
                    warn!("Transport error from {}: {}", shared.url, e);
                    break true;
                }
                None => {
                    info!("Relay {} closed connection", shared.url);
                    break true;
                }
            },
        }
    };

    if remote {
        shared.mark_closed(RelayStatus::ClosedRemote);
    } else {
        shared.mark_closed(RelayStatus::ClosedLocal);
        close_sink(&shared.url, sink).await;
    }
}

async fn close_sink(url: &RelayUrl, mut sink: FrameSink) {
    match timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Error closing connection to {}: {}", url, e),
        Err(_) => debug!("Timed out closing connection to {}", url),
    }
}
