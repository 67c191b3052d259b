//! Nostr relay connection pool.
//!
//! This crate provides:
//! - WebSocket connections to Nostr relays
//! - Message parsing (NIP-01 relay protocol)
//! - A pool that sends each subscription to every relay and merges the answers
//!   into one stream per subscription
//! - Tracking of relays the remote side dropped, for reconnection
//!
//! # Example
//!
//! ```rust,no_run
//! use relay_pool::{ConnectionPool, Filter, RelayMessage};
//!
//! #[tokio::main]
//! async fn main() {
//!     let pool = ConnectionPool::new();
//!
//!     // Relays that fail to connect are reported, the rest are added
//!     if let Some(errors) = pool.add_relay_urls(["wss://relay.damus.io", "nos.lol"]).await {
//!         for (url, err) in errors {
//!             eprintln!("{url}: {err}");
//!         }
//!     }
//!
//!     // Subscribe to kind 1 (text notes)
//!     let filter = Filter::new().kinds(vec![1]).limit(10);
//!     let mut sub = pool.new_sub("notes", filter).await.unwrap();
//!
//!     while let Some(msg) = sub.pop().await {
//!         match msg.message {
//!             RelayMessage::Event { event, .. } => {
//!                 println!("{} from {}", event.id, msg.relay_url);
//!             }
//!             RelayMessage::Eose { .. } => {
//!                 if pool.all_eose("notes").await == Some(true) {
//!                     break;
//!                 }
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     pool.close().await;
//! }
//! ```

mod channel;
mod error;
mod message;
mod pool;
mod relay;
mod subscription;
mod transport;
mod url;

// Re-export main types
pub use channel::{ChannelReceiver, ChannelSender, channel};
pub use error::{ClientError, ErrorKind, Result};
pub use message::{ClientMessage, Event, Filter, MessageError, RelayMessage};
pub use pool::{ConnectionPool, PoolConfig, PoolMessage};
pub use relay::{RelayConfig, RelayConnection, RelayStatus};
pub use subscription::{SubscriptionStream, generate_subscription_id};
pub use transport::{
    FrameSink, FrameStream, Transport, TransportError, TransportFactory, WebSocketTransport,
    WebSocketTransportFactory, default_factory,
};
pub use crate::url::RelayUrl;

/// Well-known public relays.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://nostr.wine",
];

/// Create a pool connected to [`DEFAULT_RELAYS`].
///
/// Relays that fail to connect are logged and left out.
pub async fn default_pool() -> ConnectionPool {
    let pool = ConnectionPool::new();
    if let Some(errors) = pool.add_relay_urls(DEFAULT_RELAYS).await {
        for (url, err) in errors {
            tracing::warn!("Skipping default relay {}: {}", url, err);
        }
    }
    pool
}
