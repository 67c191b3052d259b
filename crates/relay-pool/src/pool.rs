//! Relay pool for managing connections to multiple Nostr relays.
//!
//! The pool keeps one [`RelayConnection`] per normalized relay URL and a
//! registry of subscriptions. Subscribing sends the REQ to every open relay;
//! adding a relay replays every active REQ to it. Each relay has its own fan-in
//! task that routes inbound messages, by subscription id, into the output
//! stream of the matching subscription.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Event, Filter, RelayMessage};
use crate::relay::{RelayConfig, RelayConnection, RelayStatus};
use crate::subscription::{
    SubscriptionEntry, SubscriptionRegistry, SubscriptionStream, generate_subscription_id,
};
use crate::transport::{TransportFactory, default_factory};
use crate::url::RelayUrl;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

type RelayMap = HashMap<RelayUrl, RelayConnection>;

/// A message delivered to a subscription, tagged with the relay it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolMessage {
    pub relay_url: RelayUrl,
    pub message: RelayMessage,
}

/// Configuration for the relay pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Configuration for every relay connection the pool opens
    pub relay: RelayConfig,
    /// How often the background scan looks for dropped relays
    pub health_check_interval: Duration,
    /// Reconnect relays the remote side dropped
    pub auto_reconnect: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            health_check_interval: Duration::from_secs(5),
            auto_reconnect: false,
        }
    }
}

enum Registration {
    New,
    Replace,
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn TransportFactory>,
    relays: Arc<RwLock<RelayMap>>,
    subscriptions: Arc<RwLock<SubscriptionRegistry>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A pool of Nostr relay connections.
///
/// Cloning yields another handle to the same pool. Call [`close`] to shut it
/// down; dropping every handle only stops the background tasks.
///
/// [`close`]: ConnectionPool::close
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool with the default config and WebSocket transport.
    ///
    /// Spawns the health scan, so this must be called inside a Tokio runtime.
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    /// Create a pool with custom config and the WebSocket transport.
    pub fn with_config(config: PoolConfig) -> Self {
        let factory = default_factory(config.relay.clone());
        Self::with_transport(config, factory)
    }

    /// Create a pool that opens relays through `factory`.
    pub fn with_transport(config: PoolConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let pool = Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                relays: Arc::new(RwLock::new(HashMap::new())),
                subscriptions: Arc::new(RwLock::new(SubscriptionRegistry::default())),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        };
        pool.start_health_scan();
        pool
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::PoolClosed);
        }
        Ok(())
    }

    /// Add an already constructed relay connection.
    ///
    /// Waits for the relay to open. On success every active subscription has
    /// been sent to it by the time this returns.
    pub async fn add_relay(&self, relay: RelayConnection) -> Result<()> {
        self.ensure_open()?;
        if self.inner.relays.read().await.contains_key(relay.url()) {
            return Err(ClientError::RelayAlreadyRegistered(relay.url().to_string()));
        }

        self.wait_open(&relay).await?;
        self.register(relay, Registration::New).await
    }

    /// Connect to a relay by URL and add it to the pool.
    ///
    /// Accepts bare hosts as well as `ws://` / `wss://` URLs. On failure the
    /// connection is closed and the pool is left unchanged.
    pub async fn add_relay_url(&self, url: &str) -> Result<RelayConnection> {
        self.ensure_open()?;
        let url = RelayUrl::parse(url)?;
        if self.inner.relays.read().await.contains_key(&url) {
            return Err(ClientError::RelayAlreadyRegistered(url.to_string()));
        }

        info!("Adding relay to pool: {}", url);
        let relay = RelayConnection::connect_url(url, self.inner.factory.as_ref())?;
        if let Err(e) = self.add_relay(relay.clone()).await {
            relay.close().await;
            return Err(e);
        }
        Ok(relay)
    }

    /// Connect to several relays concurrently.
    ///
    /// Returns `None` if every relay was added, otherwise the URLs that failed
    /// with their errors. Relays that did connect stay in the pool.
    pub async fn add_relay_urls<I, S>(&self, urls: I) -> Option<Vec<(String, ClientError)>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let attempts = urls.into_iter().map(|url| {
            let url = url.as_ref().to_string();
            async move {
                let result = self.add_relay_url(&url).await;
                (url, result)
            }
        });

        let failures: Vec<(String, ClientError)> = join_all(attempts)
            .await
            .into_iter()
            .filter_map(|(url, result)| result.err().map(|e| (url, e)))
            .collect();

        if failures.is_empty() {
            None
        } else {
            warn!("Failed to add {} relays", failures.len());
            Some(failures)
        }
    }

    /// Replace a registered relay that is no longer open with a fresh
    /// connection, replaying every active subscription to it.
    pub async fn reconnect_relay(&self, url: &str) -> Result<RelayConnection> {
        self.ensure_open()?;
        let url = RelayUrl::parse(url)?;
        match self.inner.relays.read().await.get(&url) {
            None => return Err(ClientError::NotRegistered(url.to_string())),
            Some(current) if !current.status().is_closed() => {
                return Err(ClientError::AlreadyConnected(url.to_string()));
            }
            Some(_) => {}
        }

        info!("Reconnecting to relay: {}", url);
        let relay = RelayConnection::connect_url(url, self.inner.factory.as_ref())?;
        let result = match self.wait_open(&relay).await {
            Ok(()) => self.register(relay.clone(), Registration::Replace).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            relay.close().await;
            return Err(e);
        }
        Ok(relay)
    }

    async fn wait_open(&self, relay: &RelayConnection) -> Result<()> {
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(ClientError::PoolClosed),
            result = relay.until_open() => result,
        }
    }

    async fn register(&self, relay: RelayConnection, registration: Registration) -> Result<()> {
        let url = relay.url().clone();
        let mut relays = self.inner.relays.write().await;
        self.ensure_open()?;

        match (registration, relays.get(&url)) {
            (Registration::New, Some(_)) => {
                return Err(ClientError::RelayAlreadyRegistered(url.to_string()));
            }
            (Registration::Replace, None) => {
                return Err(ClientError::NotRegistered(url.to_string()));
            }
            (Registration::Replace, Some(current)) if !current.status().is_closed() => {
                return Err(ClientError::AlreadyConnected(url.to_string()));
            }
            _ => {}
        }

        // Listen before replaying so no response to the replayed REQs is missed
        let messages = relay.subscribe_messages();
        {
            let mut subs = self.inner.subscriptions.write().await;
            for entry in subs.iter_mut() {
                match relay.subscribe(&entry.id, entry.filters.clone()) {
                    Ok(()) => entry.add_relay(url.clone()),
                    Err(e) => warn!("Failed to resubscribe {} on {}: {}", entry.id, url, e),
                }
            }
        }

        relays.insert(url.clone(), relay.clone());
        drop(relays);

        info!("Relay {} joined the pool", url);
        self.spawn_fan_in(relay, messages);
        Ok(())
    }

    fn spawn_fan_in(&self, relay: RelayConnection, mut messages: mpsc::UnboundedReceiver<RelayMessage>) {
        let relays = Arc::clone(&self.inner.relays);
        let subscriptions = Arc::clone(&self.inner.subscriptions);
        let cancel = self.inner.cancel.clone();

        self.inner.tasks.spawn(async move {
            let url = relay.url().clone();
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => return,
                    msg = messages.recv() => msg,
                };
                match msg {
                    Some(msg) => route(&subscriptions, &url, msg).await,
                    None => break,
                }
            }

            // The relay is gone; only forget it if it was not replaced meanwhile
            let relays = relays.read().await;
            if relays.get(&url).is_some_and(|current| current.same_connection(&relay)) {
                subscriptions.write().await.remove_relay(&url);
            }
            if relay.status() == RelayStatus::ClosedRemote {
                warn!("Relay {} dropped the connection, eligible for reconnect", url);
            }
        });
    }

    /// Subscribe with a caller-chosen id.
    pub async fn new_sub(&self, id: impl Into<String>, filter: Filter) -> Result<SubscriptionStream> {
        self.new_sub_with_filters(id, vec![filter]).await
    }

    /// Subscribe with a caller-chosen id and several filters.
    ///
    /// The subscription is registered immediately, even with no relays; the
    /// REQ is queued on every open relay without waiting for any answer.
    pub async fn new_sub_with_filters(
        &self,
        id: impl Into<String>,
        filters: Vec<Filter>,
    ) -> Result<SubscriptionStream> {
        let id = id.into();
        self.ensure_open()?;

        let frame = ClientMessage::req(id.clone(), filters.clone()).to_json()?;

        let relays = self.inner.relays.read().await;
        let mut subs = self.inner.subscriptions.write().await;
        if subs.contains(&id) {
            return Err(ClientError::SubscriptionAlreadyExist(id));
        }

        let (stream, sender) = SubscriptionStream::new(id.clone());
        let mut entry = SubscriptionEntry::new(id.clone(), filters, sender);
        for (url, relay) in relays.iter().filter(|(_, relay)| relay.is_open()) {
            match relay.send_frame(frame.clone()) {
                Ok(()) => entry.add_relay(url.clone()),
                Err(e) => debug!("Skipping {} for subscription {}: {}", url, id, e),
            }
        }

        info!(
            "Created subscription {} on {} relays",
            id,
            entry.relay_count()
        );
        subs.insert(entry);
        Ok(stream)
    }

    /// Subscribe with a generated id.
    pub async fn subscribe(&self, filters: Vec<Filter>) -> Result<SubscriptionStream> {
        self.new_sub_with_filters(generate_subscription_id(), filters)
            .await
    }

    /// Close a subscription on every relay it was sent to.
    ///
    /// Unknown ids are ignored. The subscription's stream stays open, so
    /// anything already delivered can still be popped.
    pub async fn close_sub(&self, id: &str) {
        let relays = self.inner.relays.read().await;
        let Some(entry) = self.inner.subscriptions.write().await.remove(id) else {
            return;
        };

        let close = ClientMessage::close(id);
        for url in entry.relays() {
            if let Some(relay) = relays.get(url)
                && let Err(e) = relay.send(&close)
            {
                debug!("Failed to send CLOSE {} to {}: {}", id, url, e);
            }
        }
        info!("Closed subscription {}", id);
    }

    /// Send an event to every open relay.
    pub async fn publish(&self, event: Event) -> Vec<(RelayUrl, Result<()>)> {
        let relays = self.inner.relays.read().await;
        let msg = ClientMessage::Event(event);

        relays
            .iter()
            .filter(|(_, relay)| relay.is_open())
            .map(|(url, relay)| (url.clone(), relay.send(&msg)))
            .collect()
    }

    /// Shut the pool down.
    ///
    /// Closes every relay from our side, closes every subscription stream and
    /// waits for the background tasks to finish. Safe to call more than once.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.tasks.wait().await;
            return;
        }

        info!("Closing connection pool");
        self.inner.cancel.cancel();

        let relays: Vec<RelayConnection> = {
            let mut relays = self.inner.relays.write().await;
            relays.drain().map(|(_, relay)| relay).collect()
        };
        let subs = self.inner.subscriptions.write().await.drain();

        join_all(relays.iter().map(|relay| relay.close())).await;
        for entry in subs {
            entry.sender().close(format!(
                "close sub {} because of pool is closed by the client",
                entry.id
            ));
        }

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        debug!("Connection pool closed");
    }

    /// All registered relays.
    pub async fn relays(&self) -> Vec<RelayConnection> {
        self.inner.relays.read().await.values().cloned().collect()
    }

    /// Get a registered relay by URL, in any accepted form.
    pub async fn relay(&self, url: &str) -> Option<RelayConnection> {
        let url = RelayUrl::parse(url).ok()?;
        self.inner.relays.read().await.get(&url).cloned()
    }

    /// URLs of all registered relays.
    pub async fn relay_urls(&self) -> Vec<RelayUrl> {
        self.inner.relays.read().await.keys().cloned().collect()
    }

    /// Get the number of open relays.
    pub async fn connected_count(&self) -> usize {
        self.inner
            .relays
            .read()
            .await
            .values()
            .filter(|relay| relay.is_open())
            .count()
    }

    /// Registered relays the remote side closed.
    ///
    /// Relays we closed ourselves are never included.
    pub async fn closed_relays_to_reconnect(&self) -> Vec<RelayConnection> {
        self.inner
            .relays
            .read()
            .await
            .values()
            .filter(|relay| relay.status() == RelayStatus::ClosedRemote)
            .cloned()
            .collect()
    }

    /// Get active subscription IDs.
    pub async fn subscription_ids(&self) -> Vec<String> {
        self.inner.subscriptions.read().await.ids()
    }

    /// Whether every relay serving a subscription has sent EOSE.
    pub async fn all_eose(&self, id: &str) -> Option<bool> {
        self.inner
            .subscriptions
            .read()
            .await
            .get(id)
            .map(SubscriptionEntry::all_eose)
    }

    fn start_health_scan(&self) {
        let pool = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        // interval() rejects a zero period
        let period = self
            .inner
            .config
            .health_check_interval
            .max(Duration::from_millis(1));

        self.inner.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut reported: HashSet<RelayUrl> = HashSet::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = pool.upgrade() else { break };
                health_scan(&ConnectionPool { inner }, &mut reported).await;
            }
            debug!("Health scan stopped");
        });
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

async fn health_scan(pool: &ConnectionPool, reported: &mut HashSet<RelayUrl>) {
    let dropped = pool.closed_relays_to_reconnect().await;
    reported.retain(|url| dropped.iter().any(|relay| relay.url() == url));

    for relay in &dropped {
        if reported.insert(relay.url().clone()) {
            warn!("Relay {} is closed and awaiting reconnect", relay.url());
        }
    }

    if pool.config().auto_reconnect {
        for relay in dropped {
            match pool.reconnect_relay(relay.url().as_str()).await {
                Ok(_) => {
                    reported.remove(relay.url());
                }
                Err(e) => debug!("Reconnect to {} failed: {}", relay.url(), e),
            }
        }
    }

    let relay_count = pool.inner.relays.read().await.len();
    let sub_count = pool.inner.subscriptions.read().await.len();
    trace!(
        "Health scan: {} relays, {} subscriptions, {} awaiting reconnect",
        relay_count,
        sub_count,
        reported.len()
    );
}

async fn route(subscriptions: &RwLock<SubscriptionRegistry>, url: &RelayUrl, msg: RelayMessage) {
    let Some(id) = msg.subscription_id().map(str::to_string) else {
        trace!("Dropping {} from {}: no subscription id", msg.type_name(), url);
        return;
    };

    let sender = match &msg {
        RelayMessage::Eose { .. } | RelayMessage::Closed { .. } => {
            let mut subs = subscriptions.write().await;
            let Some(entry) = subs.get_mut(&id) else {
                debug!("Dropping {} for unknown subscription {} from {}", msg.type_name(), id, url);
                return;
            };
            if let RelayMessage::Closed { message, .. } = &msg {
                warn!("Subscription {} closed by {}: {}", id, url, message);
                entry.remove_relay(url);
            } else {
                entry.mark_eose(url);
            }
            entry.sender().clone()
        }
        _ => match subscriptions.read().await.get(&id) {
            Some(entry) => entry.sender().clone(),
            None => {
                debug!("Dropping {} for unknown subscription {} from {}", msg.type_name(), id, url);
                return;
            }
        },
    };

    let delivered = PoolMessage {
        relay_url: url.clone(),
        message: msg,
    };
    if sender.send(delivered).is_err() {
        trace!("Subscription {} stream is closed, dropping message", id);
    }
}
