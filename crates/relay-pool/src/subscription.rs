//! Subscription management for the relay pool.
//!
//! The registry maps subscription ids to their filters, the sending half of
//! their output channel and the relays currently serving them. It outlives any
//! individual relay: entries are only removed when the caller closes the
//! subscription or the pool shuts down.

use crate::channel::{ChannelReceiver, ChannelSender, channel};
use crate::message::Filter;
use crate::pool::PoolMessage;
use crate::url::RelayUrl;
use futures::Stream;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::task::{Context, Poll};
use uuid::Uuid;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Caller side of a subscription: the merged message stream from every relay.
///
/// Closing the subscription in the pool leaves this stream open; it is only
/// closed by [`SubscriptionStream::close`] or when the pool shuts down.
pub struct SubscriptionStream {
    id: String,
    chan: ChannelReceiver<PoolMessage>,
}

impl SubscriptionStream {
    pub(crate) fn new(id: String) -> (Self, ChannelSender<PoolMessage>) {
        let (tx, chan) = channel();
        (Self { id, chan }, tx)
    }

    /// Subscription ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next message. `None` once the stream is closed and drained.
    pub async fn pop(&mut self) -> Option<PoolMessage> {
        self.chan.pop().await
    }

    /// Next message if one is buffered.
    pub fn try_pop(&mut self) -> Option<PoolMessage> {
        self.chan.try_pop()
    }

    /// `None` while open, the close reason afterwards.
    pub fn closed(&self) -> Option<String> {
        self.chan.closed()
    }

    /// Stop receiving. Buffered messages remain poppable.
    pub fn close(&self, reason: impl Into<String>) -> bool {
        self.chan.close(reason)
    }

    pub fn is_empty(&self) -> bool {
        self.chan.is_empty()
    }
}

impl Stream for SubscriptionStream {
    type Item = PoolMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<PoolMessage>> {
        Pin::new(&mut self.chan).poll_next(cx)
    }
}

impl std::fmt::Debug for SubscriptionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionStream")
            .field("id", &self.id)
            .field("closed", &self.closed())
            .finish()
    }
}

/// Registry side of one subscription.
pub(crate) struct SubscriptionEntry {
    pub id: String,
    pub filters: Vec<Filter>,
    sender: ChannelSender<PoolMessage>,
    /// Relays the REQ was sent to
    relays: HashSet<RelayUrl>,
    /// Relays that have sent EOSE
    eose_relays: HashSet<RelayUrl>,
}

impl SubscriptionEntry {
    pub fn new(id: String, filters: Vec<Filter>, sender: ChannelSender<PoolMessage>) -> Self {
        Self {
            id,
            filters,
            sender,
            relays: HashSet::new(),
            eose_relays: HashSet::new(),
        }
    }

    pub fn sender(&self) -> &ChannelSender<PoolMessage> {
        &self.sender
    }

    /// Record that the REQ went to a relay. Resets its EOSE state.
    pub fn add_relay(&mut self, relay_url: RelayUrl) {
        self.eose_relays.remove(&relay_url);
        self.relays.insert(relay_url);
    }

    pub fn remove_relay(&mut self, relay_url: &RelayUrl) -> bool {
        self.eose_relays.remove(relay_url);
        self.relays.remove(relay_url)
    }

    pub fn has_relay(&self, relay_url: &RelayUrl) -> bool {
        self.relays.contains(relay_url)
    }

    pub fn relays(&self) -> impl Iterator<Item = &RelayUrl> {
        self.relays.iter()
    }

    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    /// Mark EOSE received from a relay serving this subscription.
    pub fn mark_eose(&mut self, relay_url: &RelayUrl) {
        if self.has_relay(relay_url) {
            self.eose_relays.insert(relay_url.clone());
        }
    }

    /// Every relay serving this subscription has sent EOSE.
    pub fn all_eose(&self) -> bool {
        !self.relays.is_empty() && self.relays.len() == self.eose_relays.len()
    }
}

/// All active subscriptions of a pool.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: HashMap<String, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Insert an entry; the caller checks for duplicates first.
    pub fn insert(&mut self, entry: SubscriptionEntry) {
        self.entries.insert(entry.id.clone(), entry);
    }

    pub fn remove(&mut self, id: &str) -> Option<SubscriptionEntry> {
        self.entries.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&SubscriptionEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SubscriptionEntry> {
        self.entries.get_mut(id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SubscriptionEntry> {
        self.entries.values_mut()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Forget a relay in every subscription.
    pub fn remove_relay(&mut self, relay_url: &RelayUrl) {
        for entry in self.entries.values_mut() {
            entry.remove_relay(relay_url);
        }
    }

    pub fn drain(&mut self) -> Vec<SubscriptionEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
