//! Closable multi-producer, single-consumer channel.
//!
//! Unbounded, so producers never block and nothing is dropped. Closing records
//! a reason; whatever was already buffered can still be drained, and only then
//! does [`ChannelReceiver::pop`] return `None`.

use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

struct State<T> {
    tx: Option<mpsc::UnboundedSender<T>>,
    reason: Option<String>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

impl<T> Shared<T> {
    fn close(&self, reason: String) -> bool {
        let mut state = self.state.lock();
        if state.reason.is_some() {
            return false;
        }
        state.reason = Some(reason);
        state.tx = None;
        true
    }

    fn closed(&self) -> Option<String> {
        self.state.lock().reason.clone()
    }
}

/// Create a new channel.
pub fn channel<T>() -> (ChannelSender<T>, ChannelReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            tx: Some(tx),
            reason: None,
        }),
    });
    (
        ChannelSender {
            shared: Arc::clone(&shared),
        },
        ChannelReceiver { shared, rx },
    )
}

/// Producer handle. Cheap to clone.
pub struct ChannelSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ChannelSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> ChannelSender<T> {
    /// Enqueue an item. Gives the item back if the channel is closed or the
    /// receiver is gone.
    pub fn send(&self, item: T) -> Result<(), T> {
        let state = self.shared.state.lock();
        match &state.tx {
            Some(tx) => tx.send(item).map_err(|e| e.0),
            None => Err(item),
        }
    }

    /// Close with a reason. Only the first close takes effect.
    pub fn close(&self, reason: impl Into<String>) -> bool {
        self.shared.close(reason.into())
    }

    /// `None` while open, the close reason afterwards.
    pub fn closed(&self) -> Option<String> {
        self.shared.closed()
    }
}

/// Consumer handle.
pub struct ChannelReceiver<T> {
    shared: Arc<Shared<T>>,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> ChannelReceiver<T> {
    /// Next item, waiting if the channel is open and empty. `None` once the
    /// channel is closed and drained.
    pub async fn pop(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next item if one is buffered.
    pub fn try_pop(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// `None` while open, the close reason afterwards.
    pub fn closed(&self) -> Option<String> {
        self.shared.closed()
    }

    /// Close from the consumer side. Buffered items stay poppable.
    pub fn close(&self, reason: impl Into<String>) -> bool {
        self.shared.close(reason.into())
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

impl<T> Stream for ChannelReceiver<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}
