//! Broadcast + history fan-out for lifecycle notifications.

use std::{collections::VecDeque, sync::RwLock};

use futures::{StreamExt, stream::BoxStream};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Default number of events kept for late subscribers.
const HISTORY_LEN: usize = 1024;

/// Event hub with broadcast and bounded history.
///
/// Late subscribers receive the retained history, then live events.
pub struct EventHub<E> {
    history: RwLock<VecDeque<E>>,
    capacity: usize,
    sender: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> EventHub<E> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_history(HISTORY_LEN)
    }

    /// Create a hub retaining at most `capacity` past events.
    #[must_use]
    pub fn with_history(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity.min(32))),
            capacity,
            sender,
        }
    }

    /// Push an event to live listeners and history.
    pub fn push(&self, event: E) {
        let _ = self.sender.send(event.clone());

        match self.history.write() {
            Ok(mut history) => {
                while history.len() >= self.capacity && history.pop_front().is_some() {}
                if self.capacity > 0 {
                    history.push_back(event);
                }
            }
            Err(e) => tracing::error!("event history poisoned: {e}"),
        }
    }

    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn get_history(&self) -> Vec<E> {
        self.history
            .read()
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stream that yields history first, then live events.
    ///
    /// Lagging receivers skip the events they missed.
    #[must_use]
    pub fn history_plus_stream(&self) -> BoxStream<'static, E> {
        let (history, rx) = (self.get_history(), self.get_receiver());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }

    /// Stream of live events only.
    #[must_use]
    pub fn live_stream(&self) -> BoxStream<'static, E> {
        BroadcastStream::new(self.get_receiver())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }
}
