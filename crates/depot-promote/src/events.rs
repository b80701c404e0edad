//! In-process notifications for finished promotions.

use depot_model::{GroupPromotionSummary, PromotionSummary, StoreKey};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, Receiver, Sender};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromoteEvent {
    PathsPromoted {
        source: StoreKey,
        target: StoreKey,
        summary: PromotionSummary,
    },
    GroupPromoted {
        summary: GroupPromotionSummary,
        /// `true` when the membership edit was undone by a rollback.
        rolled_back: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventEnvelope {
    pub id: u64,
    pub event: PromoteEvent,
}

/// Broadcast fan-out of [`PromoteEvent`]s. Publishing with no subscriber is
/// not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn publish(&self, event: PromoteEvent) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.sender.send(EventEnvelope { id, event });
        id
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EventStream {
    receiver: Receiver<EventEnvelope>,
}

impl EventStream {
    /// Next event; a lagging subscriber skips what it missed. `None` once the
    /// bus is gone.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!("event subscriber lagged by {missed}");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_model::{GroupPromoteRequest, GroupPromoteResult};

    fn group_event() -> PromoteEvent {
        let req = GroupPromoteRequest::new(StoreKey::hosted("maven", "build"), "public");
        PromoteEvent::GroupPromoted {
            summary: GroupPromoteResult::new(req).summary(),
            rolled_back: false,
        }
    }

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();
        let first = bus.publish(group_event());
        let second = bus.publish(group_event());
        assert_eq!(stream.next().await.unwrap().id, first);
        assert_eq!(stream.next().await.unwrap().id, second);
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(group_event()), 1);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_ahead() {
        let bus = EventBus::with_capacity(2);
        let mut stream = bus.subscribe();
        for _ in 0..5 {
            bus.publish(group_event());
        }
        assert_eq!(stream.next().await.unwrap().id, 4);
    }

    #[tokio::test]
    async fn stream_ends_when_bus_dropped() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();
        drop(bus);
        assert!(stream.next().await.is_none());
    }
}
