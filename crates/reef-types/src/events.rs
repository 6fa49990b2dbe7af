//! Typed completion feed for sync progress.
//!
//! The [`EventBus`] lets the scheduler publish progress without knowing who
//! listens: the stall watchdog, readiness probes, and tests all subscribe
//! independently. Each event type gets its own bounded
//! `tokio::sync::broadcast` channel, so a slow subscriber lags and drops
//! events for its own type instead of blocking sync progress.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::warn;

use crate::Contract;

/// Marker trait for events that travel through the [`EventBus`].
pub trait Event: Any + Send + Sync + Clone + std::fmt::Debug + 'static {}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A batch of KV entries was verified and written for a shard.
#[derive(Clone, Debug)]
pub struct SyncProgress {
    /// Contract the shard belongs to.
    pub contract: Contract,
    /// The shard that advanced.
    pub shard_index: u64,
    /// Number of entries resolved by this batch.
    pub delta: u64,
}
impl Event for SyncProgress {}

/// A shard has reached its authoritative content.
#[derive(Clone, Debug)]
pub struct ShardSyncDone {
    /// Contract the shard belongs to.
    pub contract: Contract,
    /// The shard that finished.
    pub shard_index: u64,
}
impl Event for ShardSyncDone {}

/// Every locally hosted shard has finished syncing.
#[derive(Clone, Debug)]
pub struct AllShardsDone;
impl Event for AllShardsDone {}

/// No progress event arrived within the configured stall timeout while
/// work was still outstanding. The sync context is being cancelled.
#[derive(Clone, Debug)]
pub struct SyncStalled {
    /// Milliseconds since the last observed progress.
    pub idle_ms: u64,
}
impl Event for SyncStalled {}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Capacity of each per-type broadcast channel.
const CHANNEL_CAPACITY: usize = 256;

struct EventBusInner {
    channels: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

/// Type-safe pub/sub bus. Clonable, thread-safe, non-blocking emits.
///
/// Channels are created lazily on the first `subscribe()` for a type;
/// emitting with no subscribers drops the event.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<EventBusInner>>,
}

impl EventBus {
    /// Create a new empty bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventBusInner {
                channels: HashMap::new(),
            })),
        }
    }

    /// Emit an event to all current subscribers of type `E`.
    pub fn emit<E: Event>(&self, event: E) {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        if let Some(boxed) = inner.channels.get(&TypeId::of::<E>()) {
            let sender = boxed
                .downcast_ref::<broadcast::Sender<E>>()
                .expect("type mismatch in event bus");
            // Err means no live receivers; the event is intentionally dropped.
            let _ = sender.send(event);
        }
    }

    /// Subscribe to events of type `E`.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let sender = inner
            .channels
            .entry(TypeId::of::<E>())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel::<E>(CHANNEL_CAPACITY);
                Box::new(tx)
            })
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("type mismatch in event bus");

        EventReceiver {
            rx: sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("channel_count", &inner.channels.len())
            .finish()
    }
}

/// Typed receiver for one event type.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> EventReceiver<E> {
    /// Wait for the next event.
    ///
    /// Returns `None` when the bus is gone. Lagged events are skipped with
    /// a warning; a subscriber that cannot keep up loses events rather
    /// than exerting backpressure on the scheduler.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        skipped = n,
                        event_type = std::any::type_name::<E>(),
                        "event receiver lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive, used by pollers and tests.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract() -> Contract {
        Contract::from([0x33u8; 20])
    }

    #[tokio::test]
    async fn test_emit_subscribe_basic() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe::<SyncProgress>();

        bus.emit(SyncProgress {
            contract: contract(),
            shard_index: 2,
            delta: 16,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.shard_index, 2);
        assert_eq!(event.delta, 16);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe::<ShardSyncDone>();
        let mut rx2 = bus.subscribe::<ShardSyncDone>();

        bus.emit(ShardSyncDone {
            contract: contract(),
            shard_index: 7,
        });

        assert_eq!(rx1.recv().await.unwrap().shard_index, 7);
        assert_eq!(rx2.recv().await.unwrap().shard_index, 7);
    }

    #[tokio::test]
    async fn test_types_are_isolated() {
        let bus = EventBus::new();
        let mut done_rx = bus.subscribe::<AllShardsDone>();

        bus.emit(SyncProgress {
            contract: contract(),
            shard_index: 0,
            delta: 1,
        });
        bus.emit(AllShardsDone);

        // The AllShardsDone subscriber never sees SyncProgress events.
        assert!(done_rx.recv().await.is_some());
        assert!(done_rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_dropped() {
        let bus = EventBus::new();
        // Must not panic or block.
        bus.emit(SyncStalled { idle_ms: 1000 });
    }

    #[tokio::test]
    async fn test_lagged_subscriber_drops_not_blocks() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe::<SyncProgress>();

        // Overflow the bounded channel.
        for i in 0..(CHANNEL_CAPACITY as u64 + 64) {
            bus.emit(SyncProgress {
                contract: contract(),
                shard_index: 0,
                delta: i,
            });
        }

        // The receiver recovers by skipping lagged events; the newest
        // events are still delivered.
        let first = rx.recv().await.unwrap();
        assert!(first.delta >= 64);
    }
}
