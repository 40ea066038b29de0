//! Progress event fan-out.
//!
//! Pure plumbing: the pipeline publishes typed events, and any number of
//! consumers (CLI printer, dashboard broadcaster) subscribe independently.
//! Each subscriber owns a bounded buffer; a full or slow subscriber drops
//! events rather than stalling the pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::state::{Phase, Status, TokenStats};

/// Default per-subscriber buffer capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Aggregate token/cost snapshot published after each unit resolves.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub tokens: TokenStats,
    pub units_completed: usize,
    pub units_failed: usize,
}

/// Typed progress events emitted by the pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    PhaseStarted {
        phase: Phase,
        total_units: usize,
    },
    PhaseCompleted {
        phase: Phase,
        status: Status,
        units_completed: usize,
        units_failed: usize,
    },
    UnitStarted {
        phase: Phase,
        unit: String,
    },
    UnitCompleted {
        phase: Phase,
        unit: String,
        tokens_used: u64,
    },
    UnitFailed {
        phase: Phase,
        unit: String,
        error: String,
    },
    Stats(StatsSnapshot),
    RunError {
        message: String,
    },
}

struct Subscriber {
    tx: mpsc::Sender<ProgressEvent>,
    dropped: Arc<AtomicU64>,
}

/// Receiving end of a subscription.
pub struct EventReceiver {
    rx: mpsc::Receiver<ProgressEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventReceiver {
    /// Receive the next event; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }

    /// Events dropped for this subscriber because its buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Fan-out bus. Publishing never blocks on consumers.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe with the default buffer capacity.
    pub fn subscribe(&self) -> EventReceiver {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Subscribe with an explicit buffer capacity (minimum 1).
    pub fn subscribe_with_capacity(&self, capacity: usize) -> EventReceiver {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(Subscriber {
                tx,
                dropped: dropped.clone(),
            });
        }
        EventReceiver { rx, dropped }
    }

    /// Publish an event to every live subscriber. A subscriber whose buffer
    /// is full has the event counted against it and dropped; a subscriber
    /// whose receiver is gone is removed.
    pub fn publish(&self, event: ProgressEvent) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                sub.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_event(n: u32) -> ProgressEvent {
        ProgressEvent::UnitCompleted {
            phase: Phase::Analyze,
            unit: format!("chapter-{}", n),
            tokens_used: 10,
        }
    }

    #[tokio::test]
    async fn test_all_subscribers_receive() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(unit_event(1));

        assert!(matches!(
            a.recv().await,
            Some(ProgressEvent::UnitCompleted { .. })
        ));
        assert!(matches!(
            b.recv().await,
            Some(ProgressEvent::UnitCompleted { .. })
        ));
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_without_blocking() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe_with_capacity(2);

        for n in 0..5 {
            bus.publish(unit_event(n));
        }

        // Publisher never blocked; two events buffered, three dropped.
        assert_eq!(slow.dropped_count(), 3);
        assert!(slow.try_recv().is_some());
        assert!(slow.try_recv().is_some());
        assert!(slow.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_pruned() {
        let bus = EventBus::new();
        let receiver = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(receiver);
        bus.publish(unit_event(1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_with_no_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(unit_event(1));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
