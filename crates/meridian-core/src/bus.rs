//! In-process message bus connecting channels to worker transports.
//!
//! The bus is a typed broker: publishers tag every message with a worker
//! id and a direction, subscribers receive their own queue filtered on
//! that pair. A worker channel subscribes to the worker-to-host slice of
//! its worker; the transport (or a loopback test harness) subscribes to
//! the host-to-worker slice.

use dashmap::DashMap;
use meridian_proto::{StreamingMessage, WorkerId};
use tokio::sync::mpsc;
use tracing::trace;

/// Direction of a message relative to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host → worker.
    HostToWorker,
    /// Worker → host.
    WorkerToHost,
}

/// A message in flight on the bus.
#[derive(Debug, Clone)]
pub struct BusEvent {
    /// Worker the message belongs to.
    pub worker_id: WorkerId,
    /// The message itself.
    pub message: StreamingMessage,
}

/// Many-publisher / many-subscriber broker keyed by worker id.
///
/// Subscribers that drop their [`Subscription`] are pruned on the next
/// publish to the same slice; the bus never keeps a strong reference to
/// a consumer beyond its queue sender.
#[derive(Debug, Default)]
pub struct MessageBus {
    subscribers: DashMap<(WorkerId, Direction), Vec<mpsc::UnboundedSender<BusEvent>>>,
}

impl MessageBus {
    /// Creates a new empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }

    /// Subscribes to the given worker/direction slice.
    ///
    /// Delivery order matches publication order per slice.
    pub fn subscribe(&self, worker_id: &str, direction: Direction) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .entry((worker_id.to_owned(), direction))
            .or_default()
            .push(tx);

        Subscription { receiver: rx }
    }

    /// Publishes a message to every live subscriber of the slice.
    ///
    /// Returns the number of subscribers the message was delivered to.
    /// Disconnected subscribers are pruned.
    pub fn publish(&self, direction: Direction, event: BusEvent) -> usize {
        trace!(
            worker_id = %event.worker_id,
            message = event.message.name(),
            ?direction,
            "publishing bus message"
        );

        let Some(mut senders) = self
            .subscribers
            .get_mut(&(event.worker_id.clone(), direction))
        else {
            return 0;
        };

        senders.retain(|tx| tx.send(event.clone()).is_ok());
        senders.len()
    }

    /// Removes every subscriber of the given worker, both directions.
    pub fn remove_worker(&self, worker_id: &str) {
        self.subscribers
            .remove(&(worker_id.to_owned(), Direction::HostToWorker));
        self.subscribers
            .remove(&(worker_id.to_owned(), Direction::WorkerToHost));
    }

    /// Returns the number of live subscribers for a slice.
    #[must_use]
    pub fn subscriber_count(&self, worker_id: &str, direction: Direction) -> usize {
        self.subscribers
            .get(&(worker_id.to_owned(), direction))
            .map_or(0, |senders| senders.len())
    }
}

/// A subscriber's private queue of bus messages.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<BusEvent>,
}

impl Subscription {
    /// Receives the next message, or `None` once the slice is removed.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.receiver.recv().await
    }

    /// Receives without waiting.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.receiver.try_recv().ok()
    }
}
