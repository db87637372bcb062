//! Fan-out of queued events to connection subscriptions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::queue::{EventQueue, EventQueueStats, PublishOutcome};
use super::Event;
use crate::config::EventConfig;

/// Process-wide event hub.
///
/// Owns the shared [`EventQueue`] and a broadcast channel. The pump only
/// dequeues while at least one subscription exists, so events published
/// before the first client connects wait in the queue instead of being lost.
#[derive(Debug)]
pub struct EventHub {
    queue: EventQueue,
    sender: broadcast::Sender<Event>,
    subscribers_changed: Notify,
    pump_started: AtomicBool,
    forwarded: AtomicU64,
}

impl EventHub {
    /// Create a hub with the default queue capacity.
    pub fn new() -> Arc<Self> {
        Self::with_capacity(EventConfig::QUEUE_CAPACITY)
    }

    /// Create a hub whose queue holds at most `capacity` events.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(EventConfig::SUBSCRIBER_BUFFER);
        Arc::new(Self {
            queue: EventQueue::new(capacity),
            sender,
            subscribers_changed: Notify::new(),
            pump_started: AtomicBool::new(false),
            forwarded: AtomicU64::new(0),
        })
    }

    /// Enqueue an event for delivery. Never blocks.
    pub fn publish(&self, event: Event) -> PublishOutcome {
        self.queue.publish(event)
    }

    /// Attach a new subscriber.
    pub fn subscribe(&self) -> EventSubscription {
        let receiver = self.sender.subscribe();
        self.subscribers_changed.notify_waiters();
        EventSubscription { receiver }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Discard queued events while keeping the hub usable.
    pub fn drain(&self) -> usize {
        self.queue.drain()
    }

    /// Close the queue and stop the pump. Terminal.
    pub fn close(&self) {
        self.queue.close();
        self.subscribers_changed.notify_waiters();
        info!("Event hub closed");
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn stats(&self) -> EventQueueStats {
        self.queue.stats()
    }

    /// Number of events handed to subscribers so far.
    pub fn forwarded_count(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Start the fan-out pump. Returns `None` if it is already running.
    pub fn spawn_pump(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.pump_started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let hub = Arc::clone(self);
        Some(tokio::spawn(async move { hub.pump().await }))
    }

    async fn pump(self: Arc<Self>) {
        debug!("Event fan-out pump started");
        loop {
            loop {
                let notified = self.subscribers_changed.notified();
                if self.sender.receiver_count() > 0 || self.queue.is_closed() {
                    break;
                }
                notified.await;
            }

            let Some(event) = self.queue.recv().await else {
                break;
            };

            match self.sender.send(event) {
                Ok(_) => {
                    self.forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(broadcast::error::SendError(event)) => {
                    debug!("No subscribers for {} event, keeping it queued", event.kind);
                    self.queue.requeue_front(event);
                }
            }
        }
        debug!("Event fan-out pump stopped");
    }
}

/// One connection's view of the event stream.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: broadcast::Receiver<Event>,
}

impl EventSubscription {
    /// Next event in publish order. `None` once the hub is gone.
    ///
    /// A subscriber that falls behind skips the events it missed and logs
    /// how many.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
