//! Bounded, drop-on-full event queue.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::Event;
use crate::config::EventConfig;

/// Result of [`EventQueue::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Queued,
    /// The queue was full; the event was discarded.
    DroppedFull,
    /// The queue has been closed; the event was discarded.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventQueueStats {
    pub len: usize,
    pub capacity: usize,
    pub published: u64,
    pub dropped: u64,
    pub closed: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<Event>,
    closed: bool,
}

/// Multi-producer queue with a fixed capacity.
///
/// `publish` never blocks. `drain` discards what is buffered but keeps the
/// queue usable; `close` is terminal.
#[derive(Debug)]
pub struct EventQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an event without waiting.
    pub fn publish(&self, event: Event) -> PublishOutcome {
        {
            let mut state = self.lock();
            if state.closed {
                drop(state);
                warn!("Event queue closed, discarding {} event", event.kind);
                return PublishOutcome::Closed;
            }
            if state.events.len() >= self.capacity {
                drop(state);
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Event queue full ({} events), dropping {} event ({} dropped so far)",
                    self.capacity, event.kind, dropped
                );
                return PublishOutcome::DroppedFull;
            }
            state.events.push_back(event);
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_waiters();
        PublishOutcome::Queued
    }

    /// Wait for the next event. Returns `None` once the queue is closed.
    pub async fn recv(&self) -> Option<Event> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
            }
            notified.await;
        }
    }

    /// Take the next event if one is buffered.
    pub fn try_recv(&self) -> Option<Event> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.events.pop_front()
    }

    /// Put an event back at the head of the queue.
    ///
    /// Used by the fan-out pump when the last subscriber went away between
    /// dequeue and delivery. Dropped if the queue has filled meanwhile.
    pub(crate) fn requeue_front(&self, event: Event) {
        let mut state = self.lock();
        if state.closed || state.events.len() >= self.capacity {
            drop(state);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Could not requeue {} event, dropping", event.kind);
            return;
        }
        state.events.push_front(event);
    }

    /// Discard every buffered event. The queue stays open.
    ///
    /// Returns the number of events discarded.
    pub fn drain(&self) -> usize {
        let drained = {
            let mut state = self.lock();
            let drained = state.events.len();
            state.events.clear();
            drained
        };
        if drained > 0 {
            debug!("Drained {} pending events", drained);
        }
        drained
    }

    /// Close the queue. Pending and future events are discarded and waiting
    /// receivers return `None`.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.events.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> EventQueueStats {
        let state = self.lock();
        EventQueueStats {
            len: state.events.len(),
            capacity: self.capacity,
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            closed: state.closed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(EventConfig::QUEUE_CAPACITY)
    }
}
