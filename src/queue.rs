//! Event handoff queue
//!
//! Bounded single-producer queue moving owned events from the feed task to a
//! dedicated consumer thread. Overflow handling is an explicit policy and
//! every dropped event is counted.

use crossbeam::channel::{self, RecvTimeoutError, TrySendError};
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::warn;

use crate::error::{RecorderError, Result};

/// Log every Nth drop after the first one
const DROP_LOG_EVERY: u64 = 1000;

/// What `offer` does when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the incoming event
    DropNewest,
    /// Evict the oldest queued event to make room. The sender keeps a
    /// receiver handle for eviction, so consumer presence is tracked
    /// separately and a gone consumer still reports `QueueClosed`.
    DropOldest,
    /// Surface `RecorderError::QueueOverflow` to the producer
    Fail,
}

/// Result of a successful `offer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    DroppedIncoming,
    EvictedOldest,
}

/// Rejected push; the event is handed back to the caller
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    Full(T),
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(event) | PushError::Closed(event) => event,
        }
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => write!(f, "queue full"),
            PushError::Closed(_) => write!(f, "queue closed"),
        }
    }
}

/// Counters shared by both ends of a queue
#[derive(Debug, Default)]
pub struct QueueStats {
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl QueueStats {
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record_drop(&self, queue: &str) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped == 1 || dropped % DROP_LOG_EVERY == 0 {
            warn!(queue = %queue, dropped, "Queue full, dropping event");
        }
    }
}

/// Create a bounded queue
pub fn channel<T>(
    name: &str,
    capacity: usize,
    policy: OverflowPolicy,
) -> (EventSender<T>, EventReceiver<T>) {
    let (tx, rx) = channel::bounded(capacity);
    let name: Arc<str> = Arc::from(name);
    let stats = Arc::new(QueueStats::default());
    let consumer = Arc::new(());

    let evict = match policy {
        OverflowPolicy::DropOldest => Some(rx.clone()),
        _ => None,
    };

    let sender = EventSender {
        tx,
        evict,
        consumer: Arc::downgrade(&consumer),
        name: name.clone(),
        capacity,
        policy,
        stats: stats.clone(),
    };
    let receiver = EventReceiver {
        rx,
        name,
        stats,
        _consumer: consumer,
    };
    (sender, receiver)
}

/// Producer side
pub struct EventSender<T> {
    tx: channel::Sender<T>,
    evict: Option<channel::Receiver<T>>,
    consumer: Weak<()>,
    name: Arc<str>,
    capacity: usize,
    policy: OverflowPolicy,
    stats: Arc<QueueStats>,
}

impl<T> EventSender<T> {
    /// Push without applying any policy. On failure the caller keeps the event.
    pub fn push(&self, event: T) -> std::result::Result<(), PushError<T>> {
        if self.consumer.strong_count() == 0 {
            return Err(PushError::Closed(event));
        }
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(event)) => Err(PushError::Full(event)),
            Err(TrySendError::Disconnected(event)) => Err(PushError::Closed(event)),
        }
    }

    /// Push, resolving a full queue with the configured overflow policy
    pub fn offer(&self, event: T) -> Result<Offer> {
        let mut event = match self.push(event) {
            Ok(()) => return Ok(Offer::Queued),
            Err(PushError::Closed(_)) => return Err(RecorderError::QueueClosed),
            Err(PushError::Full(event)) => event,
        };

        match self.policy {
            OverflowPolicy::DropNewest => {
                self.stats.record_drop(&self.name);
                Ok(Offer::DroppedIncoming)
            }
            OverflowPolicy::Fail => {
                self.stats.record_drop(&self.name);
                Err(RecorderError::QueueOverflow {
                    queue: self.name.to_string(),
                    capacity: self.capacity,
                })
            }
            OverflowPolicy::DropOldest => {
                let mut evicted = false;
                loop {
                    if let Some(evict) = &self.evict {
                        if evict.try_recv().is_ok() {
                            self.stats.record_drop(&self.name);
                            evicted = true;
                        }
                    }
                    match self.push(event) {
                        Ok(()) if evicted => return Ok(Offer::EvictedOldest),
                        Ok(()) => return Ok(Offer::Queued),
                        Err(PushError::Full(back)) => event = back,
                        Err(PushError::Closed(_)) => return Err(RecorderError::QueueClosed),
                    }
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }
}

/// Consumer side
pub struct EventReceiver<T> {
    rx: channel::Receiver<T>,
    name: Arc<str>,
    stats: Arc<QueueStats>,
    _consumer: Arc<()>,
}

impl<T> EventReceiver<T> {
    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Block until an event arrives. `Ok(None)` means the timeout elapsed.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(RecorderError::QueueClosed),
        }
    }

    /// Everything currently queued, in arrival order
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }

    pub(crate) fn raw(&self) -> &channel::Receiver<T> {
        &self.rx
    }
}
