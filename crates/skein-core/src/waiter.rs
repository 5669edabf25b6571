//! Readiness events and waiter notification.
//!
//! Consumers register an [`EventNotifier`] with an interest mask on a
//! [`WaitQueue`]; producers (the endpoint) call [`WaitQueue::notify`]
//! when readiness changes. Notifiers must not block: they run on the
//! producer's call path, which may be the receive path of the stack.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

/// Readiness event bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u32);

impl EventMask {
    /// Data is available to read.
    pub const READABLE: EventMask = EventMask(0x01);
    /// The endpoint can accept a write.
    pub const WRITABLE: EventMask = EventMask(0x04);
    /// An asynchronous error is pending.
    pub const ERROR: EventMask = EventMask(0x08);
    /// The endpoint has been closed.
    pub const HANGUP: EventMask = EventMask(0x10);

    /// No events.
    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    /// Every event.
    #[must_use]
    pub fn all() -> Self {
        Self::READABLE | Self::WRITABLE | Self::ERROR | Self::HANGUP
    }

    /// Whether no bits are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub fn contains(&self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit value.
    #[must_use]
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl core::ops::BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

impl core::ops::BitAnd for EventMask {
    type Output = EventMask;

    fn bitand(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 & rhs.0)
    }
}

/// Receives readiness events for one registered waiter.
pub trait EventNotifier: Send + Sync {
    /// Delivers the events that intersected the waiter's interest mask.
    fn notify(&self, events: EventMask);
}

struct WaitEntry {
    id: u64,
    interest: EventMask,
    notifier: Arc<dyn EventNotifier>,
}

/// A registry of waiters interested in an endpoint's readiness changes.
#[derive(Default)]
pub struct WaitQueue {
    entries: Mutex<Vec<WaitEntry>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitQueue").finish_non_exhaustive()
    }
}

impl WaitQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a notifier for the events in `interest`; returns a token
    /// for [`WaitQueue::unregister`].
    pub fn register(&self, interest: EventMask, notifier: Arc<dyn EventNotifier>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(WaitEntry { id, interest, notifier });
        id
    }

    /// Removes a previously registered notifier.
    pub fn unregister(&self, id: u64) {
        self.entries.lock().retain(|entry| entry.id != id);
    }

    /// Fans `events` out to every waiter whose interest intersects it.
    pub fn notify(&self, events: EventMask) {
        let entries = self.entries.lock();
        for entry in entries.iter() {
            let delivered = entry.interest & events;
            if !delivered.is_empty() {
                entry.notifier.notify(delivered);
            }
        }
    }
}

/// An [`EventNotifier`] that forwards events into an unbounded channel,
/// for consumers that select on a channel rather than providing their own
/// wakeup primitive.
pub struct ChannelNotifier {
    tx: Sender<EventMask>,
}

impl ChannelNotifier {
    /// Creates the notifier and the receiving half.
    #[must_use]
    pub fn new() -> (Arc<Self>, Receiver<EventMask>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventNotifier for ChannelNotifier {
    fn notify(&self, events: EventMask) {
        // The receiver may be gone; readiness is best-effort.
        let _ = self.tx.send(events);
    }
}
