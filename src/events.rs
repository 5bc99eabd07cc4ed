//! Typed event fan-out
//!
//! [`Signal`] is the subscriber registry used wherever a component publishes
//! typed events to an unknown number of listeners (device connections, fused
//! devices, controller contexts). Emission runs on the emitting thread, so
//! per-source ordering is exactly the source's processing order.
//!
//! Handlers run with the registry lock held: a handler must not connect or
//! disconnect on the signal it is being delivered from.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Slot<T> = (u64, Box<dyn Fn(&T) + Send>);

/// A typed event source with RAII subscriptions.
pub struct Signal<T> {
    slots: Arc<Mutex<Vec<Slot<T>>>>,
    next_id: AtomicU64,
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a handler; it stays registered until the returned
    /// [`Subscription`] is dropped.
    pub fn connect(&self, handler: impl Fn(&T) + Send + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().push((id, Box::new(handler)));

        let weak: Weak<Mutex<Vec<Slot<T>>>> = Arc::downgrade(&self.slots);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(slots) = weak.upgrade() {
                    slots.lock().retain(|(sid, _)| *sid != id);
                }
            })),
        }
    }

    /// Deliver an event to every registered handler, in registration order.
    pub fn emit(&self, event: &T) {
        let slots = self.slots.lock();
        for (_, handler) in slots.iter() {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots.lock().len()
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a [`Signal`] handler registered; dropping it unregisters.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
