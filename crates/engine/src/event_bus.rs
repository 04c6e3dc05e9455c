//! Typed, synchronous event fan-out.
//!
//! Subscribers register for one concrete event type and only ever see events
//! of exactly that type (no supertype/trait-object matching). Delivery happens
//! on the posting thread, so subscribers must be quick or hand work off to the
//! [`TaskScheduler`](crate::scheduler::TaskScheduler).
//!
//! A subscriber is an `Arc`'d closure and its identity is the `Arc`: registering
//! the same `Arc` twice for one type is a no-op, and the same `Arc` is what
//! [`EventBus::unsubscribe`] removes.

use std::any::{Any, TypeId};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::util::panic_message;

/// A callback for events of type `E`.
pub type Subscriber<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Type-erased subscriber; downcasts to the registered event type.
type Handler = Arc<dyn Fn(&dyn Any) + Send + Sync>;

/// Address of the subscriber's allocation. Stable while registered, since the
/// stored handler owns a clone of the `Arc`.
fn identity<E>(subscriber: &Subscriber<E>) -> usize {
    Arc::as_ptr(subscriber) as *const () as usize
}

#[derive(Default)]
pub struct EventBus {
    subscribers: DashMap<TypeId, DashMap<usize, Handler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscriber` for events of type `E`. Returns `false` if it
    /// was already registered.
    pub fn subscribe<E: Any>(&self, subscriber: Subscriber<E>) -> bool {
        let key = identity(&subscriber);
        let handler: Handler = Arc::new(move |event: &dyn Any| {
            if let Some(event) = event.downcast_ref::<E>() {
                subscriber(event);
            }
        });

        let set = self.subscribers.entry(TypeId::of::<E>()).or_default();
        match set.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handler);
                true
            }
        }
    }

    /// Wrap `f` as a subscriber, register it, and return it for a later
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe_fn<E, F>(&self, f: F) -> Subscriber<E>
    where
        E: Any,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let subscriber: Subscriber<E> = Arc::new(f);
        self.subscribe(Arc::clone(&subscriber));
        subscriber
    }

    /// Remove one registration. Unknown pairs are ignored.
    pub fn unsubscribe<E: Any>(&self, subscriber: &Subscriber<E>) -> bool {
        let type_id = TypeId::of::<E>();
        let removed = match self.subscribers.get(&type_id) {
            Some(set) => set.remove(&identity(subscriber)).is_some(),
            None => false,
        };
        if removed {
            self.subscribers.remove_if(&type_id, |_, set| set.is_empty());
        }
        removed
    }

    pub fn unsubscribe_all(&self) {
        self.subscribers.clear();
    }

    /// Drop every subscriber of event type `E`.
    pub fn unsubscribe_all_of<E: Any>(&self) {
        self.subscribers.remove(&TypeId::of::<E>());
    }

    pub fn subscriber_count<E: Any>(&self) -> usize {
        self.subscribers
            .get(&TypeId::of::<E>())
            .map_or(0, |set| set.len())
    }

    /// Deliver `event` to every subscriber of `E`. Returns how many were invoked.
    pub fn call<E: Any>(&self, event: &E) -> usize {
        self.dispatch(TypeId::of::<E>(), event)
    }

    /// Like [`call`](Self::call), keyed by the event's runtime type.
    pub fn call_dyn(&self, event: &dyn Any) -> usize {
        self.dispatch(event.type_id(), event)
    }

    fn dispatch(&self, type_id: TypeId, event: &dyn Any) -> usize {
        // Snapshot first: callbacks run without any map lock held, so they
        // may themselves subscribe or unsubscribe.
        let handlers: Vec<Handler> = match self.subscribers.get(&type_id) {
            Some(set) => set.iter().map(|h| Arc::clone(h.value())).collect(),
            None => return 0,
        };

        for handler in &handlers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                tracing::error!("Event subscriber failed: {}", panic_message(payload.as_ref()));
            }
        }
        handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Ping(u32);

    #[test]
    fn duplicate_subscription_is_ignored() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub: Subscriber<Ping> = Arc::new(move |p: &Ping| {
            h.fetch_add(p.0 as usize, Ordering::SeqCst);
        });
        assert!(bus.subscribe(Arc::clone(&sub)));
        assert!(!bus.subscribe(Arc::clone(&sub)));
        assert_eq!(bus.subscriber_count::<Ping>(), 1);

        assert_eq!(bus.call(&Ping(5)), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn unsubscribe_unknown_is_noop() {
        let bus = EventBus::new();
        let sub: Subscriber<Ping> = Arc::new(|_: &Ping| {});
        assert!(!bus.unsubscribe(&sub));
        bus.subscribe(Arc::clone(&sub));
        assert!(bus.unsubscribe(&sub));
        assert!(!bus.unsubscribe(&sub));
        assert_eq!(bus.subscriber_count::<Ping>(), 0);
    }

    #[test]
    fn panicking_subscriber_does_not_stop_fan_out() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe_fn(|_: &Ping| panic!("subscriber bug"));
        let h = Arc::clone(&hits);
        bus.subscribe_fn(move |_: &Ping| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.call(&Ping(0)), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscriber_may_subscribe_during_delivery() {
        let bus = Arc::new(EventBus::new());
        let inner = Arc::clone(&bus);
        bus.subscribe_fn(move |_: &Ping| {
            inner.subscribe_fn(|_: &Ping| {});
        });
        bus.call(&Ping(1));
        assert_eq!(bus.subscriber_count::<Ping>(), 2);
    }

    #[test]
    fn dynamic_dispatch_uses_runtime_type() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.subscribe_fn(move |_: &Ping| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let boxed: Box<dyn Any> = Box::new(Ping(3));
        assert_eq!(bus.call_dyn(boxed.as_ref()), 1);
        assert_eq!(bus.call_dyn(&7u32), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
