//! In-process pub/sub for order-lifecycle events.
//!
//! Handlers are snapshot-cloned under the lock and invoked outside it, so a
//! subscriber can re-subscribe from inside a handler without deadlocking.
//! Production correctness never depends on this bus; it exists so tests and
//! tooling can observe engine internals.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    PriceUpdate,
    OrderPlaced,
    OrderFilled,
    OrderPartiallyFilled,
    OrderCancelled,
    OrderFailed,
    PositionChanged,
    MarketSwitched,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub data: Value,
    pub timestamp: i64,
}

impl Event {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            data,
            timestamp: Utc::now().timestamp(),
        }
    }
}

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<EventType, Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event_type: EventType, handler: Handler) {
        self.subscribers
            .lock()
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    pub fn publish(&self, event: Event) {
        let handlers: Vec<Handler> = {
            let subscribers = self.subscribers.lock();
            match subscribers.get(&event.event_type) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for handler in handlers {
            handler(&event);
        }
    }

    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delivers_to_matching_subscribers_only() {
        let bus = EventBus::new();
        let filled = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));

        let f = filled.clone();
        bus.subscribe(
            EventType::OrderFilled,
            Arc::new(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let c = cancelled.clone();
        bus.subscribe(
            EventType::OrderCancelled,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish(Event::new(EventType::OrderFilled, json!({"id": "1"})));
        bus.publish(Event::new(EventType::OrderFilled, json!({"id": "2"})));

        assert_eq!(filled.load(Ordering::SeqCst), 2);
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_can_subscribe_during_dispatch() {
        let bus = Arc::new(EventBus::new());
        let inner = bus.clone();
        bus.subscribe(
            EventType::PriceUpdate,
            Arc::new(move |_| {
                inner.subscribe(EventType::OrderPlaced, Arc::new(|_| {}));
            }),
        );
        bus.publish(Event::new(EventType::PriceUpdate, json!({})));
    }

    #[test]
    fn clear_removes_everything() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(
            EventType::OrderFilled,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.clear();
        bus.publish(Event::new(EventType::OrderFilled, json!({})));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
