//! In-process fan-out of station events.
//!
//! The messenger is owned by the station and constructed at startup.
//! Synchronous listeners are called on the publishing thread, in
//! registration order, so events about one instance reach every listener
//! in the order the transitions happened. Async consumers can take a
//! broadcast receiver instead.

use crate::event::StationEvent;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Receives station notifications.
pub trait StationListener: Send + Sync {
    fn notify(&self, event: &StationEvent);
}

impl<F> StationListener for F
where
    F: Fn(&StationEvent) + Send + Sync,
{
    fn notify(&self, event: &StationEvent) {
        self(event)
    }
}

/// Handle returned by [`StationMessenger::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Station event bus.
pub struct StationMessenger {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn StationListener>)>>,
    tx: broadcast::Sender<StationEvent>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl StationMessenger {
    /// Create a messenger whose broadcast side buffers `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            tx,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn register(&self, listener: Arc<dyn StationListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push((id, listener)),
            Err(poisoned) => poisoned.into_inner().push((id, listener)),
        }
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn deregister(&self, id: ListenerId) -> bool {
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        match self.listeners.read() {
            Ok(listeners) => listeners.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Subscribe to the broadcast stream of future events.
    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.tx.subscribe()
    }

    /// Deliver an event to every listener, then to broadcast subscribers.
    pub fn publish(&self, event: StationEvent) {
        if self.closed.load(Ordering::Acquire) {
            debug!(operation = event.operation_name(), "Messenger closed, event dropped");
            return;
        }

        // Snapshot so listeners may (de)register from inside notify.
        let listeners: Vec<Arc<dyn StationListener>> = match self.listeners.read() {
            Ok(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(poisoned) => {
                warn!("Listener list poisoned, recovering");
                poisoned
                    .into_inner()
                    .iter()
                    .map(|(_, l)| Arc::clone(l))
                    .collect()
            }
        };

        for listener in &listeners {
            listener.notify(&event);
        }

        let operation = event.operation_name();
        match self.tx.send(event) {
            Ok(receivers) => debug!(operation, receivers, "Published event"),
            Err(_) => debug!(operation, listeners = listeners.len(), "Published event"),
        }
    }

    /// Drop every listener and refuse further events.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        match self.listeners.write() {
            Ok(mut listeners) => listeners.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl Default for StationMessenger {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn place_event(name: &str) -> StationEvent {
        StationEvent::PlaceCreated {
            place: name.to_string(),
        }
    }

    #[test]
    fn test_listeners_receive_in_order() {
        let messenger = StationMessenger::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        messenger.register(Arc::new(move |event: &StationEvent| {
            if let StationEvent::PlaceCreated { place } = event {
                sink.lock().unwrap().push(place.clone());
            }
        }));

        messenger.publish(place_event("a"));
        messenger.publish(place_event("b"));

        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_deregister_stops_delivery() {
        let messenger = StationMessenger::new(16);
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let id = messenger.register(Arc::new(move |_: &StationEvent| {
            *sink.lock().unwrap() += 1;
        }));

        messenger.publish(place_event("a"));
        assert!(messenger.deregister(id));
        assert!(!messenger.deregister(id));
        messenger.publish(place_event("b"));

        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(messenger.listener_count(), 0);
    }

    #[test]
    fn test_broadcast_subscriber() {
        let messenger = StationMessenger::new(16);
        let mut rx = messenger.subscribe();
        messenger.publish(place_event("Lab"));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.operation_name(), "createPlace");
    }

    #[test]
    fn test_shutdown_drops_events() {
        let messenger = StationMessenger::new(16);
        let mut rx = messenger.subscribe();
        messenger.register(Arc::new(|_: &StationEvent| {}));
        messenger.shutdown();
        messenger.publish(place_event("Lab"));
        assert_eq!(messenger.listener_count(), 0);
        assert!(rx.try_recv().is_err());
    }
}
