//! Lifecycle events the manager emits; subscribers drain an
//! `mpsc::Receiver<Event>` handed out by `Manager::subscribe()`.

use crate::value::Item;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Initialized,
    Stored(Item),
    Updated(Item),
    Deleted {
        namespace: String,
        category: String,
        key: String,
    },
    CacheHit {
        namespace: String,
        category: String,
        key: String,
    },
    Imported {
        count: usize,
    },
    Closed,
}

/// Publishes events to every live subscriber, pruning channels whose
/// receiver has been dropped.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<std::sync::mpsc::Sender<Event>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    pub fn subscribe(&mut self) -> std::sync::mpsc::Receiver<Event> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn publish(&mut self, event: Event) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_receive_published_events() {
        let mut bus = EventBus::new();
        let rx = bus.subscribe();
        bus.publish(Event::Initialized);
        assert_eq!(rx.try_recv().unwrap(), Event::Initialized);
    }

    #[test]
    fn dropped_receivers_are_pruned_on_next_publish() {
        let mut bus = EventBus::new();
        {
            let _rx = bus.subscribe();
        }
        assert_eq!(bus.subscribers.len(), 1);
        bus.publish(Event::Closed);
        assert_eq!(bus.subscribers.len(), 0);
    }

    #[test]
    fn multiple_subscribers_all_receive_the_same_event() {
        let mut bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        bus.publish(Event::Imported { count: 3 });
        assert_eq!(rx1.try_recv().unwrap(), Event::Imported { count: 3 });
        assert_eq!(rx2.try_recv().unwrap(), Event::Imported { count: 3 });
    }
}
