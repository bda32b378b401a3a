use std::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Fan-out of events to any number of channel subscribers. Closed receivers are
/// dropped on the next emit.
#[derive(Debug)]
pub struct EventHub<E> {
    subscribers: Mutex<Vec<UnboundedSender<E>>>,
}

impl<E: Clone> EventHub<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Returns the number of subscribers that received the event.
    pub fn emit(&self, event: E) -> usize {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return 0;
        };
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl<E: Clone> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let hub = EventHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        assert_eq!(hub.emit("ready"), 2);
        assert_eq!(a.recv().await, Some("ready"));
        assert_eq!(b.recv().await, Some("ready"));
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let hub = EventHub::new();
        let dropped = hub.subscribe();
        let mut kept = hub.subscribe();
        drop(dropped);

        assert_eq!(hub.emit(7u32), 1);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(kept.recv().await, Some(7));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let hub: EventHub<u8> = EventHub::default();
        assert_eq!(hub.emit(1), 0);
    }
}
