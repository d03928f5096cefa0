/// Typed event fan-out
use tokio::sync::mpsc;

/// Subscribers of one component's events.
///
/// Each subscriber owns an unbounded receiver; dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscribers<E> {
    senders: Vec<mpsc::UnboundedSender<E>>,
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            senders: Vec::new(),
        }
    }
}

impl<E: Clone> Subscribers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, forgetting closed ones
    pub fn emit(&mut self, event: E) {
        self.senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_live_subscribers() {
        let mut subscribers = Subscribers::new();
        let mut first = subscribers.subscribe();
        let second = subscribers.subscribe();
        drop(second);

        subscribers.emit(7u32);

        assert_eq!(first.try_recv().unwrap(), 7);
        assert_eq!(subscribers.len(), 1);
    }
}
