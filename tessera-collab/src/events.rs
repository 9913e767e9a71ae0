//! Multi-subscriber callback channels.
//!
//! Callbacks are cloned out of the lock before they run, so a subscriber may
//! subscribe, unsubscribe or call back into the client from inside a callback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Handle returned by `subscribe`, passed back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct EventBus<T> {
    callbacks: RwLock<Vec<(usize, Callback<T>)>>,
    next_id: AtomicUsize,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        ListenerId(id)
    }

    /// Returns false when the listener was already removed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut callbacks = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
        let before = callbacks.len();
        callbacks.retain(|(cid, _)| *cid != id.0);
        callbacks.len() != before
    }

    pub fn emit(&self, event: &T) {
        let callbacks: Vec<Callback<T>> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in callbacks {
            cb(event);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_emit_reaches_all_subscribers() {
        let bus = EventBus::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = seen.clone();
        bus.subscribe(move |v| a.lock().unwrap().push(("a", *v)));
        let b = seen.clone();
        bus.subscribe(move |v| b.lock().unwrap().push(("b", *v)));

        bus.emit(&7);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let bus = Arc::new(EventBus::<u32>::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let bus2 = bus.clone();
        let slot2 = slot.clone();
        let id = bus.subscribe(move |_| {
            if let Some(id) = slot2.lock().unwrap().take() {
                bus2.unsubscribe(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        bus.emit(&1);
        assert!(bus.is_empty());
    }
}
