use std::sync::{
    atomic::{AtomicU64, Ordering},
    mpsc::{channel, Receiver, Sender},
    Arc, PoisonError, RwLock,
};

type Accepts<Event> = Box<dyn Fn(&Event) -> bool + Send + Sync>;

struct Observer<Event> {
    id: u64,
    accepts: Accepts<Event>,
    tx: Sender<Event>,
}

/// Fans events out to observers over mpsc channels. Each observer may carry
/// a predicate; it only receives events the predicate accepts. Observers
/// whose Receiver was dropped are cleaned up lazily on the next notify.
pub struct Notifier<Event: Send + Clone + 'static> {
    observers: Arc<RwLock<Vec<Observer<Event>>>>,
    next_id: Arc<AtomicU64>,
}

impl<Event: Send + Clone + 'static> Clone for Notifier<Event> {
    fn clone(&self) -> Self {
        Self {
            observers: self.observers.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<Event: Send + Clone + 'static> Default for Notifier<Event> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Event: Send + Clone + 'static> Notifier<Event> {
    pub fn new() -> Self {
        Self {
            observers: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn notify(&self, event: Event) {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        observers.retain(|observer| {
            if !(observer.accepts)(&event) {
                return true;
            }
            observer.tx.send(event.clone()).is_ok()
        });
    }

    /// Registers an observer for every event.
    pub fn observer(&self) -> (u64, Receiver<Event>) {
        self.observer_where(|_| true)
    }

    /// Registers an observer for the events `accepts` lets through.
    pub fn observer_where(
        &self,
        accepts: impl Fn(&Event) -> bool + Send + Sync + 'static,
    ) -> (u64, Receiver<Event>) {
        let (tx, rx) = channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Observer { id, accepts: Box::new(accepts), tx });
        (id, rx)
    }

    /// Drops the observer's Sender. Returns false if it was already gone.
    pub fn remove(&self, id: u64) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|observer| observer.id != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
