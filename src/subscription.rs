use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ReconcileError;
use crate::filter::Filter;
use crate::store::{Channel, RemoteStore};
use crate::types::RemoteEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscription#{}", self.0)
    }
}

/// Owns the push channels of one view. At most one channel is open per
/// (table, filter); every channel still open is closed on drop.
pub struct SubscriptionManager {
    store: Arc<dyn RemoteStore>,
    channels: HashMap<SubscriptionHandle, Channel>,
    keys: HashMap<(String, String), SubscriptionHandle>,
}

impl SubscriptionManager {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            channels: HashMap::new(),
            keys: HashMap::new(),
        }
    }

    pub fn subscribe(&mut self, table: &str, filter: &Filter) -> Result<SubscriptionHandle, ReconcileError> {
        let key = (table.to_string(), filter.to_string());
        if self.keys.contains_key(&key) {
            log::error!("duplicate subscription to {} ({}), the previous one was never torn down", table, filter);
            return Err(ReconcileError::DuplicateSubscription { table: key.0, filter: key.1 });
        }
        let channel = self
            .store
            .open_channel(table, filter)
            .map_err(|source| ReconcileError::Subscribe { table: table.to_string(), source })?;
        let handle = SubscriptionHandle(channel.id);
        log::debug!("{} opened on {} ({})", handle, table, filter);
        self.keys.insert(key, handle);
        self.channels.insert(handle, channel);
        Ok(handle)
    }

    /// Closes the channel. Returns false, and does nothing, if it was
    /// already closed.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> bool {
        let Some(channel) = self.channels.remove(&handle) else {
            return false;
        };
        self.keys.remove(&(channel.table.clone(), channel.filter.to_string()));
        self.store.close_channel(channel.id);
        log::debug!("{} closed", handle);
        true
    }

    /// Events queued on the channel so far. Empty once it is closed.
    pub fn drain(&self, handle: SubscriptionHandle) -> Vec<RemoteEvent> {
        self.channels.get(&handle).map(Channel::drain).unwrap_or_default()
    }

    pub fn is_open(&self, handle: SubscriptionHandle) -> bool {
        self.channels.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn close_all(&mut self) {
        let handles: Vec<SubscriptionHandle> = self.channels.keys().copied().collect();
        for handle in handles {
            self.unsubscribe(handle);
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Operation, StoreError};
    use crate::types::{Fields, NewRecord};

    fn manager() -> (MemoryStore, SubscriptionManager) {
        let store = MemoryStore::new();
        let manager = SubscriptionManager::new(Arc::new(store.clone()));
        (store, manager)
    }

    #[test]
    fn duplicate_subscription_is_rejected() -> anyhow::Result<()> {
        let (_, mut manager) = manager();
        let filter = Filter::all().eq("post_id", "p1");
        manager.subscribe("likes", &filter)?;

        let err = manager.subscribe("likes", &filter).unwrap_err();
        assert!(err.is_programming_error());
        assert_eq!(manager.len(), 1);

        // Same table, different predicate is a different subscription.
        manager.subscribe("likes", &Filter::all().eq("post_id", "p2"))?;
        assert_eq!(manager.len(), 2);
        Ok(())
    }

    #[test]
    fn unsubscribe_is_idempotent() -> anyhow::Result<()> {
        let (store, mut manager) = manager();
        let handle = manager.subscribe("posts", &Filter::all())?;
        assert_eq!(store.channel_count(), 1);

        assert!(manager.unsubscribe(handle));
        assert!(!manager.unsubscribe(handle));
        assert_eq!(store.channel_count(), 0);
        assert!(!manager.is_open(handle));

        // The pair can be opened again after teardown.
        manager.subscribe("posts", &Filter::all())?;
        Ok(())
    }

    #[test]
    fn events_after_teardown_are_dropped() -> anyhow::Result<()> {
        let (store, mut manager) = manager();
        let handle = manager.subscribe("posts", &Filter::all())?;
        store.insert("posts", NewRecord::new("u1", Fields::new()))?;
        assert_eq!(manager.drain(handle).len(), 1);

        manager.unsubscribe(handle);
        store.insert("posts", NewRecord::new("u1", Fields::new()))?;
        assert!(manager.drain(handle).is_empty());
        Ok(())
    }

    #[test]
    fn drop_closes_channels() -> anyhow::Result<()> {
        let (store, mut manager) = manager();
        manager.subscribe("posts", &Filter::all())?;
        manager.subscribe("quotes", &Filter::all())?;
        assert_eq!(store.channel_count(), 2);
        drop(manager);
        assert_eq!(store.channel_count(), 0);
        Ok(())
    }

    #[test]
    fn open_failure_leaves_no_registration() -> anyhow::Result<()> {
        let (store, mut manager) = manager();
        store.fail_next(Operation::OpenChannel, StoreError::transport("socket closed"));
        assert!(matches!(
            manager.subscribe("posts", &Filter::all()),
            Err(ReconcileError::Subscribe { .. })
        ));
        manager.subscribe("posts", &Filter::all())?;
        Ok(())
    }
}
