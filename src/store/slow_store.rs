use std::thread;
use std::time::Duration;

use super::{Channel, RemoteStore, StoreError};
use crate::filter::{Filter, SortOrder};
use crate::types::{Fields, NewRecord, Record};

/// Wraps a store with artificial delays to simulate a high-latency backend.
/// Channel operations are not delayed.
#[derive(Clone)]
pub struct SlowStore<S: RemoteStore> {
    inner: S,
    read_delay_ms: u64,
    write_delay_ms: u64,
}

impl<S: RemoteStore> SlowStore<S> {
    pub fn new(inner: S, read_delay_ms: u64, write_delay_ms: u64) -> Self {
        Self {
            inner,
            read_delay_ms,
            write_delay_ms,
        }
    }

    /// Latency in the range of a hosted backend over a mobile connection.
    pub fn backend_like(inner: S) -> Self {
        Self::new(inner, 40, 120)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn read_pause(&self) {
        thread::sleep(Duration::from_millis(self.read_delay_ms));
    }

    fn write_pause(&self) {
        thread::sleep(Duration::from_millis(self.write_delay_ms));
    }
}

impl<S: RemoteStore> RemoteStore for SlowStore<S> {
    fn select(&self, table: &str, filter: &Filter, order: &SortOrder) -> Result<Vec<Record>, StoreError> {
        log::debug!("SLOW STORE SELECT: table='{}' (delay: {}ms)", table, self.read_delay_ms);
        self.read_pause();
        self.inner.select(table, filter, order)
    }

    fn count(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
        log::debug!("SLOW STORE COUNT: table='{}' (delay: {}ms)", table, self.read_delay_ms);
        self.read_pause();
        self.inner.count(table, filter)
    }

    fn insert(&self, table: &str, record: NewRecord) -> Result<Record, StoreError> {
        log::debug!("SLOW STORE INSERT: table='{}' (delay: {}ms)", table, self.write_delay_ms);
        self.write_pause();
        self.inner.insert(table, record)
    }

    fn update(&self, table: &str, id: &str, patch: &Fields) -> Result<(), StoreError> {
        log::debug!("SLOW STORE UPDATE: table='{}' id='{}' (delay: {}ms)", table, id, self.write_delay_ms);
        self.write_pause();
        self.inner.update(table, id, patch)
    }

    fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        log::debug!("SLOW STORE DELETE: table='{}' id='{}' (delay: {}ms)", table, id, self.write_delay_ms);
        self.write_pause();
        self.inner.delete(table, id)
    }

    fn open_channel(&self, table: &str, filter: &Filter) -> Result<Channel, StoreError> {
        self.inner.open_channel(table, filter)
    }

    fn close_channel(&self, channel_id: u64) {
        self.inner.close_channel(channel_id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn delays_writes_but_not_channels() -> anyhow::Result<()> {
        let store = SlowStore::new(MemoryStore::new(), 0, 30);
        let channel = store.open_channel("posts", &Filter::all())?;

        let started = Instant::now();
        store.insert("posts", NewRecord::new("u1", Fields::new()))?;
        assert!(started.elapsed() >= Duration::from_millis(30));

        assert_eq!(channel.drain().len(), 1);
        assert_eq!(store.inner().count("posts", &Filter::all())?, 1);
        Ok(())
    }
}
