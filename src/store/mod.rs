use std::cmp;
use std::sync::{
    atomic::{AtomicI64, Ordering},
    mpsc::Receiver,
    Arc,
};
use std::time::{SystemTime, UNIX_EPOCH};

pub use error::*;
pub use memory_store::*;
pub use slow_store::*;
pub use sqlite_store::*;

pub mod error;
pub mod memory_store;
pub mod slow_store;
pub mod sqlite_store;

use crate::filter::{Filter, SortOrder};
use crate::notifier::Notifier;
use crate::types::{Fields, NewRecord, Record, RemoteEvent};

/// The hosted backend: durable record CRUD plus a push channel of row-level
/// changes. Delivery on the push channel is best effort; events may arrive
/// out of order or not at all.
pub trait RemoteStore: Send + Sync {
    fn select(&self, table: &str, filter: &Filter, order: &SortOrder) -> Result<Vec<Record>, StoreError>;

    /// Aggregate row count, the server-side `count: exact`.
    fn count(&self, table: &str, filter: &Filter) -> Result<u64, StoreError>;

    /// Inserts a row. The store assigns `id` and `created_at`.
    fn insert(&self, table: &str, record: NewRecord) -> Result<Record, StoreError>;

    fn update(&self, table: &str, id: &str, patch: &Fields) -> Result<(), StoreError>;

    fn delete(&self, table: &str, id: &str) -> Result<(), StoreError>;

    /// Opens a push channel for changes to `table` matching `filter`.
    fn open_channel(&self, table: &str, filter: &Filter) -> Result<Channel, StoreError>;

    /// Closes a channel. Unknown or already closed ids are ignored.
    fn close_channel(&self, channel_id: u64);
}

impl<S: RemoteStore + ?Sized> RemoteStore for Arc<S> {
    fn select(&self, table: &str, filter: &Filter, order: &SortOrder) -> Result<Vec<Record>, StoreError> {
        (**self).select(table, filter, order)
    }

    fn count(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
        (**self).count(table, filter)
    }

    fn insert(&self, table: &str, record: NewRecord) -> Result<Record, StoreError> {
        (**self).insert(table, record)
    }

    fn update(&self, table: &str, id: &str, patch: &Fields) -> Result<(), StoreError> {
        (**self).update(table, id, patch)
    }

    fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        (**self).delete(table, id)
    }

    fn open_channel(&self, table: &str, filter: &Filter) -> Result<Channel, StoreError> {
        (**self).open_channel(table, filter)
    }

    fn close_channel(&self, channel_id: u64) {
        (**self).close_channel(channel_id)
    }
}

/// Receiving end of one push subscription.
pub struct Channel {
    pub id: u64,
    pub table: String,
    pub filter: Filter,
    receiver: Receiver<RemoteEvent>,
}

impl Channel {
    pub fn new(id: u64, table: &str, filter: &Filter, receiver: Receiver<RemoteEvent>) -> Self {
        Self {
            id,
            table: table.to_string(),
            filter: filter.clone(),
            receiver,
        }
    }

    /// Takes every event queued so far without blocking.
    pub fn drain(&self) -> Vec<RemoteEvent> {
        self.receiver.try_iter().collect()
    }
}

/// Registers a channel on `notifier` that accepts events for `table` whose
/// new or previous row matches `filter`. Shared by the store implementations.
pub(crate) fn open_filtered_channel(notifier: &Notifier<RemoteEvent>, table: &str, filter: &Filter) -> Channel {
    let accept_table = table.to_string();
    let accept_filter = filter.clone();
    let (id, rx) = notifier.observer_where(move |event: &RemoteEvent| {
        event.table == accept_table
            && (accept_filter.matches(&event.record)
                || event.previous.as_ref().is_some_and(|previous| accept_filter.matches(previous)))
    });
    log::debug!("CHANNEL OPEN: id={} table='{}' filter='{}'", id, table, filter);
    Channel::new(id, table, filter, rx)
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Assigns `created_at` values. Strictly increasing per clock, so rows
/// inserted in the same millisecond still order by insertion.
#[derive(Clone, Default)]
pub struct ServerClock {
    last: Arc<AtomicI64>,
}

impl ServerClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock whose first value is greater than `last`.
    pub fn starting_after(last: i64) -> Self {
        Self {
            last: Arc::new(AtomicI64::new(last)),
        }
    }

    pub fn next(&self) -> i64 {
        let now = now_millis();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(cmp::max(now, last + 1)))
            .unwrap_or_else(|last| last);
        cmp::max(now, previous + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_clock_is_strictly_increasing() {
        let clock = ServerClock::new();
        let mut last = clock.next();
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn filtered_channel_sees_rows_leaving_the_filter() {
        let notifier = Notifier::new();
        let filter = Filter::all().eq("category", "cartas");
        let channel = open_filtered_channel(&notifier, "quotes", &filter);

        let mut before = Record {
            id: "q1".to_string(),
            owner_id: "u1".to_string(),
            created_at: 1,
            fields: Fields::new(),
        };
        before.fields.insert("category".to_string(), "cartas".into());
        let mut after = before.clone();
        after.fields.insert("category".to_string(), "poemas".into());

        notifier.notify(RemoteEvent::update("quotes", after.clone(), Some(before)));
        notifier.notify(RemoteEvent::insert("quotes", after.clone()));
        notifier.notify(RemoteEvent::insert("posts", after));

        let events = channel.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, crate::types::EventKind::Update);
    }
}
