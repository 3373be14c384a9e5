use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use uuid::Uuid;

use super::{open_filtered_channel, Channel, RemoteStore, ServerClock, StoreError};
use crate::filter::{Filter, SortOrder};
use crate::notifier::Notifier;
use crate::types::{Fields, NewRecord, Record, RemoteEvent};

/// Store request kinds, used to target injected faults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Count,
    Insert,
    Update,
    Delete,
    OpenChannel,
}

#[derive(Default)]
struct Tables {
    rows: HashMap<String, Vec<Record>>,
    unique: HashMap<String, Vec<Vec<String>>>,
}

/// In-memory RemoteStore. Clones share the same tables, push channels and
/// fault queue, so two clones behave like two clients of one backend.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    notifier: Notifier<RemoteEvent>,
    faults: Arc<Mutex<HashMap<Operation, VecDeque<StoreError>>>>,
    clock: ServerClock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a unique constraint over `columns` of `table`.
    pub fn with_unique(self, table: &str, columns: &[&str]) -> Self {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .unique
            .entry(table.to_string())
            .or_default()
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Makes the next `op` request fail with `err`. Faults queue up in order.
    pub fn fail_next(&self, op: Operation, err: StoreError) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Number of open push channels.
    pub fn channel_count(&self) -> usize {
        self.notifier.len()
    }

    fn take_fault(&self, op: Operation) -> Result<(), StoreError> {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        match faults.get_mut(&op).and_then(|queue| queue.pop_front()) {
            Some(err) => {
                log::debug!("STORE FAULT: {:?} -> {}", op, err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::other("Failed to acquire read lock"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::other("Failed to acquire write lock"))
    }
}

fn violated_constraint(tables: &Tables, table: &str, candidate: &Record) -> Option<String> {
    let constraints = tables.unique.get(table)?;
    let rows = tables.rows.get(table)?;
    constraints.iter().find_map(|columns| {
        let clash = rows.iter().any(|row| {
            row.id != candidate.id
                && columns.iter().all(|column| {
                    let value = candidate.field(column);
                    // Like SQL, null never collides with anything.
                    value.as_ref().is_some_and(|v| !v.is_null()) && row.field(column) == value
                })
        });
        clash.then(|| format!("{}_{}_key", table, columns.join("_")))
    })
}

impl RemoteStore for MemoryStore {
    fn select(&self, table: &str, filter: &Filter, order: &SortOrder) -> Result<Vec<Record>, StoreError> {
        log::debug!("STORE SELECT: table='{}' filter='{}'", table, filter);
        self.take_fault(Operation::Select)?;
        let tables = self.read()?;
        let mut rows: Vec<Record> = tables
            .rows
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default();
        order.sort(&mut rows);
        log::debug!("STORE SELECT RESULT: {} rows", rows.len());
        Ok(rows)
    }

    fn count(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
        log::debug!("STORE COUNT: table='{}' filter='{}'", table, filter);
        self.take_fault(Operation::Count)?;
        let tables = self.read()?;
        let count = tables
            .rows
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).count())
            .unwrap_or(0);
        Ok(count as u64)
    }

    fn insert(&self, table: &str, record: NewRecord) -> Result<Record, StoreError> {
        log::debug!("STORE INSERT: table='{}' owner='{}'", table, record.owner_id);
        self.take_fault(Operation::Insert)?;
        let record = record.into_record(Uuid::now_v7().to_string(), self.clock.next());
        {
            let mut tables = self.write()?;
            if let Some(constraint) = violated_constraint(&tables, table, &record) {
                return Err(StoreError::unique_violation(format!(
                    "duplicate key value violates unique constraint \"{}\"",
                    constraint
                )));
            }
            tables.rows.entry(table.to_string()).or_default().push(record.clone());
        }
        log::debug!("STORE INSERT RESULT: id='{}'", record.id);
        self.notifier.notify(RemoteEvent::insert(table, record.clone()));
        Ok(record)
    }

    fn update(&self, table: &str, id: &str, patch: &Fields) -> Result<(), StoreError> {
        log::debug!("STORE UPDATE: table='{}' id='{}' fields={}", table, id, patch.len());
        self.take_fault(Operation::Update)?;
        let (previous, updated) = {
            let mut tables = self.write()?;
            let current = tables
                .rows
                .get(table)
                .and_then(|rows| rows.iter().find(|r| r.id == id))
                .cloned()
                .ok_or_else(|| StoreError::not_found(format!("{}/{}", table, id)))?;
            let mut updated = current.clone();
            updated.apply_patch(patch);
            if let Some(constraint) = violated_constraint(&tables, table, &updated) {
                return Err(StoreError::unique_violation(format!(
                    "duplicate key value violates unique constraint \"{}\"",
                    constraint
                )));
            }
            if let Some(row) = tables
                .rows
                .get_mut(table)
                .and_then(|rows| rows.iter_mut().find(|r| r.id == id))
            {
                *row = updated.clone();
            }
            (current, updated)
        };
        self.notifier.notify(RemoteEvent::update(table, updated, Some(previous)));
        Ok(())
    }

    fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        log::debug!("STORE DELETE: table='{}' id='{}'", table, id);
        self.take_fault(Operation::Delete)?;
        let removed = {
            let mut tables = self.write()?;
            let rows = tables
                .rows
                .get_mut(table)
                .ok_or_else(|| StoreError::not_found(format!("{}/{}", table, id)))?;
            let position = rows
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| StoreError::not_found(format!("{}/{}", table, id)))?;
            rows.remove(position)
        };
        self.notifier.notify(RemoteEvent::delete(table, removed));
        Ok(())
    }

    fn open_channel(&self, table: &str, filter: &Filter) -> Result<Channel, StoreError> {
        self.take_fault(Operation::OpenChannel)?;
        Ok(open_filtered_channel(&self.notifier, table, filter))
    }

    fn close_channel(&self, channel_id: u64) {
        if self.notifier.remove(channel_id) {
            log::debug!("CHANNEL CLOSE: id={}", channel_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::StoreErrorKind;
    use crate::types::EventKind;

    fn like(post_id: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("post_id".to_string(), json!(post_id));
        fields
    }

    #[test]
    fn insert_assigns_identity_and_order() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let a = store.insert("posts", NewRecord::new("u1", Fields::new()))?;
        let b = store.insert("posts", NewRecord::new("u1", Fields::new()))?;
        assert_ne!(a.id, b.id);
        assert!(b.created_at > a.created_at);

        let rows = store.select("posts", &Filter::all(), &SortOrder::new().desc("created_at"))?;
        assert_eq!(rows.iter().map(|r| r.id.clone()).collect::<Vec<_>>(), vec![b.id, a.id]);
        Ok(())
    }

    #[test]
    fn unique_constraint_rejects_duplicates() -> anyhow::Result<()> {
        let store = MemoryStore::new().with_unique("likes", &["post_id", "owner_id"]);
        store.insert("likes", NewRecord::new("u1", like("p1")))?;
        store.insert("likes", NewRecord::new("u2", like("p1")))?;
        let err = store.insert("likes", NewRecord::new("u1", like("p1"))).unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::UniqueViolation);
        assert_eq!(store.count("likes", &Filter::all().eq("post_id", "p1"))?, 2);
        Ok(())
    }

    #[test]
    fn faults_fire_once_in_order() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.fail_next(Operation::Select, StoreError::transport("offline"));
        assert!(store.select("posts", &Filter::all(), &SortOrder::new()).is_err());
        assert!(store.select("posts", &Filter::all(), &SortOrder::new()).is_ok());
        Ok(())
    }

    #[test]
    fn update_and_delete_missing_rows() {
        let store = MemoryStore::new();
        let err = store.update("posts", "nope", &Fields::new()).unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::NotFound);
        let err = store.delete("posts", "nope").unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::NotFound);
    }

    #[test]
    fn channels_receive_matching_changes() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let channel = store.open_channel("likes", &Filter::all().eq("post_id", "p1"))?;

        let liked = store.insert("likes", NewRecord::new("u1", like("p1")))?;
        store.insert("likes", NewRecord::new("u1", like("p2")))?;
        store.delete("likes", &liked.id)?;

        let kinds: Vec<EventKind> = channel.drain().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Insert, EventKind::Delete]);

        store.close_channel(channel.id);
        store.insert("likes", NewRecord::new("u3", like("p1")))?;
        assert!(channel.drain().is_empty());
        assert_eq!(store.channel_count(), 0);
        Ok(())
    }

    #[test]
    fn clones_share_state() -> anyhow::Result<()> {
        let device_a = MemoryStore::new();
        let device_b = device_a.clone();
        device_a.insert("quotes", NewRecord::new("u1", Fields::new()))?;
        assert_eq!(device_b.count("quotes", &Filter::all())?, 1);
        Ok(())
    }
}
