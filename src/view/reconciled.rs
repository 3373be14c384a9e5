use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use super::config::{EventMode, ViewConfig};
use super::edit::{is_echo_of, is_provisional_id, provisional_record, EditHandle, LocalEdit, PendingEdit};
use super::policy::materialize;
use crate::error::ReconcileError;
use crate::filter::Filter;
use crate::identity::{IdentityContext, Role};
use crate::store::{RemoteStore, StoreError, StoreErrorKind};
use crate::subscription::{SubscriptionHandle, SubscriptionManager};
use crate::types::{Entity, EventKind, Fields, NewRecord, Record, RemoteEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    /// No channel open, either never mounted or the subscribe failed. Edits
    /// still resolve; `mount()` retries.
    Detached,
    Mounted,
    Unmounted,
}

/// Most deleted ids remembered between loads.
pub(crate) const TOMBSTONE_LIMIT: usize = 4096;

/// Ids seen deleted since the last load. Ids are never reused, so a later
/// insert or update for one of these is a stale, reordered event. Only the
/// newest `TOMBSTONE_LIMIT` are kept.
#[derive(Default)]
struct Tombstones {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl Tombstones {
    fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > TOMBSTONE_LIMIT {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.order.clear();
    }
}

/// A materialized collection for one table and filter. The rendered rows
/// are always re-derived from the last known server snapshot with the
/// pending optimistic edits applied on top; they are never patched in place.
pub struct ReconciledView {
    config: ViewConfig,
    store: Arc<dyn RemoteStore>,
    identity: IdentityContext,
    subscriptions: SubscriptionManager,
    subscription: Option<SubscriptionHandle>,
    lifecycle: Lifecycle,
    snapshot: Vec<Record>,
    pending: Vec<PendingEdit>,
    rendered: Vec<Record>,
    tombstones: Tombstones,
    next_edit: u64,
}

impl ReconciledView {
    pub fn new(store: Arc<dyn RemoteStore>, identity: IdentityContext, config: ViewConfig) -> Self {
        Self {
            subscriptions: SubscriptionManager::new(store.clone()),
            config,
            store,
            identity,
            subscription: None,
            lifecycle: Lifecycle::Detached,
            snapshot: Vec::new(),
            pending: Vec::new(),
            rendered: Vec::new(),
            tombstones: Tombstones::default(),
            next_edit: 0,
        }
    }

    /// Opens the push channel, then fetches the snapshot. Mounting again
    /// tears the previous channel down first. If the fetch fails the view
    /// stays mounted and the error is returned; call `load()` to retry. If
    /// the channel cannot be opened the view is left detached, showing only
    /// the rows it has that pass the current filter.
    pub fn mount(&mut self) -> Result<(), ReconcileError> {
        self.close_subscription();
        let handle = match self.subscriptions.subscribe(&self.config.table, &self.config.filter) {
            Ok(handle) => handle,
            Err(err) => {
                self.lifecycle = Lifecycle::Detached;
                let filter = &self.config.filter;
                self.snapshot.retain(|r| filter.matches(r));
                self.recompute();
                log::warn!("view on {} detached: {}", self.config.table, err);
                return Err(err);
            }
        };
        self.subscription = Some(handle);
        self.lifecycle = Lifecycle::Mounted;
        log::debug!("view on {} ({}) mounted", self.config.table, self.config.filter);
        self.load()
    }

    /// Closes the channel and forgets unresolved edits. Completions and
    /// events arriving afterwards are ignored.
    pub fn unmount(&mut self) {
        self.close_subscription();
        if !self.pending.is_empty() {
            log::debug!("view on {} dropped {} unresolved edits", self.config.table, self.pending.len());
        }
        self.pending.clear();
        self.lifecycle = Lifecycle::Unmounted;
        self.recompute();
    }

    pub fn is_mounted(&self) -> bool {
        self.lifecycle == Lifecycle::Mounted
    }

    /// Replaces the snapshot with a full fetch and re-applies pending edits.
    /// On failure nothing changes.
    pub fn load(&mut self) -> Result<(), ReconcileError> {
        let rows = self
            .store
            .select(&self.config.table, &self.config.filter, &self.config.order)
            .map_err(|source| {
                log::warn!("load of {} failed, keeping {} rows: {}", self.config.table, self.rendered.len(), source);
                ReconcileError::Fetch { table: self.config.table.clone(), source }
            })?;
        log::debug!(
            "loaded {} rows from {}, forgetting {} deleted ids",
            rows.len(),
            self.config.table,
            self.tombstones.len()
        );
        self.snapshot = rows;
        self.tombstones.clear();
        self.recompute();
        Ok(())
    }

    /// Shows `edit` immediately and records it as pending. No request is
    /// made.
    pub fn apply_optimistic(&mut self, edit: LocalEdit) -> EditHandle {
        self.next_edit += 1;
        let handle = EditHandle(self.next_edit);
        let base = self.rendered.iter().find(|r| r.id == edit.target_id()).cloned();
        log::debug!("{} applied: {} {}", handle, edit.action(), edit.target_id());
        self.pending.push(PendingEdit { handle, edit, base });
        self.recompute();
        handle
    }

    /// Resolves a pending edit as accepted. The edit is folded into the
    /// snapshot, so the rendered rows do not change. Returns false for a
    /// handle that is already resolved.
    pub fn confirm(&mut self, handle: EditHandle) -> bool {
        let Some(pending) = self.take_pending(handle) else {
            log::debug!("{} already resolved, ignoring confirm", handle);
            return false;
        };
        self.fold(&pending.edit);
        self.recompute();
        log::debug!("{} confirmed", handle);
        true
    }

    /// Confirms a pending insert with the row the store created, which
    /// replaces the provisional one.
    pub fn confirm_with(&mut self, handle: EditHandle, record: Record) -> bool {
        let Some(_) = self.take_pending(handle) else {
            log::debug!("{} already resolved, ignoring confirm", handle);
            return false;
        };
        self.fold(&LocalEdit::Insert(record));
        self.recompute();
        log::debug!("{} confirmed", handle);
        true
    }

    /// Undoes a pending edit. Returns the conflict to surface to the user,
    /// `AlreadyExists` for an insert that hit a unique key, or None if the
    /// handle was already resolved.
    pub fn rollback(&mut self, handle: EditHandle, cause: StoreError) -> Option<ReconcileError> {
        let Some(pending) = self.take_pending(handle) else {
            log::debug!("{} already resolved, ignoring rollback", handle);
            return None;
        };
        self.recompute();
        log::warn!("{} ({} {}) rolled back: {}", handle, pending.edit.action(), pending.edit.target_id(), cause);
        if matches!(pending.edit, LocalEdit::Insert(_)) && cause.is_unique_violation() {
            return Some(ReconcileError::AlreadyExists { table: self.config.table.clone() });
        }
        Some(ReconcileError::Conflict { edit: handle.to_string(), source: cause })
    }

    /// Merges one push event. In refetch mode a full load follows; if that
    /// fails the merged state stands and the error is returned.
    pub fn on_remote_event(&mut self, event: RemoteEvent) -> Result<(), ReconcileError> {
        if !self.accepts(&event) {
            return Ok(());
        }
        self.merge(&event);
        self.recompute();
        match self.config.event_mode {
            EventMode::Merge => Ok(()),
            EventMode::Refetch => self.load(),
        }
    }

    /// Drains the view's push channel and merges everything queued. Returns
    /// the number of events taken.
    pub fn pump_events(&mut self) -> Result<usize, ReconcileError> {
        let Some(handle) = self.subscription else {
            return Ok(0);
        };
        let events = self.subscriptions.drain(handle);
        if events.is_empty() {
            return Ok(0);
        }
        for event in &events {
            if self.accepts(event) {
                self.merge(event);
            }
        }
        self.recompute();
        if self.config.event_mode == EventMode::Refetch {
            self.load()?;
        }
        Ok(events.len())
    }

    /// Applies `edit` optimistically, sends it, then confirms or rolls back.
    /// Returns the stored row for inserts.
    pub fn submit(&mut self, edit: LocalEdit) -> Result<Option<Record>, ReconcileError> {
        let handle = self.begin(edit.clone())?;
        match self.send(&edit) {
            Ok(Some(stored)) => {
                self.confirm_with(handle, stored.clone());
                Ok(Some(stored))
            }
            Ok(None) => {
                self.confirm(handle);
                Ok(None)
            }
            Err(cause) => Err(self.reject(handle, cause)),
        }
    }

    /// Creates a row owned by the signed-in user.
    pub fn create(&mut self, fields: Fields) -> Result<Record, ReconcileError> {
        let user = self.identity.current_user_id().ok_or(ReconcileError::NotSignedIn)?;
        let new = NewRecord::new(&user, fields);
        let handle = self.begin(LocalEdit::Insert(provisional_record(&user, new.fields.clone())))?;
        match self.store.insert(&self.config.table, new) {
            Ok(stored) => {
                self.confirm_with(handle, stored.clone());
                Ok(stored)
            }
            Err(cause) => Err(self.reject(handle, cause)),
        }
    }

    pub fn update(&mut self, id: &str, patch: Fields) -> Result<(), ReconcileError> {
        self.submit(LocalEdit::update(id, patch)).map(|_| ())
    }

    pub fn remove(&mut self, id: &str) -> Result<(), ReconcileError> {
        self.submit(LocalEdit::delete(id)).map(|_| ())
    }

    /// Switches the predicate. A mounted view re-subscribes under the new
    /// filter and reloads.
    pub fn set_filter(&mut self, filter: Filter) -> Result<(), ReconcileError> {
        if filter == self.config.filter {
            return Ok(());
        }
        self.config.filter = filter;
        if self.is_mounted() {
            self.mount()
        } else {
            self.recompute();
            Ok(())
        }
    }

    pub fn rendered(&self) -> &[Record] {
        &self.rendered
    }

    pub fn snapshot(&self) -> &[Record] {
        &self.snapshot
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.rendered.iter().find(|r| r.id == id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, handle: EditHandle) -> bool {
        self.pending.iter().any(|p| p.handle == handle)
    }

    pub fn config(&self) -> &ViewConfig {
        &self.config
    }

    pub fn decoded<E: Entity>(&self) -> serde_json::Result<Vec<E>> {
        self.rendered.iter().map(|r| r.decode::<E>()).collect()
    }

    fn close_subscription(&mut self) {
        if let Some(handle) = self.subscription.take() {
            self.subscriptions.unsubscribe(handle);
        }
    }

    fn begin(&mut self, edit: LocalEdit) -> Result<EditHandle, ReconcileError> {
        self.authorize(&edit)?;
        Ok(self.apply_optimistic(edit))
    }

    fn send(&self, edit: &LocalEdit) -> Result<Option<Record>, StoreError> {
        let table = &self.config.table;
        match edit {
            LocalEdit::Insert(record) => self
                .store
                .insert(table, NewRecord::new(&record.owner_id, record.fields.clone()))
                .map(Some),
            LocalEdit::Delete(id) => match self.store.delete(table, id) {
                // Someone else removed it first; the outcome is the same.
                Err(err) if err.kind == StoreErrorKind::NotFound => Ok(None),
                other => other.map(|_| None),
            },
            LocalEdit::FieldUpdate { id, patch } => self.store.update(table, id, patch).map(|_| None),
        }
    }

    fn reject(&mut self, handle: EditHandle, cause: StoreError) -> ReconcileError {
        let edit = handle.to_string();
        self.rollback(handle, cause.clone())
            .unwrap_or(ReconcileError::Conflict { edit, source: cause })
    }

    fn take_pending(&mut self, handle: EditHandle) -> Option<PendingEdit> {
        let position = self.pending.iter().position(|p| p.handle == handle)?;
        Some(self.pending.remove(position))
    }

    fn recompute(&mut self) {
        self.rendered = materialize(
            &self.snapshot,
            &self.pending,
            self.config.conflict_policy,
            &self.config.filter,
            &self.config.order,
        );
    }

    fn accepts(&self, event: &RemoteEvent) -> bool {
        if self.lifecycle == Lifecycle::Unmounted {
            log::debug!("view on {} is unmounted, dropping {:?} event", self.config.table, event.kind);
            return false;
        }
        if event.table != self.config.table {
            log::warn!("view on {} got an event for {}, ignoring", self.config.table, event.table);
            return false;
        }
        true
    }

    fn merge(&mut self, event: &RemoteEvent) {
        let record = &event.record;
        match event.kind {
            EventKind::Insert | EventKind::Update => {
                if self.tombstones.contains(&record.id) {
                    log::debug!("ignoring stale {:?} for deleted {}", event.kind, record.id);
                    return;
                }
                if event.kind == EventKind::Insert {
                    // Our own confirmed insert coming back under its real id.
                    if let Some(position) = self
                        .snapshot
                        .iter()
                        .position(|r| is_provisional_id(&r.id) && is_echo_of(record, r))
                    {
                        self.snapshot.remove(position);
                    }
                }
                if self.config.filter.matches(record) {
                    self.upsert_snapshot(record.clone());
                } else {
                    self.snapshot.retain(|r| r.id != record.id);
                }
            }
            EventKind::Delete => {
                self.snapshot.retain(|r| r.id != record.id);
                self.tombstones.insert(&record.id);
            }
        }
    }

    // The server is taken to agree with the edit.
    fn fold(&mut self, edit: &LocalEdit) {
        match edit {
            LocalEdit::Insert(record) => {
                if is_provisional_id(&record.id) && self.snapshot.iter().any(|r| is_echo_of(r, record)) {
                    return;
                }
                if !self.tombstones.contains(&record.id) && self.config.filter.matches(record) {
                    self.upsert_snapshot(record.clone());
                }
            }
            LocalEdit::Delete(id) => {
                self.snapshot.retain(|r| &r.id != id);
                self.tombstones.insert(id);
            }
            LocalEdit::FieldUpdate { id, patch } => {
                if let Some(existing) = self.snapshot.iter_mut().find(|r| &r.id == id) {
                    existing.apply_patch(patch);
                }
                let filter = &self.config.filter;
                self.snapshot.retain(|r| &r.id != id || filter.matches(r));
                self.config.order.sort(&mut self.snapshot);
            }
        }
    }

    fn upsert_snapshot(&mut self, record: Record) {
        match self.snapshot.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => self.snapshot.push(record),
        }
        self.config.order.sort(&mut self.snapshot);
    }

    fn owner_of(&self, id: &str) -> Option<String> {
        self.rendered
            .iter()
            .chain(self.snapshot.iter())
            .find(|r| r.id == id)
            .map(|r| r.owner_id.clone())
    }

    fn authorize(&self, edit: &LocalEdit) -> Result<(), ReconcileError> {
        let identity = self.identity.current().ok_or(ReconcileError::NotSignedIn)?;
        let elevated = identity.role == Role::Elevated;
        let forbidden = || ReconcileError::Forbidden {
            user: identity.user_id.clone(),
            action: edit.action().to_string(),
            table: self.config.table.clone(),
        };
        if self.config.require_elevated_role && !elevated {
            return Err(forbidden());
        }
        let owner = match edit {
            LocalEdit::Insert(record) => Some(record.owner_id.clone()),
            LocalEdit::Delete(id) | LocalEdit::FieldUpdate { id, .. } => self.owner_of(id),
        };
        match owner {
            Some(owner) if owner != identity.user_id && !elevated => Err(forbidden()),
            _ => Ok(()),
        }
    }
}
