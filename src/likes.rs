use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;

use crate::error::ReconcileError;
use crate::filter::{Filter, SortOrder};
use crate::identity::IdentityContext;
use crate::store::{RemoteStore, StoreError, StoreErrorKind};
use crate::subscription::{SubscriptionHandle, SubscriptionManager};
use crate::types::{Fields, NewRecord};

pub const LIKES_TABLE: &str = "likes";
/// Column of a like row naming the liked post.
pub const LIKE_TARGET_COLUMN: &str = "post_id";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LikeState {
    pub liked: bool,
    pub count: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToggleOutcome {
    Liked,
    Unliked,
    /// The like was already stored, by another device or a racing request.
    AlreadyLiked,
}

/// The (user, target) pairs with a toggle outstanding. Share one between
/// trackers to guard the same target shown in several places.
#[derive(Clone, Default)]
pub struct InFlight {
    pairs: Arc<Mutex<HashSet<(String, String)>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the pair as in flight, or returns None if it already is. The
    /// mark is cleared when the guard drops.
    pub fn try_acquire(&self, user_id: &str, target_id: &str) -> Option<InFlightGuard> {
        let key = (user_id.to_string(), target_id.to_string());
        let mut pairs = self.pairs.lock().unwrap_or_else(PoisonError::into_inner);
        if !pairs.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard { pairs: self.pairs.clone(), key })
    }

    pub fn is_in_flight(&self, user_id: &str, target_id: &str) -> bool {
        self.pairs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(user_id.to_string(), target_id.to_string()))
    }
}

pub struct InFlightGuard {
    pairs: Arc<Mutex<HashSet<(String, String)>>>,
    key: (String, String),
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.pairs.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.key);
    }
}

/// "Did I like this" plus the total like count for one post. The count is
/// always taken from the store, never accumulated locally.
pub struct LikeTracker {
    store: Arc<dyn RemoteStore>,
    identity: IdentityContext,
    target_id: String,
    in_flight: InFlight,
    state: Mutex<LikeState>,
    subscriptions: Mutex<SubscriptionManager>,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl LikeTracker {
    pub fn new(store: Arc<dyn RemoteStore>, identity: IdentityContext, target_id: &str) -> Self {
        Self::with_in_flight(store, identity, target_id, InFlight::new())
    }

    pub fn with_in_flight(
        store: Arc<dyn RemoteStore>,
        identity: IdentityContext,
        target_id: &str,
        in_flight: InFlight,
    ) -> Self {
        Self {
            subscriptions: Mutex::new(SubscriptionManager::new(store.clone())),
            store,
            identity,
            target_id: target_id.to_string(),
            in_flight,
            state: Mutex::new(LikeState::default()),
            subscription: Mutex::new(None),
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    fn target_filter(&self) -> Filter {
        Filter::all().eq(LIKE_TARGET_COLUMN, self.target_id.as_str())
    }

    fn mine_filter(&self, user_id: &str) -> Filter {
        self.target_filter().eq("owner_id", user_id)
    }

    /// Subscribes to like changes on the post and loads the current state.
    pub fn mount(&self) -> Result<(), ReconcileError> {
        self.unmount();
        let handle = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe(LIKES_TABLE, &self.target_filter())?;
        *self.subscription.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        self.refresh()
    }

    pub fn unmount(&self) {
        let handle = self.subscription.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            self.subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .unsubscribe(handle);
        }
    }

    pub fn state(&self) -> LikeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: LikeState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn query(&self) -> Result<LikeState, StoreError> {
        let count = self.store.count(LIKES_TABLE, &self.target_filter())?;
        let liked = match self.identity.current_user_id() {
            Some(user_id) => self.store.count(LIKES_TABLE, &self.mine_filter(&user_id))? > 0,
            None => false,
        };
        Ok(LikeState { liked, count })
    }

    /// Re-queries whether the user likes the post and the total count.
    pub fn refresh(&self) -> Result<(), ReconcileError> {
        let state = self.query().map_err(|source| {
            log::warn!("like state for {} not refreshed: {}", self.target_id, source);
            ReconcileError::Fetch { table: LIKES_TABLE.to_string(), source }
        })?;
        log::debug!("likes on {}: liked={} count={}", self.target_id, state.liked, state.count);
        self.set_state(state);
        Ok(())
    }

    /// Refreshes if any like change arrived. Returns the number of events.
    pub fn pump_events(&self) -> Result<usize, ReconcileError> {
        let Some(handle) = *self.subscription.lock().unwrap_or_else(PoisonError::into_inner) else {
            return Ok(0);
        };
        let events = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(handle);
        if !events.is_empty() {
            self.refresh()?;
        }
        Ok(events.len())
    }

    /// Likes or unlikes the post for the signed-in user. The state flips
    /// at once and is settled from the store when the write completes.
    pub fn toggle(&self) -> Result<ToggleOutcome, ReconcileError> {
        let user_id = self.identity.current_user_id().ok_or(ReconcileError::NotSignedIn)?;
        let Some(_guard) = self.in_flight.try_acquire(&user_id, &self.target_id) else {
            log::debug!("like toggle on {} by {} already in flight", self.target_id, user_id);
            return Err(ReconcileError::Busy { user: user_id, target: self.target_id.clone() });
        };

        let prior = self.state();
        self.set_state(LikeState {
            liked: !prior.liked,
            count: if prior.liked { prior.count.saturating_sub(1) } else { prior.count + 1 },
        });

        let result = if prior.liked { self.unlike(&user_id) } else { self.like(&user_id) };
        match result {
            Ok(outcome) => {
                if let Err(err) = self.refresh() {
                    log::warn!("like toggle on {} stored but not settled: {}", self.target_id, err);
                }
                Ok(outcome)
            }
            Err(cause) => {
                self.set_state(prior);
                log::warn!("like toggle on {} by {} rolled back: {}", self.target_id, user_id, cause);
                Err(ReconcileError::Conflict { edit: format!("like toggle on {}", self.target_id), source: cause })
            }
        }
    }

    fn like(&self, user_id: &str) -> Result<ToggleOutcome, StoreError> {
        if self.store.count(LIKES_TABLE, &self.mine_filter(user_id))? > 0 {
            return Ok(ToggleOutcome::AlreadyLiked);
        }
        let mut fields = Fields::new();
        fields.insert(LIKE_TARGET_COLUMN.to_string(), json!(self.target_id));
        match self.store.insert(LIKES_TABLE, NewRecord::new(user_id, fields)) {
            Ok(_) => Ok(ToggleOutcome::Liked),
            Err(err) if err.is_unique_violation() => {
                log::debug!("like on {} by {} raced another insert", self.target_id, user_id);
                Ok(ToggleOutcome::AlreadyLiked)
            }
            Err(err) => Err(err),
        }
    }

    fn unlike(&self, user_id: &str) -> Result<ToggleOutcome, StoreError> {
        let mine = self.store.select(LIKES_TABLE, &self.mine_filter(user_id), &SortOrder::new())?;
        for like in mine {
            match self.store.delete(LIKES_TABLE, &like.id) {
                Err(err) if err.kind != StoreErrorKind::NotFound => return Err(err),
                _ => {}
            }
        }
        Ok(ToggleOutcome::Unliked)
    }
}

impl Drop for LikeTracker {
    fn drop(&mut self) {
        self.unmount();
    }
}
