use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by views, subscriptions and the like toggle.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The snapshot could not be fetched. Prior state is untouched; retry
    /// with `load()`.
    #[error("failed to fetch {table}: {source}")]
    Fetch {
        table: String,
        #[source]
        source: StoreError,
    },

    /// The store rejected an optimistic edit. The rollback has already been
    /// applied when this is returned.
    #[error("{edit} was rejected and rolled back: {source}")]
    Conflict {
        edit: String,
        #[source]
        source: StoreError,
    },

    /// A second subscription for the same (table, filter) was requested by
    /// one owner. This is a lifecycle bug in the caller.
    #[error("a subscription to {table} ({filter}) is already open")]
    DuplicateSubscription { table: String, filter: String },

    #[error("could not open a channel on {table}: {source}")]
    Subscribe {
        table: String,
        #[source]
        source: StoreError,
    },

    /// Rejected because the same action is still in flight.
    #[error("{user} already has an action in flight on {target}")]
    Busy { user: String, target: String },

    /// The row already exists. Idempotent inserts treat this as success.
    #[error("{table} already contains this row")]
    AlreadyExists { table: String },

    #[error("no user is signed in")]
    NotSignedIn,

    #[error("{user} may not {action} in {table}")]
    Forbidden { user: String, action: String, table: String },
}

impl ReconcileError {
    /// Transient failures the user can retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Fetch { .. } | ReconcileError::Conflict { .. } | ReconcileError::Subscribe { .. })
    }

    /// Bugs in the calling code rather than runtime conditions.
    pub fn is_programming_error(&self) -> bool {
        matches!(self, ReconcileError::DuplicateSubscription { .. })
    }
}
