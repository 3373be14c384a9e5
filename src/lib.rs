pub mod domain;
pub mod error;
pub mod filter;
pub mod identity;
pub mod likes;
pub mod notifier;
pub mod store;
pub mod subscription;
pub mod types;
pub mod view;

pub use error::ReconcileError;
pub use filter::{Filter, SortKey, SortOrder};
pub use identity::{Identity, IdentityContext, Role, SessionEvent};
pub use likes::{InFlight, LikeState, LikeTracker, ToggleOutcome};
pub use store::{MemoryStore, RemoteStore, SlowStore, SqliteStore, StoreError, StoreErrorKind};
pub use subscription::{SubscriptionHandle, SubscriptionManager};
pub use types::{Entity, EventKind, Fields, NewRecord, Record, RemoteEvent};
pub use view::{ConflictPolicy, EditHandle, EventMode, LocalEdit, ReconciledView, ViewBuilder, ViewConfig};
pub use rusqlite;
