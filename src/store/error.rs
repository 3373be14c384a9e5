use std::fmt;

use thiserror::Error;

/// Machine-readable reason a store request failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// A unique constraint rejected an insert or update.
    UniqueViolation,
    NotFound,
    PermissionDenied,
    /// The request never reached the store or the reply was lost.
    Transport,
    Other,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreErrorKind::UniqueViolation => "unique violation",
            StoreErrorKind::NotFound => "not found",
            StoreErrorKind::PermissionDenied => "permission denied",
            StoreErrorKind::Transport => "transport",
            StoreErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn unique_violation(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::UniqueViolation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::NotFound, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::PermissionDenied, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Transport, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Other, message)
    }

    pub fn is_unique_violation(&self) -> bool {
        self.kind == StoreErrorKind::UniqueViolation
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::ConstraintViolation) => StoreError::unique_violation(err.to_string()),
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                StoreError::transport(err.to_string())
            }
            _ => match err {
                rusqlite::Error::QueryReturnedNoRows => StoreError::not_found("no rows returned"),
                other => StoreError::other(other.to_string()),
            },
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::other(format!("malformed row: {}", err))
    }
}

impl From<serde_rusqlite::Error> for StoreError {
    fn from(err: serde_rusqlite::Error) -> Self {
        StoreError::other(format!("row mapping failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind() {
        let err = StoreError::unique_violation("likes_post_id_owner_id_key");
        assert_eq!(err.to_string(), "unique violation: likes_post_id_owner_id_key");
        assert!(err.is_unique_violation());
        assert!(!StoreError::transport("offline").is_unique_violation());
    }

    #[test]
    fn sqlite_constraint_maps_to_unique_violation() -> anyhow::Result<()> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute_batch("CREATE TABLE t (k TEXT PRIMARY KEY); INSERT INTO t VALUES ('a');")?;
        let err = conn.execute("INSERT INTO t VALUES ('a')", []).unwrap_err();
        assert_eq!(StoreError::from(err).kind, StoreErrorKind::UniqueViolation);
        Ok(())
    }
}
