use std::fmt;

use uuid::Uuid;

use crate::store::now_millis;
use crate::types::{Fields, Record, RESERVED_FIELDS};

/// Rows created optimistically carry an id with this prefix until the store
/// assigns the real one.
pub const PROVISIONAL_ID_PREFIX: &str = "local-";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EditHandle(pub(crate) u64);

impl fmt::Display for EditHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "edit#{}", self.0)
    }
}

/// A mutation applied locally before the store has confirmed it.
#[derive(Clone, Debug, PartialEq)]
pub enum LocalEdit {
    Insert(Record),
    Delete(String),
    FieldUpdate { id: String, patch: Fields },
}

impl LocalEdit {
    /// An insert of a new row under a provisional id, timestamped now so it
    /// sorts with the newest rows.
    pub fn insert(owner_id: &str, fields: Fields) -> Self {
        LocalEdit::Insert(provisional_record(owner_id, fields))
    }

    pub fn delete(id: &str) -> Self {
        LocalEdit::Delete(id.to_string())
    }

    pub fn update(id: &str, patch: Fields) -> Self {
        LocalEdit::FieldUpdate { id: id.to_string(), patch }
    }

    pub fn target_id(&self) -> &str {
        match self {
            LocalEdit::Insert(record) => &record.id,
            LocalEdit::Delete(id) => id,
            LocalEdit::FieldUpdate { id, .. } => id,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            LocalEdit::Insert(_) => "insert",
            LocalEdit::Delete(_) => "delete",
            LocalEdit::FieldUpdate { .. } => "update",
        }
    }
}

pub fn is_provisional_id(id: &str) -> bool {
    id.starts_with(PROVISIONAL_ID_PREFIX)
}

/// A row not yet stored: provisional id, timestamped now. Reserved columns
/// in `fields` are dropped, as the store would.
pub fn provisional_record(owner_id: &str, fields: Fields) -> Record {
    let mut fields = fields;
    for reserved in RESERVED_FIELDS {
        fields.remove(reserved);
    }
    Record {
        id: format!("{}{}", PROVISIONAL_ID_PREFIX, Uuid::now_v7()),
        owner_id: owner_id.to_string(),
        created_at: now_millis(),
        fields,
    }
}

/// Whether `stored` is the row the store created for `provisional`. The
/// store keeps owner and fields as sent, so those identify it.
pub(crate) fn is_echo_of(stored: &Record, provisional: &Record) -> bool {
    !is_provisional_id(&stored.id) && stored.owner_id == provisional.owner_id && stored.fields == provisional.fields
}

/// An unresolved edit. `base` is the row as rendered when the edit was
/// applied, kept so an update can still be shown after the row vanished
/// from the snapshot.
#[derive(Clone, Debug)]
pub(crate) struct PendingEdit {
    pub handle: EditHandle,
    pub edit: LocalEdit,
    pub base: Option<Record>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserts_get_provisional_ids() {
        let a = LocalEdit::insert("u1", Fields::new());
        let b = LocalEdit::insert("u1", Fields::new());
        assert!(is_provisional_id(a.target_id()));
        assert_ne!(a.target_id(), b.target_id());
        assert!(!is_provisional_id("0190c2d4-0000-7000-8000-000000000000"));
    }

    #[test]
    fn echo_matches_owner_and_fields() {
        let mut fields = Fields::new();
        fields.insert("content_text".to_string(), serde_json::json!("hola"));
        fields.insert("id".to_string(), serde_json::json!("forged"));
        let provisional = provisional_record("u1", fields);
        assert!(!provisional.fields.contains_key("id"));

        let mut stored = provisional.clone();
        stored.id = "0190c2d4-0000-7000-8000-000000000001".to_string();
        assert!(is_echo_of(&stored, &provisional));
        assert!(!is_echo_of(&provisional, &provisional));

        stored.owner_id = "u2".to_string();
        assert!(!is_echo_of(&stored, &provisional));
    }

    #[test]
    fn handles_display() {
        assert_eq!(EditHandle(7).to_string(), "edit#7");
        assert_eq!(LocalEdit::delete("p1").action(), "delete");
    }
}
