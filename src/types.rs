use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// Trait for types that can be decoded from, and encoded into, a Record.
pub trait Entity: Serialize + DeserializeOwned {}

// Blanket implementation for any type that meets the requirements
impl<T> Entity for T where T: Serialize + DeserializeOwned {}

/// Domain fields of a record, keyed by column name.
pub type Fields = Map<String, Value>;

/// Column names owned by the store rather than by the domain.
pub const RESERVED_FIELDS: [&str; 3] = ["id", "owner_id", "created_at"];

/// A row as the store knows it. `id` and `created_at` are assigned by the
/// server and never change afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub owner_id: String,
    pub created_at: i64,
    #[serde(default)]
    pub fields: Fields,
}

impl Record {
    /// Resolves a column by name, including the reserved columns.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "owner_id" => Some(Value::String(self.owner_id.clone())),
            "created_at" => Some(Value::from(self.created_at)),
            _ => self.fields.get(name).cloned(),
        }
    }

    /// Merges `patch` into the domain fields. Reserved columns in the patch
    /// are ignored.
    pub fn apply_patch(&mut self, patch: &Fields) {
        for (key, value) in patch {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
        }
    }

    /// Flattens the record into one JSON object, reserved columns included.
    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("id".to_string(), Value::String(self.id.clone()));
        object.insert("owner_id".to_string(), Value::String(self.owner_id.clone()));
        object.insert("created_at".to_string(), Value::from(self.created_at));
        Value::Object(object)
    }

    pub fn decode<E: Entity>(&self) -> serde_json::Result<E> {
        serde_json::from_value(self.to_value())
    }
}

/// A record that has not been assigned an id or timestamp yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub owner_id: String,
    #[serde(default)]
    pub fields: Fields,
}

impl NewRecord {
    pub fn new(owner_id: &str, fields: Fields) -> Self {
        let mut fields = fields;
        for reserved in RESERVED_FIELDS {
            fields.remove(reserved);
        }
        Self {
            owner_id: owner_id.to_string(),
            fields,
        }
    }

    /// Serializes an entity into domain fields. Any reserved columns the
    /// entity carries are dropped.
    pub fn from_entity<E: Entity>(owner_id: &str, entity: &E) -> serde_json::Result<Self> {
        match serde_json::to_value(entity)? {
            Value::Object(fields) => Ok(Self::new(owner_id, fields)),
            other => Err(serde::de::Error::custom(format!(
                "entity must serialize to an object, got {}",
                other
            ))),
        }
    }

    pub(crate) fn into_record(self, id: String, created_at: i64) -> Record {
        Record {
            id,
            owner_id: self.owner_id,
            created_at,
            fields: self.fields,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

/// Row-level change pushed by the store. `record` is the new row for
/// inserts and updates and the removed row for deletes; `previous` is the
/// row before an update, when the store knows it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub kind: EventKind,
    pub table: String,
    pub record: Record,
    #[serde(default)]
    pub previous: Option<Record>,
}

impl RemoteEvent {
    pub fn insert(table: &str, record: Record) -> Self {
        Self { kind: EventKind::Insert, table: table.to_string(), record, previous: None }
    }

    pub fn update(table: &str, record: Record, previous: Option<Record>) -> Self {
        Self { kind: EventKind::Update, table: table.to_string(), record, previous }
    }

    pub fn delete(table: &str, record: Record) -> Self {
        Self { kind: EventKind::Delete, table: table.to_string(), record, previous: None }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;

    #[derive(Serialize, Deserialize, Debug, Default)]
    struct Quote {
        id: String,
        owner_id: String,
        created_at: i64,
        content_text: String,
        priority: Option<i64>,
    }

    fn record() -> Record {
        let mut fields = Fields::new();
        fields.insert("content_text".to_string(), json!("Te quiero"));
        Record {
            id: "q1".to_string(),
            owner_id: "u1".to_string(),
            created_at: 10,
            fields,
        }
    }

    #[test]
    fn field_resolves_reserved_columns() {
        let r = record();
        assert_eq!(r.field("id"), Some(json!("q1")));
        assert_eq!(r.field("owner_id"), Some(json!("u1")));
        assert_eq!(r.field("created_at"), Some(json!(10)));
        assert_eq!(r.field("content_text"), Some(json!("Te quiero")));
        assert_eq!(r.field("missing"), None);
    }

    #[test]
    fn patch_cannot_touch_identity() {
        let mut r = record();
        let mut patch = Fields::new();
        patch.insert("id".to_string(), json!("hijacked"));
        patch.insert("priority".to_string(), json!(3));
        r.apply_patch(&patch);
        assert_eq!(r.id, "q1");
        assert_eq!(r.field("priority"), Some(json!(3)));
    }

    #[test]
    fn decode_into_entity() -> anyhow::Result<()> {
        let quote: Quote = record().decode()?;
        assert_eq!(quote.id, "q1");
        assert_eq!(quote.created_at, 10);
        assert_eq!(quote.content_text, "Te quiero");
        assert_eq!(quote.priority, None);
        Ok(())
    }

    #[test]
    fn new_record_from_entity_strips_reserved() -> anyhow::Result<()> {
        let quote = Quote {
            id: "ignored".to_string(),
            content_text: "Siempre".to_string(),
            ..Default::default()
        };
        let new = NewRecord::from_entity("u2", &quote)?;
        assert_eq!(new.owner_id, "u2");
        assert!(!new.fields.contains_key("id"));
        assert!(!new.fields.contains_key("created_at"));
        assert_eq!(new.fields.get("content_text"), Some(&json!("Siempre")));
        Ok(())
    }

    #[test]
    fn new_record_rejects_non_objects() {
        assert!(NewRecord::from_entity("u1", &42).is_err());
    }
}
