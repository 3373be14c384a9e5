use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use rusqlite_migration::{Migrations, M};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{open_filtered_channel, Channel, RemoteStore, ServerClock, StoreError};
use crate::filter::{Filter, SortOrder};
use crate::notifier::Notifier;
use crate::types::{Fields, NewRecord, Record, RemoteEvent};

/// ZD is the prefix for the store's internal tables. Every logical table
/// lives in ZD_RECORD, keyed by `tbl`; unique constraints are materialized
/// as rows in ZD_UNIQUE so SQLite enforces them.
const MIGRATIONS_SLICE: &[M<'_>] = &[
    M::up(
        "CREATE TABLE ZD_RECORD (
            tbl        TEXT NOT NULL,
            id         TEXT NOT NULL PRIMARY KEY,
            owner_id   TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            fields     TEXT NOT NULL
        );
        CREATE INDEX ZD_RECORD_TBL_CREATED ON ZD_RECORD (tbl, created_at);",
    ),
    M::up(
        "CREATE TABLE ZD_UNIQUE (
            tbl             TEXT NOT NULL,
            constraint_name TEXT NOT NULL,
            unique_key      TEXT NOT NULL,
            record_id       TEXT NOT NULL REFERENCES ZD_RECORD(id) ON DELETE CASCADE,
            PRIMARY KEY (tbl, constraint_name, unique_key)
        );
        CREATE INDEX ZD_UNIQUE_RECORD ON ZD_UNIQUE (record_id);",
    ),
];
const MIGRATIONS: Migrations<'_> = Migrations::from_slice(MIGRATIONS_SLICE);

#[derive(Serialize, Deserialize)]
struct RecordRow {
    tbl: String,
    id: String,
    owner_id: String,
    created_at: i64,
    fields: String,
}

impl RecordRow {
    fn from_record(table: &str, record: &Record) -> Result<Self, StoreError> {
        Ok(Self {
            tbl: table.to_string(),
            id: record.id.clone(),
            owner_id: record.owner_id.clone(),
            created_at: record.created_at,
            fields: serde_json::to_string(&record.fields)?,
        })
    }

    fn into_record(self) -> Result<Record, StoreError> {
        Ok(Record {
            id: self.id,
            owner_id: self.owner_id,
            created_at: self.created_at,
            fields: serde_json::from_str(&self.fields)?,
        })
    }
}

/// RemoteStore backed by SQLite. Used as the reference backend in tests and
/// for running the app offline against a local file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    unique: Arc<HashMap<String, Vec<Vec<String>>>>,
    notifier: Notifier<RemoteEvent>,
    clock: ServerClock,
}

#[derive(Default)]
pub struct SqliteStoreBuilder {
    path: Option<PathBuf>,
    unique: Vec<(String, Vec<String>)>,
}

impl SqliteStoreBuilder {
    pub fn memory(mut self) -> Self {
        self.path = None;
        self
    }

    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn unique(mut self, table: &str, columns: &[&str]) -> Self {
        self.unique
            .push((table.to_string(), columns.iter().map(|c| c.to_string()).collect()));
        self
    }

    pub fn build(self) -> Result<SqliteStore> {
        let conn = match &self.path {
            Some(path) => {
                let conn = Connection::open(path)?;
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
                conn
            }
            None => Connection::open_in_memory()?,
        };
        let mut unique: HashMap<String, Vec<Vec<String>>> = HashMap::new();
        for (table, columns) in self.unique {
            unique.entry(table).or_default().push(columns);
        }
        SqliteStore::from_connection(conn, unique)
    }
}

impl SqliteStore {
    pub fn builder() -> SqliteStoreBuilder {
        SqliteStoreBuilder::default()
    }

    pub fn open_memory() -> Result<Self> {
        Self::builder().memory().build()
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder().path(path).build()
    }

    fn from_connection(mut conn: Connection, unique: HashMap<String, Vec<Vec<String>>>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        MIGRATIONS.to_latest(&mut conn)?;

        // Resume the clock after the newest row so reopened files keep order.
        let newest: Option<i64> = conn.query_row("SELECT MAX(created_at) FROM ZD_RECORD", [], |row| row.get(0))?;
        let clock = ServerClock::starting_after(newest.unwrap_or(0));

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            unique: Arc::new(unique),
            notifier: Notifier::new(),
            clock,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::other("Failed to acquire connection lock"))
    }

    /// Rows of `table` passing `filter`. Clauses are narrowed in SQL with
    /// `json_extract`, then re-checked with `Filter::matches`, which tells
    /// `true` from `1` where SQLite does not.
    fn load_matching(&self, conn: &Connection, table: &str, filter: &Filter) -> Result<Vec<Record>, StoreError> {
        let mut sql = String::from("SELECT tbl, id, owner_id, created_at, fields FROM ZD_RECORD WHERE tbl = ?");
        let mut values = vec![SqlValue::Text(table.to_string())];
        for (column, expected) in filter.clauses() {
            let (Some(expr), Some(value)) = (column_expr(column), sql_value(expected)) else {
                continue;
            };
            if value == SqlValue::Null {
                sql.push_str(&format!(" AND {} IS NULL", expr));
            } else {
                sql.push_str(&format!(" AND {} = ?", expr));
                values.push(value);
            }
        }
        sql.push_str(" ORDER BY created_at");

        let mut stmt = conn.prepare(&sql)?;
        let rows = serde_rusqlite::from_rows::<RecordRow>(stmt.query(params_from_iter(values))?);
        let mut records = Vec::new();
        for row in rows {
            let record = row?.into_record()?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn load_one(&self, conn: &Connection, table: &str, id: &str) -> Result<Option<Record>, StoreError> {
        let row = conn
            .query_row(
                "SELECT owner_id, created_at, fields FROM ZD_RECORD WHERE tbl = ?1 AND id = ?2",
                params![table, id],
                |row| {
                    Ok(RecordRow {
                        tbl: table.to_string(),
                        id: id.to_string(),
                        owner_id: row.get(0)?,
                        created_at: row.get(1)?,
                        fields: row.get(2)?,
                    })
                },
            )
            .optional()?;
        row.map(RecordRow::into_record).transpose()
    }

    fn write_unique_keys(&self, conn: &Connection, table: &str, record: &Record) -> Result<(), StoreError> {
        conn.execute("DELETE FROM ZD_UNIQUE WHERE record_id = ?1", params![record.id])?;
        let Some(constraints) = self.unique.get(table) else {
            return Ok(());
        };
        for columns in constraints {
            let values: Vec<Value> = columns
                .iter()
                .map(|column| record.field(column).unwrap_or(Value::Null))
                .collect();
            // Like SQL, null never collides with anything.
            if values.iter().any(Value::is_null) {
                continue;
            }
            let name = format!("{}_{}_key", table, columns.join("_"));
            let key = serde_json::to_string(&values)?;
            conn.execute(
                "INSERT INTO ZD_UNIQUE (tbl, constraint_name, unique_key, record_id) VALUES (?1, ?2, ?3, ?4)",
                params![table, name, key, record.id],
            )
            .map_err(|e| match StoreError::from(e) {
                err if err.is_unique_violation() => StoreError::unique_violation(format!(
                    "duplicate key value violates unique constraint \"{}\"",
                    name
                )),
                err => err,
            })?;
        }
        Ok(())
    }
}

// Reserved columns are real columns; anything else lives in `fields`.
// Names that would need quoting in a JSON path are left to the Rust check.
fn column_expr(column: &str) -> Option<String> {
    match column {
        "id" | "owner_id" | "created_at" => Some(column.to_string()),
        _ if column.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
            && column.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') =>
        {
            Some(format!("json_extract(fields, '$.{}')", column))
        }
        _ => None,
    }
}

fn sql_value(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Null => Some(SqlValue::Null),
        Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => n.as_i64().map(SqlValue::Integer).or_else(|| n.as_f64().map(SqlValue::Real)),
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => None,
    }
}

impl RemoteStore for SqliteStore {
    fn select(&self, table: &str, filter: &Filter, order: &SortOrder) -> Result<Vec<Record>, StoreError> {
        log::debug!("SQLITE SELECT: table='{}' filter='{}'", table, filter);
        let conn = self.lock()?;
        let mut records = self.load_matching(&conn, table, filter)?;
        order.sort(&mut records);
        log::debug!("SQLITE SELECT RESULT: {} rows", records.len());
        Ok(records)
    }

    fn count(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        if filter.is_empty() {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM ZD_RECORD WHERE tbl = ?1", params![table], |row| {
                row.get(0)
            })?;
            return Ok(count as u64);
        }
        Ok(self.load_matching(&conn, table, filter)?.len() as u64)
    }

    fn insert(&self, table: &str, record: NewRecord) -> Result<Record, StoreError> {
        log::debug!("SQLITE INSERT: table='{}' owner='{}'", table, record.owner_id);
        let record = record.into_record(Uuid::now_v7().to_string(), self.clock.next());
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let row = RecordRow::from_record(table, &record)?;
            let params = serde_rusqlite::to_params_named(&row)?;
            tx.execute(
                "INSERT INTO ZD_RECORD (tbl, id, owner_id, created_at, fields)
                 VALUES (:tbl, :id, :owner_id, :created_at, :fields)",
                params.to_slice().as_slice(),
            )?;
            self.write_unique_keys(&tx, table, &record)?;
            tx.commit()?;
        }
        log::debug!("SQLITE INSERT RESULT: id='{}'", record.id);
        self.notifier.notify(RemoteEvent::insert(table, record.clone()));
        Ok(record)
    }

    fn update(&self, table: &str, id: &str, patch: &Fields) -> Result<(), StoreError> {
        log::debug!("SQLITE UPDATE: table='{}' id='{}' fields={}", table, id, patch.len());
        let (previous, updated) = {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let previous = self
                .load_one(&tx, table, id)?
                .ok_or_else(|| StoreError::not_found(format!("{}/{}", table, id)))?;
            let mut updated = previous.clone();
            updated.apply_patch(patch);
            tx.execute(
                "UPDATE ZD_RECORD SET fields = ?1 WHERE tbl = ?2 AND id = ?3",
                params![serde_json::to_string(&updated.fields)?, table, id],
            )?;
            self.write_unique_keys(&tx, table, &updated)?;
            tx.commit()?;
            (previous, updated)
        };
        self.notifier.notify(RemoteEvent::update(table, updated, Some(previous)));
        Ok(())
    }

    fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        log::debug!("SQLITE DELETE: table='{}' id='{}'", table, id);
        let removed = {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let removed = self
                .load_one(&tx, table, id)?
                .ok_or_else(|| StoreError::not_found(format!("{}/{}", table, id)))?;
            tx.execute("DELETE FROM ZD_UNIQUE WHERE record_id = ?1", params![id])?;
            tx.execute("DELETE FROM ZD_RECORD WHERE tbl = ?1 AND id = ?2", params![table, id])?;
            tx.commit()?;
            removed
        };
        self.notifier.notify(RemoteEvent::delete(table, removed));
        Ok(())
    }

    fn open_channel(&self, table: &str, filter: &Filter) -> Result<Channel, StoreError> {
        Ok(open_filtered_channel(&self.notifier, table, filter))
    }

    fn close_channel(&self, channel_id: u64) {
        if self.notifier.remove(channel_id) {
            log::debug!("CHANNEL CLOSE: id={}", channel_id);
        }
    }
}
