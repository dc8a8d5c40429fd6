//! SQLite-backed document store.
//!
//! Each collection is a table of `(id, body)` rows where `body` is the JSON
//! document. Every write also appends to a `_changes` log in the same
//! transaction; change streams poll that log past their own cursor, which
//! makes writes from other processes visible to live subscribers.

use super::{ChangeStream, DocumentStore, StoreSession, assign_id, parse_document};
use crate::config::{CollectionNames, StoreConfig};
use crate::error::StoreError;
use crate::types::{ChangeEvent, Collection, Document, ID_FIELD};
use async_trait::async_trait;
use futures::StreamExt;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// TODO: prune `_changes` rows older than the oldest live cursor; the log
// currently grows with every write.
const CHANGE_LOG_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS _changes (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    old_body TEXT,
    new_body TEXT
);
CREATE INDEX IF NOT EXISTS idx_changes_collection ON _changes (collection, seq);
";

type SharedConnection = Arc<Mutex<Connection>>;

/// Document store persisted in a single SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    names: CollectionNames,
    poll_interval: Duration,
}

impl SqliteStore {
    /// Create a store over the database file at `path`. Nothing is opened yet.
    pub fn new(path: impl Into<PathBuf>, names: CollectionNames, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            names,
            poll_interval,
        }
    }

    /// Create a store from the `[store]` config section.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(
            config.path.clone(),
            config.collections.clone(),
            config.poll_interval(),
        )
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn open_session(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        let path = self.path.clone();
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(&path)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::unavailable(format!("store worker failed: {e}")))?
        .map_err(|e| StoreError::unavailable(format!("{}: {e}", self.path.display())))?;

        debug!(path = %self.path.display(), "Opened SQLite session");
        Ok(Box::new(SqliteSession {
            conn: Arc::new(Mutex::new(conn)),
            names: self.names.clone(),
            poll_interval: self.poll_interval,
        }))
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

struct SqliteSession {
    conn: SharedConnection,
    names: CollectionNames,
    poll_interval: Duration,
}

impl SqliteSession {
    fn table(&self, collection: Collection) -> String {
        self.names.name(collection).to_string()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, String>
    where
        F: FnOnce(&mut Connection) -> Result<T, String> + Send + 'static,
        T: Send + 'static,
    {
        run_blocking(Arc::clone(&self.conn), f).await
    }
}

async fn run_blocking<T, F>(conn: SharedConnection, f: F) -> Result<T, String>
where
    F: FnOnce(&mut Connection) -> Result<T, String> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = conn
            .lock()
            .map_err(|_| "connection lock poisoned".to_string())?;
        f(&mut guard)
    })
    .await
    .map_err(|e| format!("store worker failed: {e}"))?
}

fn sql_err(e: rusqlite::Error) -> String {
    e.to_string()
}

fn to_body(doc: &Document) -> Result<String, String> {
    serde_json::to_string(doc).map_err(|e| e.to_string())
}

/// The SQL value `json_extract` yields for a scalar JSON value.
fn sql_value(value: &Value) -> Option<SqlValue> {
    match value {
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real)),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn query_bodies(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Document>, String> {
    let mut stmt = conn.prepare(sql).map_err(sql_err)?;
    let bodies = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .map_err(sql_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sql_err)?;
    bodies.iter().map(|b| parse_document(b)).collect()
}

#[async_trait]
impl StoreSession for SqliteSession {
    async fn ensure_collections(&mut self) -> Result<(), StoreError> {
        let tables: Vec<String> = Collection::ALL.iter().map(|c| self.table(*c)).collect();
        self.blocking(move |conn| {
            let mut sql = String::new();
            for table in &tables {
                sql.push_str(&format!(
                    "CREATE TABLE IF NOT EXISTS \"{table}\" (id TEXT PRIMARY KEY, body TEXT NOT NULL);\n"
                ));
            }
            sql.push_str(CHANGE_LOG_SCHEMA);
            conn.execute_batch(&sql).map_err(sql_err)
        })
        .await
        .map_err(|m| StoreError::unavailable(format!("collection setup failed: {m}")))
    }

    async fn scan(&mut self, collection: Collection) -> Result<Vec<Document>, StoreError> {
        let table = self.table(collection);
        self.blocking(move |conn| {
            query_bodies(conn, &format!("SELECT body FROM \"{table}\" ORDER BY rowid"), [])
        })
        .await
        .map_err(|m| StoreError::query(collection, m))
    }

    async fn get(
        &mut self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let table = self.table(collection);
        let id = id.to_string();
        self.blocking(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    &format!("SELECT body FROM \"{table}\" WHERE id = ?1"),
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            body.map(|b| parse_document(&b)).transpose()
        })
        .await
        .map_err(|m| StoreError::query(collection, m))
    }

    async fn filter_eq(
        &mut self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Document>, StoreError> {
        let table = self.table(collection);
        let path = format!("$.\"{field}\"");
        let param = sql_value(value);
        let rows = self
            .blocking(move |conn| match param {
                Some(param) => query_bodies(
                    conn,
                    &format!(
                        "SELECT body FROM \"{table}\" WHERE json_extract(body, ?1) = ?2 ORDER BY rowid"
                    ),
                    params![path, param],
                ),
                None => query_bodies(conn, &format!("SELECT body FROM \"{table}\" ORDER BY rowid"), []),
            })
            .await
            .map_err(|m| StoreError::query(collection, m))?;

        // SQLite folds booleans into integers; keep exact JSON equality.
        Ok(rows
            .into_iter()
            .filter(|doc| doc.get(field) == Some(value))
            .collect())
    }

    async fn insert(
        &mut self,
        collection: Collection,
        mut doc: Document,
    ) -> Result<String, StoreError> {
        let table = self.table(collection);
        let id = assign_id(&mut doc);
        let body = to_body(&doc).map_err(|m| StoreError::InvalidDocument { message: m })?;
        let inserted = self
            .blocking(move |conn| {
                let tx = conn.transaction().map_err(sql_err)?;
                tx.execute(
                    &format!("INSERT INTO \"{table}\" (id, body) VALUES (?1, ?2)"),
                    params![id, body],
                )
                .map_err(sql_err)?;
                tx.execute(
                    "INSERT INTO _changes (collection, old_body, new_body) VALUES (?1, NULL, ?2)",
                    params![table, body],
                )
                .map_err(sql_err)?;
                tx.commit().map_err(sql_err)?;
                Ok(id)
            })
            .await
            .map_err(|m| StoreError::query(collection, m))?;
        trace!(%collection, id = %inserted, "Inserted row");
        Ok(inserted)
    }

    async fn upsert(
        &mut self,
        collection: Collection,
        id: &str,
        mut doc: Document,
    ) -> Result<(), StoreError> {
        let table = self.table(collection);
        let id = id.to_string();
        doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        let body = to_body(&doc).map_err(|m| StoreError::InvalidDocument { message: m })?;
        self.blocking(move |conn| {
            let tx = conn.transaction().map_err(sql_err)?;
            let old: Option<String> = tx
                .query_row(
                    &format!("SELECT body FROM \"{table}\" WHERE id = ?1"),
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            tx.execute(
                &format!(
                    "INSERT INTO \"{table}\" (id, body) VALUES (?1, ?2) \
                     ON CONFLICT(id) DO UPDATE SET body = excluded.body"
                ),
                params![id, body],
            )
            .map_err(sql_err)?;
            tx.execute(
                "INSERT INTO _changes (collection, old_body, new_body) VALUES (?1, ?2, ?3)",
                params![table, old, body],
            )
            .map_err(sql_err)?;
            tx.commit().map_err(sql_err)
        })
        .await
        .map_err(|m| StoreError::query(collection, m))
    }

    async fn changes(&mut self, collection: Collection) -> Result<ChangeStream, StoreError> {
        let table = self.table(collection);
        let cursor = {
            let table = table.clone();
            self.blocking(move |conn| {
                conn.query_row(
                    "SELECT COALESCE(MAX(seq), 0) FROM _changes WHERE collection = ?1",
                    params![table],
                    |row| row.get::<_, i64>(0),
                )
                .map_err(sql_err)
            })
            .await
            .map_err(|m| StoreError::subscription(collection, m))?
        };

        debug!(%collection, cursor, "Subscribed to change log");
        let feed = ChangeLogCursor {
            conn: Arc::clone(&self.conn),
            collection,
            table,
            cursor,
            interval: self.poll_interval,
            pending: VecDeque::new(),
            failure: None,
        };
        Ok(feed.into_stream())
    }
}

/// Tails `_changes` for one collection, starting after `cursor`.
struct ChangeLogCursor {
    conn: SharedConnection,
    collection: Collection,
    table: String,
    cursor: i64,
    interval: Duration,
    pending: VecDeque<ChangeEvent>,
    /// Set when a row fails to parse; yielded once `pending` is drained.
    failure: Option<StoreError>,
}

impl ChangeLogCursor {
    async fn poll(&mut self) -> Result<(), StoreError> {
        let table = self.table.clone();
        let after = self.cursor;
        let rows = run_blocking(Arc::clone(&self.conn), move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT seq, old_body, new_body FROM _changes \
                     WHERE collection = ?1 AND seq > ?2 ORDER BY seq",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![table, after], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })
                .map_err(sql_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(sql_err)?;
            Ok(rows)
        })
        .await
        .map_err(|m| StoreError::subscription(self.collection, m))?;

        let collection = self.collection;
        let parse = |body: Option<String>| -> Result<Option<Value>, StoreError> {
            body.map(|b| serde_json::from_str::<Value>(&b))
                .transpose()
                .map_err(|e| StoreError::subscription(collection, e.to_string()))
        };
        for (seq, old_body, new_body) in rows {
            let event = match (parse(old_body), parse(new_body)) {
                (Ok(old_value), Ok(new_value)) => ChangeEvent {
                    old_value,
                    new_value,
                },
                (Err(e), _) | (_, Err(e)) => {
                    self.failure = Some(e);
                    break;
                }
            };
            self.cursor = seq;
            self.pending.push_back(event);
        }
        Ok(())
    }

    fn into_stream(self) -> ChangeStream {
        futures::stream::unfold(Some(self), |state| async move {
            let mut feed = state?;
            loop {
                if let Some(event) = feed.pending.pop_front() {
                    return Some((Ok(event), Some(feed)));
                }
                if let Some(e) = feed.failure.take() {
                    return Some((Err(e), None));
                }
                tokio::time::sleep(feed.interval).await;
                if let Err(e) = feed.poll().await {
                    return Some((Err(e), None));
                }
            }
        })
        .boxed()
    }
}
