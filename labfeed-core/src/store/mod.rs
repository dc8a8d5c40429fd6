//! # Document store
//!
//! The store is the only stateful collaborator. It holds the four
//! collections, answers point reads and scans, and exposes a per-collection
//! change stream that emits `(old value, new value)` pairs for every insert
//! or update.
//!
//! Callers open a [`StoreSession`] per logical operation (or per relay
//! connection) and release it by dropping it. Change streams keep whatever
//! they need from the session alive until they are dropped themselves.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::types::{ChangeEvent, Collection, Document};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

/// A change stream for one collection. Yields events in store order,
/// starting at the moment of subscription. An `Err` item means the stream
/// is broken; it ends right after.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, StoreError>>;

/// A document store that hands out sessions.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Open a new session. Fails with [`StoreError::Unavailable`] when the
    /// store cannot be reached.
    async fn open_session(&self) -> Result<Box<dyn StoreSession>, StoreError>;

    /// Short backend name, reported by the health endpoint.
    fn backend(&self) -> &'static str;
}

/// One open connection to the store.
#[async_trait]
pub trait StoreSession: Send {
    /// Create any missing collections. Safe to call repeatedly.
    async fn ensure_collections(&mut self) -> Result<(), StoreError>;

    /// Every row of a collection, in store-native order.
    async fn scan(&mut self, collection: Collection) -> Result<Vec<Document>, StoreError>;

    /// Point read by id.
    async fn get(
        &mut self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Document>, StoreError>;

    /// Rows whose top-level `field` equals `value`, in store-native order.
    async fn filter_eq(
        &mut self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Document>, StoreError>;

    /// Insert a row and return its id. A UUID v4 id is generated when the
    /// row carries no string `id`.
    async fn insert(&mut self, collection: Collection, doc: Document)
    -> Result<String, StoreError>;

    /// Insert or replace the row with the given id. Emits an update event
    /// carrying the previous row when one existed.
    async fn upsert(
        &mut self,
        collection: Collection,
        id: &str,
        doc: Document,
    ) -> Result<(), StoreError>;

    /// Subscribe to the collection's change stream.
    async fn changes(&mut self, collection: Collection) -> Result<ChangeStream, StoreError>;
}

/// Give `doc` a string id, generating one if needed, and return it.
pub(crate) fn assign_id(doc: &mut Document) -> String {
    if let Some(Value::String(id)) = doc.get(crate::types::ID_FIELD) {
        return id.clone();
    }
    let id = uuid::Uuid::new_v4().to_string();
    doc.insert(crate::types::ID_FIELD.to_string(), Value::String(id.clone()));
    id
}

/// Parse a JSON text body into a row.
pub(crate) fn parse_document(body: &str) -> Result<Document, String> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("stored row is not an object: {other}")),
        Err(e) => Err(format!("stored row is not valid JSON: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_assign_id_keeps_existing() {
        let mut doc = json!({"id": "e1"}).as_object().cloned().unwrap();
        assert_eq!(assign_id(&mut doc), "e1");
    }

    #[test]
    fn test_assign_id_generates_uuid() {
        let mut doc = Document::new();
        let id = assign_id(&mut doc);
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        assert_eq!(doc["id"], json!(id));
    }

    #[test]
    fn test_assign_id_replaces_non_string_id() {
        let mut doc = json!({"id": 7}).as_object().cloned().unwrap();
        let id = assign_id(&mut doc);
        assert_ne!(id, "7");
        assert_eq!(doc["id"], json!(id));
    }

    #[test]
    fn test_parse_document() {
        assert!(parse_document(r#"{"id":"a"}"#).is_ok());
        assert!(parse_document("[1,2]").is_err());
        assert!(parse_document("{not json").is_err());
    }
}
