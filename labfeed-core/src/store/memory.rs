//! In-process document store.
//!
//! Rows live in a mutex-guarded map and every collection has its own tokio
//! broadcast channel as its change feed. The store counts open sessions and
//! live change streams and can be told to fail in the specific ways the
//! query service and relay must tolerate, which makes it the backend of
//! choice for tests and demos.

use super::{ChangeStream, DocumentStore, StoreSession, assign_id};
use crate::error::StoreError;
use crate::types::{ChangeEvent, Collection, Document, ID_FIELD};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

const FEED_CAPACITY: usize = 256;

/// A feed item: an event, or an injected stream failure.
type FeedItem = Result<ChangeEvent, String>;

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    failing_queries: HashSet<Collection>,
    failing_subscriptions: HashSet<Collection>,
}

struct Shared {
    rows: Mutex<HashMap<Collection, Vec<Document>>>,
    feeds: HashMap<Collection, broadcast::Sender<FeedItem>>,
    faults: Mutex<Faults>,
    open_sessions: AtomicUsize,
    live_streams: AtomicUsize,
}

impl Shared {
    fn rows(&self) -> MutexGuard<'_, HashMap<Collection, Vec<Document>>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, collection: Collection, item: FeedItem) -> usize {
        self.feeds
            .get(&collection)
            .and_then(|tx| tx.send(item).ok())
            .unwrap_or(0)
    }

    fn check_query(&self, collection: Collection) -> Result<(), StoreError> {
        let faults = self.faults();
        if faults.unavailable {
            return Err(StoreError::query(collection, "connection lost"));
        }
        if faults.failing_queries.contains(&collection) {
            return Err(StoreError::query(collection, "injected query failure"));
        }
        Ok(())
    }

    fn insert(&self, collection: Collection, mut doc: Document) -> String {
        let id = assign_id(&mut doc);
        let row = Value::Object(doc.clone());
        self.rows().entry(collection).or_default().push(doc);
        self.publish(collection, Ok(ChangeEvent::inserted(row)));
        id
    }

    fn upsert(&self, collection: Collection, id: &str, mut doc: Document) {
        doc.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        let new_row = Value::Object(doc.clone());
        let old = {
            let mut rows = self.rows();
            let table = rows.entry(collection).or_default();
            match table
                .iter_mut()
                .find(|row| crate::types::document_id(row) == Some(id))
            {
                Some(existing) => Some(Value::Object(std::mem::replace(existing, doc))),
                None => {
                    table.push(doc);
                    None
                }
            }
        };
        let event = match old {
            Some(old) => ChangeEvent::updated(old, new_row),
            None => ChangeEvent::inserted(new_row),
        };
        self.publish(collection, Ok(event));
    }
}

/// In-memory document store with fault injection and resource counters.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("open_sessions", &self.open_sessions())
            .field("live_streams", &self.live_streams())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with no faults.
    pub fn new() -> Self {
        let feeds = Collection::ALL
            .iter()
            .map(|c| (*c, broadcast::channel(FEED_CAPACITY).0))
            .collect();
        Self {
            shared: Arc::new(Shared {
                rows: Mutex::new(HashMap::new()),
                feeds,
                faults: Mutex::new(Faults::default()),
                open_sessions: AtomicUsize::new(0),
                live_streams: AtomicUsize::new(0),
            }),
        }
    }

    /// Insert a row without a session, as an external writer would.
    /// Returns the row id.
    pub fn insert(&self, collection: Collection, doc: Value) -> String {
        let doc = match doc {
            Value::Object(map) => map,
            other => {
                let mut map = Document::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self.shared.insert(collection, doc)
    }

    /// Push a raw event onto a collection's feed. Returns the number of
    /// live subscribers that received it.
    pub fn emit(&self, collection: Collection, event: ChangeEvent) -> usize {
        self.shared.publish(collection, Ok(event))
    }

    /// Break every live change stream of a collection.
    pub fn fail_stream(&self, collection: Collection, message: &str) -> usize {
        self.shared.publish(collection, Err(message.to_string()))
    }

    /// Make new sessions fail, and queries on open ones.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.faults().unavailable = unavailable;
    }

    /// Make scans and reads on a collection fail.
    pub fn fail_queries_on(&self, collection: Collection) {
        self.shared.faults().failing_queries.insert(collection);
    }

    /// Make new subscriptions on a collection fail.
    pub fn fail_subscriptions_on(&self, collection: Collection) {
        self.shared.faults().failing_subscriptions.insert(collection);
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        *self.shared.faults() = Faults::default();
    }

    /// Sessions opened and not yet dropped.
    pub fn open_sessions(&self) -> usize {
        self.shared.open_sessions.load(Ordering::SeqCst)
    }

    /// Change streams handed out and not yet dropped.
    pub fn live_streams(&self) -> usize {
        self.shared.live_streams.load(Ordering::SeqCst)
    }

    /// Number of rows in a collection.
    pub fn len(&self, collection: Collection) -> usize {
        self.shared.rows().get(&collection).map_or(0, Vec::len)
    }

    /// Whether every collection is empty.
    pub fn is_empty(&self) -> bool {
        self.shared.rows().values().all(Vec::is_empty)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn open_session(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        if self.shared.faults().unavailable {
            return Err(StoreError::unavailable("connection refused"));
        }
        self.shared.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

struct MemorySession {
    shared: Arc<Shared>,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.shared.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Decrements the live stream count when the stream it rides in is dropped.
struct StreamGuard(Arc<Shared>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.live_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn ensure_collections(&mut self) -> Result<(), StoreError> {
        if self.shared.faults().unavailable {
            return Err(StoreError::unavailable("connection lost"));
        }
        let mut rows = self.shared.rows();
        for collection in Collection::ALL {
            rows.entry(collection).or_default();
        }
        Ok(())
    }

    async fn scan(&mut self, collection: Collection) -> Result<Vec<Document>, StoreError> {
        self.shared.check_query(collection)?;
        Ok(self
            .shared
            .rows()
            .get(&collection)
            .cloned()
            .unwrap_or_default())
    }

    async fn get(
        &mut self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Document>, StoreError> {
        self.shared.check_query(collection)?;
        Ok(self.shared.rows().get(&collection).and_then(|rows| {
            rows.iter()
                .find(|row| crate::types::document_id(row) == Some(id))
                .cloned()
        }))
    }

    async fn filter_eq(
        &mut self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Document>, StoreError> {
        self.shared.check_query(collection)?;
        Ok(self
            .shared
            .rows()
            .get(&collection)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.get(field) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(
        &mut self,
        collection: Collection,
        doc: Document,
    ) -> Result<String, StoreError> {
        self.shared.check_query(collection)?;
        Ok(self.shared.insert(collection, doc))
    }

    async fn upsert(
        &mut self,
        collection: Collection,
        id: &str,
        doc: Document,
    ) -> Result<(), StoreError> {
        self.shared.check_query(collection)?;
        self.shared.upsert(collection, id, doc);
        Ok(())
    }

    async fn changes(&mut self, collection: Collection) -> Result<ChangeStream, StoreError> {
        {
            let faults = self.shared.faults();
            if faults.unavailable || faults.failing_subscriptions.contains(&collection) {
                return Err(StoreError::subscription(
                    collection,
                    "subscription refused",
                ));
            }
        }
        let rx = self
            .shared
            .feeds
            .get(&collection)
            .map(broadcast::Sender::subscribe)
            .ok_or_else(|| StoreError::subscription(collection, "unknown collection"))?;

        self.shared.live_streams.fetch_add(1, Ordering::SeqCst);
        let guard = StreamGuard(Arc::clone(&self.shared));
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let _held = &guard;
            let mapped = match item {
                Ok(Ok(event)) => Some(Ok(event)),
                Ok(Err(message)) => Some(Err(StoreError::subscription(collection, message))),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(%collection, skipped, "Change feed subscriber lagged; events dropped");
                    None
                }
            };
            futures::future::ready(mapped)
        });
        Ok(stream.boxed())
    }
}
