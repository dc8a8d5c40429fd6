//! Writer side: records experiments and their results into the store.

use crate::error::StoreError;
use crate::store::DocumentStore;
use crate::types::{CREATED_AT_FIELD, Collection, Document, EXPERIMENT_REF_FIELD};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Inserts rows the way an experiment runner produces them. Every row is
/// stamped with `createdAt` and written through a fresh session.
///
/// `experiment_id` is stored as given; it is not checked against the
/// experiments collection.
#[derive(Clone)]
pub struct Recorder {
    store: Arc<dyn DocumentStore>,
}

impl Recorder {
    /// Create a recorder writing to `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Record a new experiment. `metadata` fields are stored alongside
    /// `createdAt`; it must be a JSON object or null.
    pub async fn add_experiment(&self, metadata: Value) -> Result<String, StoreError> {
        let doc = object_or_empty(metadata)?;
        self.insert(Collection::Experiments, doc).await
    }

    /// Record a transformation under `experiment_id`. Returns the row id.
    pub async fn add_transformation(
        &self,
        experiment_id: &str,
        version_name: &str,
        transformation: Value,
    ) -> Result<String, StoreError> {
        let mut doc = child(experiment_id);
        doc.insert("version_name".into(), Value::String(version_name.to_string()));
        doc.insert("transformation".into(), transformation);
        self.insert(Collection::Transformations, doc).await
    }

    /// Record a test run under `experiment_id`. Returns the row id.
    pub async fn add_test(
        &self,
        experiment_id: &str,
        version: &str,
        test_data: Value,
    ) -> Result<String, StoreError> {
        let mut doc = child(experiment_id);
        doc.insert("version".into(), Value::String(version.to_string()));
        doc.insert("test_data".into(), test_data);
        self.insert(Collection::Tests, doc).await
    }

    /// Record analytics for `experiment_id`. Returns the row id.
    pub async fn add_analytics(
        &self,
        experiment_id: &str,
        analytics: Value,
    ) -> Result<String, StoreError> {
        let mut doc = child(experiment_id);
        doc.insert("analytics".into(), analytics);
        self.insert(Collection::Analytics, doc).await
    }

    async fn insert(&self, collection: Collection, mut doc: Document) -> Result<String, StoreError> {
        doc.insert(CREATED_AT_FIELD.into(), Value::String(now_rfc3339()));
        let mut session = self.store.open_session().await?;
        let id = session.insert(collection, doc).await?;
        info!(%collection, id = %id, "Recorded row");
        Ok(id)
    }
}

fn child(experiment_id: &str) -> Document {
    let mut doc = Document::new();
    doc.insert(
        EXPERIMENT_REF_FIELD.into(),
        Value::String(experiment_id.to_string()),
    );
    doc
}

fn object_or_empty(value: Value) -> Result<Document, StoreError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Document::new()),
        other => Err(StoreError::InvalidDocument {
            message: format!("experiment metadata must be a JSON object, got {other}"),
        }),
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryService;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn recorder() -> (MemoryStore, Recorder) {
        let store = MemoryStore::new();
        let recorder = Recorder::new(Arc::new(store.clone()));
        (store, recorder)
    }

    #[tokio::test]
    async fn test_records_full_experiment() {
        let (store, recorder) = recorder();
        let exp = recorder
            .add_experiment(json!({"name": "baseline"}))
            .await
            .unwrap();
        recorder
            .add_transformation(&exp, "v1", json!({"steps": ["scale"]}))
            .await
            .unwrap();
        recorder
            .add_test(&exp, "v1", json!({"results": [{"correct": true}]}))
            .await
            .unwrap();
        recorder
            .add_analytics(&exp, json!({"accuracy": 0.9}))
            .await
            .unwrap();
        assert_eq!(store.open_sessions(), 0);

        let query = QueryService::new(Arc::new(store.clone()));
        let detail = query.get_experiment(&exp).await.unwrap().unwrap();
        assert_eq!(detail.experiment["name"], "baseline");
        assert!(detail.experiment["createdAt"].is_string());
        assert_eq!(detail.transformations[0]["version_name"], "v1");
        assert_eq!(detail.tests[0]["test_data"]["results"][0]["correct"], true);
        assert_eq!(detail.analytics[0]["analytics"]["accuracy"], 0.9);
    }

    #[tokio::test]
    async fn test_child_of_unknown_experiment_is_stored() {
        let (store, recorder) = recorder();
        recorder
            .add_test("nobody", "v0", json!({}))
            .await
            .unwrap();
        assert_eq!(store.len(Collection::Tests), 1);
    }

    #[tokio::test]
    async fn test_metadata_must_be_object() {
        let (store, recorder) = recorder();
        let err = recorder.add_experiment(json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument { .. }));
        assert!(recorder.add_experiment(Value::Null).await.is_ok());
        assert_eq!(store.len(Collection::Experiments), 1);
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = now_rfc3339();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_rfc3339();
        assert!(a < b);
        assert!(a.ends_with('Z'));
    }
}
