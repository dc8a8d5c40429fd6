//! Read side of the API: experiment listing and the joined experiment detail.

use crate::error::StoreError;
use crate::store::DocumentStore;
use crate::types::{Collection, Document, EXPERIMENT_REF_FIELD, ExperimentDetail};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Answers the two read queries the API serves.
///
/// Every call opens its own store session and drops it before returning,
/// on success and failure alike.
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn DocumentStore>,
}

impl QueryService {
    /// Create a query service over `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Every experiment row, in store-native order.
    pub async fn list_experiments(&self) -> Result<Vec<Document>, StoreError> {
        let mut session = self.store.open_session().await?;
        let rows = session.scan(Collection::Experiments).await?;
        debug!(count = rows.len(), "Listed experiments");
        Ok(rows)
    }

    /// The experiment with `id` joined with its transformations, tests and
    /// analytics. `None` when no experiment has that id; the child
    /// collections are not scanned in that case.
    pub async fn get_experiment(&self, id: &str) -> Result<Option<ExperimentDetail>, StoreError> {
        let mut session = self.store.open_session().await?;
        let Some(experiment) = session.get(Collection::Experiments, id).await? else {
            debug!(experiment_id = id, "Experiment not found");
            return Ok(None);
        };

        let key = Value::String(id.to_string());
        let transformations = session
            .filter_eq(Collection::Transformations, EXPERIMENT_REF_FIELD, &key)
            .await?;
        let tests = session
            .filter_eq(Collection::Tests, EXPERIMENT_REF_FIELD, &key)
            .await?;
        let analytics = session
            .filter_eq(Collection::Analytics, EXPERIMENT_REF_FIELD, &key)
            .await?;

        Ok(Some(ExperimentDetail {
            experiment,
            transformations,
            tests,
            analytics,
        }))
    }
}
