//! Client-side view of the experiment dashboard.
//!
//! Mirrors what a browser client keeps in memory: the experiment list, the
//! selected experiment and, per experiment, its lazily fetched children and
//! the selected transformation and test. The model is fed by the listing,
//! by detail fetches and by change feeds, and decides nothing about I/O
//! itself: [`Dashboard::select_experiment`] only reports whether details
//! still need fetching.

use crate::relay::ChangeFeed;
use crate::types::{Collection, Document, ExperimentDetail, document_id, experiment_ref, most_recent};
use serde_json::Value;

/// One experiment as the dashboard holds it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperimentView {
    pub experiment: Document,
    /// `None` until fetched or first pushed.
    pub transformations: Option<Vec<Document>>,
    pub tests: Option<Vec<Document>>,
    pub analytics: Option<Document>,
    pub selected_transformation: Option<String>,
    pub selected_test: Option<String>,
}

impl ExperimentView {
    fn new(experiment: Document) -> Self {
        Self {
            experiment,
            ..Self::default()
        }
    }

    pub fn id(&self) -> Option<&str> {
        document_id(&self.experiment)
    }

    /// Whether a detail fetch is still needed.
    pub fn needs_detail(&self) -> bool {
        self.transformations.is_none() || self.tests.is_none() || self.analytics.is_none()
    }

    /// The selected transformation row.
    pub fn selected_transformation(&self) -> Option<&Document> {
        find_by_id(self.transformations.as_deref()?, self.selected_transformation.as_deref()?)
    }

    pub fn selected_test(&self) -> Option<&Document> {
        find_by_id(self.tests.as_deref()?, self.selected_test.as_deref()?)
    }
}

fn find_by_id<'a>(rows: &'a [Document], id: &str) -> Option<&'a Document> {
    rows.iter().find(|row| document_id(row) == Some(id))
}

/// Replace the row with the same id, or append it.
fn upsert_row(rows: &mut Vec<Document>, row: &Document) {
    let existing = document_id(row)
        .and_then(|id| rows.iter().position(|r| document_id(r) == Some(id)));
    match existing {
        Some(idx) => rows[idx] = row.clone(),
        None => rows.push(row.clone()),
    }
}

fn owned_id(doc: &Document) -> Option<String> {
    document_id(doc).map(str::to_string)
}

/// The dashboard's in-memory state.
#[derive(Debug, Clone, Default)]
pub struct Dashboard {
    experiments: Vec<ExperimentView>,
    selected: Option<String>,
}

impl Dashboard {
    /// Create an empty dashboard.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn experiments(&self) -> &[ExperimentView] {
        &self.experiments
    }

    /// Look up an experiment by id.
    pub fn experiment(&self, id: &str) -> Option<&ExperimentView> {
        self.experiments.iter().find(|view| view.id() == Some(id))
    }

    fn experiment_mut(&mut self, id: &str) -> Option<&mut ExperimentView> {
        self.experiments.iter_mut().find(|view| view.id() == Some(id))
    }

    /// The selected experiment, if any.
    pub fn selected(&self) -> Option<&ExperimentView> {
        self.experiment(self.selected.as_deref()?)
    }

    /// Append a listing and select its most recent experiment.
    ///
    /// Returns the id of the selected experiment when its details must be
    /// fetched.
    pub fn load(&mut self, experiments: Vec<Document>) -> Option<String> {
        let latest = most_recent(&experiments).and_then(owned_id);
        self.experiments
            .extend(experiments.into_iter().map(ExperimentView::new));
        let id = latest?;
        self.select_experiment(&id).then_some(id)
    }

    /// Select an experiment. Returns `true` when its details must be fetched.
    /// Unknown ids leave the selection unchanged.
    pub fn select_experiment(&mut self, id: &str) -> bool {
        let Some(view) = self.experiment(id) else {
            return false;
        };
        let needs_detail = view.needs_detail();
        self.selected = Some(id.to_string());
        needs_detail
    }

    /// Merge a fetched detail into its experiment. Only missing children are
    /// filled in; the most recent transformation and test become selected.
    pub fn apply_detail(&mut self, detail: ExperimentDetail) -> bool {
        let Some(id) = owned_id(&detail.experiment) else {
            return false;
        };
        let Some(view) = self.experiment_mut(&id) else {
            return false;
        };

        if view.transformations.is_none() {
            view.transformations = Some(detail.transformations);
        }
        if view.tests.is_none() {
            view.tests = Some(detail.tests);
        }
        if view.analytics.is_none() {
            view.analytics = detail.analytics.into_iter().next();
        }
        view.selected_transformation = view
            .transformations
            .as_deref()
            .and_then(|rows| most_recent(rows))
            .and_then(owned_id);
        view.selected_test = view
            .tests
            .as_deref()
            .and_then(|rows| most_recent(rows))
            .and_then(owned_id);
        true
    }

    /// Select a transformation of the selected experiment.
    pub fn select_transformation(&mut self, id: &str) -> bool {
        let Some(selected) = self.selected.clone() else {
            return false;
        };
        let Some(view) = self.experiment_mut(&selected) else {
            return false;
        };
        view.selected_transformation = Some(id.to_string());
        true
    }

    /// Select a test of the selected experiment.
    pub fn select_test(&mut self, id: &str) -> bool {
        let Some(selected) = self.selected.clone() else {
            return false;
        };
        let Some(view) = self.experiment_mut(&selected) else {
            return false;
        };
        view.selected_test = Some(id.to_string());
        true
    }

    pub fn is_experiment_active(&self, id: &str) -> bool {
        self.selected.as_deref() == Some(id)
    }

    pub fn is_transformation_active(&self, id: &str) -> bool {
        self.selected()
            .and_then(|view| view.selected_transformation.as_deref())
            == Some(id)
    }

    pub fn is_test_active(&self, id: &str) -> bool {
        self.selected().and_then(|view| view.selected_test.as_deref()) == Some(id)
    }

    /// Apply a pushed change. Returns `false` when it was ignored: the row
    /// is not an object, or it references an experiment the dashboard does
    /// not hold.
    pub fn apply_change(&mut self, feed: &ChangeFeed) -> bool {
        let Value::Object(row) = &feed.value else {
            return false;
        };

        if feed.table == Collection::Experiments {
            let id = owned_id(row);
            let existing = id
                .as_deref()
                .and_then(|id| self.experiments.iter().position(|view| view.id() == Some(id)));
            match existing {
                Some(idx) => self.experiments[idx].experiment = row.clone(),
                None => self.experiments.push(ExperimentView::new(row.clone())),
            }
            self.selected = id;
            return true;
        }

        let Some(experiment_id) = experiment_ref(row).map(str::to_string) else {
            return false;
        };
        let is_selected = self.is_experiment_active(&experiment_id);
        let Some(view) = self.experiment_mut(&experiment_id) else {
            return false;
        };
        let row_id = owned_id(row);

        match feed.table {
            Collection::Transformations => {
                upsert_row(view.transformations.get_or_insert_with(Vec::new), row);
                if is_selected {
                    view.selected_transformation = row_id;
                }
            }
            Collection::Tests => {
                upsert_row(view.tests.get_or_insert_with(Vec::new), row);
                if is_selected {
                    view.selected_test = row_id;
                }
            }
            Collection::Analytics => view.analytics = Some(row.clone()),
            Collection::Experiments => {}
        }
        true
    }

    /// A test passes when every `test_data.results[*].correct` is truthy.
    pub fn test_successful(test: &Document) -> bool {
        let Some(results) = test
            .get("test_data")
            .and_then(|data| data.get("results"))
        else {
            return true;
        };
        let entries: Vec<&Value> = match results {
            Value::Array(items) => items.iter().collect(),
            Value::Object(map) => map.values().collect(),
            _ => return true,
        };
        entries.iter().all(|entry| {
            entry
                .get("correct")
                .map(is_truthy)
                .unwrap_or(false)
        })
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
