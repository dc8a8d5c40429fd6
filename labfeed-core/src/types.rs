//! Fundamental types shared across the store, query, relay and gateway layers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// An opaque stored row. Only `id`, `createdAt` and `experiment_id` are
/// ever interpreted.
pub type Document = serde_json::Map<String, Value>;

/// Primary key field of every row.
pub const ID_FIELD: &str = "id";
/// Creation timestamp field of every row.
pub const CREATED_AT_FIELD: &str = "createdAt";
/// Foreign key from child rows to their experiment.
pub const EXPERIMENT_REF_FIELD: &str = "experiment_id";

/// The four logical collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Experiments,
    Transformations,
    Tests,
    Analytics,
}

impl Collection {
    /// All collections, in subscription order.
    pub const ALL: [Collection; 4] = [
        Collection::Experiments,
        Collection::Transformations,
        Collection::Tests,
        Collection::Analytics,
    ];

    /// Logical name, as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Experiments => "experiments",
            Collection::Transformations => "transformations",
            Collection::Tests => "tests",
            Collection::Analytics => "analytics",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change-stream event: the row before and after an insert or update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "old_val", default)]
    pub old_value: Option<Value>,
    #[serde(rename = "new_val", default)]
    pub new_value: Option<Value>,
}

impl ChangeEvent {
    /// Event for a new row.
    pub fn inserted(row: Value) -> Self {
        Self {
            old_value: None,
            new_value: Some(row),
        }
    }

    /// Event for a replaced row.
    pub fn updated(old: Value, new: Value) -> Self {
        Self {
            old_value: Some(old),
            new_value: Some(new),
        }
    }

    /// An event with no fields at all, used by stores as a keepalive.
    pub fn heartbeat() -> Self {
        Self::default()
    }

    /// A heartbeat carries neither an old nor a new value.
    pub fn is_heartbeat(&self) -> bool {
        self.old_value.is_none() && self.new_value.is_none()
    }
}

/// An experiment joined with its related rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDetail {
    #[serde(flatten)]
    pub experiment: Document,
    pub transformations: Vec<Document>,
    pub tests: Vec<Document>,
    pub analytics: Vec<Document>,
}

/// Read a row's string id.
pub fn document_id(doc: &Document) -> Option<&str> {
    doc.get(ID_FIELD).and_then(Value::as_str)
}

/// Read the experiment a child row belongs to.
pub fn experiment_ref(doc: &Document) -> Option<&str> {
    doc.get(EXPERIMENT_REF_FIELD).and_then(Value::as_str)
}

/// Order two `createdAt` values.
///
/// Numbers compare numerically and strings lexicographically (RFC 3339
/// timestamps sort correctly that way). A missing value sorts first and
/// numbers sort before strings.
pub fn compare_created_at(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            Some(_) => 0,
        }
    }
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::MIN);
            let y = y.as_f64().unwrap_or(f64::MIN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// The most recent row by `createdAt`. Ties keep the earliest row.
pub fn most_recent<'a, I>(docs: I) -> Option<&'a Document>
where
    I: IntoIterator<Item = &'a Document>,
{
    let mut best: Option<&Document> = None;
    for doc in docs {
        best = match best {
            Some(current)
                if compare_created_at(doc.get(CREATED_AT_FIELD), current.get(CREATED_AT_FIELD))
                    != Ordering::Greater =>
            {
                Some(current)
            }
            _ => Some(doc),
        };
    }
    best
}
