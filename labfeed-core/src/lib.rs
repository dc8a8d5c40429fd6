//! # Labfeed Core
//!
//! Backend of an experiment dashboard. Experiments, their transformations,
//! tests and analytics live in a document store; an HTTP API lists and
//! joins them, and a WebSocket push channel relays every insert or update
//! to connected dashboards as it happens.

pub mod config;
pub mod dashboard;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod query;
pub mod relay;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root.
pub use config::{CollectionNames, LabfeedConfig, ServerConfig, StoreConfig, load_config};
pub use dashboard::{Dashboard, ExperimentView};
pub use error::{ConfigError, LabfeedError, Result, StoreError};
pub use gateway::{ApiEnvelope, AppState, ClientMessage, ServerMessage, router, serve};
pub use ingest::Recorder;
pub use query::QueryService;
pub use relay::{ChangeFeed, ChangeRelay, RelayConnection, RelayState};
pub use store::{ChangeStream, DocumentStore, MemoryStore, SqliteStore, StoreSession};
pub use types::{ChangeEvent, Collection, Document, ExperimentDetail};
