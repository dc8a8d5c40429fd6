//! Error types for the labfeed core library.
//!
//! Uses `thiserror` for public API error types. Store errors follow the
//! three-way split the API surface depends on: the store cannot be reached,
//! a read or write failed after connecting, or a change stream broke after
//! it was subscribed.

use crate::types::Collection;

/// Top-level error type for the labfeed core library.
#[derive(Debug, thiserror::Error)]
pub enum LabfeedError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the document store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A session could not be established.
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// A scan, point read or write failed on an open session.
    #[error("Query on '{collection}' failed: {message}")]
    QueryFailed {
        collection: Collection,
        message: String,
    },

    /// A change stream errored after it was subscribed.
    #[error("Change stream for '{collection}' failed: {message}")]
    SubscriptionFailed {
        collection: Collection,
        message: String,
    },

    /// A stored row or an input row is not a JSON object.
    #[error("Invalid document: {message}")]
    InvalidDocument { message: String },
}

impl StoreError {
    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub(crate) fn query(collection: Collection, message: impl Into<String>) -> Self {
        Self::QueryFailed {
            collection,
            message: message.into(),
        }
    }

    pub(crate) fn subscription(collection: Collection, message: impl Into<String>) -> Self {
        Self::SubscriptionFailed {
            collection,
            message: message.into(),
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::ParseError {
            message: err.to_string(),
        }
    }
}

/// A type alias for results using the top-level `LabfeedError`.
pub type Result<T> = std::result::Result<T, LabfeedError>;
