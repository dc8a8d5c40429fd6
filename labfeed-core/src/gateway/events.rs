//! Push channel message protocol.
//!
//! Frames are JSON text tagged by `event`, with the payload under `data`.

use crate::relay::ChangeFeed;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error code sent when the server is at its connection limit.
pub const CAPACITY_FULL: &str = "CAPACITY_FULL";
/// Error code sent for a frame that is not a valid client message.
pub const PARSE_ERROR: &str = "PARSE_ERROR";

/// Messages sent from the server to push clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    /// A row was inserted or updated.
    ChangeFeed(ChangeFeed),
    /// Response to a ping.
    Pong { timestamp: DateTime<Utc> },
    /// Something went wrong on this connection.
    Error { code: String, message: String },
}

impl ServerMessage {
    /// Build an `error` event.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Messages sent from push clients to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Keep-alive ping.
    Ping { timestamp: DateTime<Utc> },
}
