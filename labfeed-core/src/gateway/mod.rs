//! # Gateway
//!
//! The network edge: an axum router serving the experiment API inside the
//! response envelope, a `/ws` push channel that binds one change relay to
//! each connected client, a health endpoint, and optional static files for
//! the dashboard front end.

mod connection;
mod envelope;
mod events;
mod server;

pub use connection::{ConnectionInfo, ConnectionManager, ConnectionStats};
pub use envelope::{ApiEnvelope, FAILURE_CODE, SUCCESS_CODE, SUCCESS_DESC};
pub use events::{CAPACITY_FULL, ClientMessage, PARSE_ERROR, ServerMessage};
pub use server::{AppState, NOT_FOUND_TEXT, router, serve};
