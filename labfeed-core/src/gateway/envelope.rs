//! The `{responseCode, responseDesc, data}` wrapper every API response uses.

use axum::Json;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

pub const SUCCESS_CODE: u8 = 0;
pub const FAILURE_CODE: u8 = 1;
pub const SUCCESS_DESC: &str = "Success";

/// API response envelope. Failures are reported in the body; the HTTP
/// status is 200 either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEnvelope<T> {
    pub response_code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_desc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    /// A success. `data` of `None` serializes as no `data` key.
    pub fn success(data: Option<T>) -> Self {
        Self {
            response_code: SUCCESS_CODE,
            response_desc: Some(SUCCESS_DESC.to_string()),
            data,
        }
    }

    /// Failure envelope carrying `message` as the description.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            response_code: FAILURE_CODE,
            response_desc: Some(message.into()),
            data: None,
        }
    }
}

impl<T, E> From<Result<T, E>> for ApiEnvelope<T>
where
    E: std::fmt::Display,
{
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(data) => Self::success(Some(data)),
            Err(e) => Self::failure(e.to_string()),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiEnvelope<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}
