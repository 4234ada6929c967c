use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::IdentityError;

pub const OK_MESSAGE: &str = "ok";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EventResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h: Option<String>,
}

impl EventResponse {
    pub fn ok(c: Option<String>, h: Option<String>) -> Self {
        EventResponse {
            message: OK_MESSAGE.to_string(),
            c,
            h,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimitedResponse {
    pub error: String,
    pub message: String,
    #[serde(rename = "retryAfter")]
    pub retry_after: i64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to compute identity hash: {0}")]
    IdentityError(#[from] IdentityError),
}

impl IntoResponse for CaptureError {
    fn into_response(self) -> Response {
        match self {
            // details stay in the logs
            CaptureError::IdentityError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Internal server error",
                }),
            ),
        }
        .into_response()
    }
}
