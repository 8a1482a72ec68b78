//! Gateway error taxonomy.
//!
//! Every failure a handler can observe maps onto one of five kinds. HTTP
//! responses use the `{status, message, data}` envelope; errors written into
//! an already-open stream use [`GatewayError::to_json`], which adds the kind
//! and the upstream status so clients can recognise the terminal record.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::{json, Value};
use thiserror::Error;

use crate::types::{ApiResponse, ApiStatus};

/// Body sent when the upstream could not be reached at all.
pub const UPSTREAM_UNAVAILABLE_MESSAGE: &str = "Upstream service unavailable";

pub const AUTH_FAILURE_MESSAGE: &str = "Please authenticate.";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    ClientInput(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream returned status {status}")]
    UpstreamNonSuccess { status: u16, body: String },

    #[error("stream failure: {0}")]
    StreamFailure(String),

    #[error("{0}")]
    AuthFailure(String),
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClientInput(_) => "client_input_error",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamNonSuccess { .. } => "upstream_non_success",
            Self::StreamFailure(_) => "stream_failure",
            Self::AuthFailure(_) => "auth_failure",
        }
    }

    /// Message safe to show the client. Transport details of an unreachable
    /// upstream stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::ClientInput(m) | Self::StreamFailure(m) | Self::AuthFailure(m) => m.clone(),
            Self::UpstreamUnavailable(_) => UPSTREAM_UNAVAILABLE_MESSAGE.to_string(),
            Self::UpstreamNonSuccess { body, .. } => body.clone(),
        }
    }

    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::UpstreamNonSuccess { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn api_status(&self) -> ApiStatus {
        match self {
            Self::AuthFailure(_) => ApiStatus::Unauthorized,
            _ => ApiStatus::Fail,
        }
    }

    pub fn envelope(&self) -> ApiResponse<()> {
        ApiResponse {
            status: self.api_status(),
            message: self.client_message(),
            data: None,
        }
    }

    /// Deterministic JSON form used for in-stream terminal records.
    pub fn to_json(&self) -> Value {
        let mut v = json!({
            "status": self.api_status(),
            "message": self.client_message(),
            "data": null,
            "kind": self.kind(),
        });
        if let (Some(status), Some(obj)) = (self.upstream_status(), v.as_object_mut()) {
            obj.insert("upstreamStatus".to_string(), json!(status));
        }
        v
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            // Input and auth failures are reported in the JSON envelope.
            Self::ClientInput(_) | Self::AuthFailure(_) => StatusCode::OK,
            Self::UpstreamUnavailable(_) | Self::StreamFailure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::UpstreamNonSuccess { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());
        match self {
            Self::UpstreamNonSuccess { body, .. } => builder.body(body.clone()),
            Self::UpstreamUnavailable(_) => builder.body(UPSTREAM_UNAVAILABLE_MESSAGE),
            _ => builder.json(self.envelope()),
        }
    }
}
