//! HTTP error surface of the bridge

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("upstream returned {status}")]
    UpstreamStatus { status: u16, body: String },
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::InvalidRequest(message) => error_body(StatusCode::BAD_REQUEST, "invalid_request_error", &message),
            ProxyError::Upstream(message) => error_body(StatusCode::BAD_GATEWAY, "upstream_error", &message),
            ProxyError::UpstreamStatus { status, body } => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                // Relay upstream JSON errors untouched so clients see the real cause
                match serde_json::from_str::<Value>(&body) {
                    Ok(value) => (status, Json(value)).into_response(),
                    Err(_) => error_body(status, "upstream_error", &body),
                }
            }
        }
    }
}

fn error_body(status: StatusCode, kind: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "type": kind,
                "message": message
            }
        })),
    )
        .into_response()
}
