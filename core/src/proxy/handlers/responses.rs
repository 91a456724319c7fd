//! Responses API handler
//! Drives one request through the continuity engine and relays it upstream.

use axum::{
    body::Body,
    extract::{Json, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::bridge::{apply_bridge, BridgeDecision};
use crate::proxy::error::ProxyError;
use crate::proxy::server::AppState;
use crate::session::input::strip_item_ids;
use crate::session::{ensure_prompt_cache_key, ResponsesRequest};

fn trace_id() -> String {
    use rand::Rng;
    rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// Handle POST /v1/responses
pub async fn handle_responses(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ProxyError> {
    let trace_id = trace_id();
    state.warm_if_due();

    let mut request: ResponsesRequest = serde_json::from_value(body)
        .map_err(|e| ProxyError::InvalidRequest(format!("Invalid request body: {}", e)))?;

    let context = state.registry.get_context(&request);
    let turn = context.begin_turn().await;

    if !context.preserve_ids {
        strip_item_ids(&mut request.input);
    }

    if state.bridge_enabled && apply_bridge(&mut request, &context, &state.bridge_cache) == BridgeDecision::Add {
        debug!("[{}] Bridge message present for session {}", trace_id, context.session_id);
    }

    let context = state.registry.apply_request(&mut request, context);
    let prompt_cache_key = if context.enabled {
        context.prompt_cache_key()
    } else {
        let derived = ensure_prompt_cache_key(&request);
        request.set_prompt_cache_key(derived.key.clone());
        derived.key
    };

    info!(
        "[{}] Responses request: model={} items={} session={} new={} cache_key={}",
        trace_id,
        request.model,
        request.input.len(),
        context.session_id,
        context.is_new,
        prompt_cache_key
    );

    let response = state
        .upstream
        .create_response(&request, &prompt_cache_key, &headers)
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        error!("[{}] Upstream error {}: {}", trace_id, status, error_text);
        return Err(ProxyError::UpstreamStatus {
            status: status.as_u16(),
            body: error_text,
        });
    }

    let is_event_stream = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/event-stream"));

    if is_event_stream || request.is_stream() {
        // The turn stays locked until the relayed stream is dropped
        let registry = Arc::clone(&state.registry);
        let mut tap = CompletionTap::default();
        let stream = response.bytes_stream().map(move |chunk| {
            let _turn = &turn;
            match &chunk {
                Ok(bytes) => {
                    for event in tap.push(bytes) {
                        debug!("[{}] Stream completed for session {}", trace_id, context.session_id);
                        registry.record_response(&context, &event);
                    }
                }
                Err(e) => warn!("[{}] Upstream stream interrupted: {}", trace_id, e),
            }
            chunk
        });
        return axum::http::Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(stream))
            .map_err(|e| ProxyError::Upstream(format!("Failed to build stream response: {}", e)));
    }

    let payload: Value = response
        .json()
        .await
        .map_err(|e| ProxyError::Upstream(format!("Invalid JSON response: {}", e)))?;

    state.registry.record_response(&context, &payload);

    Ok(Json(payload).into_response())
}

/// Watches relayed SSE bytes for the terminal `response.completed` event
#[derive(Debug, Default)]
struct CompletionTap {
    line_buf: Vec<u8>,
}

impl CompletionTap {
    /// Feed one chunk, returning any completion events it finished
    fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.line_buf.extend_from_slice(chunk);
        let mut completed = Vec::new();
        while let Some(pos) = self.line_buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.line_buf.drain(..=pos).collect();
            if let Some(event) = completion_event(&line) {
                completed.push(event);
            }
        }
        completed
    }
}

fn completion_event(line: &[u8]) -> Option<Value> {
    let line = std::str::from_utf8(line).ok()?.trim();
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return None;
    }
    let event: Value = serde_json::from_str(data).ok()?;
    let kind = event.get("type").and_then(Value::as_str)?;
    matches!(kind, "response.completed" | "response.done").then_some(event)
}
