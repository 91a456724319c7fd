//! Session diagnostics handler

use axum::extract::{Json, Query, State};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cache::metrics::BucketStats;
use crate::proxy::server::AppState;
use crate::session::SessionMetrics;

const DEFAULT_LIMIT: usize = 5;

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

#[derive(Debug, Serialize)]
pub struct SessionsReport {
    #[serde(flatten)]
    pub sessions: SessionMetrics,
    pub caches: BTreeMap<String, BucketStats>,
}

/// Handle GET /v1/sessions
pub async fn handle_session_metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Json<SessionsReport> {
    state.warm();
    Json(SessionsReport {
        sessions: state.registry.get_metrics(query.limit),
        caches: state.metrics.snapshot(),
    })
}
