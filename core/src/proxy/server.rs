//! Proxy Server - Axum HTTP server

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use parking_lot::Mutex;
use tower_http::trace::TraceLayer;

use crate::bridge::BridgeDecisionCache;
use crate::cache::CacheMetrics;
use crate::config::Config;
use crate::proxy::upstream::UpstreamClient;
use crate::session::SessionRegistry;

/// Application state shared across handlers
#[derive(Debug, Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub bridge_cache: Arc<BridgeDecisionCache>,
    pub metrics: Arc<CacheMetrics>,
    pub upstream: Arc<UpstreamClient>,
    pub bridge_enabled: bool,
    warm_interval: Duration,
    last_warm: Arc<Mutex<Instant>>,
}

impl AppState {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let metrics = Arc::new(CacheMetrics::new());
        Ok(Self {
            registry: Arc::new(SessionRegistry::new(config.session.clone(), Arc::clone(&metrics))),
            bridge_cache: Arc::new(BridgeDecisionCache::new(config.bridge.ttl(), Arc::clone(&metrics))),
            upstream: Arc::new(UpstreamClient::new(&config.upstream)?),
            bridge_enabled: config.bridge.enabled,
            metrics,
            warm_interval: config.bridge.ttl(),
            last_warm: Arc::new(Mutex::new(Instant::now())),
        })
    }

    /// Opportunistic expiry sweep of every cache layer
    pub fn warm(&self) {
        let sessions = self.registry.sweep();
        let decisions = self.bridge_cache.clean();
        if sessions + decisions > 0 {
            tracing::debug!("Swept {} session(s), {} bridge decision(s)", sessions, decisions);
        }
    }

    /// Sweep at most once per bridge TTL; called from the request path
    pub fn warm_if_due(&self) -> bool {
        self.warm_if_due_at(Instant::now())
    }

    pub fn warm_if_due_at(&self, now: Instant) -> bool {
        {
            let mut last_warm = self.last_warm.lock();
            if now.saturating_duration_since(*last_warm) < self.warm_interval {
                return false;
            }
            *last_warm = now;
        }
        self.warm();
        true
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/healthz", get(health_check_handler))
        .route("/health", get(health_check_handler))

        // Responses API
        .route("/v1/responses", post(crate::proxy::handlers::responses::handle_responses))

        // Diagnostics
        .route("/v1/sessions", get(crate::proxy::handlers::sessions::handle_session_metrics))

        .layer(DefaultBodyLimit::max(100 * 1024 * 1024)) // 100MB
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Proxy server instance
#[derive(Debug)]
pub struct ProxyServer {
    host: String,
    port: u16,
    state: AppState,
}

impl ProxyServer {
    pub fn new(host: String, port: u16, state: AppState) -> Self {
        Self { host, port, state }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self::new(
            config.server.bind_host().to_string(),
            config.server.port,
            AppState::from_config(config)?,
        ))
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the proxy server (blocking)
    pub async fn run(self) -> anyhow::Result<()> {
        self.state.warm();
        let app = router(self.state);

        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        tracing::info!("Bridge server listening on {}", addr);

        // Handle graceful shutdown
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("Bridge server stopped");
        Ok(())
    }
}

/// Health check handler
async fn health_check_handler() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(bridge_ttl_secs: u64) -> AppState {
        let mut config = Config::default();
        config.bridge.ttl_secs = bridge_ttl_secs;
        AppState::from_config(&config).unwrap()
    }

    #[test]
    fn test_warm_runs_once_per_bridge_ttl() {
        let state = state(300);
        let start = Instant::now();
        assert!(!state.warm_if_due_at(start + Duration::from_secs(10)));
        assert!(state.warm_if_due_at(start + Duration::from_secs(301)));
        assert!(!state.warm_if_due_at(start + Duration::from_secs(302)));
    }

    #[test]
    fn test_request_path_sweeps_stale_bridge_decisions() {
        let state = state(0);
        state.bridge_cache.decide(&[json!({"role": "user", "content": "one"})], 0, None);
        state.bridge_cache.decide(&[json!({"role": "user", "content": "two"})], 1, None);
        assert_eq!(state.bridge_cache.len(), 2);

        std::thread::sleep(Duration::from_millis(5));
        assert!(state.warm_if_due());
        assert!(state.bridge_cache.is_empty());
    }
}
