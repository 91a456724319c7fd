//! Upstream client for the Responses backend

use axum::http::HeaderMap;
use reqwest::{header, Client, Response};
use tokio::time::Duration;

use crate::config::UpstreamConfig;
use crate::proxy::error::ProxyError;
use crate::session::ResponsesRequest;

/// Inbound headers relayed verbatim. Credentials are the host's business.
const FORWARDED_HEADERS: [&str; 4] = ["authorization", "chatgpt-account-id", "openai-beta", "originator"];

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http_client: Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(config.request_timeout))
            .user_agent(concat!("codex-bridge/", env!("CARGO_PKG_VERSION")));

        if let Some(proxy) = config.proxy_url.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
            tracing::info!("Using upstream proxy: {}", proxy);
        }

        Ok(Self {
            http_client: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn responses_url(&self) -> String {
        format!("{}/responses", self.base_url)
    }

    fn build_headers(inbound: &HeaderMap, prompt_cache_key: &str, stream: bool) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static(if stream { "text/event-stream" } else { "application/json" }),
        );

        for name in FORWARDED_HEADERS {
            if let Some(value) = inbound.get(name) {
                headers.insert(name, value.clone());
            }
        }

        match header::HeaderValue::from_str(prompt_cache_key) {
            Ok(value) => {
                headers.insert("session_id", value.clone());
                headers.insert("conversation_id", value);
            }
            Err(e) => tracing::debug!("Cache key {:?} is not a valid header value: {}", prompt_cache_key, e),
        }
        headers
    }

    /// POST the request body to `<base_url>/responses`. No retries.
    pub async fn create_response(
        &self,
        request: &ResponsesRequest,
        prompt_cache_key: &str,
        inbound: &HeaderMap,
    ) -> Result<Response, ProxyError> {
        let url = self.responses_url();
        self.http_client
            .post(&url)
            .headers(Self::build_headers(inbound, prompt_cache_key, request.is_stream()))
            .json(request)
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(format!("Request to {} failed: {}", url, e)))
    }
}
