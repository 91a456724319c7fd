use codex_bridge_core::config::Config;
use codex_bridge_core::proxy::ProxyServer;

pub async fn run(mut config: Config, port_override: Option<u16>) -> anyhow::Result<()> {
    // Apply port override if provided
    if let Some(port) = port_override {
        config.server.port = port;
    }

    tracing::info!("Starting Codex Bridge...");
    tracing::info!("  Port: {}", config.server.port);
    tracing::info!("  Host: {}", config.server.bind_host());
    tracing::info!("  Upstream: {}", config.upstream.base_url);

    if config.session.enabled {
        tracing::info!(
            "  Sessions: idle ttl {}s, max {} entries, force store {}",
            config.session.idle_ttl_secs,
            config.session.max_entries,
            config.session.force_store
        );
    } else {
        tracing::warn!("Session tracking disabled; every request gets a derived cache key only.");
    }

    let server = ProxyServer::from_config(&config)?;

    tracing::info!("Bridge starting on http://{}:{}", config.server.bind_host(), config.server.port);
    tracing::info!("Press Ctrl+C to stop");

    // Run server (blocks until shutdown)
    server.run().await?;

    Ok(())
}
