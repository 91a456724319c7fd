use codex_bridge_core::config::{default_config_path, Config};
use serde_json::Value;

pub async fn run(config: &Config, limit: usize) -> anyhow::Result<()> {
    println!("Codex Bridge Status");
    println!("===================");
    println!();
    println!("Configuration:");
    println!("  Config file: {:?}", default_config_path());
    println!("  Upstream: {}", config.upstream.base_url);
    println!();
    println!("Server settings:");
    println!("  Host: {}", config.server.host);
    println!("  Port: {}", config.server.port);
    println!("  Sessions enabled: {}", config.session.enabled);
    println!();

    let base = format!("http://{}:{}", config.server.host, config.server.port);
    match reqwest::get(format!("{}/healthz", base)).await {
        Ok(resp) if resp.status().is_success() => {
            println!("Server: RUNNING ✓");
        }
        _ => {
            println!("Server: NOT RUNNING");
            return Ok(());
        }
    }

    let report: Value = reqwest::get(format!("{}/v1/sessions?limit={}", base, limit))
        .await?
        .error_for_status()?
        .json()
        .await?;

    println!();
    println!("Sessions:");
    println!("  Total: {}", report["total_sessions"]);
    if let Some(recent) = report["recent_sessions"].as_array() {
        for session in recent {
            println!(
                "  - {} key={} cached_tokens={} updated={}",
                session["id"].as_str().unwrap_or("?"),
                session["prompt_cache_key"].as_str().unwrap_or("?"),
                session["last_cached_tokens"],
                session["last_updated"].as_str().unwrap_or("?"),
            );
        }
    }

    if let Some(caches) = report["caches"].as_object() {
        println!();
        println!("Caches:");
        for (bucket, stats) in caches {
            println!(
                "  {}: hits={} misses={} evictions={}",
                bucket, stats["hits"], stats["misses"], stats["evictions"]
            );
        }
    }

    Ok(())
}
