use clap::Parser;

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = codex_bridge_core::config::load_config(cli.config.clone())?;

    // Initialize logging
    let level = &config.logging.level;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "codex_bridge={level},codex_bridge_core={level},tower_http=info"
                ))
            }),
        )
        .init();

    match cli.command {
        Commands::Start { port } => {
            cli::commands::start::run(config, port).await?;
        }
        Commands::Status { limit } => {
            cli::commands::status::run(&config, limit).await?;
        }
        Commands::Config => {
            cli::commands::show_config::run(&config)?;
        }
    }

    Ok(())
}
