use anyhow::Result;
use gateway::config::Config;
use gateway::server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("gateway={},tower_http=debug", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting companion gateway");
    tracing::info!(
        bind_addr = %config.bind_addr,
        store_configured = config.has_redis(),
        rate_limit_enabled = config.rate_limit_enabled,
        "configuration loaded"
    );

    let server = Server::new(config)
        .map_err(|e| anyhow::anyhow!("failed to create server: {}", e))?;

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("server error: {}", e))?;

    Ok(())
}
