use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

use ai_gateway::http::{app, AppState};
use ai_gateway::GatewayConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GATEWAY_CONFIG").ok())
        .map(PathBuf::from);
    let config = GatewayConfig::load(config_path.as_deref())?;

    let state = AppState::from_config(&config)?;
    let router = app(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "ai-gateway listening");
    axum::serve(listener, router).await?;
    Ok(())
}
