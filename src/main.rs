use admission_gate::{config::GatewayConfig, init_gateway, init_tracing};
use anyhow::Context;
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Get config file path from command line or use default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/gateway.yaml".to_string());

    let config = GatewayConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    init_tracing(&config.telemetry).context("Failed to initialize tracing")?;

    init_gateway(config).await.context("Gateway error")?;
    Ok(())
}
