use anyhow::Context;
use dotenvy::dotenv;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use helpdesk_core::core::config::AppConfig;
use helpdesk_core::core::shared::state::AppStateBuilder;
use helpdesk_core::main_module::run_server;
use helpdesk_core::TenantGateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load().context("failed to load configuration")?;
    info!(
        backend = ?config.database.backend,
        port = config.server.port,
        "Starting {} {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let database = config.database.clone();
    let gateway = tokio::task::spawn_blocking(move || -> anyhow::Result<TenantGateway> {
        let gateway = TenantGateway::from_config(&database)?;
        gateway.verify_row_security()?;
        Ok(gateway)
    })
    .await
    .context("store initialisation task failed")?
    .context("store is not ready")?;

    if config.llm.endpoint.is_none() {
        warn!("No LLM endpoint configured; AI routes are disabled");
    }

    let state = AppStateBuilder::new(config, gateway)
        .build()
        .context("failed to build application state")?;

    run_server(Arc::new(state)).await?;
    info!("Server stopped");
    Ok(())
}
