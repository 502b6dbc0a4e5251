mod bridge;
mod config;
mod error;
mod fallback;
mod gateway;
mod pipeline;
mod protocol;
mod speech;
mod transcode;
mod vad;

use anyhow::{Context, Result};
use tracing_subscriber::fmt::time::ChronoLocal;

use crate::config::Config;
use crate::gateway::{SessionDeps, router};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    tracing::info!("configuration loaded, starting verba-server");

    let bind_address = config.bind_address;
    let deps = SessionDeps::from_config(config);

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!("listening on {bind_address}");

    axum::serve(listener, router(deps)).await?;
    Ok(())
}
