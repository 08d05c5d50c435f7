use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;

use tracing::info;

use manifest_proxy::{AppConfig, Logger, ProxyApplicationServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = Arc::new(AppConfig::parse());

    // guards keep the non-blocking writer and sentry alive until main returns
    let _guards = Logger::init(
        config.cargo_env,
        config.sentry_dsn.clone(),
        &config.log_dir,
    );

    info!(
        "logger and env prepped, {} channels configured, starting proxy server...",
        config.channels.len()
    );

    ProxyApplicationServer::serve(config)
        .await
        .context("proxy server failed to start")?;

    Ok(())
}
