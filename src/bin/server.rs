//! Hive HTTP 服务
//!
//! 启动: cargo run --bin hive-server --features server
//! 监听地址由 HIVE_ADDR 指定，默认 127.0.0.1:8090

#![cfg(feature = "server")]

use std::time::Duration;

use anyhow::Context;
use hive::config::load_config;
use hive::core::shutdown::drain;
use hive::{api, observability, Hive};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let hive = Hive::builder(cfg).build().await?;
    let shutdown = hive.shutdown_manager().clone();
    shutdown.install_signal_handlers();

    let resumed = hive.resume_in_flight().await?;
    let app = api::router(hive.clone());

    let addr = std::env::var("HIVE_ADDR").unwrap_or_else(|_| "127.0.0.1:8090".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("hive-server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
        .context("Server error")?;

    let stopped = drain(resumed, Duration::from_secs(5)).await;
    tracing::info!("Server stopped ({} watcher(s) drained)", stopped);
    Ok(())
}
