use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use powgate::config::Config;
use powgate::quotes::PgQuotes;
use powgate::server::Server;
use powgate::store::RedisStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "powgate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Startup failures must exit 1; clap's default is 2.
    let cfg = match Config::try_parse() {
        Ok(cfg) => cfg,
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };
    cfg.validate()?;

    let quotes = PgQuotes::connect(&cfg.dbstring, &cfg.migration_path)
        .await
        .context("failed to set up quote repository")?;
    info!("quote repository ready");

    let store = RedisStore::connect(&cfg.redis_addr)
        .await
        .context("failed to connect to challenge store")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let server = Server::new(&cfg, Arc::new(store), Arc::new(quotes));
    server.run(shutdown_rx).await
}
