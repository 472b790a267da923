use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod account;
mod app;
mod balance;
mod config;
mod engine;
mod exchange;
mod market;
mod pricing;
mod sizing;
mod streams;
mod wire;

use app::Quoter;
use config::Config;
use exchange::{DryRunTransport, TradingTransport};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    let config = Config::from_env()?;
    info!("loaded configuration: {:?}", config);

    let transport: Arc<dyn TradingTransport> = if config.dry_run {
        Arc::new(DryRunTransport)
    } else {
        bail!(
            "live order submission needs an exchange signer behind TradingTransport; \
             run with QUOTER_DRY_RUN=1 until one is wired up"
        );
    };

    let mut quoter = Quoter::start(config, transport).await?;

    let result = tokio::select! {
        result = quoter.run() => result,
        _ = signal::ctrl_c() => {
            info!("shutdown signal received, stopping");
            Ok(())
        }
    };

    quoter.shutdown().await;
    result
}

fn init_tracing() {
    let default = "lighter_quoter=info";
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init();
}
