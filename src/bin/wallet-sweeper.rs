//! Idempotency sweeper: deletes expired idempotency records on an interval.

use std::error::Error;
use wallet_ledger::{
    WalletConfig, WalletSystem, adapters::postgres::PostgresAdapter, spawn_expiry_sweeper,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => WalletConfig::from_file(path)?,
        None => WalletConfig::from_env()?,
    };

    let adapter = PostgresAdapter::connect(&config.database_url, config.max_connections).await?;
    adapter.init_schema().await?;
    let system = WalletSystem::new(Box::new(adapter), &config);

    tracing::info!(
        interval_secs = config.sweep_interval_secs,
        ttl_secs = config.idempotency_ttl_secs,
        "starting idempotency sweeper"
    );
    let sweeper = spawn_expiry_sweeper(system.idempotency(), config.sweep_interval());

    tokio::signal::ctrl_c().await?;
    sweeper.abort();

    tracing::info!("shutting down idempotency sweeper");
    Ok(())
}
