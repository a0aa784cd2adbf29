use std::env;
use std::sync::Arc;

use sqlx::postgres::PgPool;

use pactwatch::config::Config;
use pactwatch::database::PgStore;
use pactwatch::feed::{FeedClient, FeedOptions};
use pactwatch::oracle::HttpPriceOracle;
use pactwatch::streams::StreamSupervisor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL is not set in .env file");

    let pool = PgPool::connect(&database_url).await?;
    let store = Arc::new(PgStore::new(pool));
    let price = Arc::new(HttpPriceOracle::new(
        config.sol_price_url.clone(),
        config.op_timeout,
    )?);
    let feed = Arc::new(FeedClient::spawn(
        config.upstream_ws_url.clone(),
        FeedOptions::from(&config),
    ));

    let supervisor = StreamSupervisor::new(store, price, feed, &config);
    let scheduled = supervisor.start_all_pending().await;
    tracing::info!(scheduled, "pactwatch is up");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    supervisor.shutdown().await;

    Ok(())
}
