use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use almanac_chain::{EvmClient, FsStore, HttpTransport};

mod config;
mod crawler;
mod db;
mod jobs;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "almanac_indexer=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Almanac indexer");

    dotenvy::dotenv().ok();
    let config = config::Config::from_env()?;

    // Reject unknown chains before touching the database.
    almanac_common::chains::blocks_table_name(&config.chain)?;

    let pool =
        almanac_common::db::create_pool(&config.database_url, config.db_max_connections).await?;
    let database = db::Database::new(pool);

    let transport = Arc::new(HttpTransport::new(
        &config.rpc_url,
        Duration::from_secs(config.rpc_timeout_seconds),
        config.rpc_requests_per_second,
    )?);
    let client = EvmClient::new(&config.chain, transport);

    let store = Arc::new(FsStore::new(&config.store_root));

    let crawler = crawler::Crawler::new(database, client, store, config.clone());
    crawler.run().await
}
