use anyhow::{Context, Result};
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub chain: String,
    pub rpc_url: String,
    pub rpc_timeout_seconds: u64,
    pub rpc_requests_per_second: u32,
    pub start_block: u64,
    pub confirmations: u64,
    pub batch_size: u64,
    pub max_requests: usize,
    pub decode_threads: usize,
    pub min_blocks_to_sync: u64,
    pub add_raw_transactions: bool,
    pub store_root: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .context("DATABASE_URL must be set")?,
            db_max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid DB_MAX_CONNECTIONS")?,
            chain: env::var("CHAIN")
                .context("CHAIN must be set")?,
            rpc_url: env::var("RPC_URL")
                .context("RPC_URL must be set")?,
            rpc_timeout_seconds: env::var("RPC_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid RPC_TIMEOUT_SECONDS")?,
            rpc_requests_per_second: env::var("RPC_REQUESTS_PER_SECOND")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .context("Invalid RPC_REQUESTS_PER_SECOND")?,
            start_block: env::var("START_BLOCK")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .context("Invalid START_BLOCK")?,
            confirmations: env::var("CONFIRMATIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid CONFIRMATIONS")?,
            batch_size: env::var("BATCH_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .context("Invalid BATCH_SIZE")?,
            max_requests: env::var("MAX_REQUESTS")
                .unwrap_or_else(|_| "8".to_string())
                .parse()
                .context("Invalid MAX_REQUESTS")?,
            decode_threads: env::var("DECODE_THREADS")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .context("Invalid DECODE_THREADS")?,
            min_blocks_to_sync: env::var("MIN_BLOCKS_TO_SYNC")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .context("Invalid MIN_BLOCKS_TO_SYNC")?,
            add_raw_transactions: env::var("ADD_RAW_TRANSACTIONS")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .context("Invalid ADD_RAW_TRANSACTIONS")?,
            store_root: env::var("STORE_ROOT")
                .unwrap_or_else(|_| "./data".to_string()),
        })
    }
}
