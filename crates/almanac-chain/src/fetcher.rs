//! Block range retrieval.
//!
//! Two modes: a sequential walk that fails fast, and a bounded-parallel
//! fan-out gated by a semaphore. The parallel mode collects every worker
//! error (including panics) and returns them as one aggregate error;
//! partial results are discarded. Result order is not guaranteed;
//! downstream consumers re-key by block number.

use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use almanac_common::types::BlockJson;
use almanac_common::AlmanacError;

use crate::client::EvmClient;

impl EvmClient {
    /// Fetch `[from, to]` one block at a time, stopping on the first error.
    pub async fn fetch_blocks(&self, from: u64, to: u64) -> Result<Vec<BlockJson>, AlmanacError> {
        let mut blocks = Vec::with_capacity((to.saturating_sub(from) + 1) as usize);
        for number in from..=to {
            let block = self.block_by_number(number, true).await?;
            tracing::debug!("Fetched block {}", number);
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// Fetch `[from, to]` with up to `max_requests` in-flight requests.
    pub async fn fetch_blocks_parallel(
        &self,
        from: u64,
        to: u64,
        max_requests: usize,
    ) -> Result<Vec<BlockJson>, AlmanacError> {
        let semaphore = Arc::new(Semaphore::new(max_requests.max(1)));
        let blocks = Arc::new(Mutex::new(Vec::with_capacity(
            (to.saturating_sub(from) + 1) as usize,
        )));

        let mut tasks: JoinSet<Result<(), String>> = JoinSet::new();

        for number in from..=to {
            let client = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let blocks = Arc::clone(&blocks);

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| format!("block {number}: semaphore closed: {e}"))?;

                match client.block_by_number(number, true).await {
                    Ok(block) => {
                        blocks.lock().await.push(block);
                        tracing::debug!("Fetched block {}", number);
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!("Failed to fetch block {}: {}", number, e);
                        Err(format!("block {number}: {e}"))
                    }
                }
            });
        }

        let mut errors = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(message)) => errors.push(message),
                // A panicked worker is an error like any other.
                Err(join_err) => errors.push(format!("worker panicked: {join_err}")),
            }
        }

        if !errors.is_empty() {
            return Err(AlmanacError::Workers(errors));
        }

        let blocks = Arc::try_unwrap(blocks)
            .map_err(|_| AlmanacError::Internal("block accumulator still shared".to_string()))?
            .into_inner();
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use almanac_common::codec::{hex_to_u64, u64_to_hex};
    use crate::rpc::RpcTransport;

    /// Serves blocks by number, failing the configured ones. Tracks the
    /// peak number of concurrent in-flight requests.
    struct BlockTransport {
        failing: HashSet<u64>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl BlockTransport {
        fn new(failing: impl IntoIterator<Item = u64>) -> Self {
            Self {
                failing: failing.into_iter().collect(),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RpcTransport for BlockTransport {
        async fn request(&self, method: &str, params: Value) -> Result<Value, AlmanacError> {
            assert_eq!(method, "eth_getBlockByNumber");
            let number = hex_to_u64(params[0].as_str().unwrap()).unwrap();

            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing.contains(&number) {
                return Err(AlmanacError::Rpc(format!("boom at {number}")));
            }
            Ok(json!({
                "number": u64_to_hex(number),
                "hash": format!("0xhash{number}"),
                "parentHash": format!("0xhash{}", number.saturating_sub(1)),
                "timestamp": "0x65f0c0de",
                "gasLimit": "0x1c9c380",
                "gasUsed": "0x0",
                "transactions": [],
            }))
        }
    }

    #[tokio::test]
    async fn test_parallel_fetch_returns_every_block() {
        let transport = Arc::new(BlockTransport::new([]));
        let client = EvmClient::new("ethereum", transport.clone());

        let blocks = client.fetch_blocks_parallel(100, 140, 8).await.unwrap();

        let numbers: HashSet<u64> = blocks
            .iter()
            .map(|b| hex_to_u64(&b.block_number).unwrap())
            .collect();
        assert_eq!(numbers, (100..=140).collect::<HashSet<u64>>());
        assert!(transport.peak.load(Ordering::SeqCst) <= 8);
    }

    #[tokio::test]
    async fn test_parallel_fetch_aggregates_errors_and_discards_results() {
        let transport = Arc::new(BlockTransport::new([157]));
        let client = EvmClient::new("ethereum", transport);

        let err = client.fetch_blocks_parallel(100, 200, 8).await.unwrap_err();
        assert!(err.is_aggregate());
        assert!(err.to_string().contains("block 157"));
    }

    #[tokio::test]
    async fn test_sequential_fetch_fails_fast() {
        let transport = Arc::new(BlockTransport::new([3]));
        let client = EvmClient::new("ethereum", transport.clone());

        let err = client.fetch_blocks(1, 10).await.unwrap_err();
        assert!(err.to_string().contains("boom at 3"));
    }
}
