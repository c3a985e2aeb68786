//! Per-chain JSON-RPC client.
//!
//! Wraps a transport with the standard EVM methods the crawler needs.
//! Hex quantities are normalized to integers on ingress and rendered
//! back to hex on egress. Provider errors surface verbatim; retry
//! policy lives with the caller, except for the adaptive log scanner
//! below which reacts to the provider's result-count limit.

use std::sync::Arc;

use serde_json::{json, Value};

use almanac_common::codec::{hex_to_u64, u64_to_hex};
use almanac_common::types::{BlockJson, EventJson, ReceiptJson, TransactionJson};
use almanac_common::AlmanacError;

use crate::rpc::RpcTransport;

/// Marker substring a provider returns when a log filter matches too
/// many results; triggers range halving in `filter_logs`.
const TOO_MANY_RESULTS_MARKER: &str = "query returned more than 10000 results";

/// Log filter over a block range.
#[derive(Debug, Clone, Default)]
pub struct FilterQuery {
    pub from_block: u64,
    pub to_block: u64,
    pub addresses: Vec<String>,
    pub topics: Vec<Vec<String>>,
}

#[derive(Clone)]
pub struct EvmClient {
    chain: String,
    transport: Arc<dyn RpcTransport>,
}

impl EvmClient {
    pub fn new(chain: &str, transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            chain: chain.to_string(),
            transport,
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub async fn latest_block_number(&self) -> Result<u64, AlmanacError> {
        let result = self.transport.request("eth_blockNumber", json!([])).await?;
        let hex = result
            .as_str()
            .ok_or_else(|| AlmanacError::Rpc(format!("invalid block number format: {result}")))?;
        hex_to_u64(hex)
    }

    pub async fn block_by_number(
        &self,
        number: u64,
        with_transactions: bool,
    ) -> Result<BlockJson, AlmanacError> {
        let result = self
            .transport
            .request(
                "eth_getBlockByNumber",
                json!([u64_to_hex(number), with_transactions]),
            )
            .await?;
        if result.is_null() {
            return Err(AlmanacError::NotFound(format!("block {number} not found")));
        }
        serde_json::from_value(result)
            .map_err(|e| AlmanacError::Rpc(format!("failed to parse block {number}: {e}")))
    }

    pub async fn block_by_hash(&self, hash: &str) -> Result<BlockJson, AlmanacError> {
        let result = self
            .transport
            .request("eth_getBlockByHash", json!([hash, true]))
            .await?;
        if result.is_null() {
            return Err(AlmanacError::NotFound(format!("block {hash} not found")));
        }
        serde_json::from_value(result)
            .map_err(|e| AlmanacError::Rpc(format!("failed to parse block {hash}: {e}")))
    }

    pub async fn transaction_receipt(&self, hash: &str) -> Result<ReceiptJson, AlmanacError> {
        let result = self
            .transport
            .request("eth_getTransactionReceipt", json!([hash]))
            .await?;
        if result.is_null() {
            return Err(AlmanacError::NotFound(format!(
                "receipt for {hash} not found"
            )));
        }
        serde_json::from_value(result)
            .map_err(|e| AlmanacError::Rpc(format!("failed to parse receipt {hash}: {e}")))
    }

    pub async fn transaction_by_hash(&self, hash: &str) -> Result<TransactionJson, AlmanacError> {
        let result = self
            .transport
            .request("eth_getTransactionByHash", json!([hash]))
            .await?;
        if result.is_null() {
            return Err(AlmanacError::NotFound(format!(
                "transaction {hash} not found"
            )));
        }
        serde_json::from_value(result)
            .map_err(|e| AlmanacError::Rpc(format!("failed to parse transaction {hash}: {e}")))
    }

    /// Contract bytecode at the given block (latest when `None`).
    pub async fn get_code(
        &self,
        address: &str,
        block_number: Option<u64>,
    ) -> Result<Vec<u8>, AlmanacError> {
        let block = match block_number {
            Some(n) => n,
            None => self.latest_block_number().await?,
        };
        let result = self
            .transport
            .request("eth_getCode", json!([address, u64_to_hex(block)]))
            .await?;
        let hex = result
            .as_str()
            .ok_or_else(|| AlmanacError::Rpc(format!("invalid code response: {result}")))?;
        let digits = hex.strip_prefix("0x").unwrap_or(hex);
        hex::decode(digits).map_err(|e| AlmanacError::Hex(format!("invalid code hex: {e}")))
    }

    /// Fetch logs over `[from_block, to_block]`, adaptively narrowing the
    /// window whenever the provider reports too many results.
    ///
    /// The step starts at the full range and halves on every limit error.
    /// Once the step collapses below one block the offending window is
    /// skipped and scanning continues one block at a time. Any other
    /// error aborts the call. Results are concatenated in ascending
    /// block order.
    pub async fn filter_logs(&self, query: &FilterQuery) -> Result<Vec<EventJson>, AlmanacError> {
        let mut logs: Vec<EventJson> = Vec::new();
        let mut from = query.from_block;
        let to = query.to_block;
        if from > to {
            return Ok(logs);
        }
        let mut step = to - from;

        loop {
            let next = from.saturating_add(step).min(to);

            match self.get_logs(from, next, query).await {
                Ok(mut chunk) => {
                    logs.append(&mut chunk);
                    from = next + 1;
                    if from > to {
                        break;
                    }
                }
                Err(err) => {
                    if err.to_string().contains(TOO_MANY_RESULTS_MARKER) {
                        step /= 2;
                        if step < 1 {
                            // Window is already minimal: skip past it.
                            from = next + 1;
                            if from > to {
                                break;
                            }
                        }
                    } else {
                        return Err(err);
                    }
                }
            }
        }

        Ok(logs)
    }

    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        query: &FilterQuery,
    ) -> Result<Vec<EventJson>, AlmanacError> {
        let mut filter = json!({
            "fromBlock": u64_to_hex(from),
            "toBlock": u64_to_hex(to),
        });
        if !query.addresses.is_empty() {
            filter["address"] = json!(query.addresses);
        }
        if !query.topics.is_empty() {
            filter["topics"] = json!(query.topics);
        }

        let result = self
            .transport
            .request("eth_getLogs", Value::Array(vec![filter]))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| AlmanacError::Rpc(format!("failed to parse logs: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;

    /// Transport serving one synthetic log per block, rejecting windows
    /// wider than a threshold with the provider's limit message.
    struct WindowLimitTransport {
        max_window: u64,
        /// Blocks that report too many results even for a 1-block window.
        poisoned: HashSet<u64>,
    }

    fn window_of(params: &Value) -> (u64, u64) {
        let filter = &params[0];
        let from = hex_to_u64(filter["fromBlock"].as_str().unwrap()).unwrap();
        let to = hex_to_u64(filter["toBlock"].as_str().unwrap()).unwrap();
        (from, to)
    }

    #[async_trait]
    impl RpcTransport for WindowLimitTransport {
        async fn request(&self, method: &str, params: Value) -> Result<Value, AlmanacError> {
            assert_eq!(method, "eth_getLogs");
            let (from, to) = window_of(&params);
            if to - from + 1 > self.max_window || (from..=to).any(|b| self.poisoned.contains(&b)) {
                return Err(AlmanacError::Rpc(
                    "query returned more than 10000 results".to_string(),
                ));
            }
            let logs: Vec<Value> = (from..=to)
                .map(|b| {
                    json!({
                        "address": "0xc0ffee",
                        "topics": [],
                        "data": "0x",
                        "blockNumber": u64_to_hex(b),
                        "blockHash": "0xabc",
                        "transactionHash": format!("0xtx{b}"),
                        "transactionIndex": "0x0",
                        "logIndex": "0x0",
                        "removed": false,
                    })
                })
                .collect();
            Ok(Value::Array(logs))
        }
    }

    fn client_with(transport: WindowLimitTransport) -> EvmClient {
        EvmClient::new("ethereum", Arc::new(transport))
    }

    #[tokio::test]
    async fn test_filter_logs_halves_until_window_fits() {
        let client = client_with(WindowLimitTransport {
            max_window: 10,
            poisoned: HashSet::new(),
        });
        let logs = client
            .filter_logs(&FilterQuery {
                from_block: 0,
                to_block: 100,
                ..Default::default()
            })
            .await
            .unwrap();

        // Every block exactly once, ascending, no gaps.
        let numbers: Vec<u64> = logs
            .iter()
            .map(|l| hex_to_u64(&l.block_number).unwrap())
            .collect();
        assert_eq!(numbers.len(), 101);
        assert_eq!(numbers, (0..=100).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_filter_logs_skips_collapsed_window() {
        let client = client_with(WindowLimitTransport {
            max_window: u64::MAX,
            poisoned: HashSet::from([57]),
        });
        let logs = client
            .filter_logs(&FilterQuery {
                from_block: 50,
                to_block: 60,
                ..Default::default()
            })
            .await
            .unwrap();

        let numbers: HashSet<u64> = logs
            .iter()
            .map(|l| hex_to_u64(&l.block_number).unwrap())
            .collect();
        // The scanner never loops and never reports the poisoned block.
        assert!(!numbers.contains(&57));
        assert!(numbers.contains(&50));
        assert!(numbers.contains(&60));
        assert_eq!(numbers.len(), logs.len(), "no duplicates");
    }

    #[tokio::test]
    async fn test_filter_logs_propagates_other_errors() {
        struct FailingTransport;

        #[async_trait]
        impl RpcTransport for FailingTransport {
            async fn request(&self, _: &str, _: Value) -> Result<Value, AlmanacError> {
                Err(AlmanacError::Rpc("connection refused".to_string()))
            }
        }

        let client = EvmClient::new("ethereum", Arc::new(FailingTransport));
        let err = client
            .filter_logs(&FilterQuery {
                from_block: 0,
                to_block: 10,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_latest_block_number_normalizes_hex() {
        struct HeadTransport;

        #[async_trait]
        impl RpcTransport for HeadTransport {
            async fn request(&self, method: &str, _: Value) -> Result<Value, AlmanacError> {
                assert_eq!(method, "eth_blockNumber");
                Ok(json!("0x12d687"))
            }
        }

        let client = EvmClient::new("ethereum", Arc::new(HeadTransport));
        assert_eq!(client.latest_block_number().await.unwrap(), 0x12d687);
    }
}
