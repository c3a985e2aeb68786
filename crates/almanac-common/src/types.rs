use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Label value for successfully decoded calls and events.
pub const CRAWLER_LABEL: &str = "seer";

/// Label value for records whose ABI decode failed; the raw payload is
/// preserved in `label_data` so the decode can be replayed later.
pub const CRAWLER_RAW_LABEL: &str = "seer-raw";

// =====================
// JSON-RPC wire types
// =====================
//
// All numerics arrive as 0x-prefixed hex strings and are kept that way
// here; normalization happens at the protobuf conversion boundary.

/// Block as returned by `eth_getBlockByNumber` / `eth_getBlockByHash`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockJson {
    #[serde(rename = "number", default)]
    pub block_number: String,
    #[serde(default)]
    pub hash: String,
    #[serde(rename = "parentHash", default)]
    pub parent_hash: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub difficulty: String,
    #[serde(rename = "totalDifficulty", default)]
    pub total_difficulty: String,
    #[serde(rename = "extraData", default)]
    pub extra_data: String,
    #[serde(rename = "gasLimit", default)]
    pub gas_limit: String,
    #[serde(rename = "gasUsed", default)]
    pub gas_used: String,
    #[serde(rename = "baseFeePerGas", default)]
    pub base_fee_per_gas: String,
    #[serde(rename = "logsBloom", default)]
    pub logs_bloom: String,
    #[serde(default)]
    pub miner: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(rename = "receiptsRoot", default)]
    pub receipts_root: String,
    #[serde(rename = "sha3Uncles", default)]
    pub sha3_uncles: String,
    #[serde(default)]
    pub size: String,
    #[serde(rename = "stateRoot", default)]
    pub state_root: String,
    #[serde(rename = "transactionsRoot", default)]
    pub transactions_root: String,
    /// Present only on L2 chains that anchor to an L1 block.
    #[serde(rename = "l1BlockNumber", default)]
    pub l1_block_number: Option<String>,
    #[serde(default)]
    pub transactions: Vec<TransactionJson>,
}

/// Transaction as embedded in a block response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionJson {
    #[serde(default)]
    pub hash: String,
    #[serde(rename = "blockHash", default)]
    pub block_hash: String,
    #[serde(rename = "blockNumber", default)]
    pub block_number: String,
    #[serde(rename = "from", default)]
    pub from_address: String,
    #[serde(rename = "to", default)]
    pub to_address: String,
    #[serde(default)]
    pub gas: String,
    #[serde(rename = "gasPrice", default)]
    pub gas_price: String,
    #[serde(rename = "maxFeePerGas", default)]
    pub max_fee_per_gas: String,
    #[serde(rename = "maxPriorityFeePerGas", default)]
    pub max_priority_fee_per_gas: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(rename = "transactionIndex", default)]
    pub transaction_index: String,
    #[serde(rename = "type", default)]
    pub transaction_type: String,
    #[serde(default)]
    pub value: String,
    #[serde(rename = "chainId", default)]
    pub chain_id: String,
    #[serde(default)]
    pub v: String,
    #[serde(default)]
    pub r: String,
    #[serde(default)]
    pub s: String,
    #[serde(rename = "yParity", default)]
    pub y_parity: String,
    #[serde(rename = "accessList", default)]
    pub access_list: Vec<AccessListJson>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessListJson {
    #[serde(default)]
    pub address: String,
    #[serde(rename = "storageKeys", default)]
    pub storage_keys: Vec<String>,
}

/// Event log as returned by `eth_getLogs` and in receipts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventJson {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    #[serde(rename = "blockNumber", default)]
    pub block_number: String,
    #[serde(rename = "blockHash", default)]
    pub block_hash: String,
    #[serde(rename = "transactionHash", default)]
    pub transaction_hash: String,
    #[serde(rename = "transactionIndex", default)]
    pub transaction_index: String,
    #[serde(rename = "logIndex", default)]
    pub log_index: String,
    #[serde(default)]
    pub removed: bool,
}

/// Receipt as returned by `eth_getTransactionReceipt`; only the fields
/// the decoder needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiptJson {
    #[serde(default)]
    pub status: String,
    #[serde(rename = "transactionHash", default)]
    pub transaction_hash: String,
    #[serde(default)]
    pub logs: Vec<EventJson>,
}

// =====================
// Index and label types
// =====================

/// Persisted projection of a block: enough to locate its batch artifact
/// in the object store and walk adjacency by `path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockIndex {
    pub chain: String,
    pub block_number: u64,
    pub block_hash: String,
    pub block_timestamp: u64,
    pub parent_hash: String,
    /// Ordinal of the block inside its batch artifact.
    pub row_id: u64,
    /// Object-store locator of the containing batch; assigned by the
    /// caller once the artifact is written.
    pub path: String,
    pub l1_block_number: Option<u64>,
}

/// Decoded transaction call destined for a `<chain>_labels` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionLabel {
    pub address: String,
    pub block_number: u64,
    pub block_hash: String,
    pub caller_address: String,
    pub label_name: String,
    pub label_type: String,
    pub origin_address: String,
    pub label: String,
    pub transaction_hash: String,
    pub label_data: serde_json::Value,
    pub block_timestamp: u64,
}

/// Decoded event emission destined for a `<chain>_labels` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLabel {
    pub label: String,
    pub label_name: String,
    pub label_type: String,
    pub block_number: u64,
    pub block_hash: String,
    pub address: String,
    pub origin_address: String,
    pub transaction_hash: String,
    pub label_data: serde_json::Value,
    pub block_timestamp: u64,
    pub log_index: u64,
}

/// Raw transaction mirror for per-customer transaction tables. Numeric
/// fields stay hex-encoded until the database writer converts them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransaction {
    pub hash: String,
    pub block_hash: String,
    pub from_address: String,
    pub to_address: String,
    pub input: String,
    pub gas: String,
    pub gas_price: String,
    pub nonce: String,
    pub value: String,
    pub max_fee_per_gas: String,
    pub max_priority_fee_per_gas: String,
    pub block_timestamp: u64,
    pub block_number: u64,
    pub transaction_index: u64,
    pub transaction_type: u64,
    pub l1_block_number: Option<u64>,
}

// =====================
// ABI job types
// =====================

/// Row of the `abi_jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AbiJob {
    pub id: Uuid,
    pub address: Vec<u8>,
    pub user_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub abi_selector: String,
    pub chain: String,
    pub abi_name: String,
    pub status: String,
    pub historical_crawl_status: String,
    pub progress: i32,
    pub moonworm_task_pickedup: bool,
    /// ABI JSON wrapped in `[...]` so it parses as a full interface.
    pub abi: String,
    pub abi_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deployment_block_number: Option<i64>,
}

/// Deployment block and job ids for one contract address.
#[derive(Debug, Clone, Default)]
pub struct AbiJobsDeployInfo {
    pub deployed_block_number: u64,
    pub ids: Vec<Uuid>,
}
