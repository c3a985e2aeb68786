//! Chain-agnostic protobuf messages for the block batch artifact.
//!
//! One message set serves every chain; numerics are stored post
//! hex-decoding as uint64, large quantities (gas, value, fees) keep
//! their hex-string form so no precision is lost.

use base64::Engine;
use prost::Message;

use almanac_common::codec::{hex_to_u64, opt_hex_to_u64};
use almanac_common::types::{AccessListJson, BlockJson, EventJson, TransactionJson};
use almanac_common::AlmanacError;

/// Version string embedded in every batch artifact.
pub const CRAWLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, PartialEq, Message)]
pub struct EventLog {
    #[prost(string, tag = "1")]
    pub address: String,
    #[prost(string, repeated, tag = "2")]
    pub topics: Vec<String>,
    #[prost(string, tag = "3")]
    pub data: String,
    #[prost(uint64, tag = "4")]
    pub block_number: u64,
    #[prost(string, tag = "5")]
    pub transaction_hash: String,
    #[prost(uint64, tag = "6")]
    pub log_index: u64,
    #[prost(string, tag = "7")]
    pub block_hash: String,
    #[prost(bool, tag = "8")]
    pub removed: bool,
    #[prost(uint64, tag = "9")]
    pub transaction_index: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct TransactionAccessList {
    #[prost(string, tag = "1")]
    pub address: String,
    #[prost(string, repeated, tag = "2")]
    pub storage_keys: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Transaction {
    #[prost(string, tag = "1")]
    pub hash: String,
    #[prost(uint64, tag = "2")]
    pub block_number: u64,
    #[prost(string, tag = "3")]
    pub block_hash: String,
    #[prost(string, tag = "4")]
    pub from_address: String,
    #[prost(string, tag = "5")]
    pub to_address: String,
    #[prost(string, tag = "6")]
    pub gas: String,
    #[prost(string, tag = "7")]
    pub gas_price: String,
    #[prost(string, tag = "8")]
    pub max_fee_per_gas: String,
    #[prost(string, tag = "9")]
    pub max_priority_fee_per_gas: String,
    #[prost(string, tag = "10")]
    pub input: String,
    #[prost(string, tag = "11")]
    pub nonce: String,
    #[prost(uint64, tag = "12")]
    pub transaction_index: u64,
    #[prost(uint64, tag = "13")]
    pub transaction_type: u64,
    #[prost(string, tag = "14")]
    pub value: String,
    #[prost(uint64, tag = "15")]
    pub indexed_at: u64,
    #[prost(uint64, tag = "16")]
    pub block_timestamp: u64,
    #[prost(string, tag = "17")]
    pub chain_id: String,
    #[prost(string, tag = "18")]
    pub v: String,
    #[prost(string, tag = "19")]
    pub r: String,
    #[prost(string, tag = "20")]
    pub s: String,
    #[prost(message, repeated, tag = "21")]
    pub access_list: Vec<TransactionAccessList>,
    #[prost(string, tag = "22")]
    pub y_parity: String,
    #[prost(message, repeated, tag = "23")]
    pub logs: Vec<EventLog>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Block {
    #[prost(uint64, tag = "1")]
    pub block_number: u64,
    #[prost(uint64, tag = "2")]
    pub difficulty: u64,
    #[prost(string, tag = "3")]
    pub extra_data: String,
    #[prost(uint64, tag = "4")]
    pub gas_limit: u64,
    #[prost(uint64, tag = "5")]
    pub gas_used: u64,
    #[prost(string, tag = "6")]
    pub base_fee_per_gas: String,
    #[prost(string, tag = "7")]
    pub hash: String,
    #[prost(string, tag = "8")]
    pub logs_bloom: String,
    #[prost(string, tag = "9")]
    pub miner: String,
    #[prost(string, tag = "10")]
    pub nonce: String,
    #[prost(string, tag = "11")]
    pub parent_hash: String,
    #[prost(string, tag = "12")]
    pub receipts_root: String,
    #[prost(string, tag = "13")]
    pub sha3_uncles: String,
    #[prost(uint64, tag = "14")]
    pub size: u64,
    #[prost(string, tag = "15")]
    pub state_root: String,
    #[prost(uint64, tag = "16")]
    pub timestamp: u64,
    #[prost(string, tag = "17")]
    pub total_difficulty: String,
    #[prost(string, tag = "18")]
    pub transactions_root: String,
    #[prost(uint64, tag = "19")]
    pub indexed_at: u64,
    #[prost(uint64, optional, tag = "20")]
    pub l1_block_number: Option<u64>,
    #[prost(message, repeated, tag = "21")]
    pub transactions: Vec<Transaction>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BlocksBatch {
    #[prost(message, repeated, tag = "1")]
    pub blocks: Vec<Block>,
    #[prost(string, tag = "2")]
    pub seer_version: String,
}

/// Convert a wire block (hex strings) into its protobuf form. The
/// nested transactions are converted too, carrying the block timestamp.
pub fn block_from_json(block: &BlockJson) -> Result<Block, AlmanacError> {
    let timestamp = hex_to_u64(&block.timestamp)?;

    let mut transactions = Vec::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        transactions.push(transaction_from_json(tx, timestamp)?);
    }

    Ok(Block {
        block_number: hex_to_u64(&block.block_number)?,
        difficulty: opt_hex_to_u64(Some(block.difficulty.as_str()))?.unwrap_or(0),
        extra_data: block.extra_data.clone(),
        gas_limit: hex_to_u64(&block.gas_limit)?,
        gas_used: hex_to_u64(&block.gas_used)?,
        base_fee_per_gas: block.base_fee_per_gas.clone(),
        hash: block.hash.clone(),
        logs_bloom: block.logs_bloom.clone(),
        miner: block.miner.clone(),
        nonce: block.nonce.clone(),
        parent_hash: block.parent_hash.clone(),
        receipts_root: block.receipts_root.clone(),
        sha3_uncles: block.sha3_uncles.clone(),
        size: opt_hex_to_u64(Some(block.size.as_str()))?.unwrap_or(0),
        state_root: block.state_root.clone(),
        timestamp,
        total_difficulty: block.total_difficulty.clone(),
        transactions_root: block.transactions_root.clone(),
        indexed_at: 0,
        l1_block_number: opt_hex_to_u64(block.l1_block_number.as_deref())?,
        transactions,
    })
}

pub fn transaction_from_json(
    tx: &TransactionJson,
    block_timestamp: u64,
) -> Result<Transaction, AlmanacError> {
    Ok(Transaction {
        hash: tx.hash.clone(),
        block_number: hex_to_u64(&tx.block_number)?,
        block_hash: tx.block_hash.clone(),
        from_address: tx.from_address.clone(),
        to_address: tx.to_address.clone(),
        gas: tx.gas.clone(),
        gas_price: tx.gas_price.clone(),
        max_fee_per_gas: tx.max_fee_per_gas.clone(),
        max_priority_fee_per_gas: tx.max_priority_fee_per_gas.clone(),
        input: tx.input.clone(),
        nonce: tx.nonce.clone(),
        transaction_index: opt_hex_to_u64(Some(tx.transaction_index.as_str()))?.unwrap_or(0),
        transaction_type: opt_hex_to_u64(Some(tx.transaction_type.as_str()))?.unwrap_or(0),
        value: tx.value.clone(),
        indexed_at: 0,
        block_timestamp,
        chain_id: tx.chain_id.clone(),
        v: tx.v.clone(),
        r: tx.r.clone(),
        s: tx.s.clone(),
        access_list: tx.access_list.iter().map(access_list_from_json).collect(),
        y_parity: tx.y_parity.clone(),
        logs: Vec::new(),
    })
}

fn access_list_from_json(al: &AccessListJson) -> TransactionAccessList {
    TransactionAccessList {
        address: al.address.clone(),
        storage_keys: al.storage_keys.clone(),
    }
}

pub fn event_from_json(event: &EventJson) -> Result<EventLog, AlmanacError> {
    Ok(EventLog {
        address: event.address.clone(),
        topics: event.topics.clone(),
        data: event.data.clone(),
        block_number: hex_to_u64(&event.block_number)?,
        transaction_hash: event.transaction_hash.clone(),
        log_index: hex_to_u64(&event.log_index)?,
        block_hash: event.block_hash.clone(),
        removed: event.removed,
        transaction_index: opt_hex_to_u64(Some(event.transaction_index.as_str()))?.unwrap_or(0),
    })
}

/// Decode a batch artifact from raw protobuf bytes.
pub fn decode_batch(data: &[u8]) -> Result<BlocksBatch, AlmanacError> {
    BlocksBatch::decode(data).map_err(|e| AlmanacError::Decode(format!("invalid batch: {e}")))
}

/// Decode a batch artifact from base64-of-protobuf.
pub fn decode_batch_base64(data: &str) -> Result<BlocksBatch, AlmanacError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| AlmanacError::Decode(format!("invalid base64: {e}")))?;
    decode_batch(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> BlockJson {
        BlockJson {
            block_number: "0x64".to_string(),
            hash: "0xaaa".to_string(),
            parent_hash: "0xbbb".to_string(),
            timestamp: "0x65f0c0de".to_string(),
            gas_limit: "0x1c9c380".to_string(),
            gas_used: "0x5208".to_string(),
            difficulty: "0x0".to_string(),
            size: "0x220".to_string(),
            transactions: vec![TransactionJson {
                hash: "0xt1".to_string(),
                block_number: "0x64".to_string(),
                block_hash: "0xaaa".to_string(),
                from_address: "0xf00d".to_string(),
                to_address: "0xbeef".to_string(),
                gas: "0x5208".to_string(),
                value: "0x0".to_string(),
                transaction_index: "0x0".to_string(),
                transaction_type: "0x2".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_block_from_json_normalizes_hex() {
        let block = block_from_json(&sample_block()).unwrap();
        assert_eq!(block.block_number, 100);
        assert_eq!(block.gas_used, 0x5208);
        assert_eq!(block.timestamp, 0x65f0c0de);
        assert_eq!(block.l1_block_number, None);
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.transactions[0].block_timestamp, 0x65f0c0de);
        assert_eq!(block.transactions[0].transaction_type, 2);
    }

    #[test]
    fn test_block_from_json_l1_anchor() {
        let mut json = sample_block();
        json.l1_block_number = Some("0x12d687".to_string());
        let block = block_from_json(&json).unwrap();
        assert_eq!(block.l1_block_number, Some(0x12d687));
    }

    #[test]
    fn test_block_from_json_rejects_bad_hex() {
        let mut json = sample_block();
        json.timestamp = "not-hex".to_string();
        assert!(block_from_json(&json).is_err());
    }

    #[test]
    fn test_batch_decode_accepts_raw_and_base64() {
        let batch = BlocksBatch {
            blocks: vec![Block {
                block_number: 7,
                ..Default::default()
            }],
            seer_version: CRAWLER_VERSION.to_string(),
        };
        let raw = batch.encode_to_vec();

        let decoded = decode_batch(&raw).unwrap();
        assert_eq!(decoded.blocks[0].block_number, 7);

        let b64 = base64::engine::general_purpose::STANDARD.encode(&raw);
        let decoded = decode_batch_base64(&b64).unwrap();
        assert_eq!(decoded.seer_version, CRAWLER_VERSION);
    }
}
