//! Decodes batched blocks into transaction and event labels.
//!
//! Blocks are processed by a bounded pool of workers; each worker walks
//! its block's transactions sequentially, resolving selectors in the ABI
//! map and decoding calldata and log data into JSON label payloads.
//! Worker errors are collected and returned as one aggregate error, in
//! which case no labels from the batch are surfaced.

use std::sync::Arc;

use alloy::dyn_abi::{DynSolValue, EventExt, JsonAbiExt};
use alloy::json_abi::{Event, Function};
use alloy::primitives::B256;
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use almanac_common::codec::opt_hex_to_u64;
use almanac_common::types::{
    EventLabel, RawTransaction, TransactionLabel, CRAWLER_LABEL, CRAWLER_RAW_LABEL,
};
use almanac_common::AlmanacError;

use crate::client::EvmClient;
use crate::proto::{Block, BlocksBatch, EventLog, Transaction};
use crate::registry::{AbiEntry, AbiMap, EMPTY_TOPIC_SELECTOR};

#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Emit a `RawTransaction` for every transaction seen, matched or not.
    pub add_raw_transactions: bool,
    /// Number of blocks decoded concurrently.
    pub threads: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            add_raw_transactions: false,
            threads: 4,
        }
    }
}

/// Decode every block of `batch` against `abi_map`.
///
/// Returns `(event_labels, transaction_labels, raw_transactions)`. If any
/// worker fails the aggregate error is returned instead and nothing from
/// the batch should be persisted.
pub async fn decode_batch_to_labels(
    client: &EvmClient,
    batch: &BlocksBatch,
    abi_map: &AbiMap,
    options: &DecodeOptions,
) -> Result<(Vec<EventLabel>, Vec<TransactionLabel>, Vec<RawTransaction>), AlmanacError> {
    let semaphore = Arc::new(Semaphore::new(options.threads.max(1)));
    let abi_map: Arc<AbiMap> = Arc::new(abi_map.clone());
    let outputs = Arc::new(Mutex::new((
        Vec::<EventLabel>::new(),
        Vec::<TransactionLabel>::new(),
        Vec::<RawTransaction>::new(),
    )));

    let mut tasks: JoinSet<Result<(), Vec<String>>> = JoinSet::new();

    for block in batch.blocks.iter().cloned() {
        let client = client.clone();
        let semaphore = Arc::clone(&semaphore);
        let abi_map = Arc::clone(&abi_map);
        let outputs = Arc::clone(&outputs);
        let add_raw = options.add_raw_transactions;

        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| vec![format!("block {}: semaphore closed: {e}", block.block_number)])?;

            let (events, tx_labels, raws, errors) =
                decode_block(&client, &block, &abi_map, add_raw).await;

            {
                let mut guard = outputs.lock().await;
                guard.0.extend(events);
                guard.1.extend(tx_labels);
                guard.2.extend(raws);
            }

            if errors.is_empty() {
                Ok(())
            } else {
                Err(errors)
            }
        });
    }

    let mut errors = Vec::new();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(mut block_errors)) => errors.append(&mut block_errors),
            Err(join_err) => errors.push(format!("decode worker panicked: {join_err}")),
        }
    }

    if !errors.is_empty() {
        return Err(AlmanacError::Workers(errors));
    }

    let outputs = Arc::try_unwrap(outputs)
        .map_err(|_| AlmanacError::Internal("label accumulator still shared".to_string()))?
        .into_inner();
    Ok(outputs)
}

/// Decode one block; transactions are handled sequentially. Returns the
/// labels produced plus any per-record errors.
async fn decode_block(
    client: &EvmClient,
    block: &Block,
    abi_map: &AbiMap,
    add_raw_transactions: bool,
) -> (
    Vec<EventLabel>,
    Vec<TransactionLabel>,
    Vec<RawTransaction>,
    Vec<String>,
) {
    let mut events = Vec::new();
    let mut tx_labels = Vec::new();
    let mut raws = Vec::new();
    let mut errors = Vec::new();

    for tx in &block.transactions {
        if add_raw_transactions {
            raws.push(raw_transaction(block, tx));
        }

        if tx.input.len() >= 10 {
            if let Some(entry) = abi_map
                .get(&tx.to_address)
                .and_then(|selectors| selectors.get(&tx.input[..10]))
            {
                match decode_transaction(client, block, tx, entry).await {
                    Ok(label) => tx_labels.push(label),
                    Err(e) => {
                        errors.push(format!("tx {}: {e}", tx.hash));
                        continue;
                    }
                }
            }
        }

        for log in &tx.logs {
            let topic_selector = log
                .topics
                .first()
                .map(String::as_str)
                .unwrap_or(EMPTY_TOPIC_SELECTOR);

            let Some(entry) = abi_map
                .get(&log.address)
                .and_then(|selectors| selectors.get(topic_selector))
            else {
                continue;
            };

            match decode_event(block, tx, log, topic_selector, entry) {
                Ok(label) => events.push(label),
                Err(e) => errors.push(format!("log {}#{}: {e}", log.transaction_hash, log.log_index)),
            }
        }
    }

    (events, tx_labels, raws, errors)
}

async fn decode_transaction(
    client: &EvmClient,
    block: &Block,
    tx: &Transaction,
    entry: &AbiEntry,
) -> Result<TransactionLabel, AlmanacError> {
    let selector = &tx.input[..10];
    let function = entry.function()?;

    let input_data = hex::decode(&tx.input[2..])
        .map_err(|e| AlmanacError::Hex(format!("invalid input data: {e}")))?;

    let mut label = CRAWLER_LABEL;
    let mut label_data = match decode_function_input(function, &input_data[4..]) {
        Ok(args) => args,
        Err(decode_err) => {
            tracing::debug!("Falling back to raw label for tx {}: {}", tx.hash, decode_err);
            label = CRAWLER_RAW_LABEL;
            raw_fallback_data(json!(tx.input), &entry.abi_json, selector, &decode_err)
        }
    };

    let receipt = client.transaction_receipt(&tx.hash).await?;
    let status = match opt_hex_to_u64(Some(receipt.status.as_str()))?.unwrap_or(0) {
        1 => 1,
        _ => 0,
    };
    label_data.insert("status".to_string(), json!(status));

    Ok(TransactionLabel {
        address: tx.to_address.clone(),
        block_number: tx.block_number,
        block_hash: tx.block_hash.clone(),
        caller_address: tx.from_address.clone(),
        label_name: entry.abi_name.clone(),
        label_type: "tx_call".to_string(),
        origin_address: tx.from_address.clone(),
        label: label.to_string(),
        transaction_hash: tx.hash.clone(),
        label_data: Value::Object(label_data),
        block_timestamp: block.timestamp,
    })
}

fn decode_event(
    block: &Block,
    tx: &Transaction,
    log: &EventLog,
    topic_selector: &str,
    entry: &AbiEntry,
) -> Result<EventLabel, AlmanacError> {
    let event = entry.event()?;

    let mut label = CRAWLER_LABEL;
    let label_data = match decode_log_data(event, &log.topics, &log.data) {
        Ok(args) => args,
        Err(decode_err) => {
            tracing::debug!(
                "Falling back to raw label for log {}#{}: {}",
                log.transaction_hash,
                log.log_index,
                decode_err
            );
            label = CRAWLER_RAW_LABEL;
            let input_raw = json!({
                "address": log.address,
                "topics": log.topics,
                "data": log.data,
            });
            raw_fallback_data(input_raw, &entry.abi_json, topic_selector, &decode_err)
        }
    };

    Ok(EventLabel {
        label: label.to_string(),
        label_name: entry.abi_name.clone(),
        label_type: "event".to_string(),
        block_number: log.block_number,
        block_hash: log.block_hash.clone(),
        address: log.address.clone(),
        origin_address: tx.from_address.clone(),
        transaction_hash: log.transaction_hash.clone(),
        label_data: Value::Object(label_data),
        block_timestamp: block.timestamp,
        log_index: log.log_index,
    })
}

fn raw_fallback_data(
    input_raw: Value,
    abi_json: &str,
    selector: &str,
    error: &str,
) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("input_raw".to_string(), input_raw);
    data.insert("abi".to_string(), json!(abi_json));
    data.insert("selector".to_string(), json!(selector));
    data.insert("error".to_string(), json!(error));
    data
}

/// Decode calldata arguments (selector already stripped) into a map of
/// argument name to JSON value.
fn decode_function_input(function: &Function, data: &[u8]) -> Result<Map<String, Value>, String> {
    let values = function
        .abi_decode_input(data)
        .map_err(|e| e.to_string())?;

    let mut args = Map::new();
    for (index, (param, value)) in function.inputs.iter().zip(values.iter()).enumerate() {
        let name = if param.name.is_empty() {
            format!("arg{index}")
        } else {
            param.name.clone()
        };
        args.insert(name, sol_value_to_json(value));
    }
    Ok(args)
}

/// Decode an event's topics and data into a map of parameter name to
/// JSON value.
fn decode_log_data(event: &Event, topics: &[String], data: &str) -> Result<Map<String, Value>, String> {
    let topic_hashes: Vec<B256> = topics
        .iter()
        .map(|t| t.parse::<B256>().map_err(|e| format!("invalid topic {t}: {e}")))
        .collect::<Result<_, _>>()?;

    let data_bytes = hex::decode(data.strip_prefix("0x").unwrap_or(data))
        .map_err(|e| format!("invalid log data: {e}"))?;

    let decoded = event
        .decode_log_parts(topic_hashes, &data_bytes)
        .map_err(|e| e.to_string())?;

    let mut args = Map::new();
    let mut indexed = decoded.indexed.iter();
    let mut body = decoded.body.iter();

    for (index, param) in event.inputs.iter().enumerate() {
        let value = if param.indexed {
            indexed.next()
        } else {
            body.next()
        };
        let Some(value) = value else {
            return Err(format!("missing decoded value for parameter {index}"));
        };
        let name = if param.name.is_empty() {
            format!("arg{index}")
        } else {
            param.name.clone()
        };
        args.insert(name, sol_value_to_json(value));
    }
    Ok(args)
}

/// Render a decoded Solidity value as JSON. Quantities become decimal
/// strings so precision survives the JSONB round trip; byte values
/// become `0x` hex.
fn sol_value_to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Address(address) => json!(format!("0x{}", hex::encode(address.as_slice()))),
        DynSolValue::Bool(b) => json!(b),
        DynSolValue::Int(i, _) => json!(i.to_string()),
        DynSolValue::Uint(u, _) => json!(u.to_string()),
        DynSolValue::FixedBytes(word, size) => {
            json!(format!("0x{}", hex::encode(&word.as_slice()[..*size])))
        }
        DynSolValue::Bytes(bytes) => json!(format!("0x{}", hex::encode(bytes))),
        DynSolValue::String(s) => json!(s),
        DynSolValue::Function(f) => json!(format!("0x{}", hex::encode(f.as_slice()))),
        DynSolValue::Array(values) | DynSolValue::FixedArray(values) | DynSolValue::Tuple(values) => {
            Value::Array(values.iter().map(sol_value_to_json).collect())
        }
        // Feature-gated variants (e.g. EIP-712 structs) degrade to debug text.
        #[allow(unreachable_patterns)]
        other => json!(format!("{other:?}")),
    }
}

fn raw_transaction(block: &Block, tx: &Transaction) -> RawTransaction {
    RawTransaction {
        hash: tx.hash.clone(),
        block_hash: tx.block_hash.clone(),
        from_address: tx.from_address.clone(),
        to_address: tx.to_address.clone(),
        input: tx.input.clone(),
        gas: tx.gas.clone(),
        gas_price: tx.gas_price.clone(),
        nonce: tx.nonce.clone(),
        value: tx.value.clone(),
        max_fee_per_gas: tx.max_fee_per_gas.clone(),
        max_priority_fee_per_gas: tx.max_priority_fee_per_gas.clone(),
        block_timestamp: block.timestamp,
        block_number: block.block_number,
        transaction_index: tx.transaction_index,
        transaction_type: tx.transaction_type,
        l1_block_number: block.l1_block_number,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    use crate::rpc::RpcTransport;

    const TRANSFER_FN_ABI: &str = r#"[{
        "type": "function",
        "name": "transfer",
        "stateMutability": "nonpayable",
        "inputs": [
            {"name": "to", "type": "address"},
            {"name": "amount", "type": "uint256"}
        ],
        "outputs": [{"name": "", "type": "bool"}]
    }]"#;

    const TRANSFER_EVENT_ABI: &str = r#"[{
        "type": "event",
        "name": "Transfer",
        "anonymous": false,
        "inputs": [
            {"name": "from", "type": "address", "indexed": true},
            {"name": "to", "type": "address", "indexed": true},
            {"name": "value", "type": "uint256", "indexed": false}
        ]
    }]"#;

    const TRANSFER_TOPIC: &str =
        "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

    const TOKEN: &str = "0x2222222222222222222222222222222222222222";
    const RECIPIENT: &str = "0x1111111111111111111111111111111111111111";
    const SENDER: &str = "0x3333333333333333333333333333333333333333";

    struct ReceiptTransport {
        status: &'static str,
    }

    #[async_trait]
    impl RpcTransport for ReceiptTransport {
        async fn request(&self, method: &str, params: Value) -> Result<Value, AlmanacError> {
            assert_eq!(method, "eth_getTransactionReceipt");
            Ok(json!({
                "status": self.status,
                "transactionHash": params[0],
                "logs": [],
            }))
        }
    }

    struct NoReceiptTransport;

    #[async_trait]
    impl RpcTransport for NoReceiptTransport {
        async fn request(&self, _: &str, _: Value) -> Result<Value, AlmanacError> {
            Ok(Value::Null)
        }
    }

    fn pad_address(address: &str) -> String {
        format!("{:0>64}", address.trim_start_matches("0x"))
    }

    fn pad_u64(value: u64) -> String {
        format!("{value:0>64x}")
    }

    fn transfer_calldata(to: &str, amount: u64) -> String {
        format!("0xa9059cbb{}{}", pad_address(to), pad_u64(amount))
    }

    fn function_abi_map() -> AbiMap {
        let entry = Arc::new(AbiEntry::new(
            TRANSFER_FN_ABI.to_string(),
            "transfer".to_string(),
            "function".to_string(),
        ));
        let mut selectors = HashMap::new();
        selectors.insert("0xa9059cbb".to_string(), entry);
        let mut map = AbiMap::new();
        map.insert(TOKEN.to_string(), selectors);
        map
    }

    fn event_abi_map() -> AbiMap {
        let entry = Arc::new(AbiEntry::new(
            TRANSFER_EVENT_ABI.to_string(),
            "Transfer".to_string(),
            "event".to_string(),
        ));
        let mut selectors = HashMap::new();
        selectors.insert(TRANSFER_TOPIC.to_string(), entry);
        let mut map = AbiMap::new();
        map.insert(TOKEN.to_string(), selectors);
        map
    }

    fn batch_with_transaction(input: &str) -> BlocksBatch {
        BlocksBatch {
            blocks: vec![Block {
                block_number: 100,
                hash: "0xblock".to_string(),
                timestamp: 1_700_000_000,
                transactions: vec![Transaction {
                    hash: "0xtx1".to_string(),
                    block_number: 100,
                    block_hash: "0xblock".to_string(),
                    from_address: SENDER.to_string(),
                    to_address: TOKEN.to_string(),
                    input: input.to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            seer_version: "test".to_string(),
        }
    }

    fn client(transport: impl RpcTransport + 'static) -> EvmClient {
        EvmClient::new("ethereum", Arc::new(transport))
    }

    #[tokio::test]
    async fn test_decode_transfer_call() {
        let batch = batch_with_transaction(&transfer_calldata(RECIPIENT, 1000));
        let client = client(ReceiptTransport { status: "0x1" });

        let (events, tx_labels, raws) = decode_batch_to_labels(
            &client,
            &batch,
            &function_abi_map(),
            &DecodeOptions::default(),
        )
        .await
        .unwrap();

        assert!(events.is_empty());
        assert!(raws.is_empty());
        assert_eq!(tx_labels.len(), 1);

        let label = &tx_labels[0];
        assert_eq!(label.label, CRAWLER_LABEL);
        assert_eq!(label.label_type, "tx_call");
        assert_eq!(label.label_name, "transfer");
        assert_eq!(label.address, TOKEN);
        assert_eq!(label.caller_address, SENDER);
        assert_eq!(label.label_data["to"], json!(RECIPIENT));
        assert_eq!(label.label_data["amount"], json!("1000"));
        assert_eq!(label.label_data["status"], json!(1));
    }

    #[tokio::test]
    async fn test_decode_transfer_call_failed_receipt() {
        let batch = batch_with_transaction(&transfer_calldata(RECIPIENT, 1000));
        let client = client(ReceiptTransport { status: "0x0" });

        let (_, tx_labels, _) = decode_batch_to_labels(
            &client,
            &batch,
            &function_abi_map(),
            &DecodeOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(tx_labels[0].label_data["status"], json!(0));
        assert_eq!(tx_labels[0].label_data["to"], json!(RECIPIENT));
    }

    #[tokio::test]
    async fn test_plain_value_transfer_is_skipped() {
        let batch = batch_with_transaction("0x");
        let client = client(NoReceiptTransport);

        let (events, tx_labels, raws) = decode_batch_to_labels(
            &client,
            &batch,
            &function_abi_map(),
            &DecodeOptions::default(),
        )
        .await
        .unwrap();

        assert!(events.is_empty());
        assert!(tx_labels.is_empty());
        assert!(raws.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_input_falls_back_to_raw_label() {
        // Valid selector, truncated arguments.
        let batch = batch_with_transaction("0xa9059cbb1234");
        let client = client(ReceiptTransport { status: "0x1" });

        let (_, tx_labels, _) = decode_batch_to_labels(
            &client,
            &batch,
            &function_abi_map(),
            &DecodeOptions::default(),
        )
        .await
        .unwrap();

        let label = &tx_labels[0];
        assert_eq!(label.label, CRAWLER_RAW_LABEL);
        for key in ["input_raw", "abi", "selector", "error"] {
            assert!(label.label_data.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(label.label_data["selector"], json!("0xa9059cbb"));
        assert_eq!(label.label_data["status"], json!(1));
    }

    #[tokio::test]
    async fn test_decode_transfer_event() {
        let mut batch = batch_with_transaction("0x");
        batch.blocks[0].transactions[0].logs = vec![EventLog {
            address: TOKEN.to_string(),
            topics: vec![
                TRANSFER_TOPIC.to_string(),
                format!("0x{}", pad_address(SENDER)),
                format!("0x{}", pad_address(RECIPIENT)),
            ],
            data: format!("0x{}", pad_u64(5000)),
            block_number: 100,
            transaction_hash: "0xtx1".to_string(),
            log_index: 3,
            block_hash: "0xblock".to_string(),
            ..Default::default()
        }];
        let client = client(NoReceiptTransport);

        let (events, tx_labels, _) =
            decode_batch_to_labels(&client, &batch, &event_abi_map(), &DecodeOptions::default())
                .await
                .unwrap();

        assert!(tx_labels.is_empty());
        assert_eq!(events.len(), 1);

        let event = &events[0];
        assert_eq!(event.label, CRAWLER_LABEL);
        assert_eq!(event.label_type, "event");
        assert_eq!(event.label_name, "Transfer");
        assert_eq!(event.log_index, 3);
        assert_eq!(event.origin_address, SENDER);
        assert_eq!(event.label_data["from"], json!(SENDER));
        assert_eq!(event.label_data["to"], json!(RECIPIENT));
        assert_eq!(event.label_data["value"], json!("5000"));
    }

    #[tokio::test]
    async fn test_receipt_failure_aggregates_and_suppresses_labels() {
        let batch = batch_with_transaction(&transfer_calldata(RECIPIENT, 1000));
        let client = client(NoReceiptTransport);

        let err = decode_batch_to_labels(
            &client,
            &batch,
            &function_abi_map(),
            &DecodeOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(err.is_aggregate());
        assert!(err.to_string().contains("0xtx1"));
    }

    #[tokio::test]
    async fn test_raw_transactions_emitted_for_every_transaction() {
        let batch = batch_with_transaction("0x");
        let client = client(NoReceiptTransport);

        let options = DecodeOptions {
            add_raw_transactions: true,
            ..Default::default()
        };
        let (_, _, raws) = decode_batch_to_labels(&client, &batch, &AbiMap::new(), &options)
            .await
            .unwrap();

        assert_eq!(raws.len(), 1);
        assert_eq!(raws[0].hash, "0xtx1");
        assert_eq!(raws[0].block_number, 100);
    }
}
