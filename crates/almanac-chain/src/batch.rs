//! Assembles fetched blocks and logs into a batch artifact.
//!
//! The batch is the unit of object storage; the index rows are the unit
//! of addressability in the database. Incoming blocks may arrive in any
//! order (the parallel fetcher gives no guarantee) and are re-keyed by
//! block number here.

use std::collections::HashMap;

use prost::Message;

use almanac_common::chains::is_chain_with_l1;
use almanac_common::types::{BlockIndex, BlockJson, EventJson};
use almanac_common::AlmanacError;

use crate::proto::{block_from_json, event_from_json, BlocksBatch, CRAWLER_VERSION};

/// A serialized-ready batch plus its database projection.
#[derive(Debug, Clone)]
pub struct BatchArtifact {
    pub batch: BlocksBatch,
    pub indexes: Vec<BlockIndex>,
    /// Byte size of the serialized batch.
    pub size: u64,
}

/// Build the batch artifact for a fetched range.
///
/// Event logs are attached to their transactions by transaction hash;
/// logs whose transaction is not in the range are dropped. The `path` of
/// each index row is left empty for the caller to assign once the
/// artifact is written to the object store.
pub fn build_batch(
    chain: &str,
    blocks: &[BlockJson],
    events: &[EventJson],
) -> Result<BatchArtifact, AlmanacError> {
    let mut proto_blocks = Vec::with_capacity(blocks.len());
    for block in blocks {
        proto_blocks.push(block_from_json(block)?);
    }
    proto_blocks.sort_by_key(|b| b.block_number);

    // Route events to their transactions.
    let mut events_by_tx: HashMap<&str, Vec<&EventJson>> = HashMap::new();
    for event in events {
        events_by_tx
            .entry(event.transaction_hash.as_str())
            .or_default()
            .push(event);
    }

    let with_l1 = is_chain_with_l1(chain);
    let mut indexes = Vec::with_capacity(proto_blocks.len());

    for (row_id, block) in proto_blocks.iter_mut().enumerate() {
        for tx in &mut block.transactions {
            if let Some(tx_events) = events_by_tx.get(tx.hash.as_str()) {
                for event in tx_events {
                    tx.logs.push(event_from_json(event)?);
                }
            }
        }

        indexes.push(BlockIndex {
            chain: chain.to_string(),
            block_number: block.block_number,
            block_hash: block.hash.clone(),
            block_timestamp: block.timestamp,
            parent_hash: block.parent_hash.clone(),
            row_id: row_id as u64,
            path: String::new(),
            l1_block_number: if with_l1 { block.l1_block_number } else { None },
        });
    }

    let batch = BlocksBatch {
        blocks: proto_blocks,
        seer_version: CRAWLER_VERSION.to_string(),
    };
    let size = batch.encoded_len() as u64;

    Ok(BatchArtifact {
        batch,
        indexes,
        size,
    })
}

/// Object-store key for a batch artifact covering `[from, to]`.
pub fn batch_key(chain: &str, from: u64, to: u64) -> String {
    format!("{chain}/{from:0>12}-{to:0>12}.pb")
}
