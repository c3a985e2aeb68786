//! Postgres persistence layer.
//!
//! Bulk writes go through a columnar insert protocol: every column is
//! passed as one array parameter and expanded server-side with
//! `INSERT INTO t (...) SELECT * FROM unnest($1::T1[], ...)`. A batch of
//! any size costs one parameter per column instead of one per value, so
//! the statement never trips the parameter-count limit.
//! <https://klotzandrew.com/blog/postgres-passing-65535-parameter-limit/>

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{NaiveDateTime, Utc};
use serde::Deserialize;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use uuid::Uuid;

use almanac_chain::registry::{AbiEntry, AbiMap, CustomerUpdates};
use almanac_common::chains::{
    blocks_table_name, customer_transactions_table_name, is_chain_with_l1, labels_table_name,
    transactions_table_name,
};
use almanac_common::codec::{decode_address, hex_to_decimal};
use almanac_common::types::{
    AbiJob, BlockIndex, EventLabel, RawTransaction, TransactionLabel,
};
use almanac_common::AlmanacError;

pub struct Database {
    pool: PgPool,
}

// ---------------------------------------------------------------------------
// Columnar insert protocol
// ---------------------------------------------------------------------------

/// One column of a bulk insert: parallel values, one per row. `None`
/// becomes SQL NULL, which also covers the typed-nil case of an absent
/// optional field.
pub(crate) enum ColumnData {
    BigInt(Vec<Option<i64>>),
    Integer(Vec<Option<i32>>),
    Text(Vec<Option<String>>),
    Bytea(Vec<Option<Vec<u8>>>),
    Uuid(Vec<Uuid>),
    Jsonb(Vec<serde_json::Value>),
    Numeric(Vec<Option<BigDecimal>>),
    Timestamp(Vec<Option<NaiveDateTime>>),
}

impl ColumnData {
    fn pg_type(&self) -> &'static str {
        match self {
            ColumnData::BigInt(_) => "BIGINT",
            ColumnData::Integer(_) => "INTEGER",
            ColumnData::Text(_) => "TEXT",
            ColumnData::Bytea(_) => "BYTEA",
            ColumnData::Uuid(_) => "UUID",
            ColumnData::Jsonb(_) => "JSONB",
            ColumnData::Numeric(_) => "NUMERIC",
            ColumnData::Timestamp(_) => "TIMESTAMP",
        }
    }

    fn len(&self) -> usize {
        match self {
            ColumnData::BigInt(v) => v.len(),
            ColumnData::Integer(v) => v.len(),
            ColumnData::Text(v) => v.len(),
            ColumnData::Bytea(v) => v.len(),
            ColumnData::Uuid(v) => v.len(),
            ColumnData::Jsonb(v) => v.len(),
            ColumnData::Numeric(v) => v.len(),
            ColumnData::Timestamp(v) => v.len(),
        }
    }
}

pub(crate) struct Column {
    pub(crate) name: &'static str,
    pub(crate) data: ColumnData,
}

impl Column {
    fn new(name: &'static str, data: ColumnData) -> Self {
        Self { name, data }
    }
}

/// `INSERT INTO t (c1,...,cn) SELECT * FROM unnest($1::T1[], ..., $n::Tn[]) <conflict>`
pub(crate) fn build_unnest_insert(table: &str, columns: &[Column], conflict: &str) -> String {
    let names: Vec<&str> = columns.iter().map(|c| c.name).collect();
    let arrays: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("${}::{}[]", i + 1, c.data.pg_type()))
        .collect();
    format!(
        "INSERT INTO {} ({}) SELECT * FROM unnest({}) {}",
        table,
        names.join(","),
        arrays.join(", "),
        conflict
    )
}

async fn execute_batch_insert(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    columns: Vec<Column>,
    conflict: &str,
) -> Result<(), AlmanacError> {
    debug_assert!(columns.windows(2).all(|w| w[0].data.len() == w[1].data.len()));

    let sql = build_unnest_insert(table, &columns, conflict);
    let mut query = sqlx::query(&sql);
    for column in columns {
        query = match column.data {
            ColumnData::BigInt(v) => query.bind(v),
            ColumnData::Integer(v) => query.bind(v),
            ColumnData::Text(v) => query.bind(v),
            ColumnData::Bytea(v) => query.bind(v),
            ColumnData::Uuid(v) => query.bind(v),
            ColumnData::Jsonb(v) => query.bind(v),
            ColumnData::Numeric(v) => query.bind(v),
            ColumnData::Timestamp(v) => query.bind(v),
        };
    }
    query.execute(&mut **tx).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Column builders (pure, separately testable)
// ---------------------------------------------------------------------------

pub(crate) fn block_index_columns(chain: &str, indexes: &[BlockIndex]) -> Vec<Column> {
    let with_l1 = is_chain_with_l1(chain);
    let now = Utc::now().naive_utc();

    let mut block_numbers = Vec::with_capacity(indexes.len());
    let mut block_hashes = Vec::with_capacity(indexes.len());
    let mut block_timestamps = Vec::with_capacity(indexes.len());
    let mut parent_hashes = Vec::with_capacity(indexes.len());
    let mut row_ids = Vec::with_capacity(indexes.len());
    let mut paths = Vec::with_capacity(indexes.len());
    let mut indexed_ats = Vec::with_capacity(indexes.len());
    let mut l1_block_numbers = Vec::with_capacity(indexes.len());

    for index in indexes {
        block_numbers.push(Some(index.block_number as i64));
        block_hashes.push(Some(index.block_hash.clone()));
        block_timestamps.push(Some(index.block_timestamp as i64));
        parent_hashes.push(Some(index.parent_hash.clone()));
        row_ids.push(Some(index.row_id as i64));
        paths.push(Some(index.path.clone()));
        indexed_ats.push(Some(now));
        l1_block_numbers.push(index.l1_block_number.map(|n| n as i64));
    }

    let mut columns = vec![
        Column::new("block_number", ColumnData::BigInt(block_numbers)),
        Column::new("block_hash", ColumnData::Text(block_hashes)),
        Column::new("block_timestamp", ColumnData::BigInt(block_timestamps)),
        Column::new("parent_hash", ColumnData::Text(parent_hashes)),
        Column::new("row_id", ColumnData::BigInt(row_ids)),
        Column::new("path", ColumnData::Text(paths)),
        Column::new(
            "transactions_indexed_at",
            ColumnData::Timestamp(indexed_ats.clone()),
        ),
        Column::new("logs_indexed_at", ColumnData::Timestamp(indexed_ats)),
    ];
    if with_l1 {
        columns.push(Column::new(
            "l1_block_number",
            ColumnData::BigInt(l1_block_numbers),
        ));
    }
    columns
}

/// Rows with undecodable addresses are skipped (and logged), matching
/// the per-record error policy for labels.
pub(crate) fn transaction_label_columns(labels: &[TransactionLabel]) -> Vec<Column> {
    let mut ids = Vec::with_capacity(labels.len());
    let mut addresses = Vec::with_capacity(labels.len());
    let mut block_numbers = Vec::with_capacity(labels.len());
    let mut block_hashes = Vec::with_capacity(labels.len());
    let mut caller_addresses = Vec::with_capacity(labels.len());
    let mut label_names = Vec::with_capacity(labels.len());
    let mut label_types = Vec::with_capacity(labels.len());
    let mut origin_addresses = Vec::with_capacity(labels.len());
    let mut label_values = Vec::with_capacity(labels.len());
    let mut transaction_hashes = Vec::with_capacity(labels.len());
    let mut label_datas = Vec::with_capacity(labels.len());
    let mut block_timestamps = Vec::with_capacity(labels.len());

    for label in labels {
        let (address, caller, origin) = match (
            decode_address(&label.address),
            decode_address(&label.caller_address),
            decode_address(&label.origin_address),
        ) {
            (Ok(a), Ok(c), Ok(o)) => (a, c, o),
            _ => {
                tracing::warn!(
                    "Skipping transaction label with undecodable address: {}",
                    label.transaction_hash
                );
                continue;
            }
        };

        ids.push(Uuid::new_v4());
        addresses.push(Some(address));
        block_numbers.push(Some(label.block_number as i64));
        block_hashes.push(Some(label.block_hash.clone()));
        caller_addresses.push(Some(caller));
        label_names.push(Some(label.label_name.clone()));
        label_types.push(Some(label.label_type.clone()));
        origin_addresses.push(Some(origin));
        label_values.push(Some(label.label.clone()));
        transaction_hashes.push(Some(label.transaction_hash.clone()));
        label_datas.push(label.label_data.clone());
        block_timestamps.push(Some(label.block_timestamp as i64));
    }

    vec![
        Column::new("id", ColumnData::Uuid(ids)),
        Column::new("address", ColumnData::Bytea(addresses)),
        Column::new("block_number", ColumnData::BigInt(block_numbers)),
        Column::new("block_hash", ColumnData::Text(block_hashes)),
        Column::new("caller_address", ColumnData::Bytea(caller_addresses)),
        Column::new("label_name", ColumnData::Text(label_names)),
        Column::new("label_type", ColumnData::Text(label_types)),
        Column::new("origin_address", ColumnData::Bytea(origin_addresses)),
        Column::new("label", ColumnData::Text(label_values)),
        Column::new("transaction_hash", ColumnData::Text(transaction_hashes)),
        Column::new("label_data", ColumnData::Jsonb(label_datas)),
        Column::new("block_timestamp", ColumnData::BigInt(block_timestamps)),
    ]
}

pub(crate) fn event_label_columns(events: &[EventLabel]) -> Vec<Column> {
    let mut ids = Vec::with_capacity(events.len());
    let mut label_values = Vec::with_capacity(events.len());
    let mut transaction_hashes = Vec::with_capacity(events.len());
    let mut log_indexes = Vec::with_capacity(events.len());
    let mut block_numbers = Vec::with_capacity(events.len());
    let mut block_hashes = Vec::with_capacity(events.len());
    let mut block_timestamps = Vec::with_capacity(events.len());
    let mut caller_addresses = Vec::with_capacity(events.len());
    let mut origin_addresses = Vec::with_capacity(events.len());
    let mut addresses = Vec::with_capacity(events.len());
    let mut label_names = Vec::with_capacity(events.len());
    let mut label_types = Vec::with_capacity(events.len());
    let mut label_datas = Vec::with_capacity(events.len());

    for event in events {
        let (address, origin) = match (
            decode_address(&event.address),
            decode_address(&event.origin_address),
        ) {
            (Ok(a), Ok(o)) => (a, o),
            _ => {
                tracing::warn!(
                    "Skipping event label with undecodable address: {}#{}",
                    event.transaction_hash,
                    event.log_index
                );
                continue;
            }
        };

        ids.push(Uuid::new_v4());
        label_values.push(Some(event.label.clone()));
        transaction_hashes.push(Some(event.transaction_hash.clone()));
        log_indexes.push(Some(event.log_index as i64));
        block_numbers.push(Some(event.block_number as i64));
        block_hashes.push(Some(event.block_hash.clone()));
        block_timestamps.push(Some(event.block_timestamp as i64));
        caller_addresses.push(None);
        origin_addresses.push(Some(origin));
        addresses.push(Some(address));
        label_names.push(Some(event.label_name.clone()));
        label_types.push(Some(event.label_type.clone()));
        label_datas.push(event.label_data.clone());
    }

    vec![
        Column::new("id", ColumnData::Uuid(ids)),
        Column::new("label", ColumnData::Text(label_values)),
        Column::new("transaction_hash", ColumnData::Text(transaction_hashes)),
        Column::new("log_index", ColumnData::BigInt(log_indexes)),
        Column::new("block_number", ColumnData::BigInt(block_numbers)),
        Column::new("block_hash", ColumnData::Text(block_hashes)),
        Column::new("block_timestamp", ColumnData::BigInt(block_timestamps)),
        Column::new("caller_address", ColumnData::Bytea(caller_addresses)),
        Column::new("origin_address", ColumnData::Bytea(origin_addresses)),
        Column::new("address", ColumnData::Bytea(addresses)),
        Column::new("label_name", ColumnData::Text(label_names)),
        Column::new("label_type", ColumnData::Text(label_types)),
        Column::new("label_data", ColumnData::Jsonb(label_datas)),
    ]
}

/// Unlike labels, a malformed raw transaction aborts the whole write.
pub(crate) fn raw_transaction_columns(
    chain: &str,
    raw_transactions: &[RawTransaction],
) -> Result<Vec<Column>, AlmanacError> {
    let with_l1 = is_chain_with_l1(chain);

    let mut hashes = Vec::with_capacity(raw_transactions.len());
    let mut block_hashes = Vec::with_capacity(raw_transactions.len());
    let mut block_timestamps = Vec::with_capacity(raw_transactions.len());
    let mut block_numbers = Vec::with_capacity(raw_transactions.len());
    let mut from_addresses = Vec::with_capacity(raw_transactions.len());
    let mut to_addresses = Vec::with_capacity(raw_transactions.len());
    let mut gases = Vec::with_capacity(raw_transactions.len());
    let mut gas_prices = Vec::with_capacity(raw_transactions.len());
    let mut inputs = Vec::with_capacity(raw_transactions.len());
    let mut nonces = Vec::with_capacity(raw_transactions.len());
    let mut max_fees = Vec::with_capacity(raw_transactions.len());
    let mut max_priority_fees = Vec::with_capacity(raw_transactions.len());
    let mut transaction_indexes = Vec::with_capacity(raw_transactions.len());
    let mut transaction_types = Vec::with_capacity(raw_transactions.len());
    let mut values = Vec::with_capacity(raw_transactions.len());
    let mut l1_block_numbers = Vec::with_capacity(raw_transactions.len());

    for tx in raw_transactions {
        hashes.push(Some(tx.hash.clone()));
        block_hashes.push(Some(tx.block_hash.clone()));
        block_timestamps.push(Some(tx.block_timestamp as i64));
        block_numbers.push(Some(tx.block_number as i64));
        from_addresses.push(Some(decode_address(&tx.from_address)?));
        to_addresses.push(Some(decode_address(&tx.to_address)?));
        gases.push(hex_to_decimal(&tx.gas)?);
        gas_prices.push(hex_to_decimal(&tx.gas_price)?);
        inputs.push(Some(tx.input.clone()));
        nonces.push(Some(tx.nonce.clone()));
        max_fees.push(hex_to_decimal(&tx.max_fee_per_gas)?);
        max_priority_fees.push(hex_to_decimal(&tx.max_priority_fee_per_gas)?);
        transaction_indexes.push(Some(tx.transaction_index as i64));
        transaction_types.push(Some(tx.transaction_type as i32));
        values.push(hex_to_decimal(&tx.value)?);
        l1_block_numbers.push(tx.l1_block_number.map(|n| n as i64));
    }

    let mut columns = vec![
        Column::new("hash", ColumnData::Text(hashes)),
        Column::new("block_hash", ColumnData::Text(block_hashes)),
        Column::new("block_timestamp", ColumnData::BigInt(block_timestamps)),
        Column::new("block_number", ColumnData::BigInt(block_numbers)),
        Column::new("from_address", ColumnData::Bytea(from_addresses)),
        Column::new("to_address", ColumnData::Bytea(to_addresses)),
        Column::new("gas", ColumnData::Numeric(gases)),
        Column::new("gas_price", ColumnData::Numeric(gas_prices)),
        Column::new("input", ColumnData::Text(inputs)),
        Column::new("nonce", ColumnData::Text(nonces)),
        Column::new("max_fee_per_gas", ColumnData::Numeric(max_fees)),
        Column::new(
            "max_priority_fee_per_gas",
            ColumnData::Numeric(max_priority_fees),
        ),
        Column::new("transaction_index", ColumnData::BigInt(transaction_indexes)),
        Column::new("transaction_type", ColumnData::Integer(transaction_types)),
        Column::new("value", ColumnData::Numeric(values)),
    ];
    if with_l1 {
        columns.push(Column::new(
            "l1_block_number",
            ColumnData::BigInt(l1_block_numbers),
        ));
    }
    Ok(columns)
}

// ---------------------------------------------------------------------------
// Database operations
// ---------------------------------------------------------------------------

/// Dynamic predicate set for `select_abi_jobs`.
#[derive(Debug, Clone, Default)]
pub struct AbiJobsFilter {
    pub chain: Option<String>,
    pub addresses: Vec<String>,
    pub customer_ids: Vec<Uuid>,
    /// Restrict to jobs whose historical crawl is not done yet.
    pub auto_jobs: bool,
    pub deploy_block_not_null: bool,
    pub abi_types: Vec<String>,
}

const ABI_JOB_SELECT: &str = "SELECT id, address, user_id, customer_id, abi_selector, chain, \
     abi_name, status, historical_crawl_status, progress, moonworm_task_pickedup, \
     '[' || abi || ']' as abi, (abi::jsonb)->>'type' as abi_type, created_at, updated_at, \
     deployment_block_number FROM abi_jobs";

#[derive(Debug, Deserialize)]
struct AbiEntryRow {
    abi: String,
    abi_name: String,
    /// Null for ABI fragments without a `type` key.
    abi_type: Option<String>,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert block index rows inside one transaction.
    pub async fn write_block_index(
        &self,
        chain: &str,
        indexes: &[BlockIndex],
    ) -> Result<(), AlmanacError> {
        if indexes.is_empty() {
            return Ok(());
        }
        let table = blocks_table_name(chain)?;
        let columns = block_index_columns(chain, indexes);

        let mut tx = self.pool.begin().await?;
        execute_batch_insert(&mut tx, &table, columns, "ON CONFLICT (block_number) DO NOTHING")
            .await?;
        tx.commit().await?;

        tracing::info!("Added {} records into {} table", indexes.len(), table);
        Ok(())
    }

    /// Write decoded labels and raw transactions atomically: either every
    /// sub-batch lands or none does. The transaction rolls back on drop
    /// if any write fails.
    pub async fn write_labels(
        &self,
        chain: &str,
        tx_calls: &[TransactionLabel],
        events: &[EventLabel],
        raw_transactions: &[RawTransaction],
    ) -> Result<(), AlmanacError> {
        let mut tx = self.pool.begin().await?;

        if !tx_calls.is_empty() {
            let table = labels_table_name(chain)?;
            let columns = transaction_label_columns(tx_calls);
            execute_batch_insert(&mut tx, &table, columns, "ON CONFLICT DO NOTHING").await?;
            tracing::info!(
                "Saved {} tx_calls records into {} table",
                tx_calls.len(),
                table
            );
        }

        if !events.is_empty() {
            let table = labels_table_name(chain)?;
            let columns = event_label_columns(events);
            execute_batch_insert(&mut tx, &table, columns, "ON CONFLICT DO NOTHING").await?;
            tracing::info!("Saved {} events records into {} table", events.len(), table);
        }

        if !raw_transactions.is_empty() {
            let table = customer_transactions_table_name(chain);
            let columns = raw_transaction_columns(chain, raw_transactions)?;
            execute_batch_insert(&mut tx, &table, columns, "ON CONFLICT DO NOTHING").await?;
            tracing::info!(
                "Saved {} transactions records into {} table",
                raw_transactions.len(),
                table
            );
        }

        tx.commit().await?;
        Ok(())
    }

    // -- block index queries ------------------------------------------------

    pub async fn latest_indexed_block(
        &self,
        chain: &str,
        ascending: bool,
    ) -> Result<u64, AlmanacError> {
        let table = blocks_table_name(chain)?;
        let direction = if ascending { "ASC" } else { "DESC" };
        let sql =
            format!("SELECT block_number FROM {table} ORDER BY block_number {direction} LIMIT 1");
        let row: Option<(i64,)> = sqlx::query_as(&sql).fetch_optional(&self.pool).await?;
        row.map(|(n,)| n as u64)
            .ok_or_else(|| AlmanacError::NotFound(format!("no blocks indexed in {table}")))
    }

    /// Highest labeled block, or 0 when the table is empty.
    pub async fn read_last_label(&self, chain: &str) -> Result<u64, AlmanacError> {
        let table = labels_table_name(chain)?;
        let sql = format!("SELECT block_number FROM {table} ORDER BY block_number DESC LIMIT 1");
        let row: Option<(i64,)> = sqlx::query_as(&sql).fetch_optional(&self.pool).await?;
        Ok(row.map(|(n,)| n as u64).unwrap_or(0))
    }

    /// Batch path containing `block_number` together with the block
    /// bounds of that batch, or `None` when the block is not indexed yet.
    pub async fn find_batch_path(
        &self,
        chain: &str,
        block_number: u64,
    ) -> Result<Option<(String, u64, u64)>, AlmanacError> {
        let table = blocks_table_name(chain)?;
        let sql = format!(
            "WITH path AS (SELECT path FROM {table} WHERE block_number = $1) \
             SELECT path, min(block_number), max(block_number) FROM {table} \
             WHERE path = (SELECT path FROM path) GROUP BY path"
        );
        let row: Option<(String, i64, i64)> = sqlx::query_as(&sql)
            .bind(block_number as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(path, min, max)| (path, min as u64, max as u64)))
    }

    /// Distinct batch paths spanning `[block_number - min_blocks_to_sync,
    /// block_number]` plus the bounds of the touched batches.
    pub async fn retrieve_paths_and_block_bounds(
        &self,
        chain: &str,
        block_number: u64,
        min_blocks_to_sync: u64,
    ) -> Result<(Vec<String>, u64, u64), AlmanacError> {
        let table = blocks_table_name(chain)?;
        let sql = format!(
            "WITH path AS ( \
                 SELECT path, block_number FROM {table} \
                 WHERE block_number >= $2 AND block_number <= $1 \
             ), latest_block_of_path AS ( \
                 SELECT block_number AS latest_block_number FROM {table} \
                 WHERE path = (SELECT path FROM path ORDER BY block_number DESC LIMIT 1) \
                 ORDER BY block_number DESC LIMIT 1 \
             ), earliest_block_of_path AS ( \
                 SELECT block_number AS first_block_number FROM {table} \
                 WHERE path = (SELECT path FROM path ORDER BY block_number ASC LIMIT 1) \
                 ORDER BY block_number ASC LIMIT 1 \
             ) \
             SELECT array_agg(DISTINCT path) AS paths, \
                    (SELECT first_block_number FROM earliest_block_of_path) AS min_block_number, \
                    (SELECT latest_block_number FROM latest_block_of_path) AS max_block_number \
             FROM path"
        );
        let from = block_number.saturating_sub(min_blocks_to_sync);
        let row: Option<(Option<Vec<String>>, Option<i64>, Option<i64>)> = sqlx::query_as(&sql)
            .bind(block_number as i64)
            .bind(from as i64)
            .fetch_optional(&self.pool)
            .await?;

        let (paths, min, max) = row.unwrap_or((None, None, None));
        Ok((
            paths.unwrap_or_default(),
            min.unwrap_or(0) as u64,
            max.unwrap_or(0) as u64,
        ))
    }

    /// Single round-trip join point for the crawl controller: the batch
    /// paths covering `[from_block, from_block + min_blocks_to_sync]`,
    /// the last block of the last touched path (so the cursor aligns to
    /// a batch boundary), and the per-customer ABI routing maps.
    pub async fn read_updates(
        &self,
        chain: &str,
        from_block: u64,
        customer_ids: &[Uuid],
        min_blocks_to_sync: u64,
    ) -> Result<(u64, Vec<String>, Vec<CustomerUpdates>), AlmanacError> {
        let table = blocks_table_name(chain)?;
        let sql = format!(
            "WITH path AS ( \
                 SELECT path, block_number FROM {table} \
                 WHERE block_number >= $1 AND block_number <= $1 + $3 \
             ), \
             latest_block_of_path AS ( \
                 SELECT block_number AS latest_block_number FROM {table} \
                 WHERE path = (SELECT path FROM path ORDER BY block_number DESC LIMIT 1) \
                 ORDER BY block_number DESC LIMIT 1 \
             ), \
             jobs AS ( \
                 SELECT address, '0x' || encode(address, 'hex') AS address_str, customer_id, \
                        abi_selector, abi_name, abi, \
                        (abi)::jsonb ->> 'type' AS abi_type \
                 FROM abi_jobs \
                 WHERE chain = $2 \
                   AND (cardinality($4::uuid[]) = 0 OR customer_id = ANY($4::uuid[])) \
             ), \
             address_abis AS ( \
                 SELECT address_str, customer_id, \
                        json_object_agg(abi_selector, json_build_object( \
                            'abi', '[' || abi || ']', \
                            'abi_name', abi_name, \
                            'abi_type', abi_type)) AS abis_per_address \
                 FROM jobs GROUP BY address_str, customer_id \
             ), \
             reformatted_jobs AS ( \
                 SELECT customer_id, json_object_agg(address_str, abis_per_address) AS abis \
                 FROM address_abis GROUP BY customer_id \
             ) \
             SELECT latest_block_number, \
                    (SELECT array_agg(DISTINCT path) FROM path) AS paths, \
                    (SELECT json_agg(json_build_object(customer_id, abis)) FROM reformatted_jobs) AS jobs \
             FROM latest_block_of_path"
        );

        let row = sqlx::query(&sql)
            .bind(from_block as i64)
            .bind(chain)
            .bind(min_blocks_to_sync as i64)
            .bind(customer_ids)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok((0, Vec::new(), Vec::new()));
        };

        let last_block: Option<i64> = row.try_get("latest_block_number")?;
        let paths: Option<Vec<String>> = row.try_get("paths")?;
        let jobs: Option<serde_json::Value> = row.try_get("jobs")?;

        let customers = match jobs {
            Some(value) => parse_customer_updates(value)?,
            None => Vec::new(),
        };

        Ok((
            last_block.unwrap_or(0) as u64,
            paths.unwrap_or_default(),
            customers,
        ))
    }

    // -- ABI job lifecycle --------------------------------------------------

    pub async fn read_abi_jobs(&self, chain: &str) -> Result<Vec<AbiJob>, AlmanacError> {
        let sql = format!(
            "{ABI_JOB_SELECT} WHERE chain = $1 AND (abi::jsonb)->>'type' IS NOT NULL"
        );
        let jobs = sqlx::query_as::<_, AbiJob>(&sql)
            .bind(chain)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    pub async fn select_abi_jobs(
        &self,
        filter: &AbiJobsFilter,
    ) -> Result<Vec<AbiJob>, AlmanacError> {
        let mut builder = select_abi_jobs_builder(filter)?;
        let jobs = builder
            .build_query_as::<AbiJob>()
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    pub async fn get_customer_ids(&self, chain: &str) -> Result<Vec<Uuid>, AlmanacError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT DISTINCT customer_id FROM abi_jobs \
             WHERE customer_id IS NOT NULL AND chain = $1",
        )
        .bind(chain)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Flip `pending` jobs to `in_progress` for active jobs whose
    /// deployment block is known.
    pub async fn update_abi_jobs_status(&self, chain: &str) -> Result<(), AlmanacError> {
        sqlx::query(
            "UPDATE abi_jobs \
             SET historical_crawl_status = 'in_progress', moonworm_task_pickedup = true \
             WHERE chain = $1 \
               AND historical_crawl_status = 'pending' \
               AND status = 'active' \
               AND deployment_block_number IS NOT NULL",
        )
        .bind(chain)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_abis_as_done(&self, ids: &[Uuid]) -> Result<(), AlmanacError> {
        sqlx::query(
            "UPDATE abi_jobs SET historical_crawl_status = 'done', progress = 100 \
             WHERE id = ANY($1)",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_abis_progress(
        &self,
        ids: &[Uuid],
        progress: i32,
    ) -> Result<(), AlmanacError> {
        sqlx::query("UPDATE abi_jobs SET progress = $1 WHERE id = ANY($2)")
            .bind(progress)
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_abi_jobs_deploy_block(
        &self,
        block_number: u64,
        ids: &[Uuid],
    ) -> Result<(), AlmanacError> {
        sqlx::query("UPDATE abi_jobs SET deployment_block_number = $1 WHERE id = ANY($2)")
            .bind(block_number as i64)
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_jobs(&self, ids: &[Uuid]) -> Result<(), AlmanacError> {
        if ids.is_empty() {
            tracing::info!("Nothing to delete");
            return Ok(());
        }
        sqlx::query("DELETE FROM abi_jobs WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        tracing::info!("Deleted {} jobs", ids.len());
        Ok(())
    }

    /// Copy jobs to another customer inside one transaction, with fresh
    /// ids and reset crawl state. Jobs whose ABI JSON is not wrapped in
    /// `[...]` are skipped.
    pub async fn copy_abi_jobs(
        &self,
        source_customer_id: Uuid,
        dest_customer_id: Uuid,
        jobs: &[AbiJob],
    ) -> Result<(), AlmanacError> {
        let mut tx = self.pool.begin().await?;
        let mut copied = 0usize;

        for job in jobs {
            if job.abi.len() <= 2 || !job.abi.starts_with('[') || !job.abi.ends_with(']') {
                tracing::warn!("Passed ABI job, incorrect format: {}", job.abi);
                continue;
            }
            let abi = &job.abi[1..job.abi.len() - 1];

            sqlx::query(
                "INSERT INTO abi_jobs (id, address, user_id, customer_id, abi_selector, chain, \
                     abi_name, status, historical_crawl_status, progress, moonworm_task_pickedup, \
                     abi, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now(), now())",
            )
            .bind(Uuid::new_v4())
            .bind(&job.address)
            .bind(job.user_id)
            .bind(dest_customer_id)
            .bind(&job.abi_selector)
            .bind(&job.chain)
            .bind(&job.abi_name)
            .bind("true")
            .bind("pending")
            .bind(0i32)
            .bind(false)
            .bind(abi)
            .execute(&mut *tx)
            .await?;
            copied += 1;
        }

        tx.commit().await?;
        tracing::info!(
            "Copied {} ABI jobs from customer {} to {}.",
            copied,
            source_customer_id,
            dest_customer_id
        );
        Ok(())
    }

    /// Create one job per entry of an ABI file, deriving selectors from
    /// the entries themselves. Entries that are neither functions nor
    /// events are skipped.
    pub async fn create_jobs_from_abi(
        &self,
        chain: &str,
        address: &str,
        abi_file: &str,
        customer_id: Uuid,
        user_id: Uuid,
        deployment_block_number: u64,
    ) -> Result<(), AlmanacError> {
        let abi_data = std::fs::read_to_string(abi_file)
            .map_err(|e| AlmanacError::Config(format!("failed to read {abi_file}: {e}")))?;
        let entries: Vec<serde_json::Value> = serde_json::from_str(&abi_data)
            .map_err(|e| AlmanacError::AbiParse(format!("invalid ABI file {abi_file}: {e}")))?;

        let address_bytes = decode_address(address)?;

        for entry in entries {
            let abi_type = entry.get("type").and_then(|v| v.as_str()).unwrap_or("");
            if abi_type != "function" && abi_type != "event" {
                continue;
            }
            let Some(name) = entry.get("name").and_then(|v| v.as_str()) else {
                continue;
            };

            let wrapped = format!("[{entry}]");
            let abi: alloy::json_abi::JsonAbi = serde_json::from_str(&wrapped)
                .map_err(|e| AlmanacError::AbiParse(e.to_string()))?;
            let selector = almanac_chain::derive_selector(&abi, name, abi_type)?;

            sqlx::query(
                "INSERT INTO abi_jobs (id, address, user_id, customer_id, abi_selector, chain, \
                     abi_name, status, historical_crawl_status, progress, moonworm_task_pickedup, \
                     abi, deployment_block_number, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now(), now()) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(Uuid::new_v4())
            .bind(&address_bytes)
            .bind(user_id)
            .bind(customer_id)
            .bind(&selector)
            .bind(chain)
            .bind(name)
            .bind("true")
            .bind("pending")
            .bind(0i32)
            .bind(false)
            .bind(entry.to_string())
            .bind(deployment_block_number as i64)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Jobs lacking a deployment block, grouped by address; corrects
    /// their selectors on the way out.
    pub async fn get_abi_jobs_without_deploy_blocks(
        &self,
        chain: &str,
    ) -> Result<HashMap<String, Vec<Uuid>>, AlmanacError> {
        let rows: Vec<(Uuid, String, Vec<u8>)> = sqlx::query_as(
            "SELECT id, chain, address FROM abi_jobs \
             WHERE deployment_block_number IS NULL \
               AND chain = $1 \
               AND ( \
                   (abi::jsonb)->>'type' = 'event' \
                   OR ((abi::jsonb)->>'type' = 'function' \
                       AND (abi::jsonb)->>'stateMutability' != 'view') \
               )",
        )
        .bind(chain)
        .fetch_all(&self.pool)
        .await?;

        let mut addresses: HashMap<String, Vec<Uuid>> = HashMap::new();
        for (id, _, raw_address) in rows {
            let address = almanac_common::codec::encode_address(&raw_address);
            addresses.entry(address).or_default().push(id);
        }

        for ids in addresses.values() {
            self.ensure_correct_selectors(chain, true, None, ids).await?;
        }

        Ok(addresses)
    }

    /// Re-derive selectors from the stored ABI JSON, updating rows whose
    /// stored selector disagrees and/or appending a report file.
    pub async fn ensure_correct_selectors(
        &self,
        chain: &str,
        write_to_db: bool,
        output_file: Option<&str>,
        ids: &[Uuid],
    ) -> Result<(), AlmanacError> {
        let mut jobs = self.read_abi_jobs(chain).await?;
        if !ids.is_empty() {
            jobs.retain(|job| ids.contains(&job.id));
        } else {
            tracing::info!("Found {} ABI jobs for blockchain: {}", jobs.len(), chain);
        }

        let mut writer = match output_file {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(path)
                    .map_err(|e| AlmanacError::Config(format!("failed to open {path}: {e}")))?;
                let mut writer = std::io::BufWriter::new(file);
                writeln!(
                    writer,
                    "ABI jobs for blockchain: {} run with write_to_db: {} recorded at {}",
                    chain,
                    write_to_db,
                    Utc::now()
                )
                .map_err(|e| AlmanacError::Internal(e.to_string()))?;
                Some(writer)
            }
            None => None,
        };

        for job in &jobs {
            let abi: alloy::json_abi::JsonAbi = serde_json::from_str(&job.abi).map_err(|e| {
                tracing::error!("Error parsing ABI for ABI job: {} {}", job.id, e);
                AlmanacError::AbiParse(e.to_string())
            })?;
            let abi_type = job.abi_type.as_deref().unwrap_or("function");
            let selector = almanac_chain::derive_selector(&abi, &job.abi_name, abi_type)?;

            if job.abi_selector == selector {
                continue;
            }

            if write_to_db {
                sqlx::query("UPDATE abi_jobs SET abi_selector = $1 WHERE id = $2")
                    .bind(&selector)
                    .bind(job.id)
                    .execute(&self.pool)
                    .await?;
                tracing::info!(
                    "Updated selector: {} for ABI job: {} to new selector: {}",
                    job.abi_selector,
                    job.id,
                    selector
                );
            }

            if let Some(writer) = writer.as_mut() {
                writeln!(
                    writer,
                    "ABI job ID: {}, Name: {}, Address: 0x{}, Selector: {}, Correct Selector: {}",
                    job.id,
                    job.abi_name,
                    hex::encode(&job.address),
                    job.abi_selector,
                    selector
                )
                .map_err(|e| AlmanacError::Internal(e.to_string()))?;
            }
        }

        if let Some(mut writer) = writer {
            writer
                .flush()
                .map_err(|e| AlmanacError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    /// Delete indexed transactions in block batches, pausing between
    /// deletions to keep load off the database.
    pub async fn clean_indexes(
        &self,
        chain: &str,
        batch_limit: u64,
        sleep_seconds: u64,
    ) -> Result<(), AlmanacError> {
        let table = transactions_table_name(chain)?;
        let sql = format!("SELECT min(block_number), max(block_number) FROM {table}");
        let bounds: (Option<i64>, Option<i64>) =
            sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        let (Some(min), Some(max)) = bounds else {
            return Ok(());
        };

        tracing::info!(
            "Starting deletion of transactions indexes in blocks range from {} to {}",
            min,
            max
        );

        let delete_sql =
            format!("DELETE FROM {table} WHERE block_number >= $1 AND block_number < $2");
        let mut cursor = min;
        while cursor <= max {
            let result = sqlx::query(&delete_sql)
                .bind(cursor)
                .bind(cursor + batch_limit as i64)
                .execute(&self.pool)
                .await?;
            tracing::info!("Deleted {} transactions indexes", result.rows_affected());
            cursor += batch_limit as i64;
            tokio::time::sleep(std::time::Duration::from_secs(sleep_seconds)).await;
        }

        Ok(())
    }
}

pub(crate) fn select_abi_jobs_builder(
    filter: &AbiJobsFilter,
) -> Result<QueryBuilder<'static, Postgres>, AlmanacError> {
    let mut builder: QueryBuilder<Postgres> =
        QueryBuilder::new(format!("{ABI_JOB_SELECT} WHERE true"));

    if !filter.abi_types.is_empty() {
        builder.push(" AND (abi::jsonb)->>'type' = ANY(");
        builder.push_bind(filter.abi_types.clone());
        builder.push(")");
    }
    if filter.deploy_block_not_null {
        builder.push(" AND deployment_block_number IS NOT NULL");
    }
    if let Some(chain) = &filter.chain {
        builder.push(" AND chain = ");
        builder.push_bind(chain.clone());
    }
    if filter.auto_jobs {
        builder.push(" AND historical_crawl_status != 'done'");
    }
    if !filter.addresses.is_empty() {
        let mut decoded = Vec::with_capacity(filter.addresses.len());
        for address in &filter.addresses {
            decoded.push(decode_address(address)?);
        }
        builder.push(" AND address = ANY(");
        builder.push_bind(decoded);
        builder.push(")");
    }
    if !filter.customer_ids.is_empty() {
        builder.push(" AND customer_id = ANY(");
        builder.push_bind(filter.customer_ids.clone());
        builder.push(")");
    }

    Ok(builder)
}

/// Parse the `jobs` JSON of `read_updates` into routing maps:
/// `[{customer_id: {address: {selector: {abi, abi_name, abi_type}}}}]`.
fn parse_customer_updates(
    value: serde_json::Value,
) -> Result<Vec<CustomerUpdates>, AlmanacError> {
    type JobsJson = Vec<HashMap<String, HashMap<String, HashMap<String, AbiEntryRow>>>>;

    let parsed: JobsJson = serde_json::from_value(value)
        .map_err(|e| AlmanacError::Internal(format!("malformed jobs payload: {e}")))?;

    let mut updates = Vec::new();
    for customer_map in parsed {
        for (customer_id, addresses) in customer_map {
            let mut abis: AbiMap = AbiMap::new();
            for (address, selectors) in addresses {
                let entry_map = abis.entry(address).or_default();
                for (selector, row) in selectors {
                    entry_map.insert(
                        selector,
                        Arc::new(AbiEntry::new(
                            row.abi,
                            row.abi_name,
                            row.abi_type.unwrap_or_else(|| "function".to_string()),
                        )),
                    );
                }
            }
            updates.push(CustomerUpdates { customer_id, abis });
        }
    }
    Ok(updates)
}
