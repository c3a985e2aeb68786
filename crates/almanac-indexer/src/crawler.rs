//! Crawl controller.
//!
//! Sequences the pipeline over a moving block-range cursor: resolve the
//! ABI routing maps and target window, fetch and persist the batch
//! artifact plus its index rows, decode labels, write them, bump job
//! progress, advance. A failed iteration never advances the cursor;
//! conflict-skip inserts make the retry idempotent.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prost::Message;
use uuid::Uuid;

use almanac_chain::proto::{decode_batch, BlocksBatch};
use almanac_chain::{
    batch_key, build_batch, decode_batch_to_labels, ArtifactStore, DecodeOptions, EvmClient,
    FilterQuery,
};
use almanac_common::AlmanacError;

use crate::config::Config;
use crate::db::{AbiJobsFilter, Database};

pub struct Crawler {
    db: Database,
    client: EvmClient,
    store: Arc<dyn ArtifactStore>,
    config: Config,
}

impl Crawler {
    pub fn new(
        db: Database,
        client: EvmClient,
        store: Arc<dyn ArtifactStore>,
        config: Config,
    ) -> Self {
        Self {
            db,
            client,
            store,
            config,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let chain = self.config.chain.as_str();

        self.db
            .update_abi_jobs_status(chain)
            .await
            .context("failed to mark pending ABI jobs in progress")?;

        let active_job_ids = self.active_job_ids(chain).await?;
        let start_block = self.resolve_start_block(chain).await?;
        let mut cursor = start_block;
        tracing::info!("Starting crawl of {} from block {}", chain, cursor);

        loop {
            let head = match self.client.latest_block_number().await {
                Ok(head) => head,
                Err(e) => {
                    tracing::error!("Failed to read chain head: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };
            let safe_head = head.saturating_sub(self.config.confirmations);

            if cursor > safe_head {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            match self.crawl_window(chain, cursor, safe_head).await {
                Ok(last_block) => {
                    self.update_progress(&active_job_ids, start_block, last_block, safe_head)
                        .await;
                    cursor = last_block + 1;
                }
                Err(e) => {
                    // Retry the same window next pass; idempotent inserts
                    // make the replay safe.
                    tracing::error!("Crawl iteration failed, will retry: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    /// Process one window starting at `cursor`; returns the last block
    /// covered so the caller can advance.
    async fn crawl_window(&self, chain: &str, cursor: u64, safe_head: u64) -> Result<u64> {
        let (last_indexed, paths, updates) = self
            .db
            .read_updates(chain, cursor, &[], self.config.min_blocks_to_sync)
            .await?;

        let (batch, last_block) = if paths.is_empty() {
            // Front of the chain: nothing indexed here yet.
            let to = (cursor + self.config.batch_size - 1).min(safe_head);
            let batch = self.index_range(chain, cursor, to).await?;
            (batch, to)
        } else {
            // Previously indexed range: one path's worth per iteration.
            let path = &paths[0];
            let data = self.store.get(path).await?;
            let batch = decode_batch(&data)?;
            let last_in_batch = batch
                .blocks
                .iter()
                .map(|b| b.block_number)
                .max()
                .unwrap_or(cursor);
            // Align to the batch boundary unless the window spans
            // further paths.
            let last = if paths.len() > 1 { last_in_batch } else { last_indexed };
            (batch, last.max(cursor))
        };

        if !updates.is_empty() {
            let options = DecodeOptions {
                add_raw_transactions: self.config.add_raw_transactions,
                threads: self.config.decode_threads,
            };
            for customer in &updates {
                let (events, tx_labels, raws) =
                    decode_batch_to_labels(&self.client, &batch, &customer.abis, &options)
                        .await
                        .map_err(|e| anyhow::anyhow!("decode for customer {}: {e}", customer.customer_id))?;

                self.db
                    .write_labels(chain, &tx_labels, &events, &raws)
                    .await
                    .map_err(|e| anyhow::anyhow!("label write for customer {}: {e}", customer.customer_id))?;
            }
        }

        Ok(last_block)
    }

    /// Fetch `[from, to]`, write the batch artifact, then persist its
    /// index rows. Failures here leave the cursor untouched.
    async fn index_range(&self, chain: &str, from: u64, to: u64) -> Result<BlocksBatch> {
        let blocks = self
            .client
            .fetch_blocks_parallel(from, to, self.config.max_requests)
            .await?;

        let events = self
            .client
            .filter_logs(&FilterQuery {
                from_block: from,
                to_block: to,
                ..Default::default()
            })
            .await?;

        let mut artifact = build_batch(chain, &blocks, &events)?;
        let path = batch_key(chain, from, to);

        self.store
            .put(&path, artifact.batch.encode_to_vec())
            .await?;
        tracing::debug!("Wrote batch artifact {} ({} bytes)", path, artifact.size);

        for index in &mut artifact.indexes {
            index.path = path.clone();
        }
        self.db.write_block_index(chain, &artifact.indexes).await?;

        Ok(artifact.batch)
    }

    async fn resolve_start_block(&self, chain: &str) -> Result<u64> {
        if self.config.start_block > 0 {
            return Ok(self.config.start_block);
        }
        // Resume after the last labeled block, falling back to the last
        // indexed block for a fresh label run.
        let last_label = self.db.read_last_label(chain).await?;
        if last_label > 0 {
            return Ok(last_label + 1);
        }
        match self.db.latest_indexed_block(chain, false).await {
            Ok(last) => Ok(last + 1),
            Err(AlmanacError::NotFound(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn active_job_ids(&self, chain: &str) -> Result<Vec<Uuid>> {
        let jobs = self
            .db
            .select_abi_jobs(&AbiJobsFilter {
                chain: Some(chain.to_string()),
                auto_jobs: true,
                ..Default::default()
            })
            .await?;
        Ok(crate::jobs::get_job_ids(&jobs, true))
    }

    async fn update_progress(
        &self,
        job_ids: &[Uuid],
        start_block: u64,
        last_block: u64,
        safe_head: u64,
    ) {
        if job_ids.is_empty() {
            return;
        }

        let span = safe_head.saturating_sub(start_block).max(1);
        let done = last_block.saturating_sub(start_block);
        let progress = ((done * 100) / span).min(100) as i32;

        let result = if progress >= 100 {
            self.db.update_abis_as_done(job_ids).await
        } else {
            self.db.update_abis_progress(job_ids, progress).await
        };
        if let Err(e) = result {
            tracing::warn!("Failed to update ABI job progress: {}", e);
        }
    }
}
