use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::chain::{Chain, ChainProperties};
use crate::errors::{RpcError, StoreError};
use crate::indexer::AddressBlockExtrinsics;
use crate::node_pool::NodePool;
use crate::params::Param;
use crate::queue::BoundedQueue;
use crate::rpc::SubstrateRpcApi;
use crate::store::{PersistedExtrinsic, Store};

pub const DBWRITER_SLEEP_SECONDS: Duration = Duration::from_secs(5);
pub const N_MIN: usize = 10;
pub const N_MAX: usize = 10;
pub const REQUEST_RECEIPT_DATA_TIMES: u32 = 2;

/// A fatal condition that stops the writer loop and is surfaced to every
/// session with an indexer on this chain, not just the session that created it.
#[derive(Debug, Clone)]
pub enum WriterFailure {
    Rpc(RpcError),
    Store(StoreError),
}

pub struct DbWriterHandle {
    pub cancel: watch::Sender<bool>,
    pub join: JoinHandle<()>,
}

impl DbWriterHandle {
    pub fn request_stop(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Spawns the DB Writer main loop: drains the queue in batches once it has
/// enough items, enriches each extrinsic with its fee receipt, and commits
/// the batch to the store.
pub fn spawn_db_writer<C, S, F>(
    chain: Chain,
    properties: ChainProperties,
    node_pool: Arc<NodePool<C>>,
    queue: Arc<BoundedQueue<AddressBlockExtrinsics>>,
    store: Arc<S>,
    on_failure: F,
) -> DbWriterHandle
where
    C: SubstrateRpcApi + 'static,
    S: Store + 'static,
    F: Fn(WriterFailure) + Send + 'static,
{
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let join = tokio::spawn(async move {
        loop {
            if *cancel_rx.borrow() {
                return;
            }

            if queue.len().await < N_MIN {
                tokio::select! {
                    _ = tokio::time::sleep(DBWRITER_SLEEP_SECONDS) => {},
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            return;
                        }
                    }
                }
                continue;
            }

            let batch = queue.take_batch(N_MAX).await;
            if batch.is_empty() {
                continue;
            }

            match process_batch(&chain, &properties, &node_pool, &batch).await {
                Ok(rows) => match commit_batch(store.as_ref(), &chain, &batch, rows).await {
                    Ok(()) => {}
                    Err(e) => {
                        // Fatal DB error: re-queue the batch at the head before surfacing.
                        queue.requeue_front(batch).await;
                        on_failure(WriterFailure::Store(e));
                        return;
                    }
                },
                Err(e) => {
                    // Non-fatal enrichment failure: retry the whole batch once.
                    match process_batch(&chain, &properties, &node_pool, &batch).await {
                        Ok(rows) => {
                            if let Err(e) = commit_batch(store.as_ref(), &chain, &batch, rows).await
                            {
                                queue.requeue_front(batch).await;
                                on_failure(WriterFailure::Store(e));
                                return;
                            }
                        }
                        Err(_) => {
                            queue.requeue_front(batch).await;
                            on_failure(WriterFailure::Rpc(e));
                            return;
                        }
                    }
                }
            }
        }
    });

    DbWriterHandle {
        cancel: cancel_tx,
        join,
    }
}

async fn process_batch<C: SubstrateRpcApi>(
    chain: &Chain,
    properties: &ChainProperties,
    node_pool: &NodePool<C>,
    batch: &[AddressBlockExtrinsics],
) -> Result<Vec<PersistedExtrinsic>, RpcError> {
    let mut rows = Vec::new();
    for item in batch {
        for extrinsic in &item.extrinsics {
            let extrinsic_hash = extrinsic
                .extrinsic_hash
                .clone()
                .expect("filtered extrinsics always carry a hash");

            let receipt = node_pool
                .with_failover(|client| {
                    let block_hash = item.block_hash.clone();
                    let extrinsic_hash = extrinsic_hash.clone();
                    async move {
                        crate::rpc::retry::with_retry(
                            "extrinsic_receipt",
                            REQUEST_RECEIPT_DATA_TIMES,
                            || client.extrinsic_receipt(&block_hash, &extrinsic_hash),
                        )
                        .await
                    }
                })
                .await?;

            let fee = fee_minor_to_decimal(receipt.fee_minor, properties.token_decimals);

            rows.push(PersistedExtrinsic {
                chain_id: chain.name().to_owned(),
                block_number: item.block_number,
                block_hash: item.block_hash.clone(),
                block_timestamp: item.block_timestamp,
                extrinsic_index: receipt.extrinsic_index,
                extrinsic_hash,
                call_module: extrinsic.call_module.clone(),
                call_function: extrinsic.call_function.clone(),
                params: render_params(&extrinsic.params),
                account_id: format!("0x{}", hex::encode(item.public_key)),
                address: item.address.clone(),
                nonce: extrinsic.nonce,
                fee: fee.to_string(),
            });
        }
    }
    Ok(rows)
}

/// Exact `fee_minor / 10^decimals`, with no floating-point rounding: builds a
/// `Decimal` directly from the integer mantissa and a negative power-of-ten
/// scale.
fn fee_minor_to_decimal(fee_minor: u128, decimals: u8) -> Decimal {
    Decimal::from_i128_with_scale(fee_minor as i128, decimals as u32)
}

fn render_params(param: &Param) -> String {
    param.to_canonical_json()
}

async fn commit_batch<S: Store>(
    store: &S,
    _chain: &Chain,
    batch: &[AddressBlockExtrinsics],
    rows: Vec<PersistedExtrinsic>,
) -> Result<(), StoreError> {
    store.insert_batch(&rows).await?;

    // Per-address, per-batch query range update (resolved Open Question, see DESIGN.md).
    let mut ranges: HashMap<&str, (i64, i64)> = HashMap::new();
    for item in batch {
        let entry = ranges
            .entry(item.address.as_str())
            .or_insert((item.block_timestamp, item.block_timestamp));
        entry.0 = entry.0.min(item.block_timestamp);
        entry.1 = entry.1.max(item.block_timestamp);
    }
    for (address, (start_ts, end_ts)) in ranges {
        store.update_query_range(address, start_ts, end_ts).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::ToPrimitive;

    #[test]
    fn fee_conversion_is_exact() {
        let fee = fee_minor_to_decimal(10_000_000_000, 12);
        assert_eq!(fee.to_string(), "0.01");
        assert_eq!(fee.to_f64().unwrap(), 0.01);
    }

    #[test]
    fn fee_conversion_handles_zero_decimals() {
        let fee = fee_minor_to_decimal(42, 0);
        assert_eq!(fee.to_string(), "42");
    }
}
