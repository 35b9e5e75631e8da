use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::address::{Address, PublicKey};
use crate::chain::Chain;
use crate::errors::{ControlPlaneErrorCode, RpcError};
use crate::node_pool::NodePool;
use crate::queue::BoundedQueue;
use crate::rpc::{Extrinsic, SubstrateRpcApi};

/// Default cadence (in blocks) for progress logging.
pub const LOG_EVERY_BLOCKS: u64 = 1000;
/// Same-client retries before the Node Pool fails over to another node.
pub const REQUEST_BLOCK_RETRY_TIMES: u32 = 2;
/// How long the indexer sleeps once it has caught up to the chain tip.
const CATCH_UP_SLEEP: Duration = Duration::from_secs(6);

/// Produced by an Indexer, one per matching block, consumed by a DB Writer.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressBlockExtrinsics {
    pub address: String,
    pub public_key: PublicKey,
    pub block_number: u64,
    pub block_hash: String,
    /// Seconds since epoch, parsed from the block's timestamp inherent.
    pub block_timestamp: i64,
    pub extrinsics: Vec<Extrinsic>,
}

/// A fatal condition that stops the indexer loop and is routed to the owning
/// session as a `server_error`.
#[derive(Debug, Clone)]
pub enum IndexerFailure {
    Rpc(RpcError),
    MalformedBlock(String),
}

impl IndexerFailure {
    pub fn detail(&self) -> String {
        match self {
            IndexerFailure::Rpc(e) => e.to_string(),
            IndexerFailure::MalformedBlock(detail) => detail.clone(),
        }
    }
}

/// A running Indexer task handle, owned exclusively by the Session Manager.
pub struct IndexerHandle {
    pub cancel: watch::Sender<bool>,
    pub join: JoinHandle<()>,
}

impl IndexerHandle {
    pub fn request_stop(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Spawns the Indexer main loop: walks blocks from `start_block`, filtering
/// for signed extrinsics sent by `address`, and returns its handle.
///
/// `on_failure` is invoked at most once, with the error that is to be surfaced
/// to the owning session as `start_indexing_0002`-class `server_error`.
pub fn spawn_indexer<C, F>(
    chain: Chain,
    address: Address,
    start_block: u64,
    node_pool: Arc<NodePool<C>>,
    queue: Arc<BoundedQueue<AddressBlockExtrinsics>>,
    on_failure: F,
) -> IndexerHandle
where
    C: SubstrateRpcApi + 'static,
    F: FnOnce(ControlPlaneErrorCode, IndexerFailure) + Send + 'static,
{
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let join = tokio::spawn(async move {
        let public_key = address.public_key();
        let address_str = address.as_str().to_owned();
        let mut cursor = start_block;

        loop {
            if *cancel_rx.borrow() {
                return;
            }

            if cursor % LOG_EVERY_BLOCKS == 0 {
                tracing::info!(chain = %chain, address = %address_str, cursor, "indexer progress");
            }

            let fetch_result = node_pool
                .with_failover(|client| {
                    let cursor = cursor;
                    async move {
                        crate::rpc::retry::with_retry("block_extrinsics", REQUEST_BLOCK_RETRY_TIMES, || {
                            client.block_extrinsics(cursor)
                        })
                        .await
                    }
                })
                .await;

            let block = match fetch_result {
                Ok(block) => block,
                Err(RpcError::Timeout(_)) | Err(RpcError::RemoteUnavailable(_)) => {
                    // Catch-up probe: if we're past the head, this is expected
                    // while waiting for the next block; otherwise it is the
                    // retry ceiling being exhausted, which is fatal.
                    match node_pool
                        .with_failover(|client| async move { client.head_block_number().await })
                        .await
                    {
                        Ok(head) if cursor > head => {
                            tokio::select! {
                                _ = tokio::time::sleep(CATCH_UP_SLEEP) => {},
                                _ = cancel_rx.changed() => {},
                            }
                            continue;
                        }
                        Ok(_) => {
                            on_failure(
                                ControlPlaneErrorCode::StartIndexingIndexerFailed,
                                IndexerFailure::Rpc(RpcError::RemoteUnavailable(
                                    "block fetch retries exhausted".into(),
                                )),
                            );
                            return;
                        }
                        Err(e) => {
                            on_failure(
                                ControlPlaneErrorCode::StartIndexingIndexerFailed,
                                IndexerFailure::Rpc(e),
                            );
                            return;
                        }
                    }
                }
                Err(e) => {
                    on_failure(
                        ControlPlaneErrorCode::StartIndexingIndexerFailed,
                        IndexerFailure::Rpc(e),
                    );
                    return;
                }
            };

            let (inherent, rest) = match block.extrinsics.split_first() {
                Some(pair) => pair,
                None => {
                    on_failure(
                        ControlPlaneErrorCode::StartIndexingIndexerFailed,
                        IndexerFailure::MalformedBlock("block has no inherent".into()),
                    );
                    return;
                }
            };

            let block_timestamp = match parse_inherent_timestamp(inherent) {
                Some(ts) => ts,
                None => {
                    on_failure(
                        ControlPlaneErrorCode::StartIndexingIndexerFailed,
                        IndexerFailure::MalformedBlock("missing or unparsable timestamp inherent".into()),
                    );
                    return;
                }
            };

            let matching: Vec<Extrinsic> = rest
                .iter()
                .filter(|e| {
                    e.extrinsic_hash.is_some()
                        && e.contains_transaction
                        && e.signer_public_key == Some(public_key)
                })
                .cloned()
                .collect();

            if !matching.is_empty() {
                queue
                    .put(AddressBlockExtrinsics {
                        address: address_str.clone(),
                        public_key,
                        block_number: cursor,
                        block_hash: block.block_hash.clone(),
                        block_timestamp,
                        extrinsics: matching,
                    })
                    .await;
            }

            cursor += 1;
        }
    });

    IndexerHandle {
        cancel: cancel_tx,
        join,
    }
}

fn parse_inherent_timestamp(inherent: &Extrinsic) -> Option<i64> {
    if inherent.call_module != "Timestamp" || inherent.call_function != "set" {
        return None;
    }
    let raw = match &inherent.params {
        crate::params::Param::String(s) => s.clone(),
        _ => return None,
    };
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Param;

    fn inherent(ts: &str) -> Extrinsic {
        Extrinsic {
            extrinsic_hash: None,
            signer_public_key: None,
            nonce: None,
            call_module: "Timestamp".into(),
            call_function: "set".into(),
            params: Param::String(ts.to_string()),
            contains_transaction: false,
        }
    }

    #[test]
    fn parses_valid_timestamp_inherent() {
        let e = inherent("2023-01-02T03:04:05");
        assert!(parse_inherent_timestamp(&e).is_some());
    }

    #[test]
    fn rejects_non_timestamp_inherent() {
        let mut e = inherent("2023-01-02T03:04:05");
        e.call_module = "ParachainSystem".into();
        assert!(parse_inherent_timestamp(&e).is_none());
    }

    #[test]
    fn filter_keeps_only_signed_matching_hashed_extrinsics() {
        let target: PublicKey = [7u8; 32];
        let other: PublicKey = [9u8; 32];
        let candidates = vec![
            Extrinsic {
                extrinsic_hash: Some("0x1".into()),
                signer_public_key: Some(target),
                nonce: Some(1),
                call_module: "Balances".into(),
                call_function: "transfer".into(),
                params: Param::Bool(true),
                contains_transaction: true,
            },
            Extrinsic {
                extrinsic_hash: Some("0x2".into()),
                signer_public_key: Some(other),
                nonce: Some(1),
                call_module: "Balances".into(),
                call_function: "transfer".into(),
                params: Param::Bool(true),
                contains_transaction: true,
            },
            Extrinsic {
                extrinsic_hash: None,
                signer_public_key: Some(target),
                nonce: Some(1),
                call_module: "Balances".into(),
                call_function: "transfer".into(),
                params: Param::Bool(true),
                contains_transaction: true,
            },
            Extrinsic {
                extrinsic_hash: Some("0x3".into()),
                signer_public_key: Some(target),
                nonce: Some(1),
                call_module: "Balances".into(),
                call_function: "transfer".into(),
                params: Param::Bool(true),
                contains_transaction: false,
            },
        ];
        let matching: Vec<_> = candidates
            .iter()
            .filter(|e| {
                e.extrinsic_hash.is_some() && e.contains_transaction && e.signer_public_key == Some(target)
            })
            .collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].extrinsic_hash.as_deref(), Some("0x1"));
    }
}
