pub mod rocks;

use crate::errors::StoreError;
use serde::{Deserialize, Serialize};

/// One row of the persisted extrinsic table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedExtrinsic {
    pub chain_id: String,
    pub block_number: u64,
    pub block_hash: String,
    pub block_timestamp: i64,
    pub extrinsic_index: u32,
    pub extrinsic_hash: String,
    pub call_module: String,
    pub call_function: String,
    /// Canonical JSON, per [`crate::params::Param::to_canonical_json`].
    pub params: String,
    pub account_id: String,
    pub address: String,
    pub nonce: Option<u64>,
    /// Decimal string, exact (no floating-point rounding).
    pub fee: String,
}

impl PersistedExtrinsic {
    /// `(chain_id, block_number, extrinsic_index)` — the dedup key enforced by
    /// the store's unique constraint.
    pub fn dedup_key(&self) -> (String, u64, u32) {
        (self.chain_id.clone(), self.block_number, self.extrinsic_index)
    }
}

/// A persisted `(start_ts, end_ts)` watermark per address, keyed by
/// `"substrate_extrinsics_{address}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRange {
    pub start_ts: i64,
    pub end_ts: i64,
}

/// The narrow interface the core needs from a concrete on-disk store.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Inserts every row not already present (by dedup key). Returns the
    /// number of rows actually inserted. Must be atomic: either every new row
    /// is committed, or none are.
    async fn insert_batch(&self, rows: &[PersistedExtrinsic]) -> Result<usize, StoreError>;

    /// Merges `(start_ts, end_ts)` into the existing range for `address`, or
    /// creates it if absent.
    async fn update_query_range(
        &self,
        address: &str,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<(), StoreError>;

    async fn get_query_range(&self, address: &str) -> Result<Option<QueryRange>, StoreError>;
}
