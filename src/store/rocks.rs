use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamilyDescriptor, Options, TransactionDB, TransactionDBOptions};

use crate::errors::StoreError;

use super::{PersistedExtrinsic, QueryRange, Store};

const CF_EXTRINSICS: &str = "extrinsics";
const CF_QUERY_RANGES: &str = "query_ranges";

/// `rocksdb`-backed [`Store`], grounded on the reference codebase's
/// `PersistentKeyDB` (`engine/src/signing/db/persistent.rs`): a transaction per
/// logical write, explicit column families instead of the reference's single
/// default column, since uniqueness here is enforced by a check-then-put
/// inside the transaction rather than relied on from the caller.
pub struct RocksStore {
    db: Arc<TransactionDB>,
}

impl RocksStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_EXTRINSICS, Options::default()),
            ColumnFamilyDescriptor::new(CF_QUERY_RANGES, Options::default()),
        ];

        let txn_db_opts = TransactionDBOptions::default();
        let db = TransactionDB::open_cf_descriptors(&db_opts, &txn_db_opts, path, cfs)
            .map_err(|e| StoreError::Open(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    fn extrinsic_key(chain_id: &str, block_number: u64, extrinsic_index: u32) -> Vec<u8> {
        format!("{chain_id}:{block_number:020}:{extrinsic_index:010}").into_bytes()
    }

    fn query_range_key(address: &str) -> Vec<u8> {
        format!("substrate_extrinsics_{address}").into_bytes()
    }
}

#[async_trait::async_trait]
impl Store for RocksStore {
    async fn insert_batch(&self, rows: &[PersistedExtrinsic]) -> Result<usize, StoreError> {
        let db = self.db.clone();
        let rows = rows.to_vec();
        tokio::task::spawn_blocking(move || {
            let cf = db
                .cf_handle(CF_EXTRINSICS)
                .ok_or_else(|| StoreError::Open("missing extrinsics column family".into()))?;
            let txn = db.transaction();
            let mut inserted = 0usize;
            for row in &rows {
                let (chain_id, block_number, extrinsic_index) = row.dedup_key();
                let key = Self::extrinsic_key(&chain_id, block_number, extrinsic_index);
                // Insert-or-ignore: skip rows already present, never update the fee.
                if txn
                    .get_cf(&cf, &key)
                    .map_err(|e| StoreError::Write(e.to_string()))?
                    .is_some()
                {
                    continue;
                }
                let value =
                    serde_json::to_vec(row).map_err(|e| StoreError::Codec(e.to_string()))?;
                txn.put_cf(&cf, &key, value)
                    .map_err(|e| StoreError::Write(e.to_string()))?;
                inserted += 1;
            }
            txn.commit().map_err(|e| StoreError::Write(e.to_string()))?;
            Ok(inserted)
        })
        .await
        .map_err(|e| StoreError::Write(e.to_string()))?
    }

    async fn update_query_range(
        &self,
        address: &str,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<(), StoreError> {
        let db = self.db.clone();
        let address = address.to_owned();
        tokio::task::spawn_blocking(move || {
            let cf = db
                .cf_handle(CF_QUERY_RANGES)
                .ok_or_else(|| StoreError::Open("missing query_ranges column family".into()))?;
            let txn = db.transaction();
            let key = Self::query_range_key(&address);
            let existing = txn
                .get_cf(&cf, &key)
                .map_err(|e| StoreError::Write(e.to_string()))?
                .map(|bytes| {
                    serde_json::from_slice::<QueryRange>(&bytes)
                        .map_err(|e| StoreError::Codec(e.to_string()))
                })
                .transpose()?;

            let merged = match existing {
                Some(existing) => QueryRange {
                    start_ts: existing.start_ts.min(start_ts),
                    end_ts: existing.end_ts.max(end_ts),
                },
                None => QueryRange { start_ts, end_ts },
            };

            let value =
                serde_json::to_vec(&merged).map_err(|e| StoreError::Codec(e.to_string()))?;
            txn.put_cf(&cf, &key, value)
                .map_err(|e| StoreError::Write(e.to_string()))?;
            txn.commit().map_err(|e| StoreError::Write(e.to_string()))
        })
        .await
        .map_err(|e| StoreError::Write(e.to_string()))?
    }

    async fn get_query_range(&self, address: &str) -> Result<Option<QueryRange>, StoreError> {
        let db = self.db.clone();
        let address = address.to_owned();
        tokio::task::spawn_blocking(move || {
            let cf = db
                .cf_handle(CF_QUERY_RANGES)
                .ok_or_else(|| StoreError::Open("missing query_ranges column family".into()))?;
            let bytes = db
                .get_cf(&cf, Self::query_range_key(&address))
                .map_err(|e| StoreError::Write(e.to_string()))?;
            bytes
                .map(|b| {
                    serde_json::from_slice::<QueryRange>(&b)
                        .map_err(|e| StoreError::Codec(e.to_string()))
                })
                .transpose()
        })
        .await
        .map_err(|e| StoreError::Write(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(block_number: u64, extrinsic_index: u32) -> PersistedExtrinsic {
        PersistedExtrinsic {
            chain_id: "Kusama".into(),
            block_number,
            block_hash: "0xabc".into(),
            block_timestamp: 1_700_000_000,
            extrinsic_index,
            extrinsic_hash: "0xdef".into(),
            call_module: "Balances".into(),
            call_function: "transfer".into(),
            params: "{}".into(),
            account_id: "0x01".into(),
            address: "DJXRnqb3aTRpQfZtfZKFB3rXrDcdKjyS7C3BrrB5oWMDrxJ".into(),
            nonce: Some(1),
            fee: "0.01".into(),
        }
    }

    #[tokio::test]
    async fn insert_batch_is_idempotent_on_dedup_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let row = sample_row(100, 2);

        let first = store.insert_batch(&[row.clone()]).await.unwrap();
        let second = store.insert_batch(&[row]).await.unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn distinct_extrinsic_indices_both_insert() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();

        let inserted = store
            .insert_batch(&[sample_row(100, 0), sample_row(100, 1)])
            .await
            .unwrap();
        assert_eq!(inserted, 2);
    }

    #[tokio::test]
    async fn query_range_merges_with_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let addr = "DJXRnqb3aTRpQfZtfZKFB3rXrDcdKjyS7C3BrrB5oWMDrxJ";

        store.update_query_range(addr, 100, 200).await.unwrap();
        store.update_query_range(addr, 50, 150).await.unwrap();

        let range = store.get_query_range(addr).await.unwrap().unwrap();
        assert_eq!(range.start_ts, 50);
        assert_eq!(range.end_ts, 200);
    }
}
