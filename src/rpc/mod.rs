pub mod client;
pub mod retry;

use crate::chain::ChainProperties;
use crate::errors::RpcError;
use crate::params::Param;
use async_trait::async_trait;

/// A single raw extrinsic as read off a block, before receipt enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct Extrinsic {
    pub extrinsic_hash: Option<String>,
    pub signer_public_key: Option<[u8; 32]>,
    pub nonce: Option<u64>,
    pub call_module: String,
    pub call_function: String,
    pub params: Param,
    pub contains_transaction: bool,
}

/// The result of `block_extrinsics(n)`: the block hash (so receipt lookups don't
/// pay a second round-trip) plus its extrinsics, first of which is the timestamp
/// inherent.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockExtrinsics {
    pub block_hash: String,
    pub extrinsics: Vec<Extrinsic>,
}

/// Post-execution metadata for one extrinsic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub extrinsic_index: u32,
    pub fee_minor: u128,
}

/// Sole owner of one network endpoint.
///
/// Every method fails with exactly one [`RpcError`] variant. Retry policy is
/// deliberately not implemented here; see [`retry::with_retry`] and
/// [`crate::node_pool::NodePool::with_failover`] for the two layers that wrap it.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait SubstrateRpcApi: Send + Sync {
    async fn chain_id(&self) -> Result<u64, RpcError>;

    async fn chain_properties(&self) -> Result<ChainProperties, RpcError>;

    async fn head_block_number(&self) -> Result<u64, RpcError>;

    async fn block_extrinsics(&self, block_number: u64) -> Result<BlockExtrinsics, RpcError>;

    async fn extrinsic_receipt(
        &self,
        block_hash: &str,
        extrinsic_hash: &str,
    ) -> Result<Receipt, RpcError>;
}
