use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::chain::Chain;
use crate::errors::RpcError;
use crate::rpc::SubstrateRpcApi;

struct Node<C> {
    name: String,
    client: Arc<C>,
    is_own: bool,
    weight: AtomicU64,
}

/// Holds every node registered for one chain, ordered so `with_failover`
/// transparently retries across them.
pub struct NodePool<C> {
    chain: Chain,
    nodes: RwLock<Vec<Node<C>>>,
}

impl<C: SubstrateRpcApi> NodePool<C> {
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            nodes: RwLock::new(Vec::new()),
        }
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    /// Registers a node. `is_own` marks the operator-owned node, which always
    /// has unconditional priority over public nodes regardless of weight.
    pub async fn add_node(&self, name: impl Into<String>, client: Arc<C>, is_own: bool) {
        let mut nodes = self.nodes.write().await;
        nodes.push(Node {
            name: name.into(),
            client,
            is_own,
            weight: AtomicU64::new(0),
        });
    }

    pub async fn set_weight(&self, name: &str, weight: u64) {
        let nodes = self.nodes.read().await;
        if let Some(node) = nodes.iter().find(|n| n.name == name) {
            node.weight.store(weight, Ordering::Relaxed);
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Own node first, then descending weight among the rest.
    async fn ordered_clients(&self) -> Vec<(String, Arc<C>)> {
        let nodes = self.nodes.read().await;
        let mut indices: Vec<usize> = (0..nodes.len()).collect();
        indices.sort_by(|&a, &b| {
            let na = &nodes[a];
            let nb = &nodes[b];
            match (na.is_own, nb.is_own) {
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                _ => nb
                    .weight
                    .load(Ordering::Relaxed)
                    .cmp(&na.weight.load(Ordering::Relaxed)),
            }
        });
        indices
            .into_iter()
            .map(|i| (nodes[i].name.clone(), nodes[i].client.clone()))
            .collect()
    }

    /// Calls `op(client)` across nodes in priority order, returning the first
    /// result that isn't `RemoteUnavailable`. If every node is unavailable, the
    /// returned error aggregates every endpoint name that was tried.
    pub async fn with_failover<T, F, Fut>(&self, op: F) -> Result<T, RpcError>
    where
        F: Fn(Arc<C>) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let ordered = self.ordered_clients().await;
        if ordered.is_empty() {
            return Err(RpcError::RemoteUnavailable(
                "no nodes registered for chain".into(),
            ));
        }

        let mut tried = Vec::new();
        for (name, client) in ordered {
            match op(client).await {
                Ok(value) => return Ok(value),
                Err(RpcError::RemoteUnavailable(detail)) => {
                    tried.push(format!("{name} ({detail})"));
                }
                Err(other) => return Err(other),
            }
        }

        Err(RpcError::RemoteUnavailable(format!(
            "all nodes exhausted: {}",
            tried.join(", ")
        )))
    }

    /// Compares a node's head height against an external reference (explorer
    /// metadata) and logs a warning — never a hard failure — when the lag
    /// exceeds the chain's threshold.
    pub fn check_sync(&self, node_name: &str, node_head: u64, explorer_head: u64) {
        let threshold = self.chain.block_lag_threshold();
        let lag = explorer_head.saturating_sub(node_head);
        if lag > threshold {
            tracing::warn!(
                node = node_name,
                chain = %self.chain,
                node_head,
                explorer_head,
                threshold,
                "node head is lagging the explorer reference beyond the chain's threshold"
            );
        }
    }
}

#[derive(serde::Deserialize)]
struct ScanMetadataResponse {
    data: ScanMetadataPayload,
}

#[derive(serde::Deserialize)]
struct ScanMetadataPayload {
    #[serde(rename = "blockNum")]
    block_num: u64,
}

/// Fetches `chain`'s current head height from its block explorer, for
/// [`NodePool::check_sync`]. Returns `None` on any transport or decode
/// failure; the caller treats a missing reading the same as a skipped check.
pub async fn fetch_explorer_head(chain: Chain) -> Option<u64> {
    let url = format!("{}/scan/metadata", chain.explorer_base());
    let client = reqwest::Client::builder().build().ok()?;
    let resp = client.post(url).send().await.ok()?;
    let parsed: ScanMetadataResponse = resp.json().await.ok()?;
    Some(parsed.data.block_num)
}
