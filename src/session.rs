use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::address::Address;
use crate::chain::Chain;
use crate::db_writer::{spawn_db_writer, DbWriterHandle, WriterFailure};
use crate::errors::SessionError;
use crate::indexer::{spawn_indexer, AddressBlockExtrinsics, IndexerFailure, IndexerHandle};
use crate::node_pool::{fetch_explorer_head, NodePool};
use crate::queue::BoundedQueue;
use crate::rpc::SubstrateRpcApi;
use crate::rpc::client::SubxtRpcClient;
use crate::store::Store;

/// Opaque per-connection session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

/// A running Indexer, identified by its chain and target address so the
/// Session Manager can look it up without the task owning a back-reference to
/// its session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexerId {
    pub chain: u64,
    pub address: String,
}

struct WriterEntry {
    handle: DbWriterHandle,
    queue: Arc<BoundedQueue<AddressBlockExtrinsics>>,
    node_pool: Arc<NodePool<SubxtRpcClient>>,
}

struct IndexerEntry {
    handle: IndexerHandle,
}

/// A function invoked whenever a task reports a session-scoped error, wired
/// up to the Control Plane Adapter's `server_error` emission.
pub type ErrorSink = Arc<dyn Fn(&SessionId, &str, String) + Send + Sync>;

/// Owns every running Indexer and DB Writer, and enforces that a chain has at
/// most one writer no matter how many sessions ask for one.
pub struct SessionManager<S: Store> {
    writers: Mutex<HashMap<u64, WriterEntry>>,
    indexers: Mutex<HashMap<IndexerId, IndexerEntry>>,
    sessions_writers: Mutex<HashMap<SessionId, HashSet<u64>>>,
    sessions_indexers: Mutex<HashMap<SessionId, HashSet<IndexerId>>>,
    store: Arc<S>,
    on_error: ErrorSink,
}

impl<S: Store + 'static> SessionManager<S> {
    pub fn new(store: Arc<S>, on_error: ErrorSink) -> Self {
        Self {
            writers: Mutex::new(HashMap::new()),
            indexers: Mutex::new(HashMap::new()),
            sessions_writers: Mutex::new(HashMap::new()),
            sessions_indexers: Mutex::new(HashMap::new()),
            store,
            on_error,
        }
    }

    /// `create_writer`: opens a node interface, starts the writer task, and
    /// registers it under the chain and the session. Fails with
    /// [`SessionError::AlreadyRunning`] if a writer for this chain already
    /// exists, anywhere.
    pub async fn create_writer(
        self: &Arc<Self>,
        session: SessionId,
        chain: Chain,
        node_url: &str,
    ) -> Result<(), SessionError> {
        {
            let writers = self.writers.lock().await;
            if writers.contains_key(&chain.id()) {
                return Err(SessionError::AlreadyRunning(chain.id()));
            }
        }

        let client = SubxtRpcClient::connect(node_url, chain.id()).await?;
        let properties = client.chain_properties().await?;

        let node_pool = Arc::new(NodePool::new(chain));
        node_pool.add_node(node_url, Arc::new(client), true).await;

        // Best-effort: a lagging node is logged, never treated as fatal, so any
        // failure fetching either side of the comparison is simply skipped.
        if let Ok(node_head) = node_pool
            .with_failover(|client| async move { client.head_block_number().await })
            .await
        {
            if let Some(explorer_head) = fetch_explorer_head(chain).await {
                node_pool.check_sync(node_url, node_head, explorer_head);
            }
        }

        let queue = Arc::new(BoundedQueue::new(10_000));

        let mut writers = self.writers.lock().await;
        if writers.contains_key(&chain.id()) {
            return Err(SessionError::AlreadyRunning(chain.id()));
        }

        let manager = self.clone();
        let chain_id = chain.id();
        let handle = spawn_db_writer(
            chain,
            properties,
            node_pool.clone(),
            queue.clone(),
            self.store.clone(),
            move |failure: WriterFailure| {
                let detail = match failure {
                    WriterFailure::Rpc(e) => e.to_string(),
                    WriterFailure::Store(e) => e.to_string(),
                };
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .notify_chain_failure(chain_id, "start_indexer_0002", detail)
                        .await;
                });
            },
        );

        writers.insert(chain.id(), WriterEntry { handle, queue, node_pool });
        drop(writers);

        self.sessions_writers
            .lock()
            .await
            .entry(session)
            .or_default()
            .insert(chain.id());

        Ok(())
    }

    /// Notifies every session that currently owns the writer or an indexer on
    /// `chain_id`, since a chain's writer is shared by every session with an
    /// indexer on that chain, not owned solely by whichever session created it.
    async fn notify_chain_failure(&self, chain_id: u64, code: &str, detail: String) {
        let mut affected: HashSet<SessionId> = HashSet::new();
        {
            let sessions_writers = self.sessions_writers.lock().await;
            for (session, chains) in sessions_writers.iter() {
                if chains.contains(&chain_id) {
                    affected.insert(session.clone());
                }
            }
        }
        {
            let sessions_indexers = self.sessions_indexers.lock().await;
            for (session, indexers) in sessions_indexers.iter() {
                if indexers.iter().any(|id| id.chain == chain_id) {
                    affected.insert(session.clone());
                }
            }
        }
        for session in affected {
            (self.on_error)(&session, code, detail.clone());
        }
    }

    /// `create_indexer`: verifies a writer (and queue) exist for the chain,
    /// derives the public key, starts the indexer task.
    pub async fn create_indexer(
        &self,
        session: SessionId,
        chain: Chain,
        start_block: u64,
        address: &str,
    ) -> Result<(), SessionError> {
        if start_block == 0 {
            return Err(SessionError::InvalidStartBlock);
        }
        let address = Address::parse(chain, address)?;

        let (node_pool, queue) = {
            let writers = self.writers.lock().await;
            let writer = writers
                .get(&chain.id())
                .ok_or(SessionError::WriterMissing(chain.id()))?;
            (writer.node_pool.clone(), writer.queue.clone())
        };

        let indexer_id = IndexerId {
            chain: chain.id(),
            address: address.as_str().to_owned(),
        };

        let on_error = self.on_error.clone();
        let session_for_failure = session.clone();
        let handle = spawn_indexer(
            chain,
            address,
            start_block,
            node_pool,
            queue,
            move |_code, failure: IndexerFailure| {
                on_error(&session_for_failure, "start_indexing_0002", failure.detail());
            },
        );

        self.indexers
            .lock()
            .await
            .insert(indexer_id.clone(), IndexerEntry { handle });
        self.sessions_indexers
            .lock()
            .await
            .entry(session)
            .or_default()
            .insert(indexer_id);

        Ok(())
    }

    /// Cancels every Indexer the session owns first, then every DB Writer. If a
    /// writer the session owned is stopped, every indexer still targeting that
    /// chain is stopped too, even those owned by other sessions, since the
    /// writer was shared.
    pub async fn stop_session(&self, session: &SessionId) {
        let indexer_ids = self
            .sessions_indexers
            .lock()
            .await
            .remove(session)
            .unwrap_or_default();
        {
            let mut indexers = self.indexers.lock().await;
            for id in &indexer_ids {
                if let Some(entry) = indexers.remove(id) {
                    entry.handle.request_stop();
                }
            }
        }

        let chain_ids = self
            .sessions_writers
            .lock()
            .await
            .remove(session)
            .unwrap_or_default();
        {
            let mut writers = self.writers.lock().await;
            for chain_id in &chain_ids {
                if let Some(entry) = writers.remove(chain_id) {
                    entry.handle.request_stop();
                    let mut indexers = self.indexers.lock().await;
                    let orphaned: Vec<IndexerId> = indexers
                        .keys()
                        .filter(|id| id.chain == *chain_id)
                        .cloned()
                        .collect();
                    for id in orphaned {
                        if let Some(entry) = indexers.remove(&id) {
                            entry.handle.request_stop();
                        }
                    }
                }
            }
        }
    }

    /// Cancels every task across every session. Safe to call from a signal
    /// handler.
    pub async fn shutdown(&self) {
        let mut indexers = self.indexers.lock().await;
        for (_, entry) in indexers.drain() {
            entry.handle.request_stop();
        }
        drop(indexers);

        let mut writers = self.writers.lock().await;
        for (_, entry) in writers.drain() {
            entry.handle.request_stop();
        }

        self.sessions_indexers.lock().await.clear();
        self.sessions_writers.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::store::{PersistedExtrinsic, QueryRange};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeStore;

    #[async_trait::async_trait]
    impl Store for FakeStore {
        async fn insert_batch(&self, rows: &[PersistedExtrinsic]) -> Result<usize, StoreError> {
            Ok(rows.len())
        }

        async fn update_query_range(
            &self,
            _address: &str,
            _start_ts: i64,
            _end_ts: i64,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn get_query_range(&self, _address: &str) -> Result<Option<QueryRange>, StoreError> {
            Ok(None)
        }
    }

    fn silent_on_error() -> ErrorSink {
        Arc::new(|_session, _code, _detail| {})
    }

    fn dummy_writer_entry(chain: Chain) -> WriterEntry {
        let (cancel, _rx) = tokio::sync::watch::channel(false);
        WriterEntry {
            handle: DbWriterHandle {
                cancel,
                join: tokio::spawn(async {}),
            },
            queue: Arc::new(BoundedQueue::new(10)),
            node_pool: Arc::new(NodePool::new(chain)),
        }
    }

    fn dummy_indexer_entry() -> IndexerEntry {
        let (cancel, _rx) = tokio::sync::watch::channel(false);
        IndexerEntry {
            handle: IndexerHandle {
                cancel,
                join: tokio::spawn(async {}),
            },
        }
    }

    #[tokio::test]
    async fn create_writer_rejects_duplicate_chain() {
        let manager = Arc::new(SessionManager::new(
            Arc::new(FakeStore::default()),
            silent_on_error(),
        ));
        manager
            .writers
            .lock()
            .await
            .insert(Chain::Kusama.id(), dummy_writer_entry(Chain::Kusama));

        let result = manager
            .create_writer(SessionId("other-session".into()), Chain::Kusama, "ws://unused")
            .await;

        assert!(matches!(result, Err(SessionError::AlreadyRunning(id)) if id == Chain::Kusama.id()));
    }

    #[tokio::test]
    async fn stop_session_cascades_to_other_sessions_sharing_a_writer() {
        let manager = SessionManager::new(Arc::new(FakeStore::default()), silent_on_error());
        let chain = Chain::Kusama;
        let session_a = SessionId("owner".into());
        let session_b = SessionId("guest".into());
        let indexer_id = IndexerId {
            chain: chain.id(),
            address: "some-address".into(),
        };

        manager
            .writers
            .lock()
            .await
            .insert(chain.id(), dummy_writer_entry(chain));
        manager
            .sessions_writers
            .lock()
            .await
            .entry(session_a.clone())
            .or_default()
            .insert(chain.id());

        manager
            .indexers
            .lock()
            .await
            .insert(indexer_id.clone(), dummy_indexer_entry());
        manager
            .sessions_indexers
            .lock()
            .await
            .entry(session_b.clone())
            .or_default()
            .insert(indexer_id.clone());

        manager.stop_session(&session_a).await;

        assert!(!manager.writers.lock().await.contains_key(&chain.id()));
        assert!(!manager.indexers.lock().await.contains_key(&indexer_id));
    }

    #[tokio::test]
    async fn stop_session_leaves_other_sessions_untouched_when_nothing_is_shared() {
        let manager = SessionManager::new(Arc::new(FakeStore::default()), silent_on_error());
        let chain = Chain::Kusama;
        let session_a = SessionId("a".into());
        let session_b = SessionId("b".into());
        let indexer_a = IndexerId {
            chain: chain.id(),
            address: "addr-a".into(),
        };
        let indexer_b = IndexerId {
            chain: chain.id(),
            address: "addr-b".into(),
        };

        manager
            .indexers
            .lock()
            .await
            .insert(indexer_a.clone(), dummy_indexer_entry());
        manager
            .sessions_indexers
            .lock()
            .await
            .entry(session_a.clone())
            .or_default()
            .insert(indexer_a.clone());

        manager
            .indexers
            .lock()
            .await
            .insert(indexer_b.clone(), dummy_indexer_entry());
        manager
            .sessions_indexers
            .lock()
            .await
            .entry(session_b.clone())
            .or_default()
            .insert(indexer_b.clone());

        manager.stop_session(&session_a).await;

        assert!(!manager.indexers.lock().await.contains_key(&indexer_a));
        assert!(manager.indexers.lock().await.contains_key(&indexer_b));
    }

    #[tokio::test]
    async fn writer_failure_notifies_every_session_on_the_chain_not_just_the_creator() {
        let notified: Arc<StdMutex<Vec<SessionId>>> = Arc::new(StdMutex::new(Vec::new()));
        let notified_clone = notified.clone();
        let on_error: ErrorSink = Arc::new(move |session: &SessionId, _code: &str, _detail: String| {
            notified_clone.lock().unwrap().push(session.clone());
        });
        let manager = SessionManager::new(Arc::new(FakeStore::default()), on_error);

        let chain = Chain::Kusama;
        let creator = SessionId("creator".into());
        let guest = SessionId("guest".into());

        manager
            .sessions_writers
            .lock()
            .await
            .entry(creator.clone())
            .or_default()
            .insert(chain.id());
        manager
            .sessions_indexers
            .lock()
            .await
            .entry(guest.clone())
            .or_default()
            .insert(IndexerId {
                chain: chain.id(),
                address: "addr".into(),
            });

        manager
            .notify_chain_failure(chain.id(), "start_indexer_0002", "writer died".into())
            .await;

        let notified = notified.lock().unwrap();
        assert!(notified.contains(&creator));
        assert!(notified.contains(&guest));
    }
}
