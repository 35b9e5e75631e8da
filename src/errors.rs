use thiserror::Error;

/// Errors returned by every [`crate::rpc::SubstrateRpcApi`] operation.
///
/// Exactly one of these variants is produced by any given call; retry policy
/// lives above this type (see [`crate::rpc::retry`] and [`crate::node_pool`]).
#[derive(Debug, Error, Clone)]
pub enum RpcError {
    #[error("remote endpoint unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("remote endpoint rejected request: {0}")]
    RemoteRejected(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl SessionError {
    /// Whether this failure belongs to the control plane's "decode" error
    /// class (`*_0001`, a malformed request) rather than its "creation
    /// failed" class (`*_0002`, a valid request that couldn't be satisfied).
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            SessionError::InvalidAddress(_)
                | SessionError::InvalidStartBlock
                | SessionError::UnknownChain(_)
        )
    }
}

impl RpcError {
    /// Transient errors are safe to retry at the same client and fail over to
    /// another node; schema mismatches are not, since a different node won't
    /// decode the response any differently.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcError::RemoteUnavailable(_) | RpcError::RemoteRejected(_) | RpcError::Timeout(_)
        )
    }
}

/// Contract violations raised by the [`crate::session::SessionManager`].
///
/// These are refused synchronously and never retried.
#[derive(Debug, Error, Clone)]
pub enum SessionError {
    #[error("a DB writer for chain {0} is already running")]
    AlreadyRunning(u64),
    #[error("no DB writer is running for chain {0}")]
    WriterMissing(u64),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("block_number_start_at must be greater than zero")]
    InvalidStartBlock,
    #[error("unknown chain id: {0}")]
    UnknownChain(u64),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("failed to open store: {0}")]
    Open(String),
    #[error("write denied or corrupted: {0}")]
    Write(String),
    #[error("serialization failure: {0}")]
    Codec(String),
}

/// Stable `{scope}_{NNNN}` error codes surfaced over the control plane, mirroring
/// the code strings used by the system this indexer replaces (`start_indexer_0001`
/// and friends).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPlaneErrorCode {
    StartIndexerDeserialize,
    StartIndexerWriterFailed,
    StartIndexingDeserialize,
    StartIndexingIndexerFailed,
}

impl ControlPlaneErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            ControlPlaneErrorCode::StartIndexerDeserialize => "start_indexer_0001",
            ControlPlaneErrorCode::StartIndexerWriterFailed => "start_indexer_0002",
            ControlPlaneErrorCode::StartIndexingDeserialize => "start_indexing_0001",
            ControlPlaneErrorCode::StartIndexingIndexerFailed => "start_indexing_0002",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ControlPlaneErrorCode::StartIndexerDeserialize => "Failed to deserialize data",
            ControlPlaneErrorCode::StartIndexerWriterFailed => "Failed to create dbwriter",
            ControlPlaneErrorCode::StartIndexingDeserialize => "Failed to deserialize data",
            ControlPlaneErrorCode::StartIndexingIndexerFailed => "Failed to create indexer",
        }
    }
}
