use shardsync_core::KvIndex;
use shardsync_storage::StoreError;
use thiserror::Error;

/// Wire/transport-facing failures for a single request.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("stream closed before response was fully read")]
    StreamClosed,
    #[error("request timed out")]
    Timeout,
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unexpected response status {0}")]
    BadStatus(u8),
    #[error("peer advertisement missing or malformed")]
    AdvertisementInvalid,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error surface for the sync core.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("commitment mismatch at kv-index {0}")]
    CommitmentMismatch(KvIndex),
    #[error("no shard is held locally")]
    NoShardsHeld,
    #[error("config error: {0}")]
    Config(String),
}

/// Outcome-distinguishing error for a single payload validation, so the
/// dispatcher can tell a peer-at-fault rejection from a local storage
/// failure (only the former counts against the peer's failure counter).
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("commitment mismatch at kv-index {0}")]
    CommitmentMismatch(KvIndex),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}
