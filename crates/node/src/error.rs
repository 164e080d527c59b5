use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid listen or dial address: {0}")]
    Addr(#[from] std::net::AddrParseError),
    #[error("storage error: {0}")]
    Storage(#[from] shardsync_storage::StoreError),
    #[error("sync error: {0}")]
    Sync(#[from] shardsync_sync::SyncError),
}
