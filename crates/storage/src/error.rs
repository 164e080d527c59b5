use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("commitment mismatch for kv-index {0}")]
    CommitmentMismatch(u64),
    #[error("no content stored at kv-index {0}")]
    NotFound(u64),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Custom(String),
}
