//! Shared data model for the shard synchronization core: contract/shard
//! coordinates, commitments and the wire-level blob payload shape. Kept
//! free of any networking or storage-engine dependency so that both the
//! `shardsync-storage` and `shardsync-sync` crates can depend on it without
//! pulling in unrelated machinery.

pub mod types;

pub use types::{
    BlobPayload, Commitment, ContractAddress, EncodingKind, KvIndex, MinerAddress, PeerId,
    ShardId, ShardKey, EMPTY_FILLING_MASK, HASH_SIZE_IN_CONTRACT,
};
