use shardsync_core::{Commitment, EncodingKind, KvIndex, MinerAddress, ShardKey};

use crate::error::StoreError;

/// Capability contract the sync core consumes for reading/writing the local
/// blob store and for learning the chain's view of each slot's commitment.
///
/// Out of scope for this workspace is the *implementation* backing this
/// trait in a real node (an on-disk engine synced from chain events); this
/// crate ships [`in_memory::InMemoryStorageManager`](crate::in_memory::InMemoryStorageManager)
/// as the reference/test double the sync core is exercised against, mirroring
/// how the contract is expressed and tested in the codebase this core is
/// modeled on.
pub trait StorageManager: Send + Sync {
    /// Entries per shard (`E`); shard `S` owns `[S*E, (S+1)*E)`.
    fn entries_per_shard(&self) -> u64;

    /// Encoding newly written blobs must be stored under.
    fn local_encoding(&self) -> EncodingKind;

    /// Shards this node currently holds locally.
    fn held_shards(&self) -> Vec<ShardKey>;

    /// The chain's most recently observed `lastKvIndex` for a shard. Slots
    /// at or beyond this index are not yet assigned on chain and must be
    /// empty-filled rather than fetched.
    fn last_kv_index(&self, shard: ShardKey) -> Result<KvIndex, StoreError>;

    /// The authoritative commitment the chain reports for `index`, if any.
    /// Returns `None` for indices at or beyond `last_kv_index` (the slot's
    /// identity there is the empty marker, not a chain-reported value).
    fn chain_commitment(
        &self,
        shard: ShardKey,
        index: KvIndex,
    ) -> Result<Option<Commitment>, StoreError>;

    /// Reads back the locally stored bytes and commitment at `index`, if
    /// anything has been written there yet.
    fn try_read(
        &self,
        shard: ShardKey,
        index: KvIndex,
    ) -> Result<Option<(Vec<u8>, Commitment)>, StoreError>;

    /// Decodes a peer-encoded blob to raw bytes. `commitment` and
    /// `miner_address` are passed through to the engine as it may need them
    /// to validate or derive per-slot encoding keys; this core does not
    /// inspect them itself beyond what [`crate::manager::StorageManager::encode_kv`]
    /// needs.
    fn decode_kv(
        &self,
        shard: ShardKey,
        index: KvIndex,
        encoded_blob: &[u8],
        commitment: Commitment,
        miner_address: MinerAddress,
        encode_type: EncodingKind,
    ) -> Result<Vec<u8>, StoreError>;

    /// Re-encodes raw bytes under [`StorageManager::local_encoding`].
    fn encode_kv(&self, shard: ShardKey, index: KvIndex, raw: &[u8]) -> Result<Vec<u8>, StoreError>;

    /// Write-through commit. Idempotent when `commitment` matches what is
    /// already stored at `index`.
    fn commit_blob(
        &self,
        shard: ShardKey,
        index: KvIndex,
        encoded_bytes: Vec<u8>,
        commitment: Commitment,
    ) -> Result<(), StoreError>;
}
